//! Implementation of `obsfs config`.

use std::path::PathBuf;

use clap::Args;

use crate::config::FsConfig;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Path to a JSON configuration file; defaults apply when omitted.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Override the stat cache entry budget.
    #[arg(long)]
    pub cache_size: Option<usize>,

    /// Override the stat cache TTL in seconds (0 disables expiry).
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    /// Override negative caching of missing paths.
    #[arg(long)]
    pub negative_cache: Option<bool>,

    /// Override the multipart slab size in bytes.
    #[arg(long)]
    pub max_part_size: Option<u64>,

    /// Override server-side copy reuse.
    #[arg(long)]
    pub use_copy_upload: Option<bool>,

    /// Override the number of upload worker threads.
    #[arg(long)]
    pub upload_parallelism: Option<usize>,
}

/// Resolve the configuration from file and flag overrides.
pub fn effective_config(args: &ConfigArgs) -> Result<FsConfig> {
    let mut config = match &args.config {
        Some(path) => FsConfig::load(path)?,
        None => FsConfig::default(),
    };

    if let Some(cache_size) = args.cache_size {
        config.cache_size = cache_size;
    }
    if let Some(ttl) = args.cache_ttl_secs {
        config.cache_ttl_secs = ttl;
    }
    if let Some(negative) = args.negative_cache {
        config.negative_cache = negative;
    }
    if let Some(max_part_size) = args.max_part_size {
        config.max_part_size = max_part_size;
    }
    if let Some(use_copy) = args.use_copy_upload {
        config.use_copy_upload = use_copy;
    }
    if let Some(parallelism) = args.upload_parallelism {
        config.upload_parallelism = parallelism;
    }

    config.validate()?;
    Ok(config)
}

pub fn execute(args: ConfigArgs) -> Result<()> {
    let config = effective_config(&args)?;
    println!("{}", serde_json::to_string_pretty(&config).map_err(crate::Error::from)?);
    Ok(())
}
