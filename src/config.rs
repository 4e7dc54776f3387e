//! Explicit configuration record for the write-path engine.
//!
//! Everything the core tunes lives here as one serde-loadable struct; the
//! CLI layers flag overrides on top and `validate` rejects combinations the
//! store cannot honor.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_MAX_PART_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_PARTS: u32 = 10_000;
pub const DEFAULT_MAX_COPY_PART: u64 = 5 * 1024 * 1024 * 1024;
pub const MAX_OBJECT_SIZE_CAP: u64 = 5 * 1024 * 1024 * 1024 * 1024;

/// How the stat cache interprets its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TtlMode {
    /// Age is measured from the time the entry was added or replaced.
    #[default]
    Absolute,
    /// Every cache hit refreshes the entry's clock.
    IntervalFromAccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FsConfig {
    /// Maximum number of stat cache entries before eviction kicks in.
    pub cache_size: usize,
    /// Stat cache TTL in seconds; 0 disables expiry.
    pub cache_ttl_secs: u64,
    pub ttl_mode: TtlMode,
    /// Cache 404 responses so repeated lookups of missing paths skip the store.
    pub negative_cache: bool,
    /// Slab size for multipart planning; every non-final part has this size.
    pub max_part_size: u64,
    /// Store-imposed lower bound on non-final part sizes.
    pub min_part_size: u64,
    /// Store-imposed cap on the number of parts per upload.
    pub max_parts: u32,
    /// Store-imposed cap on a single server-side ranged copy.
    pub max_copy_part: u64,
    /// Whether server-side copy of already-stored ranges may be planned.
    pub use_copy_upload: bool,
    /// Number of part-upload worker threads.
    pub upload_parallelism: usize,
    /// Directory for local buffer files; defaults to a per-process temp dir.
    pub buffer_dir: Option<PathBuf>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_size: 100_000,
            cache_ttl_secs: 900,
            ttl_mode: TtlMode::Absolute,
            negative_cache: false,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_parts: DEFAULT_MAX_PARTS,
            max_copy_part: DEFAULT_MAX_COPY_PART,
            use_copy_upload: true,
            upload_parallelism: 5,
            buffer_dir: None,
        }
    }
}

impl FsConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read(path).map_err(Error::from)?;
        let config: FsConfig = serde_json::from_slice(&contents).map_err(Error::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_part_size == 0 {
            return Err(Error::Config("max_part_size cannot be zero".into()).into());
        }
        if self.min_part_size == 0 || self.min_part_size > self.max_part_size {
            return Err(Error::Config(format!(
                "min_part_size {} must be non-zero and not exceed max_part_size {}",
                self.min_part_size, self.max_part_size
            ))
            .into());
        }
        if self.max_parts == 0 || self.max_parts > DEFAULT_MAX_PARTS {
            return Err(Error::Config(format!(
                "max_parts {} must be within 1..={}",
                self.max_parts, DEFAULT_MAX_PARTS
            ))
            .into());
        }
        if self.max_copy_part < self.max_part_size {
            return Err(Error::Config(format!(
                "max_copy_part {} is smaller than max_part_size {}",
                self.max_copy_part, self.max_part_size
            ))
            .into());
        }
        if self.upload_parallelism == 0 {
            return Err(Error::Config("upload_parallelism cannot be zero".into()).into());
        }
        Ok(())
    }

    /// Largest object the configured part layout can represent.
    pub fn max_object_size(&self) -> u64 {
        (self.min_part_size * u64::from(self.max_parts)).min(MAX_OBJECT_SIZE_CAP)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        if self.cache_ttl_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cache_ttl_secs))
        }
    }
}
