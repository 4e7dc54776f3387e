use thiserror::Error;

pub mod cache;
pub mod cli;
pub mod config;
pub mod control;
pub mod fs;
pub mod logging;
pub mod store;
pub mod util;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("remote store failure: {0}")]
    Store(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("operation canceled")]
    Canceled,
    #[error("handle misuse: {0}")]
    Misuse(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map a library error onto the errno reported at the filesystem boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::Canceled => libc::ECANCELED,
            Error::Misuse(_) => libc::EBADF,
            Error::Config(_) | Error::Serde(_) => libc::EINVAL,
            Error::Invariant(_) | Error::Store(_) => libc::EIO,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Extract an errno from any error chain, defaulting to EIO for errors that
/// did not originate in this crate.
pub fn errno_of(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(e) => e.to_errno(),
        None => match err.downcast_ref::<std::io::Error>() {
            Some(io) => io.raw_os_error().unwrap_or(libc::EIO),
            None => libc::EIO,
        },
    }
}

/// Build an `Error` back from a worker-recorded errno.
pub fn error_from_errno(errno: i32) -> Error {
    match errno {
        x if x == libc::ENOENT => Error::NotFound(String::new()),
        x if x == libc::ECANCELED => Error::Canceled,
        x if x == libc::EBADF => Error::Misuse("bad handle".into()),
        other => Error::Io(std::io::Error::from_raw_os_error(other)),
    }
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    // Initialize logging before doing anything else. Defaults to human format for the CLI.
    logging::init_logging(logging::LoggingConfig::default())?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}
