//! Logging initialization using `tracing` and `tracing-subscriber`.
//!
//! The filter sits behind a reload handle and the sink behind a shared
//! writer so the control upcalls can bump verbosity and reopen the log file
//! without tearing down the subscriber.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::store::worker::WorkerPoolSnapshot;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Default)]
pub enum LogSink {
    /// Log to stderr, keeping stdout for user output.
    #[default]
    Console,
    /// Append-only log file.
    File(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub sink: LogSink,
    pub debug: bool,
}

enum SinkTarget {
    Stderr,
    File(std::fs::File),
}

#[derive(Clone)]
struct SharedWriter {
    target: Arc<Mutex<SinkTarget>>,
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock() {
            SinkTarget::Stderr => io::stderr().write(buf),
            SinkTarget::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock() {
            SinkTarget::Stderr => io::stderr().flush(),
            SinkTarget::File(file) => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

struct LogController {
    handle: reload::Handle<EnvFilter, Registry>,
    writer: SharedWriter,
    level_idx: Mutex<usize>,
    file_path: Option<PathBuf>,
}

static CONTROLLER: OnceLock<LogController> = OnceLock::new();

fn ensure_parent(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn open_log_file(path: &std::path::Path) -> Result<std::fs::File> {
    ensure_parent(path)?;
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

/// Initialize the global subscriber. Safe to call multiple times; subsequent
/// calls no-op.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    if CONTROLLER.get().is_some() {
        return Ok(());
    }

    let level_idx = if config.debug { 4 } else { 2 };
    let filter = if config.debug {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (target, ansi, file_path) = match &config.sink {
        LogSink::Console => (SinkTarget::Stderr, true, None),
        LogSink::File(path) => (
            SinkTarget::File(open_log_file(path)?),
            false,
            Some(path.clone()),
        ),
    };
    let writer = SharedWriter {
        target: Arc::new(Mutex::new(target)),
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer.clone());

    match config.format {
        LogFormat::Human => {
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer.json())
                .try_init();
        }
    }

    let _ = CONTROLLER.set(LogController {
        handle,
        writer,
        level_idx: Mutex::new(level_idx),
        file_path,
    });
    Ok(())
}

/// Cycle the log filter one level more verbose, wrapping around to `error`.
pub fn bump_log_level() {
    let Some(controller) = CONTROLLER.get() else {
        return;
    };
    let mut idx = controller.level_idx.lock();
    *idx = (*idx + 1) % LEVELS.len();
    let level = LEVELS[*idx];
    if controller.handle.reload(EnvFilter::new(level)).is_ok() {
        info!(level, "log level changed");
    }
}

/// Reopen the file sink, for coordination with external log rotation. A
/// console sink stays as it is.
pub fn reopen_log() {
    let Some(controller) = CONTROLLER.get() else {
        return;
    };
    let Some(path) = &controller.file_path else {
        return;
    };
    match open_log_file(path) {
        Ok(file) => {
            *controller.writer.target.lock() = SinkTarget::File(file);
            info!(path = %path.display(), "log file reopened");
        }
        Err(err) => {
            eprintln!("obsfs: failed to reopen log file {}: {err}", path.display());
        }
    }
}

/// Emit structured metrics about the upload worker pool. Callers should pass
/// a periodically sampled snapshot to avoid excessive log volume.
pub fn log_worker_pool_metrics(snapshot: WorkerPoolSnapshot) {
    info!(
        target = "obsfs::upload_worker",
        queue_depth = snapshot.queue_depth,
        tasks_total = snapshot.tasks_total,
        "upload_worker_pool_snapshot"
    );
}
