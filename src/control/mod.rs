//! Control upcalls into the running filesystem.
//!
//! Three entry points, shaped so an embedder can wire them to OS signals or
//! anything else: an asynchronous cache walk that reports locally buffered
//! pages per open file, a log verbosity bump, and a log reopen. The cache
//! walk runs on its own thread behind a condvar hand-off; requests arriving
//! while a walk is running coalesce into a single follow-up walk.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use crate::fs::{FileReport, ObjectFs};
use crate::logging;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub enum ReportSink {
    #[default]
    Stderr,
    File(PathBuf),
}

impl ReportSink {
    fn write(&self, reports: &[FileReport]) -> Result<()> {
        use std::io::Write;
        let mut lines = Vec::new();
        for report in reports {
            serde_json::to_writer(&mut lines, report).map_err(crate::Error::from)?;
            lines.push(b'\n');
        }
        match self {
            ReportSink::Stderr => {
                std::io::stderr().write_all(&lines)?;
            }
            ReportSink::File(path) => {
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                file.write_all(&lines)?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct SignalState {
    pending: bool,
    shutdown: bool,
}

struct SignalShared {
    state: Mutex<SignalState>,
    cond: Condvar,
}

pub struct ControlSignals {
    shared: Arc<SignalShared>,
    walker: Option<JoinHandle<()>>,
}

impl ControlSignals {
    /// Start the cache-check walker against a filesystem instance. The
    /// walker holds only a weak reference and exits when the filesystem is
    /// dropped.
    pub fn spawn(fs: &Arc<ObjectFs>, sink: ReportSink) -> Self {
        let shared = Arc::new(SignalShared {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        });
        let walker_shared = shared.clone();
        let weak_fs: Weak<ObjectFs> = Arc::downgrade(fs);

        let walker = std::thread::Builder::new()
            .name("cache-check".into())
            .spawn(move || loop {
                // Queued walks are drained before shutdown is honored, so a
                // request that raced teardown still produces its report.
                {
                    let mut state = walker_shared.state.lock();
                    while !state.pending && !state.shutdown {
                        walker_shared.cond.wait(&mut state);
                    }
                    if !state.pending {
                        break;
                    }
                    // Coalesce every wakeup queued so far into this walk.
                    state.pending = false;
                }

                let Some(fs) = weak_fs.upgrade() else {
                    break;
                };
                let reports = fs.cache_report();
                logging::log_worker_pool_metrics(fs.worker_pool_snapshot());
                info!(files = reports.len(), "cache check walk");
                if let Err(err) = sink.write(&reports) {
                    error!(%err, "failed to write cache report");
                }
            })
            .expect("cache-check thread spawn");

        Self {
            shared,
            walker: Some(walker),
        }
    }

    /// Queue a cache walk; returns immediately.
    pub fn check_cache(&self) {
        let mut state = self.shared.state.lock();
        state.pending = true;
        self.shared.cond.notify_one();
    }

    /// Raise log verbosity by one level, wrapping around.
    pub fn bump_log_level(&self) {
        logging::bump_log_level();
    }

    /// Reopen the log destination for external rotation.
    pub fn reopen_log(&self) {
        logging::reopen_log();
    }
}

impl Drop for ControlSignals {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(walker) = self.walker.take() {
            let _ = walker.join();
        }
    }
}
