//! Fixed-size worker pool for part uploads.
//!
//! Submit-and-signal: the pool runs jobs with bounded parallelism and the
//! jobs themselves signal their coordinator on completion; the pool never
//! reports results upward.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Periodically sampled pool health, emitted through the logging layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPoolSnapshot {
    pub queue_depth: usize,
    pub tasks_total: u64,
}

struct PoolShared {
    receiver: Mutex<mpsc::Receiver<Job>>,
    queue_depth: AtomicUsize,
    tasks_total: AtomicU64,
}

pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(PoolShared {
            receiver: Mutex::new(receiver),
            queue_depth: AtomicUsize::new(0),
            tasks_total: AtomicU64::new(0),
        });

        let threads = (0..parallelism.max(1))
            .map(|index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("upload-worker-{index}"))
                    .spawn(move || loop {
                        // Hold the receiver lock only long enough to pop one job.
                        let job = {
                            let receiver = shared.receiver.lock();
                            receiver.recv()
                        };
                        match job {
                            Ok(job) => {
                                shared.queue_depth.fetch_sub(1, Ordering::Relaxed);
                                shared.tasks_total.fetch_add(1, Ordering::Relaxed);
                                job();
                            }
                            Err(_) => break,
                        }
                    })
                    .expect("worker thread spawn")
            })
            .collect();

        Self {
            sender: Some(sender),
            shared,
            threads,
        }
    }

    /// Queue a job. Jobs must do their own completion signalling.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.shared.queue_depth.fetch_add(1, Ordering::Relaxed);
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                self.shared.queue_depth.fetch_sub(1, Ordering::Relaxed);
                debug!("worker pool is shut down; job dropped");
            }
        }
    }

    pub fn snapshot(&self) -> WorkerPoolSnapshot {
        WorkerPoolSnapshot {
            queue_depth: self.shared.queue_depth.load(Ordering::Relaxed),
            tasks_total: self.shared.tasks_total.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets idle workers exit; queued jobs still run.
        self.sender.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
