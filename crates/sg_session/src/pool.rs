//! Worker pool for CPU-bound jobs (sealing and signing outbound messages).
//!
//! Jobs are submitted without waiting; a fixed number of tokio workers pull
//! them from a shared channel and run each on the blocking thread pool.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(runtime: &Handle, size: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                runtime.spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        if let Err(err) = tokio::task::spawn_blocking(job).await {
                            warn!(worker, error = %err, "worker job panicked");
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        Self { sender, workers }
    }

    /// Queue a job. Returns `false` if the pool has shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(Box::new(job)).is_ok()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}
