//! Serial executor for disk work.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_EXECUTOR: Cell<u64> = const { Cell::new(0) };
}

/// Runs submitted jobs one at a time, in submission order, on a dedicated
/// thread. The thread exits once the executor is dropped and the queue drains.
#[derive(Debug, Clone)]
pub struct SerialExecutor {
    id: u64,
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    /// Spawns the worker thread. If the OS refuses the thread, the failure
    /// is logged and every submitted job is dropped.
    #[must_use]
    pub fn spawn(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let id = NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
        let thread_name = name.to_string();
        let spawned = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            CURRENT_EXECUTOR.with(|current| current.set(id));
            debug!(thread = %thread_name, "Serial executor started");
            while let Some(job) = receiver.blocking_recv() {
                job();
            }
            debug!(thread = %thread_name, "Serial executor stopped");
        });
        if let Err(e) = spawned {
            error!(thread = %name, error = %e, "Failed to spawn serial executor");
        }
        Self { id, sender }
    }

    /// Returns true when called from a job running on this executor.
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT_EXECUTOR.with(Cell::get) == self.id
    }

    /// Queues a job behind every job submitted before it.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("Serial executor is gone, dropping job");
        }
    }

    /// Resolves once every job submitted before this call has run.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}
