//! Port for host-provided background execution time.

/// Identifier of a granted background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackgroundTaskId(pub u64);

/// Host hook that keeps the process alive while a download finishes.
pub trait BackgroundTaskPort: Send + Sync {
    /// Requests extra run time. `on_expire` runs if the grant lapses first.
    /// Returns `None` when the host has no such facility.
    fn begin_task(&self, name: &str, on_expire: Box<dyn FnOnce() + Send>)
    -> Option<BackgroundTaskId>;

    /// Releases a grant obtained from [`begin_task`](Self::begin_task).
    fn end_task(&self, id: BackgroundTaskId);
}

/// Host without background execution support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackgroundTasks;

impl BackgroundTaskPort for NoBackgroundTasks {
    fn begin_task(
        &self,
        _name: &str,
        _on_expire: Box<dyn FnOnce() + Send>,
    ) -> Option<BackgroundTaskId> {
        None
    }

    fn end_task(&self, _id: BackgroundTaskId) {}
}
