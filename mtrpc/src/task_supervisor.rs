use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once stop was requested and every task has exited.
    stopped: CancellationToken,
}

/// Tracks the background tasks of a listener or a connection.
///
/// Tasks hold a [`TaskSupervisorGuard`] for as long as they run. After
/// [`stop`](Self::stop), [`all_stopped`](Self::all_stopped) resolves when the
/// last guard is dropped. The stop token doubles as the parent of per-call
/// cancellation tokens, so stopping a connection cancels all its calls.
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisorState {
    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // keeps the count above zero until stop is requested.
        let guard = supervisor.start_async_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    /// A token cancelled together with this supervisor.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.0.stop.child_token()
    }

    #[must_use]
    pub fn running(&self) -> u64 {
        self.0.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Tracks another task of the same supervisor.
    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}
