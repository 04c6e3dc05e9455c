use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use slotmap::new_key_type;

new_key_type! {
    /// Handle key for a task tracked by the scheduler.
    pub struct TaskId;
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Cancelled before it started, or it returned after observing cancellation.
    Cancelled,
    /// The job panicked.
    Failed,
}

pub(crate) struct TaskState {
    cancelled: AtomicBool,
    outcome: Mutex<Option<TaskOutcome>>,
    finished: Condvar,
}

impl TaskState {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            outcome: Mutex::new(None),
            finished: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<TaskOutcome>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.lock().is_some()
    }

    pub(crate) fn finish(&self, outcome: TaskOutcome) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.finished.notify_all();
    }
}

/// Cooperative cancellation signal handed to every running job.
///
/// Jobs should poll [`is_cancelled`](Self::is_cancelled) at natural
/// checkpoints and return early once it flips; nothing is force-terminated.
#[derive(Clone)]
pub struct CancelToken {
    pub(crate) state: Arc<TaskState>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// Caller's view of a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) id: TaskId,
    pub(crate) state: Arc<TaskState>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Request cancellation of this task only.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Block until the task has ended.
    pub fn wait(&self) -> TaskOutcome {
        let mut slot = self.state.lock();
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            slot = self
                .state
                .finished
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let slot = self.state.lock();
        let (slot, _) = self
            .state
            .finished
            .wait_timeout_while(slot, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *slot
    }
}
