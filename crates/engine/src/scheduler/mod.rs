//! Bounded worker pool for chunk-generation tasks.
//!
//! Jobs go through a bounded FIFO in front of a pool of
//! `core_threads..=max_threads` workers. When the FIFO is full and no further
//! worker may be started, submission fails with [`SchedulerError::Overloaded`]
//! instead of blocking, so a generation surge pushes back on its producer.
//!
//! Workers are detached threads: they never keep the process alive, and any
//! worker (core ones included) exits after `keep_alive` without work.

pub mod handle;

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use slotmap::SlotMap;
use thiserror::Error;

use crate::config::SchedulerConfig;
use crate::util::panic_message;
pub use handle::{CancelToken, TaskHandle, TaskId, TaskOutcome};
use handle::TaskState;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The queue is full and every allowed worker is busy. Back off and retry.
    #[error("scheduler overloaded: queue of {capacity} is full and all {workers} workers are busy")]
    Overloaded { capacity: usize, workers: usize },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

type Work = Box<dyn FnOnce(&CancelToken) + Send + 'static>;

struct Job {
    state: Arc<TaskState>,
    work: Work,
}

/// State shared between the scheduler and its workers.
struct Shared {
    receiver: Receiver<Job>,
    config: SchedulerConfig,
    /// Live worker threads, counting ones reserved but not yet spawned.
    workers: AtomicUsize,
    /// Workers currently inside a job.
    active: AtomicUsize,
    spawned: AtomicUsize,
}

impl Shared {
    /// Claim a worker slot if fewer than `limit` are live.
    fn try_reserve(&self, limit: usize) -> bool {
        self.workers
            .fetch_update(SeqCst, SeqCst, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    /// Called by an idle worker whose keep-alive expired. Returns `true` if
    /// the worker should exit, `false` if it re-claimed a slot because work
    /// arrived while it was leaving.
    fn retire(&self) -> bool {
        self.workers.fetch_sub(1, SeqCst);
        self.receiver.is_empty() || !self.try_reserve(self.config.max_threads)
    }

    fn run_job(&self, job: Job) {
        let Job { state, work } = job;
        if state.is_cancelled() {
            state.finish(TaskOutcome::Cancelled);
            return;
        }

        let token = CancelToken {
            state: Arc::clone(&state),
        };
        self.active.fetch_add(1, SeqCst);
        let result = panic::catch_unwind(AssertUnwindSafe(|| work(&token)));
        self.active.fetch_sub(1, SeqCst);

        let outcome = match result {
            Ok(()) if state.is_cancelled() => TaskOutcome::Cancelled,
            Ok(()) => TaskOutcome::Completed,
            Err(payload) => {
                tracing::error!("Task failed: {}", panic_message(payload.as_ref()));
                TaskOutcome::Failed
            }
        };
        state.finish(outcome);
    }
}

fn worker_loop(shared: Arc<Shared>, mut first: Option<Job>) {
    loop {
        let job = match first.take() {
            Some(job) => job,
            None => match shared.receiver.recv_timeout(shared.config.keep_alive) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => {
                    if shared.retire() {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    shared.workers.fetch_sub(1, SeqCst);
                    break;
                }
            },
        };
        shared.run_job(job);
    }
    tracing::trace!("Worker {:?} exiting", thread::current().name());
}

/// Runs submitted jobs on a bounded pool and can cancel all of them at once.
pub struct TaskScheduler {
    sender: Sender<Job>,
    shared: Arc<Shared>,
    tasks: Mutex<SlotMap<TaskId, Arc<TaskState>>>,
}

impl TaskScheduler {
    /// Build the pool and prestart all core workers.
    ///
    /// A config built by hand is re-capped like [`SchedulerConfig::new`].
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let config = SchedulerConfig::new(config.core_threads, config.max_threads, config.queue_size)
            .with_keep_alive(config.keep_alive);
        let (sender, receiver) = bounded(config.queue_size);
        let core = config.core_threads;
        let scheduler = Self {
            sender,
            shared: Arc::new(Shared {
                receiver,
                config,
                workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
            }),
            tasks: Mutex::new(SlotMap::with_key()),
        };
        for _ in 0..core {
            if scheduler.shared.try_reserve(core) {
                scheduler.spawn_worker(None)?;
            }
        }
        tracing::debug!(
            "Task scheduler started: {} core / {} max workers, queue {}",
            core,
            scheduler.shared.config.max_threads,
            scheduler.shared.config.queue_size
        );
        Ok(scheduler)
    }

    /// Scheduler sized from the environment.
    pub fn from_env() -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::from_env())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Spawn a worker into a slot already claimed with `try_reserve`.
    fn spawn_worker(&self, first: Option<Job>) -> Result<(), SchedulerError> {
        let shared = Arc::clone(&self.shared);
        let n = self.shared.spawned.fetch_add(1, SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("Chunky Worker #{n}"))
            .spawn(move || worker_loop(shared, first));
        if let Err(e) = spawned {
            self.shared.workers.fetch_sub(1, SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, SlotMap<TaskId, Arc<TaskState>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a job to an idle worker, the queue, or a freshly started worker,
    /// in that order of preference.
    fn execute(&self, job: Job) -> Result<(), SchedulerError> {
        let config = &self.shared.config;
        if self.shared.try_reserve(config.core_threads) {
            return self.spawn_worker(Some(job));
        }

        match self.sender.try_send(job) {
            Ok(()) => {
                // Every worker may have timed out between our checks.
                if self.shared.workers.load(SeqCst) == 0 && self.shared.try_reserve(config.max_threads)
                {
                    self.spawn_worker(None)?;
                }
                Ok(())
            }
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => {
                if self.shared.try_reserve(config.max_threads) {
                    return self.spawn_worker(Some(job));
                }
                tracing::debug!(
                    "Rejecting task: queue full ({}) with {} workers",
                    config.queue_size,
                    config.max_threads
                );
                Err(SchedulerError::Overloaded {
                    capacity: config.queue_size,
                    workers: config.max_threads,
                })
            }
        }
    }

    /// Submit a job. Never blocks: a saturated pool returns
    /// [`SchedulerError::Overloaded`].
    ///
    /// Completed handles are pruned from the tracked set on every call.
    pub fn run_task<F>(&self, work: F) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        let state = Arc::new(TaskState::new());
        let id = {
            let mut tasks = self.lock_tasks();
            tasks.retain(|_, task| !task.is_done());
            tasks.insert(Arc::clone(&state))
        };

        let job = Job {
            state: Arc::clone(&state),
            work: Box::new(work),
        };
        if let Err(e) = self.execute(job) {
            self.lock_tasks().remove(id);
            return Err(e);
        }
        Ok(TaskHandle { id, state })
    }

    /// Signal cancellation to every tracked task, forget them, and drop
    /// whatever is still queued. Returns the number of tasks signalled.
    ///
    /// Running jobs keep running until they notice their [`CancelToken`].
    pub fn cancel_tasks(&self) -> usize {
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks.values() {
            task.cancel();
        }

        let mut drained = 0;
        while let Ok(job) = self.shared.receiver.try_recv() {
            job.state.cancel();
            job.state.finish(TaskOutcome::Cancelled);
            drained += 1;
        }

        tracing::info!(
            "Cancelled {} tasks ({} still queued)",
            tasks.len(),
            drained
        );
        tasks.len()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(SeqCst)
    }

    pub fn queued_count(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Handles not yet pruned; may include tasks that have since finished.
    pub fn tracked_count(&self) -> usize {
        self.lock_tasks().len()
    }
}
