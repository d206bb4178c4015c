// Task Scheduler Module
//
// INTENTION:
// Run application code (function handlers, event slots, remote requests) on a worker
// pool with named groups. A group can be configured for serial execution so that tasks
// posted from any number of threads run one at a time, in post order.
//
// ARCHITECTURAL PRINCIPLES:
// 1. The scheduler owns a tokio multi-thread runtime; task bodies are plain closures run
//    through `spawn_blocking`, so a body may block (e.g. a handler doing a sync call).
// 2. A configured group is a channel drained by one driver task. Serial groups await
//    each body before taking the next; in-order groups only start bodies in order.
// 3. Every task is tracked until it finishes or is cancelled so that callers can wait
//    on one task, on one group, or on everything.
// 4. A task body knows which scheduler it runs on (thread-local marker), which is what
//    `dispatch` uses to run inline instead of queueing.

use dashmap::DashMap;
use keel_common::logging::{Component, Logger};
use keel_common::{log_debug, log_error, log_info, log_warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::SchedulerConfig;

/// Identifier of a posted task
pub type TaskId = u64;

/// A one-shot task body
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A periodic task body; returning `false` ends the repetition
pub type PeriodicTask = Box<dyn FnMut() -> bool + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Ordering options of a task group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupConfig {
    /// Run the group's tasks one at a time, in post order
    pub enable_serial_execution: bool,
    /// Start the group's tasks in post order (they may overlap)
    pub enable_post_execute_in_order: bool,
}

impl GroupConfig {
    pub fn serial() -> Self {
        Self {
            enable_serial_execution: true,
            enable_post_execute_in_order: true,
        }
    }
}

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_SCHEDULER: Cell<u64> = const { Cell::new(0) };
}

// Marks the current thread as running a task of a scheduler until dropped
struct SchedulerScope {
    previous: u64,
}

impl SchedulerScope {
    fn enter(scheduler_id: u64) -> Self {
        let previous = CURRENT_SCHEDULER.with(|current| current.replace(scheduler_id));
        Self { previous }
    }
}

impl Drop for SchedulerScope {
    fn drop(&mut self) {
        CURRENT_SCHEDULER.with(|current| current.set(self.previous));
    }
}

struct TrackedTask {
    group: Option<String>,
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct TaskTracker {
    tasks: Mutex<HashMap<TaskId, TrackedTask>>,
    changed: Condvar,
}

impl TaskTracker {
    fn track(&self, id: TaskId, group: Option<&str>) -> Arc<AtomicBool> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks.lock().insert(
            id,
            TrackedTask {
                group: group.map(str::to_string),
                cancelled: cancelled.clone(),
                abort: None,
            },
        );
        cancelled
    }

    fn set_abort(&self, id: TaskId, abort: AbortHandle) {
        if let Some(task) = self.tasks.lock().get_mut(&id) {
            task.abort = Some(abort);
        }
    }

    fn finish(&self, id: TaskId) {
        let removed = self.tasks.lock().remove(&id).is_some();
        if removed {
            self.changed.notify_all();
        }
    }

    fn cancel(&self, id: TaskId) -> bool {
        let task = self.tasks.lock().remove(&id);
        match task {
            Some(task) => {
                task.cancelled.store(true, Ordering::SeqCst);
                if let Some(abort) = task.abort {
                    abort.abort();
                }
                self.changed.notify_all();
                true
            }
            None => false,
        }
    }

    fn clear(&self) {
        let drained: Vec<TrackedTask> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        for task in drained {
            task.cancelled.store(true, Ordering::SeqCst);
            if let Some(abort) = task.abort {
                abort.abort();
            }
        }
        self.changed.notify_all();
    }

    /// Block until `done` holds over the task table or the timeout elapses
    fn wait_until(
        &self,
        timeout: Duration,
        done: impl Fn(&HashMap<TaskId, TrackedTask>) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock();
        while !done(&*tasks) {
            if self.changed.wait_until(&mut tasks, deadline).timed_out() {
                return done(&*tasks);
            }
        }
        true
    }
}

// Removes the task from the tracker when the job is dropped, whether it ran or not
struct FinishGuard {
    tracker: Arc<TaskTracker>,
    id: TaskId,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.id);
    }
}

struct GroupState {
    config: GroupConfig,
    queue: mpsc::UnboundedSender<Job>,
}

/// Worker-pool executor with named groups, delayed/periodic posting,
/// cancellation and waiting.
pub struct TaskScheduler {
    id: u64,
    logger: Arc<Logger>,
    runtime: Mutex<Option<Runtime>>,
    handle: RwLock<Option<Handle>>,
    groups: DashMap<String, GroupState>,
    tracker: Arc<TaskTracker>,
    next_task_id: AtomicU64,
}

impl TaskScheduler {
    pub fn new(logger: &Logger) -> Self {
        Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            logger: Arc::new(logger.with_component(Component::Scheduler)),
            runtime: Mutex::new(None),
            handle: RwLock::new(None),
            groups: DashMap::new(),
            tracker: Arc::new(TaskTracker::default()),
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Start the worker pool. Starting a running scheduler is a no-op.
    pub fn start(&self, config: &SchedulerConfig) -> bool {
        let mut runtime_slot = self.runtime.lock();
        if runtime_slot.is_some() {
            log_debug!(self.logger, "Already running");
            return true;
        }

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .worker_threads(config.worker_count())
            .max_blocking_threads(config.max_blocking_threads.max(1))
            .thread_name(config.thread_name())
            .enable_all();
        if let Some(stack_size) = config.stack_size() {
            builder.thread_stack_size(stack_size);
        }

        let runtime = match builder.build() {
            Ok(runtime) => runtime,
            Err(e) => {
                log_error!(self.logger, "Failed to build runtime: {}", e);
                return false;
            }
        };

        *self.handle.write() = Some(runtime.handle().clone());
        *runtime_slot = Some(runtime);
        log_info!(self.logger, "Started with {}", config);
        true
    }

    /// Stop the worker pool. Queued tasks are dropped; running bodies finish on their own.
    pub fn stop(&self) {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };

        *self.handle.write() = None;
        self.groups.clear();
        self.tracker.clear();
        // Safe from async contexts, unlike dropping the runtime
        runtime.shutdown_background();
        log_info!(self.logger, "Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Whether the calling thread is currently executing a task of this scheduler
    pub fn is_current_thread(&self) -> bool {
        CURRENT_SCHEDULER.with(|current| current.get() == self.id)
    }

    /// Configure (or reconfigure) a named group
    pub fn configure_group(&self, name: &str, config: GroupConfig) -> bool {
        let Some(handle) = self.handle.read().clone() else {
            log_warn!(self.logger, "Cannot configure group `{}`: not running", name);
            return false;
        };

        if let Some(existing) = self.groups.get(name) {
            if existing.config == config && !existing.queue.is_closed() {
                return true;
            }
        }

        if !config.enable_serial_execution && !config.enable_post_execute_in_order {
            self.groups.remove(name);
            return true;
        }

        let (queue, mut receiver) = mpsc::unbounded_channel::<Job>();
        let serial = config.enable_serial_execution;
        let driver_handle = handle.clone();
        handle.spawn(async move {
            while let Some(job) = receiver.recv().await {
                let running = driver_handle.spawn_blocking(job);
                if serial {
                    let _ = running.await;
                }
            }
        });

        self.groups
            .insert(name.to_string(), GroupState { config, queue });
        log_debug!(self.logger, "Configured group `{}`: {:?}", name, config);
        true
    }

    fn next_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    fn make_job(&self, id: TaskId, cancelled: Arc<AtomicBool>, task: Task) -> Job {
        let guard = FinishGuard {
            tracker: self.tracker.clone(),
            id,
        };
        let scheduler_id = self.id;
        let logger = self.logger.clone();
        Box::new(move || {
            let _guard = guard;
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            let _scope = SchedulerScope::enter(scheduler_id);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log_error!(logger, "Task {} panicked", id);
            }
        })
    }

    /// Queue a task, optionally on a named group. Returns the task id, or `None`
    /// when the scheduler is not running.
    pub fn post(&self, task: Task, group: Option<&str>) -> Option<TaskId> {
        let Some(handle) = self.handle.read().clone() else {
            log_warn!(self.logger, "Cannot post task: not running");
            return None;
        };

        let id = self.next_id();
        let cancelled = self.tracker.track(id, group);
        let job = self.make_job(id, cancelled, task);

        let queue = group.and_then(|g| self.groups.get(g).map(|state| state.queue.clone()));
        match queue {
            Some(queue) => {
                // A send error drops the job, whose guard untracks it
                if queue.send(job).is_err() {
                    log_warn!(self.logger, "Group `{:?}` is closed", group);
                    return None;
                }
            }
            None => {
                handle.spawn_blocking(job);
            }
        }
        Some(id)
    }

    /// Run the task inline when the caller is already executing on this scheduler,
    /// otherwise behave like `post`.
    pub fn dispatch(&self, task: Task, group: Option<&str>) -> Option<TaskId> {
        if !self.is_current_thread() {
            return self.post(task, group);
        }
        if !self.is_running() {
            return None;
        }

        let id = self.next_id();
        let cancelled = self.tracker.track(id, group);
        let job = self.make_job(id, cancelled, task);
        job();
        Some(id)
    }

    /// Queue a task to run once after `delay`
    pub fn post_delayed(&self, task: Task, delay: Duration) -> Option<TaskId> {
        let Some(handle) = self.handle.read().clone() else {
            log_warn!(self.logger, "Cannot post delayed task: not running");
            return None;
        };

        let id = self.next_id();
        let cancelled = self.tracker.track(id, None);
        let job = self.make_job(id, cancelled, task);
        let blocking = handle.clone();
        let join = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = blocking.spawn_blocking(job).await;
        });
        self.tracker.set_abort(id, join.abort_handle());
        Some(id)
    }

    /// Run `task` every `interval` until it returns `false` or is cancelled
    pub fn post_periodic(&self, task: PeriodicTask, interval: Duration) -> Option<TaskId> {
        let Some(handle) = self.handle.read().clone() else {
            log_warn!(self.logger, "Cannot post periodic task: not running");
            return None;
        };

        let id = self.next_id();
        let cancelled = self.tracker.track(id, None);
        let guard = FinishGuard {
            tracker: self.tracker.clone(),
            id,
        };
        let scheduler_id = self.id;
        let logger = self.logger.clone();
        let blocking = handle.clone();
        let join = handle.spawn(async move {
            let _guard = guard;
            let mut slot = Some(task);
            while let Some(mut task) = slot.take() {
                tokio::time::sleep(interval).await;
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                let iteration = blocking.spawn_blocking(move || {
                    let _scope = SchedulerScope::enter(scheduler_id);
                    let keep = catch_unwind(AssertUnwindSafe(|| task())).unwrap_or(false);
                    (task, keep)
                });
                match iteration.await {
                    Ok((task, true)) => slot = Some(task),
                    Ok((_, false)) => {}
                    Err(e) => log_error!(logger, "Periodic task {} failed: {}", id, e),
                }
            }
        });
        self.tracker.set_abort(id, join.abort_handle());
        Some(id)
    }

    /// Cancel a queued, delayed or periodic task. A body that already started runs to completion.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.tracker.cancel(id)
    }

    /// Wait until the task finished or was cancelled
    pub fn wait(&self, id: TaskId, timeout: Duration) -> bool {
        self.tracker
            .wait_until(timeout, |tasks| !tasks.contains_key(&id))
    }

    /// Wait until every tracked task of one group finished
    pub fn wait_group(&self, group: &str, timeout: Duration) -> bool {
        self.tracker.wait_until(timeout, |tasks| {
            !tasks
                .values()
                .any(|task| task.group.as_deref() == Some(group))
        })
    }

    /// Wait until every tracked task finished
    pub fn wait_all(&self, timeout: Duration) -> bool {
        self.tracker.wait_until(timeout, |tasks| tasks.is_empty())
    }

    /// Number of tasks queued or running
    pub fn pending_tasks(&self) -> usize {
        self.tracker.tasks.lock().len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
