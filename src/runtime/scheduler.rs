//! Thread-group scheduler
//!
//! A scheduler owns one worker thread and a FIFO task queue. Node runners
//! assigned to the scheduler submit their tasks here; the worker runs them
//! one after another.
//!
//! Delayed tasks (frequency-limited re-submissions) wait in a separate heap
//! keyed by wake time and are moved to the back of the FIFO queue once due.
//! Nothing else reorders the queue.
//!
//! Pausing holds dispatch: queued tasks stay queued, a task already running
//! runs to completion.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::errors::SchedulingError;
use super::ids::NodeId;
use super::task::Task;
use super::thread_pool::GroupId;
use super::watchdog::{OperationGuard, Watchdog};

struct DelayedTask {
    wake: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.wake == other.wake && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // Reversed so the max-heap pops the earliest wake time first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .wake
            .cmp(&self.wake)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Task>,
    delayed: BinaryHeap<DelayedTask>,
    members: HashSet<NodeId>,
    paused: bool,
    running: bool,
    stopped: bool,
    executed: u64,
    seq: u64,
}

impl QueueState {
    fn push(&mut self, task: Task) {
        match task.wake_time() {
            Some(wake) if wake > Instant::now() => {
                self.seq += 1;
                let seq = self.seq;
                self.delayed.push(DelayedTask { wake, seq, task });
            }
            _ => self.queue.push_back(task),
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|next| next.wake <= now) {
            if let Some(due) = self.delayed.pop() {
                self.queue.push_back(due.task);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        self.delayed.peek().map(|next| next.wake)
    }

    fn is_idle(&self) -> bool {
        !self.running && self.queue.is_empty() && self.delayed.is_empty()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
}

/// Execution context of one thread group (or one private node thread)
pub struct Scheduler {
    id: GroupId,
    name: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler and spawn its worker thread
    pub fn new(
        id: GroupId,
        name: impl Into<String>,
        watchdog: Option<Watchdog>,
    ) -> Result<Arc<Self>, SchedulingError> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(worker_name, worker_shared, watchdog))
            .map_err(|source| SchedulingError::Spawn {
                group: name.clone(),
                source,
            })?;

        info!("[{}] Scheduler started (group {})", name, id);

        Ok(Arc::new(Self {
            id,
            name,
            shared,
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a runner and enqueue the tasks it carried over
    pub fn add(&self, runner: NodeId, tasks: Vec<Task>) {
        let mut state = self.shared.state.lock();
        state.members.insert(runner);
        for task in tasks {
            state.push(task);
        }
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Unregister a runner and hand back its not-yet-started tasks.
    ///
    /// # Panics
    /// Panics if the runner is not a member; that means the pool's
    /// bookkeeping is corrupted and tasks would be lost or duplicated.
    pub fn remove(&self, runner: NodeId) -> Vec<Task> {
        let mut state = self.shared.state.lock();
        if !state.members.remove(&runner) {
            panic!(
                "scheduling inconsistency: runner {} is not assigned to scheduler '{}'",
                runner, self.name
            );
        }

        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(state.queue.len());
        for task in state.queue.drain(..) {
            if task.owner() == Some(runner) {
                taken.push(task);
            } else {
                kept.push_back(task);
            }
        }
        state.queue = kept;

        let mut delayed: Vec<DelayedTask> = std::mem::take(&mut state.delayed).into_vec();
        delayed.sort_by(|a, b| b.cmp(a));
        for entry in delayed {
            if entry.task.owner() == Some(runner) {
                taken.push(entry.task);
            } else {
                state.delayed.push(entry);
            }
        }
        drop(state);
        self.shared.idle.notify_all();

        debug!(
            "[{}] Removed runner {} with {} pending tasks",
            self.name,
            runner,
            taken.len()
        );
        taken
    }

    pub fn is_member(&self, runner: NodeId) -> bool {
        self.shared.state.lock().members.contains(&runner)
    }

    pub fn member_count(&self) -> usize {
        self.shared.state.lock().members.len()
    }

    /// Queue a task; delayed tasks wait until their wake time
    pub fn schedule(&self, task: Task) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            warn!("[{}] Dropping task '{}': scheduler stopped", self.name, task.name());
            return;
        }
        state.push(task);
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Queue a task to run no earlier than `wake`
    pub fn schedule_delayed(&self, task: Task, wake: Instant) {
        self.schedule(task.not_before(wake));
    }

    pub fn set_pause(&self, paused: bool) {
        let mut state = self.shared.state.lock();
        if state.paused == paused {
            return;
        }
        state.paused = paused;
        drop(state);
        debug!("[{}] {}", self.name, if paused { "Paused" } else { "Resumed" });
        self.shared.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Drop all queued and delayed tasks, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.shared.state.lock();
        let dropped = state.queue.len() + state.delayed.len();
        state.queue.clear();
        state.delayed.clear();
        drop(state);
        self.shared.idle.notify_all();
        dropped
    }

    pub fn pending_tasks(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + state.delayed.len()
    }

    pub fn executed_count(&self) -> u64 {
        self.shared.state.lock().executed
    }

    /// Nothing running, nothing queued, nothing delayed
    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().is_idle()
    }

    /// Block until idle or `timeout` elapses. Returns true if idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return state.is_idle();
            }
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Stop the worker after its current task and join it
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.shared.wake.notify_all();
        self.shared.idle.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            // A task on this worker may stop its own scheduler
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = handle.join() {
                error!("[{}] Worker thread panicked: {:?}", self.name, e);
            }
        }
        info!("[{}] Scheduler stopped", self.name);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_worker(name: String, shared: Arc<Shared>, watchdog: Option<Watchdog>) {
    let guard_handle = watchdog.map(|w| w.register(&name, "task"));
    debug!("[{}] Worker running", name);

    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.stopped {
                    debug!("[{}] Worker exiting after {} tasks", name, state.executed);
                    return;
                }
                state.promote_due(Instant::now());
                if !state.paused {
                    if let Some(task) = state.queue.pop_front() {
                        state.running = true;
                        break task;
                    }
                }
                if state.is_idle() {
                    shared.idle.notify_all();
                }
                match state.next_wake() {
                    Some(wake) => {
                        shared.wake.wait_until(&mut state, wake);
                    }
                    None => shared.wake.wait(&mut state),
                }
            }
        };

        let outcome = {
            let _guard = guard_handle
                .as_ref()
                .map(|handle| OperationGuard::with_detail(handle, task.name()));
            panic::catch_unwind(AssertUnwindSafe(|| task.execute()))
        };
        if let Err(payload) = outcome {
            error!(
                "[{}] Task '{}' panicked: {}",
                name,
                task.name(),
                describe_panic(payload.as_ref())
            );
        }

        let mut state = shared.state.lock();
        state.running = false;
        state.executed += 1;
        let idle = state.is_idle();
        drop(state);
        if idle {
            shared.idle.notify_all();
        }
    }
}
