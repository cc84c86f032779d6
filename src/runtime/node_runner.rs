//! Per-node scheduling proxy
//!
//! A [`NodeRunner`] listens to its node's readiness signals and decides when
//! to submit the node's execution task to the scheduler it is assigned to.
//! Pause, stepping and frequency limiting all live here; the node handle
//! itself only knows whether it *can* run.
//!
//! While unassigned, submitted tasks are buffered and handed to the next
//! scheduler on assignment, so reassignment never loses or duplicates work.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

use super::ids::NodeId;
use super::node_handle::NodeHandle;
use super::node_state::ErrorState;
use super::rate::Rate;
use super::scheduler::Scheduler;
use super::signal::SubscriptionId;
use super::task::Task;

struct Assignment {
    scheduler: Option<Arc<Scheduler>>,
    /// Tasks submitted while unassigned
    remaining: Vec<Task>,
    initialized: bool,
}

struct Subscriptions {
    try_process: SubscriptionId,
    parameters_changed: SubscriptionId,
    enabled_changed: SubscriptionId,
    slot_triggered: SubscriptionId,
}

pub struct NodeRunner {
    handle: Arc<NodeHandle>,
    assignment: Mutex<Assignment>,
    execute_task: Task,
    delayed_execute_task: Task,
    check_parameters_task: Task,
    paused: AtomicBool,
    stepping: AtomicBool,
    step_granted: AtomicBool,
    step_pending: AtomicBool,
    step_available: AtomicBool,
    /// A frequency-limited execution is scheduled for later
    waiting: AtomicBool,
    /// An execute task is queued and has not started yet
    queued: AtomicBool,
    rate: Mutex<Rate>,
    executions: AtomicU64,
    subscriptions: Mutex<Option<Subscriptions>>,
}

impl NodeRunner {
    pub fn new(handle: Arc<NodeHandle>) -> Arc<Self> {
        let id = handle.id();
        let runner = Arc::new_cyclic(|weak: &Weak<NodeRunner>| {
            let execute_task = {
                let weak = weak.clone();
                Task::new(format!("execute {}", id), Some(id), move || {
                    if let Some(runner) = weak.upgrade() {
                        runner.execute();
                    }
                })
            };
            let delayed_execute_task = {
                let weak = weak.clone();
                Task::new(format!("execute {} (delayed)", id), Some(id), move || {
                    if let Some(runner) = weak.upgrade() {
                        runner.waiting.store(false, Ordering::SeqCst);
                        runner.execute();
                    }
                })
            };
            let check_parameters_task = {
                let weak = weak.clone();
                Task::new(format!("check parameters {}", id), Some(id), move || {
                    if let Some(runner) = weak.upgrade() {
                        runner.check_parameters();
                    }
                })
            };

            Self {
                handle,
                assignment: Mutex::new(Assignment {
                    scheduler: None,
                    remaining: Vec::new(),
                    initialized: false,
                }),
                execute_task,
                delayed_execute_task,
                check_parameters_task,
                paused: AtomicBool::new(false),
                stepping: AtomicBool::new(false),
                step_granted: AtomicBool::new(false),
                step_pending: AtomicBool::new(false),
                step_available: AtomicBool::new(false),
                waiting: AtomicBool::new(false),
                queued: AtomicBool::new(false),
                rate: Mutex::new(Rate::default()),
                executions: AtomicU64::new(0),
                subscriptions: Mutex::new(None),
            }
        });
        runner.connect_signals();
        runner
    }

    fn connect_signals(self: &Arc<Self>) {
        let events = self.handle.events();

        let weak = Arc::downgrade(self);
        let try_process = events.try_process.subscribe(move |_| {
            if let Some(runner) = weak.upgrade() {
                runner.schedule_process();
            }
        });

        let weak = Arc::downgrade(self);
        let parameters_changed = events.parameters_changed.subscribe(move |_| {
            if let Some(runner) = weak.upgrade() {
                runner.schedule(runner.check_parameters_task.clone());
                runner.schedule_process();
            }
        });

        let weak = Arc::downgrade(self);
        let enabled_changed = events.enabled_changed.subscribe(move |enabled| {
            if let Some(runner) = weak.upgrade() {
                if *enabled {
                    runner.schedule_process();
                }
            }
        });

        let weak = Arc::downgrade(self);
        let slot_triggered = events.slot_triggered.subscribe(move |slot| {
            let Some(runner) = weak.upgrade() else {
                return;
            };
            let slot = *slot;
            let task_runner = Arc::downgrade(&runner);
            runner.schedule(Task::new(
                format!("slot {}", slot),
                Some(runner.id()),
                move || {
                    if let Some(runner) = task_runner.upgrade() {
                        if let Err(error) = runner.handle.handle_slot(slot) {
                            runner.handle.record_error(&error);
                        }
                    }
                },
            ));
        });

        *self.subscriptions.lock() = Some(Subscriptions {
            try_process,
            parameters_changed,
            enabled_changed,
            slot_triggered,
        });
    }

    pub fn id(&self) -> NodeId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<NodeHandle> {
        &self.handle
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.assignment.lock().scheduler.clone()
    }

    pub fn is_assigned(&self) -> bool {
        self.assignment.lock().scheduler.is_some()
    }

    // ────────────────────────────────────────────────────────────────────
    // Assignment
    // ────────────────────────────────────────────────────────────────────

    /// Attach to `scheduler`, carrying over buffered tasks.
    ///
    /// # Panics
    /// Panics if the runner is already assigned.
    pub fn assign_to_scheduler(&self, scheduler: &Arc<Scheduler>) {
        let first = {
            let mut assignment = self.assignment.lock();
            if let Some(current) = &assignment.scheduler {
                panic!(
                    "scheduling inconsistency: runner {} is already assigned to '{}'",
                    self.id(),
                    current.name()
                );
            }
            let carried = std::mem::take(&mut assignment.remaining);
            debug!(
                "[{}] Assigned to '{}' with {} carried tasks",
                self.id(),
                scheduler.name(),
                carried.len()
            );
            scheduler.add(self.id(), carried);
            assignment.scheduler = Some(Arc::clone(scheduler));
            let first = !assignment.initialized;
            assignment.initialized = true;
            first
        };

        self.handle.set_thread_group(Some(scheduler.id()));
        if first {
            self.schedule(self.check_parameters_task.clone());
        }
        self.schedule_process();
    }

    /// Leave the current scheduler; its pending tasks for this runner are
    /// buffered until the next assignment.
    ///
    /// # Panics
    /// Panics if the runner is not assigned.
    pub fn detach(&self) {
        let mut assignment = self.assignment.lock();
        let Some(scheduler) = assignment.scheduler.take() else {
            panic!(
                "scheduling inconsistency: runner {} detached while unassigned",
                self.id()
            );
        };
        let pending = scheduler.remove(self.id());
        assignment.remaining.extend(pending);
    }

    /// Hand out the buffered tasks (used when the node is removed)
    pub fn take_remaining_tasks(&self) -> Vec<Task> {
        std::mem::take(&mut self.assignment.lock().remaining)
    }

    pub fn remaining_tasks(&self) -> usize {
        self.assignment.lock().remaining.len()
    }

    /// Submit a task to the assigned scheduler, or buffer it
    pub fn schedule(&self, task: Task) {
        let mut assignment = self.assignment.lock();
        match &assignment.scheduler {
            Some(scheduler) => scheduler.schedule(task),
            None => assignment.remaining.push(task),
        }
    }

    pub fn schedule_delayed(&self, task: Task, wake: Instant) {
        self.schedule(task.not_before(wake));
    }

    // ────────────────────────────────────────────────────────────────────
    // Execution
    // ────────────────────────────────────────────────────────────────────

    /// Submit the execute task if policy allows.
    ///
    /// Returns true if an execution is now pending (queued or delayed).
    pub fn schedule_process(&self) -> bool {
        if self.paused.load(Ordering::SeqCst) {
            return false;
        }
        if self.stepping.load(Ordering::SeqCst)
            && self.handle.is_source()
            && !self.step_granted.swap(false, Ordering::SeqCst)
        {
            return false;
        }
        if self.waiting.load(Ordering::SeqCst) {
            return true;
        }
        if !self.queued.swap(true, Ordering::SeqCst) {
            self.schedule(self.execute_task.clone());
        }
        true
    }

    fn execute(&self) {
        self.queued.store(false, Ordering::SeqCst);

        if !self.handle.can_execute() {
            self.step_available.store(true, Ordering::SeqCst);
            self.step_pending.store(false, Ordering::SeqCst);
            return;
        }

        let now = Instant::now();
        let deferred_until = {
            let mut rate = self.rate.lock();
            rate.set_frequency(self.handle.max_frequency());
            match rate.next_allowed_start() {
                Some(next) if next > now => Some(next),
                _ => {
                    rate.start_cycle(now);
                    None
                }
            }
        };
        if let Some(next) = deferred_until {
            self.waiting.store(true, Ordering::SeqCst);
            self.schedule(self.delayed_execute_task.clone().not_before(next));
            return;
        }

        match self.handle.execute() {
            Ok(true) => {
                self.executions.fetch_add(1, Ordering::Relaxed);
                if self.handle.has_error() {
                    self.handle.clear_error();
                }
            }
            Ok(false) => self.step_available.store(true, Ordering::SeqCst),
            Err(error) => {
                self.executions.fetch_add(1, Ordering::Relaxed);
                self.handle.record_error(&error);
            }
        }
        self.step_pending.store(false, Ordering::SeqCst);
    }

    fn check_parameters(&self) {
        if let Err(error) = self.handle.check_parameters() {
            warn!("[{}] Parameter check failed: {}", self.id(), error);
            self.handle.set_error(ErrorState::warning(error.to_string()));
        }
    }

    /// Completed execute cycles, failed ones included
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn effective_frequency(&self) -> f64 {
        self.rate.lock().effective_frequency()
    }

    // ────────────────────────────────────────────────────────────────────
    // Pause and stepping
    // ────────────────────────────────────────────────────────────────────

    pub fn set_pause(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        if was && !paused {
            self.schedule_process();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_stepping_mode(&self, stepping: bool) {
        let was = self.stepping.swap(stepping, Ordering::SeqCst);
        self.step_granted.store(false, Ordering::SeqCst);
        self.step_pending.store(false, Ordering::SeqCst);
        if was && !stepping {
            self.schedule_process();
        }
    }

    pub fn is_stepping(&self) -> bool {
        self.stepping.load(Ordering::SeqCst)
    }

    /// Grant one activation. Done when the node has executed or declined.
    pub fn step(&self) {
        self.step_available.store(false, Ordering::SeqCst);
        self.step_pending.store(true, Ordering::SeqCst);
        self.step_granted.store(true, Ordering::SeqCst);
        if !self.schedule_process() {
            self.step_granted.store(false, Ordering::SeqCst);
            self.step_pending.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_step_done(&self) -> bool {
        !self.step_pending.load(Ordering::SeqCst)
    }

    /// The node declined to run during its last dispatch
    pub fn is_step_available(&self) -> bool {
        self.step_available.load(Ordering::SeqCst)
    }

    /// Forget queued/delayed markers after the scheduler dropped its tasks
    pub fn clear_flags(&self) {
        self.queued.store(false, Ordering::SeqCst);
        self.waiting.store(false, Ordering::SeqCst);
        self.step_granted.store(false, Ordering::SeqCst);
        self.step_pending.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.rate.lock().reset();
        self.clear_flags();
    }
}

impl Drop for NodeRunner {
    fn drop(&mut self) {
        if let Some(subscriptions) = self.subscriptions.lock().take() {
            let events = self.handle.events();
            events.try_process.unsubscribe(subscriptions.try_process);
            events
                .parameters_changed
                .unsubscribe(subscriptions.parameters_changed);
            events.enabled_changed.unsubscribe(subscriptions.enabled_changed);
            events.slot_triggered.unsubscribe(subscriptions.slot_triggered);
        }
    }
}

impl fmt::Debug for NodeRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NodeRunner")
            .field("node", &self.id())
            .field("assigned", &self.is_assigned())
            .field("paused", &self.is_paused())
            .field("stepping", &self.is_stepping())
            .finish()
    }
}
