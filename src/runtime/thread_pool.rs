//! Thread groups and runner placement
//!
//! The [`ThreadPool`] owns every [`Scheduler`]: one per named thread group
//! plus one per node that asked for a private thread. It keeps the
//! invariant that each registered [`NodeRunner`] is assigned to exactly
//! one scheduler, and moves runners between schedulers without losing
//! their pending tasks.
//!
//! Pause, stepping and single steps are broadcast from here to all
//! schedulers and runners.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::config::RuntimeConfig;
use super::errors::SchedulingError;
use super::ids::NodeId;
use super::node_runner::NodeRunner;
use super::scheduler::Scheduler;
use super::task::Task;
use super::watchdog::Watchdog;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Numeric thread group id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl GroupId {
    /// One dedicated thread per node
    pub const PRIVATE: GroupId = GroupId(0);
    /// Shared group used when nothing else is requested
    pub const DEFAULT: GroupId = GroupId(1);

    const FIRST_USER: u32 = 2;

    pub fn is_private(self) -> bool {
        self == Self::PRIVATE
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one thread group
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadGroupInfo {
    pub id: GroupId,
    pub name: String,
    pub members: usize,
    pub paused: bool,
    pub pending: usize,
}

struct Group {
    name: String,
    scheduler: Arc<Scheduler>,
}

struct RunnerEntry {
    runner: Arc<NodeRunner>,
    group: GroupId,
}

#[derive(Default)]
struct PoolInner {
    groups: BTreeMap<GroupId, Group>,
    private: HashMap<NodeId, Arc<Scheduler>>,
    /// Registration order is kept so broadcasts are deterministic
    runners: Vec<RunnerEntry>,
    next_group: u32,
    stopped: bool,
}

impl PoolInner {
    fn entry(&self, node: NodeId) -> Option<&RunnerEntry> {
        self.runners.iter().find(|entry| entry.runner.id() == node)
    }

    fn entry_mut(&mut self, node: NodeId) -> Option<&mut RunnerEntry> {
        self.runners.iter_mut().find(|entry| entry.runner.id() == node)
    }

    fn schedulers(&self) -> Vec<Arc<Scheduler>> {
        self.groups
            .values()
            .map(|group| Arc::clone(&group.scheduler))
            .chain(self.private.values().cloned())
            .collect()
    }
}

/// Owner of all schedulers
pub struct ThreadPool {
    config: RuntimeConfig,
    watchdog: Watchdog,
    inner: Mutex<PoolInner>,
    paused: AtomicBool,
    stepping: AtomicBool,
    /// Set once the graph quiesced after entering stepping mode
    drained: AtomicBool,
}

impl ThreadPool {
    /// Create a pool with its default group running
    pub fn new(config: RuntimeConfig) -> Result<Self, SchedulingError> {
        let watchdog = Watchdog::new(config.watchdog_threshold);
        watchdog.start_monitoring_thread(config.watchdog_interval);

        let pool = Self {
            config,
            watchdog,
            inner: Mutex::new(PoolInner {
                next_group: GroupId::FIRST_USER,
                ..Default::default()
            }),
            paused: AtomicBool::new(false),
            stepping: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        };
        {
            let mut inner = pool.inner.lock();
            pool.spawn_group(&mut inner, GroupId::DEFAULT, "default")?;
        }
        Ok(pool)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    fn spawn_group(
        &self,
        inner: &mut PoolInner,
        id: GroupId,
        name: &str,
    ) -> Result<Arc<Scheduler>, SchedulingError> {
        let thread_name = format!("{}-{}", self.config.thread_name_prefix, name);
        let scheduler = Scheduler::new(id, thread_name, Some(self.watchdog.clone()))?;
        if self.paused.load(Ordering::SeqCst) {
            scheduler.set_pause(true);
        }
        inner.groups.insert(
            id,
            Group {
                name: name.to_string(),
                scheduler: Arc::clone(&scheduler),
            },
        );
        if id.0 >= inner.next_group {
            inner.next_group = id.0 + 1;
        }
        info!("[{}] Thread group {} created", name, id);
        Ok(scheduler)
    }

    /// Scheduler for `group`, creating the group (or private thread) if needed
    fn scheduler_for(
        &self,
        inner: &mut PoolInner,
        node: NodeId,
        group: GroupId,
    ) -> Result<Arc<Scheduler>, SchedulingError> {
        if group.is_private() {
            if let Some(existing) = inner.private.get(&node) {
                return Ok(Arc::clone(existing));
            }
            let name = format!("{}-node-{}", self.config.thread_name_prefix, node);
            let scheduler = Scheduler::new(group, name, Some(self.watchdog.clone()))?;
            if self.paused.load(Ordering::SeqCst) {
                scheduler.set_pause(true);
            }
            inner.private.insert(node, Arc::clone(&scheduler));
            return Ok(scheduler);
        }
        match inner.groups.get(&group) {
            Some(existing) => Ok(Arc::clone(&existing.scheduler)),
            None => self.spawn_group(inner, group, &format!("group-{}", group)),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Runner placement
    // ────────────────────────────────────────────────────────────────────

    /// Register a runner on the default group (or a private thread when
    /// configured so)
    pub fn add(&self, runner: Arc<NodeRunner>) -> Result<(), SchedulingError> {
        let group = if self.config.private_threads_by_default {
            GroupId::PRIVATE
        } else {
            GroupId::DEFAULT
        };
        self.add_to_group(runner, group)
    }

    /// Register a runner on `group`, creating the group if needed.
    ///
    /// # Panics
    /// Panics if the runner is already registered.
    pub fn add_to_group(&self, runner: Arc<NodeRunner>, group: GroupId) -> Result<(), SchedulingError> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(SchedulingError::Stopped);
        }
        if inner.entry(runner.id()).is_some() {
            panic!(
                "scheduling inconsistency: runner {} registered twice",
                runner.id()
            );
        }

        let scheduler = self.scheduler_for(&mut inner, runner.id(), group)?;
        runner.set_pause(self.paused.load(Ordering::SeqCst));
        runner.set_stepping_mode(self.stepping.load(Ordering::SeqCst));
        runner.assign_to_scheduler(&scheduler);
        debug!("[{}] Runner {} added to group {}", scheduler.name(), runner.id(), group);
        inner.runners.push(RunnerEntry { runner, group });
        Ok(())
    }

    /// Unregister a runner and hand back its not-yet-started tasks.
    ///
    /// # Panics
    /// Panics if the runner is not registered with this pool.
    pub fn remove(&self, runner: &NodeRunner) -> Vec<Task> {
        let node = runner.id();
        let (tasks, private) = {
            let mut inner = self.inner.lock();
            let Some(position) = inner.runners.iter().position(|e| e.runner.id() == node) else {
                panic!(
                    "scheduling inconsistency: runner {} is not registered with the thread pool",
                    node
                );
            };
            let entry = inner.runners.remove(position);
            entry.runner.detach();
            let tasks = entry.runner.take_remaining_tasks();
            (tasks, inner.private.remove(&node))
        };
        if let Some(scheduler) = private {
            scheduler.stop();
        }
        debug!("Runner {} removed with {} pending tasks", node, tasks.len());
        tasks
    }

    /// Move a node's runner to another group, carrying its pending tasks
    pub fn switch_thread(&self, node: NodeId, group: GroupId) -> Result<(), SchedulingError> {
        let retired = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return Err(SchedulingError::Stopped);
            }
            let (runner, current) = match inner.entry(node) {
                Some(entry) => (Arc::clone(&entry.runner), entry.group),
                None => return Err(SchedulingError::UnknownRunner(node)),
            };
            if current == group {
                return Ok(());
            }

            let target = self.scheduler_for(&mut inner, node, group)?;
            runner.detach();
            runner.assign_to_scheduler(&target);
            if let Some(entry) = inner.entry_mut(node) {
                entry.group = group;
            }
            info!("Runner {} moved from group {} to group {}", node, current, group);

            if current.is_private() {
                inner.private.remove(&node)
            } else {
                None
            }
        };
        if let Some(scheduler) = retired {
            scheduler.stop();
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Groups
    // ────────────────────────────────────────────────────────────────────

    /// Create a named user group
    pub fn create_group(&self, name: &str) -> Result<GroupId, SchedulingError> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(SchedulingError::Stopped);
        }
        let id = GroupId(inner.next_group);
        self.spawn_group(&mut inner, id, name)?;
        Ok(id)
    }

    /// Stop a user group; its members move to the default group
    pub fn remove_group(&self, id: GroupId) -> Result<(), SchedulingError> {
        if id == GroupId::DEFAULT || id == GroupId::PRIVATE {
            return Err(SchedulingError::ProtectedGroup(id));
        }
        let retired = {
            let mut inner = self.inner.lock();
            let group = inner
                .groups
                .remove(&id)
                .ok_or(SchedulingError::UnknownGroup(id))?;
            let default = match inner.groups.get(&GroupId::DEFAULT) {
                Some(default) => Arc::clone(&default.scheduler),
                None => self.spawn_group(&mut inner, GroupId::DEFAULT, "default")?,
            };
            for entry in inner.runners.iter_mut().filter(|entry| entry.group == id) {
                entry.runner.detach();
                entry.runner.assign_to_scheduler(&default);
                entry.group = GroupId::DEFAULT;
            }
            info!("[{}] Thread group {} removed", group.name, id);
            group.scheduler
        };
        retired.stop();
        Ok(())
    }

    pub fn groups(&self) -> Vec<ThreadGroupInfo> {
        let inner = self.inner.lock();
        inner
            .groups
            .iter()
            .map(|(id, group)| ThreadGroupInfo {
                id: *id,
                name: group.name.clone(),
                members: group.scheduler.member_count(),
                paused: group.scheduler.is_paused(),
                pending: group.scheduler.pending_tasks(),
            })
            .collect()
    }

    pub fn group_of(&self, node: NodeId) -> Option<GroupId> {
        self.inner.lock().entry(node).map(|entry| entry.group)
    }

    pub fn runner(&self, node: NodeId) -> Option<Arc<NodeRunner>> {
        self.inner.lock().entry(node).map(|entry| Arc::clone(&entry.runner))
    }

    pub fn runners(&self) -> Vec<Arc<NodeRunner>> {
        self.inner
            .lock()
            .runners
            .iter()
            .map(|entry| Arc::clone(&entry.runner))
            .collect()
    }

    pub fn runner_count(&self) -> usize {
        self.inner.lock().runners.len()
    }

    fn schedulers(&self) -> Vec<Arc<Scheduler>> {
        self.inner.lock().schedulers()
    }

    // ────────────────────────────────────────────────────────────────────
    // Execution control
    // ────────────────────────────────────────────────────────────────────

    /// Hold or resume dispatch everywhere; running tasks finish
    pub fn set_pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        for scheduler in self.schedulers() {
            scheduler.set_pause(paused);
        }
        for runner in self.runners() {
            runner.set_pause(paused);
        }
        info!("Thread pool {}", if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_stepping_mode(&self, stepping: bool) {
        self.stepping.store(stepping, Ordering::SeqCst);
        self.drained.store(false, Ordering::SeqCst);
        for runner in self.runners() {
            runner.set_stepping_mode(stepping);
        }
        info!("Stepping mode {}", if stepping { "enabled" } else { "disabled" });
    }

    pub fn is_stepping(&self) -> bool {
        self.stepping.load(Ordering::SeqCst)
    }

    /// Grant one activation to every source node.
    ///
    /// The first step after entering stepping mode waits for messages
    /// already in flight to drain.
    pub fn step(&self) -> Result<(), SchedulingError> {
        if !self.is_stepping() {
            return Err(SchedulingError::NotStepping);
        }
        if !self.drained.load(Ordering::SeqCst) {
            let timeout = self.config.drain_timeout;
            if !self.wait_until_quiescent(timeout) {
                warn!("Graph did not quiesce within {:?}", timeout);
                return Err(SchedulingError::DrainTimeout(timeout));
            }
            self.drained.store(true, Ordering::SeqCst);
        }
        let mut granted = 0;
        for runner in self.runners() {
            if runner.handle().is_source() {
                runner.step();
                granted += 1;
            }
        }
        debug!("Step granted to {} source nodes", granted);
        Ok(())
    }

    /// Every granted step was taken or declined and nothing is running
    pub fn is_step_done(&self) -> bool {
        self.runners().iter().all(|runner| runner.is_step_done())
            && self.schedulers().iter().all(|scheduler| scheduler.is_idle())
    }

    /// No queued work, no node mid-cycle and no interior node about to fire
    pub fn is_quiescent(&self) -> bool {
        self.schedulers().iter().all(|scheduler| scheduler.is_idle())
            && self.runners().iter().all(|runner| {
                let handle = runner.handle();
                !handle.is_processing() && (handle.is_source() || !handle.can_execute())
            })
    }

    pub fn wait_until_quiescent(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_quiescent() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait until every scheduler has nothing queued or running
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for scheduler in self.schedulers() {
            let left = deadline.saturating_duration_since(Instant::now());
            if !scheduler.wait_until_idle(left) {
                return false;
            }
        }
        true
    }

    /// Drop all pending work without touching structure
    pub fn clear(&self) -> usize {
        let dropped: usize = self.schedulers().iter().map(|s| s.clear()).sum();
        for runner in self.runners() {
            runner.clear_flags();
        }
        debug!("Cleared {} pending tasks", dropped);
        dropped
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Stop every worker thread. Further registrations fail.
    pub fn stop(&self) {
        let schedulers = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.schedulers()
        };
        for scheduler in schedulers {
            scheduler.stop();
        }
        self.watchdog.stop();
        info!("Thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("groups", &self.groups())
            .field("runners", &self.runner_count())
            .field("paused", &self.is_paused())
            .field("stepping", &self.is_stepping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::errors::NodeResult;
    use crate::runtime::node::{Node, NodeModifier, ProcessContext};
    use crate::runtime::node_handle::NodeHandle;
    use crossbeam_channel::{unbounded, Sender};
    use std::sync::atomic::AtomicUsize;

    /// Source node that runs exactly once
    struct Once {
        index: usize,
        done: bool,
        log: Sender<usize>,
    }

    impl Node for Once {
        fn setup(&mut self, _modifier: &mut NodeModifier) -> NodeResult<()> {
            Ok(())
        }

        fn can_process(&self) -> bool {
            !self.done
        }

        fn process(&mut self, _ctx: &mut ProcessContext) -> NodeResult<()> {
            self.done = true;
            let _ = self.log.send(self.index);
            Ok(())
        }
    }

    struct Idle;

    impl Node for Idle {
        fn setup(&mut self, _modifier: &mut NodeModifier) -> NodeResult<()> {
            Ok(())
        }

        fn can_process(&self) -> bool {
            false
        }

        fn process(&mut self, _ctx: &mut ProcessContext) -> NodeResult<()> {
            Ok(())
        }
    }

    /// Source node counting every activation
    struct Counting {
        count: Arc<AtomicUsize>,
    }

    impl Node for Counting {
        fn setup(&mut self, _modifier: &mut NodeModifier) -> NodeResult<()> {
            Ok(())
        }

        fn process(&mut self, _ctx: &mut ProcessContext) -> NodeResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn runner(node: Box<dyn Node>) -> Arc<NodeRunner> {
        NodeRunner::new(NodeHandle::new(NodeId::new(), "test", node).unwrap())
    }

    fn pool() -> ThreadPool {
        ThreadPool::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_pause_then_resume_runs_in_enqueue_order() {
        let pool = pool();
        pool.set_pause(true);
        let (tx, rx) = unbounded();
        for index in 0..3 {
            let node = Once {
                index,
                done: false,
                log: tx.clone(),
            };
            pool.add(runner(Box::new(node))).unwrap();
        }

        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        pool.set_pause(false);
        let order: Vec<usize> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(pool.wait_until_idle(Duration::from_secs(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_groups_and_switch_thread() {
        let pool = pool();
        let video = pool.create_group("video").unwrap();
        assert!(video.0 >= 2);

        let runner = runner(Box::new(Idle));
        let node = runner.id();
        pool.add(Arc::clone(&runner)).unwrap();
        assert_eq!(pool.group_of(node), Some(GroupId::DEFAULT));

        pool.switch_thread(node, video).unwrap();
        assert_eq!(pool.group_of(node), Some(video));
        assert_eq!(runner.handle().thread_group(), Some(video));
        let info = pool.groups().into_iter().find(|g| g.id == video).unwrap();
        assert_eq!(info.name, "video");
        assert_eq!(info.members, 1);

        pool.remove_group(video).unwrap();
        assert_eq!(pool.group_of(node), Some(GroupId::DEFAULT));
        assert!(matches!(
            pool.remove_group(GroupId::DEFAULT),
            Err(SchedulingError::ProtectedGroup(_))
        ));
        assert!(matches!(
            pool.remove_group(video),
            Err(SchedulingError::UnknownGroup(_))
        ));
        assert!(matches!(
            pool.switch_thread(NodeId::new(), video),
            Err(SchedulingError::UnknownRunner(_))
        ));
    }

    #[test]
    fn test_switch_thread_preserves_pending_tasks() {
        let pool = pool();
        let runner = runner(Box::new(Idle));
        let node = runner.id();
        pool.add(Arc::clone(&runner)).unwrap();
        assert!(pool.wait_until_idle(Duration::from_secs(1)));

        pool.set_pause(true);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..25 {
            let counter = Arc::clone(&counter);
            runner.schedule(Task::new(format!("count {}", i), Some(node), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.switch_thread(node, GroupId::PRIVATE).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.set_pause(false);
        assert!(pool.wait_until_idle(Duration::from_secs(1)));
        assert_eq!(counter.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn test_stepping_runs_sources_once_per_step() {
        let pool = pool();
        let count = Arc::new(AtomicUsize::new(0));
        assert!(matches!(pool.step(), Err(SchedulingError::NotStepping)));

        pool.set_stepping_mode(true);
        pool.add(runner(Box::new(Counting {
            count: Arc::clone(&count),
        })))
        .unwrap();
        assert!(pool.wait_until_idle(Duration::from_secs(1)));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        for expected in 1..=3 {
            pool.step().unwrap();
            assert!(pool.wait_until_idle(Duration::from_secs(1)));
            assert!(pool.is_step_done());
            assert_eq!(count.load(Ordering::SeqCst), expected);
        }
    }

    #[test]
    fn test_remove_returns_pending_tasks() {
        let pool = pool();
        pool.set_pause(true);
        let runner = runner(Box::new(Idle));
        pool.add(Arc::clone(&runner)).unwrap();
        runner.schedule(Task::new("extra", Some(runner.id()), || {}));

        // the initial parameter check plus the extra task
        let tasks = pool.remove(&runner);
        assert_eq!(tasks.len(), 2);
        assert_eq!(pool.runner_count(), 0);
        assert!(!runner.is_assigned());
    }

    #[test]
    #[should_panic(expected = "scheduling inconsistency")]
    fn test_remove_unregistered_runner_panics() {
        let pool = pool();
        let stranger = runner(Box::new(Idle));
        pool.remove(&stranger);
    }

    #[test]
    fn test_stopped_pool_rejects_runners() {
        let pool = pool();
        pool.stop();
        assert!(matches!(
            pool.add(runner(Box::new(Idle))),
            Err(SchedulingError::Stopped)
        ));
    }
}
