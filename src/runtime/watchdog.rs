//! Stall watchdog for scheduler tasks and subgraph iterations
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each tracked operation stores its start time in an atomic variable,
//! and the watchdog periodically scans these timestamps to detect stalls.
//! It only reports; nothing is cancelled or recovered.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Shared state for a single tracked operation
struct OperationState {
    origin: Instant,
    /// Milliseconds since `origin` (+1) when the current operation started, or 0 if idle
    last_op_start: AtomicU64,
    /// Track if we've already warned about this operation
    has_warned: AtomicBool,
    scope: String,
    operation: String,
    detail: Mutex<String>,
}

impl OperationState {
    #[inline(always)]
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64 + 1
    }
}

/// A stalled operation found by [`Watchdog::stalled`]
#[derive(Debug, Clone, PartialEq)]
pub struct StallReport {
    pub scope: String,
    pub operation: String,
    pub detail: String,
    pub elapsed: Duration,
}

/// Handle to one operation's watchdog state
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<OperationState>,
}

impl WatchdogHandle {
    /// Mark the start of an operation
    #[inline(always)]
    pub fn start_operation(&self) {
        self.state.last_op_start.store(self.state.now(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    /// Mark the start of an operation and record what it is working on
    pub fn start_operation_with(&self, detail: &str) {
        {
            let mut current = self.state.detail.lock();
            current.clear();
            current.push_str(detail);
        }
        self.start_operation();
    }

    /// Mark the end of an operation
    #[inline(always)]
    pub fn finish_operation(&self) {
        if self.state.has_warned.swap(false, Ordering::Relaxed) {
            info!(
                "[{}] {} recovered ({})",
                self.state.scope,
                self.state.operation,
                self.state.detail.lock()
            );
        }
        self.state.last_op_start.store(0, Ordering::Relaxed);
    }

    pub fn is_busy(&self) -> bool {
        self.state.last_op_start.load(Ordering::Relaxed) != 0
    }
}

struct WatchdogInner {
    origin: Instant,
    threshold: Duration,
    operations: Mutex<Vec<Weak<OperationState>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    /// Create a watchdog reporting operations running longer than `threshold`
    pub fn new(threshold: Duration) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                origin: Instant::now(),
                threshold,
                operations: Mutex::new(Vec::new()),
                stop_tx: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.inner.threshold
    }

    /// Register a new operation for monitoring
    pub fn register(&self, scope: &str, operation: &str) -> WatchdogHandle {
        let state = Arc::new(OperationState {
            origin: self.inner.origin,
            last_op_start: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            scope: scope.to_string(),
            operation: operation.to_string(),
            detail: Mutex::new(String::new()),
        });

        self.inner.operations.lock().push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    fn elapsed_if_stalled(&self, state: &OperationState, now: u64) -> Option<Duration> {
        let start = state.last_op_start.load(Ordering::Relaxed);
        if start == 0 {
            return None;
        }
        let elapsed = Duration::from_millis(now.saturating_sub(start));
        (elapsed > self.inner.threshold).then_some(elapsed)
    }

    /// Warn once about every operation over the threshold.
    ///
    /// Returns the number of new warnings.
    pub fn check_for_stalls(&self) -> usize {
        let now = self.inner.origin.elapsed().as_millis() as u64 + 1;
        let mut warned = 0;

        let mut operations = self.inner.operations.lock();

        // Remove dead weak references and check live ones
        operations.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            if let Some(elapsed) = self.elapsed_if_stalled(&state, now) {
                if !state.has_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "[{}] {} stalled for {:.1}s ({})",
                        state.scope,
                        state.operation,
                        elapsed.as_secs_f64(),
                        state.detail.lock()
                    );
                    warned += 1;
                }
            }
            true
        });

        warned
    }

    /// All operations currently over the threshold
    pub fn stalled(&self) -> Vec<StallReport> {
        let now = self.inner.origin.elapsed().as_millis() as u64 + 1;
        self.inner
            .operations
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter_map(|state| {
                self.elapsed_if_stalled(&state, now).map(|elapsed| StallReport {
                    scope: state.scope.clone(),
                    operation: state.operation.clone(),
                    detail: state.detail.lock().clone(),
                    elapsed,
                })
            })
            .collect()
    }

    /// Start the monitoring thread, scanning every `interval`
    pub fn start_monitoring_thread(&self, interval: Duration) {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        *self.inner.stop_tx.lock() = Some(stop_tx);

        let watchdog = Watchdog {
            inner: Arc::clone(&self.inner),
        };
        let spawned = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        watchdog.check_for_stalls();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => *monitor = Some(handle),
            Err(e) => warn!("Failed to start watchdog thread: {}", e),
        }
    }

    /// Stop the monitoring thread
    pub fn stop(&self) {
        if let Some(stop_tx) = self.inner.stop_tx.lock().take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(handle) = self.inner.monitor.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// RAII guard for tracking an operation - near-zero cost (just atomic stores)
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }

    pub fn with_detail(handle: &'a WatchdogHandle, detail: &str) -> Self {
        handle.start_operation_with(detail);
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_marks_busy() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let handle = watchdog.register("group", "task");
        {
            let _guard = OperationGuard::new(&handle);
            assert!(handle.is_busy());
        }
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_stall_reported_once() {
        let watchdog = Watchdog::new(Duration::from_millis(10));
        let handle = watchdog.register("group", "task");
        let guard = OperationGuard::with_detail(&handle, "slow node");

        thread::sleep(Duration::from_millis(40));
        assert_eq!(watchdog.check_for_stalls(), 1);
        assert_eq!(watchdog.check_for_stalls(), 0);

        let stalled = watchdog.stalled();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].detail, "slow node");

        drop(guard);
        assert!(watchdog.stalled().is_empty());
    }

    #[test]
    fn test_dropped_handles_are_pruned() {
        let watchdog = Watchdog::new(Duration::from_millis(10));
        let handle = watchdog.register("group", "task");
        drop(handle);
        watchdog.check_for_stalls();
        assert!(watchdog.inner.operations.lock().is_empty());
    }

    #[test]
    fn test_monitoring_thread_stops() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        watchdog.start_monitoring_thread(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        watchdog.stop();
        assert!(watchdog.inner.monitor.lock().is_none());
    }
}
