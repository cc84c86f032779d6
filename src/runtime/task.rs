//! Units of work queued on a scheduler

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::ids::NodeId;

/// A named closure, optionally owned by a node runner.
///
/// Cloning a task is cheap; clones share the closure. The owner is used to
/// pull a runner's pending work out of a scheduler when it is reassigned.
#[derive(Clone)]
pub struct Task {
    name: Arc<str>,
    owner: Option<NodeId>,
    not_before: Option<Instant>,
    func: Arc<dyn Fn() + Send + Sync>,
}

impl Task {
    pub fn new(name: impl Into<String>, owner: Option<NodeId>, func: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            name: Arc::from(name.into()),
            owner,
            not_before: None,
            func: Arc::new(func),
        }
    }

    /// A task not tied to any runner
    pub fn anonymous(name: impl Into<String>, func: impl Fn() + Send + Sync + 'static) -> Self {
        Self::new(name, None, func)
    }

    /// Delay execution until `wake`
    pub fn not_before(mut self, wake: Instant) -> Self {
        self.not_before = Some(wake);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    pub fn wake_time(&self) -> Option<Instant> {
        self.not_before
    }

    pub fn execute(&self) {
        (self.func)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("not_before", &self.not_before)
            .finish()
    }
}
