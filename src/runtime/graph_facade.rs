//! Binding between a graph and the thread pool
//!
//! A [`GraphFacade`] watches one graph's structural events. Every node
//! added gets a [`NodeRunner`] registered with the pool (in the thread
//! group stored in the node's state, or the default placement); every
//! subgraph node additionally gets a child facade for its internal graph.
//! Node removal unregisters the runner before any bookkeeping is dropped,
//! so no queued task outlives its node.
//!
//! The facade is also the execution control surface: pause, stepping,
//! reset and clearing pending work.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

use super::connection::Connection;
use super::errors::{SchedulingError, StructuralError};
use super::graph::{Graph, GraphEvent};
use super::ids::{ConnectorId, NodeId};
use super::node_handle::NodeHandle;
use super::node_runner::NodeRunner;
use super::node_state::ErrorLevel;
use super::notification::Notification;
use super::signal::{EventBus, SubscriptionId};
use super::subgraph::SubgraphNode;
use super::thread_pool::ThreadPool;

/// Registration changes and control actions
#[derive(Debug, Clone, PartialEq)]
pub enum FacadeEvent {
    RunnerAdded(NodeId),
    RunnerRemoved(NodeId),
    ChildAdded(NodeId),
    ChildRemoved(NodeId),
    Paused(bool),
    Stopped,
}

#[derive(Default)]
struct FacadeInner {
    runners: HashMap<NodeId, Arc<NodeRunner>>,
    children: HashMap<NodeId, Arc<GraphFacade>>,
    node_subscriptions: HashMap<NodeId, SubscriptionId>,
    child_subscriptions: HashMap<NodeId, SubscriptionId>,
    graph_subscription: Option<SubscriptionId>,
}

pub struct GraphFacade {
    pool: Arc<ThreadPool>,
    graph: Arc<Graph>,
    subgraph: Option<Arc<SubgraphNode>>,
    self_ref: Weak<GraphFacade>,
    inner: Mutex<FacadeInner>,
    notifications: EventBus<Notification>,
    events: EventBus<FacadeEvent>,
}

impl GraphFacade {
    /// Bind a top-level graph to `pool`
    pub fn new(pool: Arc<ThreadPool>, graph: Arc<Graph>) -> Arc<Self> {
        Self::build(pool, graph, None)
    }

    /// Bind the internal graph of `subgraph`
    pub fn new_child(pool: Arc<ThreadPool>, subgraph: Arc<SubgraphNode>) -> Arc<Self> {
        let graph = Arc::clone(subgraph.graph());
        Self::build(pool, graph, Some(subgraph))
    }

    fn build(pool: Arc<ThreadPool>, graph: Arc<Graph>, subgraph: Option<Arc<SubgraphNode>>) -> Arc<Self> {
        let facade = Arc::new_cyclic(|self_ref| Self {
            pool,
            graph,
            subgraph,
            self_ref: self_ref.clone(),
            inner: Mutex::new(FacadeInner::default()),
            notifications: EventBus::new(),
            events: EventBus::new(),
        });

        let weak = Arc::downgrade(&facade);
        let subscription = facade.graph.events().subscribe(move |event| {
            if let Some(facade) = weak.upgrade() {
                facade.on_graph_event(event);
            }
        });
        facade.inner.lock().graph_subscription = Some(subscription);

        for handle in facade.graph.node_handles() {
            facade.register(&handle);
        }
        facade
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Subgraph node whose internal graph this facade drives
    pub fn subgraph(&self) -> Option<&Arc<SubgraphNode>> {
        self.subgraph.as_ref()
    }

    /// Node errors and status messages from this graph and all nested ones
    pub fn notifications(&self) -> &EventBus<Notification> {
        &self.notifications
    }

    pub fn events(&self) -> &EventBus<FacadeEvent> {
        &self.events
    }

    fn on_graph_event(&self, event: &GraphEvent) {
        match event {
            GraphEvent::NodeAdded(handle) => self.register(handle),
            GraphEvent::NodeRemoved(handle) => self.unregister(handle.id()),
            _ => {}
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Registration
    // ────────────────────────────────────────────────────────────────────

    fn register(&self, handle: &Arc<NodeHandle>) {
        let id = handle.id();
        if self.inner.lock().runners.contains_key(&id) {
            return;
        }

        let runner = NodeRunner::new(Arc::clone(handle));
        let placed = match handle.thread_group() {
            Some(group) => self.pool.add_to_group(Arc::clone(&runner), group),
            None => self.pool.add(Arc::clone(&runner)),
        };
        if let Err(e) = placed {
            error!("[{}] Could not schedule node: {}", id, e);
            self.notifications.publish(&Notification::from_node(
                id,
                format!("Could not schedule node: {}", e),
                ErrorLevel::Error,
            ));
            return;
        }

        let weak = self.self_ref.clone();
        let node_subscription = handle.events().notifications.subscribe(move |notification| {
            if let Some(facade) = weak.upgrade() {
                facade.notifications.publish(notification);
            }
        });

        let child = handle.subgraph().map(|subgraph| {
            subgraph.set_watchdog(self.pool.watchdog());
            let child = GraphFacade::new_child(Arc::clone(&self.pool), subgraph);
            let weak = self.self_ref.clone();
            let subscription = child.notifications().subscribe(move |notification| {
                if let Some(facade) = weak.upgrade() {
                    facade.notifications.publish(notification);
                }
            });
            (child, subscription)
        });

        {
            let mut inner = self.inner.lock();
            inner.runners.insert(id, runner);
            inner.node_subscriptions.insert(id, node_subscription);
            if let Some((child, subscription)) = &child {
                inner.children.insert(id, Arc::clone(child));
                inner.child_subscriptions.insert(id, *subscription);
            }
        }

        debug!("[{}] Runner registered", id);
        self.events.publish(&FacadeEvent::RunnerAdded(id));
        if child.is_some() {
            self.events.publish(&FacadeEvent::ChildAdded(id));
        }
    }

    fn unregister(&self, id: NodeId) {
        let (runner, child, node_subscription, child_subscription) = {
            let mut inner = self.inner.lock();
            (
                inner.runners.remove(&id),
                inner.children.remove(&id),
                inner.node_subscriptions.remove(&id),
                inner.child_subscriptions.remove(&id),
            )
        };

        if let Some(runner) = &runner {
            let dropped = self.pool.remove(runner);
            debug!("[{}] Runner unregistered, {} pending tasks dropped", id, dropped.len());
            if let Some(subscription) = node_subscription {
                runner.handle().events().notifications.unsubscribe(subscription);
            }
        }
        if let Some(child) = child {
            child.detach_all();
            if let Some(subscription) = child_subscription {
                child.notifications().unsubscribe(subscription);
            }
            self.events.publish(&FacadeEvent::ChildRemoved(id));
        }
        if runner.is_some() {
            self.events.publish(&FacadeEvent::RunnerRemoved(id));
        }
    }

    /// Stop following the graph and unregister every runner, recursively
    pub fn detach_all(&self) {
        if let Some(subscription) = self.inner.lock().graph_subscription.take() {
            self.graph.events().unsubscribe(subscription);
        }
        let ids: Vec<NodeId> = self.inner.lock().runners.keys().copied().collect();
        for id in ids {
            self.unregister(id);
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Structure
    // ────────────────────────────────────────────────────────────────────

    pub fn add_node(&self, handle: Arc<NodeHandle>) -> Result<(), StructuralError> {
        self.graph.add_node(handle)
    }

    pub fn delete_node(&self, id: NodeId) -> Result<Arc<NodeHandle>, StructuralError> {
        self.graph.delete_node(id)
    }

    pub fn connect(&self, a: ConnectorId, b: ConnectorId) -> Result<Arc<Connection>, StructuralError> {
        self.graph.connect(a, b)
    }

    /// Connect `from_node.from_label` to `to_node.to_label`
    pub fn connect_by_label(
        &self,
        from_node: NodeId,
        from_label: &str,
        to_node: NodeId,
        to_label: &str,
    ) -> Result<Arc<Connection>, StructuralError> {
        let from = self.graph.find_connector_by_label(from_node, from_label)?;
        let to = self.graph.find_connector_by_label(to_node, to_label)?;
        self.graph.connect(from.id(), to.id())
    }

    pub fn child(&self, subgraph: NodeId) -> Option<Arc<GraphFacade>> {
        self.inner.lock().children.get(&subgraph).cloned()
    }

    /// Walk nested facades along a path of subgraph node ids
    pub fn find_subgraph_facade(&self, path: &[NodeId]) -> Option<Arc<GraphFacade>> {
        let mut current = self.self_ref.upgrade()?;
        for id in path {
            current = current.child(*id)?;
        }
        Some(current)
    }

    /// Runner of a node in this graph or any nested graph
    pub fn runner(&self, node: NodeId) -> Option<Arc<NodeRunner>> {
        let (own, children) = {
            let inner = self.inner.lock();
            (
                inner.runners.get(&node).cloned(),
                inner.children.values().cloned().collect::<Vec<_>>(),
            )
        };
        own.or_else(|| children.iter().find_map(|child| child.runner(node)))
    }

    /// Runners of this graph's nodes (not nested ones)
    pub fn runners(&self) -> Vec<Arc<NodeRunner>> {
        self.inner.lock().runners.values().cloned().collect()
    }

    // ────────────────────────────────────────────────────────────────────
    // Execution control
    // ────────────────────────────────────────────────────────────────────

    pub fn pause_request(&self, paused: bool) {
        self.pool.set_pause(paused);
        self.events.publish(&FacadeEvent::Paused(paused));
    }

    pub fn is_paused(&self) -> bool {
        self.pool.is_paused()
    }

    pub fn set_stepping_mode(&self, stepping: bool) {
        self.pool.set_stepping_mode(stepping);
    }

    pub fn is_stepping(&self) -> bool {
        self.pool.is_stepping()
    }

    pub fn step(&self) -> Result<(), SchedulingError> {
        self.pool.step()
    }

    pub fn is_step_done(&self) -> bool {
        self.pool.is_step_done()
    }

    /// Drop all pending tasks; structure and buffered messages stay
    pub fn clear_block(&self) -> usize {
        self.pool.clear()
    }

    /// Remove every node and pending task; the pool keeps running
    pub fn reset(&self) {
        let was_paused = self.is_paused();
        self.pool.set_pause(true);
        self.pool.clear();
        self.graph.clear();
        self.pool.set_pause(was_paused);
        info!("Graph reset");
    }

    /// Drop all in-flight messages, recursively, then restart sources
    pub fn reset_activity(&self) {
        let was_paused = self.is_paused();
        self.pool.set_pause(true);
        self.pool.clear();
        if !self.pool.wait_until_idle(self.pool.config().drain_timeout) {
            error!("Tasks still running during activity reset");
        }
        self.graph.reset_activity();
        for runner in self.all_runners() {
            runner.reset();
        }
        self.pool.set_pause(was_paused);
        for runner in self.all_runners() {
            runner.schedule_process();
        }
        info!("Activity reset");
    }

    fn all_runners(&self) -> Vec<Arc<NodeRunner>> {
        let (mut runners, children) = {
            let inner = self.inner.lock();
            (
                inner.runners.values().cloned().collect::<Vec<_>>(),
                inner.children.values().cloned().collect::<Vec<_>>(),
            )
        };
        for child in children {
            runners.extend(child.all_runners());
        }
        runners
    }

    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_until_idle(timeout)
    }

    pub fn wait_until_quiescent(&self, timeout: Duration) -> bool {
        self.pool.wait_until_quiescent(timeout)
    }

    /// Stop every worker thread of the pool
    pub fn stop(&self) {
        self.pool.stop();
        self.events.publish(&FacadeEvent::Stopped);
    }
}

impl Drop for GraphFacade {
    fn drop(&mut self) {
        if let Some(subscription) = self.inner.get_mut().graph_subscription.take() {
            self.graph.events().unsubscribe(subscription);
        }
    }
}

impl fmt::Debug for GraphFacade {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("GraphFacade")
            .field("graph", &self.graph)
            .field("runners", &inner.runners.len())
            .field("children", &inner.children.len())
            .finish()
    }
}
