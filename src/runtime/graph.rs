//! Node and connection collection of one graph scope
//!
//! A [`Graph`] owns node handles and the connections between their
//! connectors. Every mutating call validates first and either succeeds
//! completely or leaves the graph untouched. Structural changes are
//! published on [`Graph::events`] after the graph's own locks are released,
//! so subscribers may call back into the graph.
//!
//! Connections never cross scopes: a subgraph's internal graph only sees
//! its own nodes plus the relay connectors registered with
//! [`Graph::add_relay`].

use parking_lot::{ReentrantMutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::connection::Connection;
use super::connector::{Connector, ConnectorEvent};
use super::errors::StructuralError;
use super::ids::{ConnectionId, ConnectorId, NodeId};
use super::node_handle::NodeHandle;
use super::signal::{EventBus, SubscriptionId};
use super::subgraph::SubgraphNode;
use super::type_registry::{MessageType, TypeRegistry};

/// Structural change notification
#[derive(Clone)]
pub enum GraphEvent {
    NodeAdded(Arc<NodeHandle>),
    NodeRemoved(Arc<NodeHandle>),
    ConnectionAdded(Arc<Connection>),
    ConnectionRemoved(Arc<Connection>),
    ConnectorCreated(Arc<Connector>),
    ConnectorRemoved(Arc<Connector>),
}

impl fmt::Debug for GraphEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphEvent::NodeAdded(node) => write!(f, "NodeAdded({})", node.id()),
            GraphEvent::NodeRemoved(node) => write!(f, "NodeRemoved({})", node.id()),
            GraphEvent::ConnectionAdded(c) => write!(f, "ConnectionAdded({})", c.id()),
            GraphEvent::ConnectionRemoved(c) => write!(f, "ConnectionRemoved({})", c.id()),
            GraphEvent::ConnectorCreated(c) => write!(f, "ConnectorCreated({})", c.id()),
            GraphEvent::ConnectorRemoved(c) => write!(f, "ConnectorRemoved({})", c.id()),
        }
    }
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<NodeId, Arc<NodeHandle>>,
    /// Insertion order of `nodes`
    order: Vec<NodeId>,
    connections: Vec<Arc<Connection>>,
    /// Every connector reachable in this scope, relays included
    connectors: HashMap<ConnectorId, Arc<Connector>>,
    relays: HashSet<ConnectorId>,
    subscriptions: HashMap<NodeId, SubscriptionId>,
}

pub struct Graph {
    owner: Option<NodeId>,
    registry: Arc<TypeRegistry>,
    self_ref: Weak<Graph>,
    /// Serializes structural mutations; reentrant for connector-removed callbacks
    structure: ReentrantMutex<()>,
    inner: RwLock<GraphInner>,
    events: EventBus<GraphEvent>,
}

impl Graph {
    /// Create a top-level graph
    pub fn new(registry: Arc<TypeRegistry>) -> Arc<Self> {
        Self::build(None, registry)
    }

    /// Create the internal graph of the subgraph node `owner`
    pub fn with_owner(owner: NodeId, registry: Arc<TypeRegistry>) -> Arc<Self> {
        Self::build(Some(owner), registry)
    }

    fn build(owner: Option<NodeId>, registry: Arc<TypeRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            owner,
            registry,
            self_ref: self_ref.clone(),
            structure: ReentrantMutex::new(()),
            inner: RwLock::new(GraphInner::default()),
            events: EventBus::new(),
        })
    }

    /// Subgraph node owning this graph, if any
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus<GraphEvent> {
        &self.events
    }

    fn publish_all(&self, events: Vec<GraphEvent>) {
        for event in &events {
            self.events.publish(event);
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Nodes
    // ────────────────────────────────────────────────────────────────────

    pub fn add_node(&self, handle: Arc<NodeHandle>) -> Result<(), StructuralError> {
        let id = handle.id();
        {
            let _structure = self.structure.lock();
            let mut inner = self.inner.write();
            if inner.nodes.contains_key(&id) {
                return Err(StructuralError::DuplicateNode(id));
            }
            for connector in handle.connectors() {
                inner.connectors.insert(connector.id(), connector);
            }

            let weak = self.self_ref.clone();
            let subscription = handle.events().connectors.subscribe(move |event| {
                if let Some(graph) = weak.upgrade() {
                    graph.on_connector_event(event);
                }
            });
            inner.subscriptions.insert(id, subscription);
            inner.nodes.insert(id, Arc::clone(&handle));
            inner.order.push(id);
        }

        debug!("[{}] Node added ({})", id, handle.type_name());
        self.events.publish(&GraphEvent::NodeAdded(handle));
        Ok(())
    }

    fn on_connector_event(&self, event: &ConnectorEvent) {
        match event {
            ConnectorEvent::Created(connector) => {
                self.inner
                    .write()
                    .connectors
                    .insert(connector.id(), Arc::clone(connector));
                self.events
                    .publish(&GraphEvent::ConnectorCreated(Arc::clone(connector)));
            }
            ConnectorEvent::Removed(connector) => {
                self.disconnect_connector(connector.id());
                self.inner.write().connectors.remove(&connector.id());
                self.events
                    .publish(&GraphEvent::ConnectorRemoved(Arc::clone(connector)));
            }
        }
    }

    /// Remove a node after severing every connection of its connectors
    pub fn delete_node(&self, id: NodeId) -> Result<Arc<NodeHandle>, StructuralError> {
        let mut events = Vec::new();
        let handle = {
            let _structure = self.structure.lock();
            let handle = self
                .inner
                .read()
                .nodes
                .get(&id)
                .cloned()
                .ok_or(StructuralError::NodeNotFound(id))?;

            for connector in handle.connectors() {
                events.extend(self.take_connections_of(connector.id()));
            }

            let mut inner = self.inner.write();
            inner.nodes.remove(&id);
            inner.order.retain(|existing| *existing != id);
            for connector in handle.connectors() {
                inner.connectors.remove(&connector.id());
            }
            if let Some(subscription) = inner.subscriptions.remove(&id) {
                handle.events().connectors.unsubscribe(subscription);
            }
            handle
        };

        debug!("[{}] Node deleted", id);
        self.publish_all(events);
        self.events
            .publish(&GraphEvent::NodeRemoved(Arc::clone(&handle)));
        handle.tear_down();
        Ok(handle)
    }

    pub fn find_node_handle(&self, id: NodeId) -> Result<Arc<NodeHandle>, StructuralError> {
        self.inner
            .read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or(StructuralError::NodeNotFound(id))
    }

    /// Node owning the connector `id`
    pub fn find_node_handle_for_connector(
        &self,
        id: ConnectorId,
    ) -> Result<Arc<NodeHandle>, StructuralError> {
        let owner = self.find_connector(id)?.owner();
        self.find_node_handle(owner)
    }

    /// Node handles in insertion order
    pub fn node_handles(&self) -> Vec<Arc<NodeHandle>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect()
    }

    pub fn count_nodes(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.inner.read().nodes.contains_key(&id)
    }

    /// Find a subgraph node here or in any nested graph
    pub fn find_subgraph(&self, id: NodeId) -> Option<Arc<SubgraphNode>> {
        for handle in self.node_handles() {
            let Some(subgraph) = handle.subgraph() else {
                continue;
            };
            if handle.id() == id {
                return Some(subgraph);
            }
            if let Some(nested) = subgraph.graph().find_subgraph(id) {
                return Some(nested);
            }
        }
        None
    }

    // ────────────────────────────────────────────────────────────────────
    // Connectors
    // ────────────────────────────────────────────────────────────────────

    pub fn find_connector(&self, id: ConnectorId) -> Result<Arc<Connector>, StructuralError> {
        self.inner
            .read()
            .connectors
            .get(&id)
            .cloned()
            .ok_or(StructuralError::ConnectorNotFound(id))
    }

    pub fn find_connector_by_label(
        &self,
        node: NodeId,
        label: &str,
    ) -> Result<Arc<Connector>, StructuralError> {
        let handle = self.find_node_handle(node)?;
        handle
            .connector_by_label(label)
            .ok_or_else(|| StructuralError::LabelNotFound {
                node,
                label: label.to_string(),
            })
    }

    /// Change a connector's type and re-validate its connections.
    ///
    /// Returns the connections that became errored.
    pub fn set_connector_type(
        &self,
        id: ConnectorId,
        message_type: MessageType,
    ) -> Result<Vec<ConnectionId>, StructuralError> {
        let connector = self.find_connector(id)?;
        let errored = connector.set_type(message_type, &self.registry);
        for connection in &errored {
            warn!("[{}] Connection errored after type change of {}", connection, id);
        }
        Ok(errored)
    }

    /// Make a relay connector (owned by the enclosing subgraph) connectable here
    pub fn add_relay(&self, connector: Arc<Connector>) {
        let _structure = self.structure.lock();
        let mut inner = self.inner.write();
        inner.relays.insert(connector.id());
        inner.connectors.insert(connector.id(), connector);
    }

    pub fn remove_relay(&self, id: ConnectorId) -> bool {
        let events = {
            let _structure = self.structure.lock();
            if !self.inner.read().relays.contains(&id) {
                return false;
            }
            let events = self.take_connections_of(id);
            let mut inner = self.inner.write();
            inner.relays.remove(&id);
            inner.connectors.remove(&id);
            events
        };
        self.publish_all(events);
        true
    }

    pub fn relays(&self) -> Vec<Arc<Connector>> {
        let inner = self.inner.read();
        inner
            .relays
            .iter()
            .filter_map(|id| inner.connectors.get(id).cloned())
            .collect()
    }

    // ────────────────────────────────────────────────────────────────────
    // Connections
    // ────────────────────────────────────────────────────────────────────

    /// Connect two connectors of this scope, in either order
    pub fn connect(&self, a: ConnectorId, b: ConnectorId) -> Result<Arc<Connection>, StructuralError> {
        let connection = {
            let _structure = self.structure.lock();
            let first = self.find_connector(a)?;
            let second = self.find_connector(b)?;
            let connection = Connection::connect(&first, &second, &self.registry)?;
            self.inner.write().connections.push(Arc::clone(&connection));
            connection
        };
        self.events
            .publish(&GraphEvent::ConnectionAdded(Arc::clone(&connection)));
        Ok(connection)
    }

    /// Remove a connection. Returns false if it was not in this graph.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = {
            let _structure = self.structure.lock();
            self.take_connection(id)
        };
        match removed {
            Some(connection) => {
                debug!("[{}] Disconnected", id);
                self.events.publish(&GraphEvent::ConnectionRemoved(connection));
                true
            }
            None => false,
        }
    }

    /// Remove every connection attached to `connector`
    pub fn disconnect_connector(&self, connector: ConnectorId) -> usize {
        let events = {
            let _structure = self.structure.lock();
            self.take_connections_of(connector)
        };
        let count = events.len();
        self.publish_all(events);
        count
    }

    fn take_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let connection = {
            let mut inner = self.inner.write();
            let position = inner.connections.iter().position(|c| c.id() == id)?;
            inner.connections.remove(position)
        };
        connection.detach();
        Some(connection)
    }

    fn take_connections_of(&self, connector: ConnectorId) -> Vec<GraphEvent> {
        let ids: Vec<ConnectionId> = self
            .inner
            .read()
            .connections
            .iter()
            .filter(|c| c.from() == connector || c.to() == connector)
            .map(|c| c.id())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.take_connection(id))
            .map(GraphEvent::ConnectionRemoved)
            .collect()
    }

    /// Detach a connection but keep its identity for a later restore
    pub fn fade_connection(&self, id: ConnectionId) -> Result<Arc<Connection>, StructuralError> {
        let connection = {
            let _structure = self.structure.lock();
            self.take_connection(id)
                .ok_or(StructuralError::ConnectionNotFound(id))?
        };
        debug!("[{}] Faded", id);
        self.events
            .publish(&GraphEvent::ConnectionRemoved(Arc::clone(&connection)));
        Ok(connection)
    }

    /// Re-attach a faded connection after validating it again
    pub fn restore_connection(&self, connection: Arc<Connection>) -> Result<(), StructuralError> {
        {
            let _structure = self.structure.lock();
            let source = self.find_connector(connection.from())?;
            let sink = self.find_connector(connection.to())?;
            if self.inner.read().connections.iter().any(|c| c.id() == connection.id()) {
                return Err(StructuralError::AlreadyConnected {
                    from: source.id(),
                    to: sink.id(),
                });
            }
            Connection::validate(&source, &sink, &self.registry)?;
            if source.is_connected_to(sink.id()) {
                return Err(StructuralError::AlreadyConnected {
                    from: source.id(),
                    to: sink.id(),
                });
            }
            connection.set_errored(false);
            connection.attach();
            self.inner.write().connections.push(Arc::clone(&connection));
        }
        debug!("[{}] Restored", connection.id());
        self.events
            .publish(&GraphEvent::ConnectionAdded(connection));
        Ok(())
    }

    pub fn find_connection(&self, id: ConnectionId) -> Result<Arc<Connection>, StructuralError> {
        self.inner
            .read()
            .connections
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or(StructuralError::ConnectionNotFound(id))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.read().connections.clone()
    }

    pub fn count_connections(&self) -> usize {
        self.inner.read().connections.len()
    }

    // ────────────────────────────────────────────────────────────────────
    // Maintenance
    // ────────────────────────────────────────────────────────────────────

    /// Re-validate every connection; returns the errored ones
    pub fn verify(&self) -> Vec<ConnectionId> {
        self.connections()
            .into_iter()
            .filter(|connection| !connection.revalidate(&self.registry))
            .map(|connection| connection.id())
            .collect()
    }

    /// Drop buffered messages everywhere and reset delivery state
    pub fn reset_activity(&self) {
        for handle in self.node_handles() {
            handle.reset();
            if let Some(subgraph) = handle.subgraph() {
                subgraph.reset();
            }
        }
        for connection in self.connections() {
            connection.reset();
        }
        for relay in self.relays() {
            relay.reset();
        }
    }

    /// Delete every node and connection, newest node first
    pub fn clear(&self) {
        let ids: Vec<NodeId> = self.inner.read().order.iter().rev().copied().collect();
        for id in ids {
            if let Err(e) = self.delete_node(id) {
                warn!("[{}] Clear skipped node: {}", id, e);
            }
        }
        let remaining: Vec<ConnectionId> =
            self.connections().iter().map(|connection| connection.id()).collect();
        for id in remaining {
            self.disconnect(id);
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Graph")
            .field("owner", &self.owner)
            .field("nodes", &self.count_nodes())
            .field("connections", &self.count_connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::errors::NodeResult;
    use crate::runtime::node::{Node, NodeModifier, ProcessContext};
    use parking_lot::Mutex;

    /// Node with the given typed ports and no behavior
    struct Ports {
        inputs: Vec<(&'static str, MessageType)>,
        outputs: Vec<(&'static str, MessageType)>,
    }

    impl Node for Ports {
        fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()> {
            for (label, ty) in &self.inputs {
                modifier.add_input(label, ty.clone());
            }
            for (label, ty) in &self.outputs {
                modifier.add_output(label, ty.clone());
            }
            Ok(())
        }

        fn process(&mut self, _ctx: &mut ProcessContext) -> NodeResult<()> {
            Ok(())
        }
    }

    fn node(
        graph: &Graph,
        inputs: Vec<(&'static str, MessageType)>,
        outputs: Vec<(&'static str, MessageType)>,
    ) -> Arc<NodeHandle> {
        let handle =
            NodeHandle::new(NodeId::new(), "ports", Box::new(Ports { inputs, outputs })).unwrap();
        graph.add_node(Arc::clone(&handle)).unwrap();
        handle
    }

    fn port(handle: &NodeHandle, label: &str) -> ConnectorId {
        handle.connector_by_label(label).unwrap().id()
    }

    fn graph() -> Arc<Graph> {
        Graph::new(Arc::new(TypeRegistry::with_builtin_types()))
    }

    #[test]
    fn test_connect_and_lookup() {
        let graph = graph();
        let a = node(&graph, vec![], vec![("out", MessageType::named("int"))]);
        let b = node(&graph, vec![("in", MessageType::named("int"))], vec![]);

        // input first: orientation is resolved by capability
        let connection = graph.connect(port(&b, "in"), port(&a, "out")).unwrap();
        assert_eq!(connection.from(), port(&a, "out"));
        assert_eq!(connection.to(), port(&b, "in"));
        assert_eq!(graph.count_connections(), 1);
        assert_eq!(
            graph.find_node_handle_for_connector(port(&b, "in")).unwrap().id(),
            b.id()
        );
        assert!(graph.find_connection(connection.id()).is_ok());
        assert!(matches!(
            graph.find_node_handle(NodeId::new()),
            Err(StructuralError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_incompatible_type_leaves_graph_unchanged() {
        let graph = graph();
        let a = node(&graph, vec![], vec![("out", MessageType::named("int"))]);
        let b = node(&graph, vec![("in", MessageType::named("string"))], vec![]);

        let result = graph.connect(port(&a, "out"), port(&b, "in"));
        assert!(matches!(result, Err(StructuralError::IncompatibleType { .. })));
        assert_eq!(graph.count_connections(), 0);
        assert_eq!(a.connector_by_label("out").unwrap().count_connections(), 0);
        assert_eq!(b.connector_by_label("in").unwrap().count_connections(), 0);
    }

    #[test]
    fn test_unknown_connector_rejected() {
        let graph = graph();
        let a = node(&graph, vec![], vec![("out", MessageType::any())]);
        let result = graph.connect(port(&a, "out"), ConnectorId::new());
        assert!(matches!(result, Err(StructuralError::ConnectorNotFound(_))));
        assert_eq!(a.connector_by_label("out").unwrap().count_connections(), 0);
    }

    #[test]
    fn test_connections_never_cross_graphs() {
        let registry = Arc::new(TypeRegistry::with_builtin_types());
        let left = Graph::new(Arc::clone(&registry));
        let right = Graph::new(registry);
        let a = node(&left, vec![], vec![("out", MessageType::any())]);
        let b = node(&right, vec![("in", MessageType::any())], vec![]);
        assert!(matches!(
            left.connect(port(&a, "out"), port(&b, "in")),
            Err(StructuralError::ConnectorNotFound(_))
        ));
    }

    #[test]
    fn test_delete_node_leaves_no_dangling_connections() {
        let graph = graph();
        let a = node(&graph, vec![], vec![("out", MessageType::any())]);
        let b = node(
            &graph,
            vec![("in", MessageType::any())],
            vec![("out", MessageType::any())],
        );
        let c = node(&graph, vec![("in", MessageType::any())], vec![]);
        graph.connect(port(&a, "out"), port(&b, "in")).unwrap();
        graph.connect(port(&b, "out"), port(&c, "in")).unwrap();
        let bypass = graph.connect(port(&a, "out"), port(&c, "in")).unwrap();

        let removed = graph.delete_node(b.id()).unwrap();
        let gone: Vec<ConnectorId> = removed.connectors().iter().map(|c| c.id()).collect();

        assert_eq!(graph.count_nodes(), 2);
        assert_eq!(graph.count_connections(), 1);
        assert_eq!(graph.connections()[0].id(), bypass.id());
        for survivor in graph.node_handles() {
            for connector in survivor.connectors() {
                assert_eq!(connector.count_connections(), 1);
                for connection in connector.connections() {
                    assert!(!gone.contains(&connection.from()));
                    assert!(!gone.contains(&connection.to()));
                }
            }
        }
        assert!(matches!(
            graph.find_connector(gone[0]),
            Err(StructuralError::ConnectorNotFound(_))
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let graph = graph();
        let a = node(&graph, vec![], vec![("out", MessageType::any())]);
        let b = node(&graph, vec![("in", MessageType::any())], vec![]);
        let connection = graph.connect(port(&a, "out"), port(&b, "in")).unwrap();

        assert!(graph.disconnect(connection.id()));
        assert!(!graph.disconnect(connection.id()));
        assert!(!b.connector_by_label("in").unwrap().is_connected());
    }

    #[test]
    fn test_fade_and_restore_keep_identity() {
        let graph = graph();
        let a = node(&graph, vec![], vec![("out", MessageType::any())]);
        let b = node(&graph, vec![("in", MessageType::any())], vec![]);
        let connection = graph.connect(port(&a, "out"), port(&b, "in")).unwrap();
        let id = connection.id();

        let faded = graph.fade_connection(id).unwrap();
        assert_eq!(graph.count_connections(), 0);
        assert!(!a.connector_by_label("out").unwrap().is_connected());

        graph.restore_connection(faded).unwrap();
        assert_eq!(graph.find_connection(id).unwrap().id(), id);
        assert!(a.connector_by_label("out").unwrap().is_connected_to(port(&b, "in")));
        assert!(matches!(
            graph.restore_connection(connection),
            Err(StructuralError::AlreadyConnected { .. })
        ));
    }

    #[test]
    fn test_structural_events_published() {
        let graph = graph();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        graph.events().subscribe(move |event| {
            let name = match event {
                GraphEvent::NodeAdded(_) => "node+",
                GraphEvent::NodeRemoved(_) => "node-",
                GraphEvent::ConnectionAdded(_) => "conn+",
                GraphEvent::ConnectionRemoved(_) => "conn-",
                GraphEvent::ConnectorCreated(_) => "port+",
                GraphEvent::ConnectorRemoved(_) => "port-",
            };
            sink.lock().push(name);
        });

        let a = node(&graph, vec![], vec![("out", MessageType::any())]);
        let b = node(&graph, vec![], vec![]);
        let variadic = b.add_connector(
            crate::runtime::connector::ConnectorKind::Input,
            "extra",
            MessageType::any(),
            false,
        );
        graph.connect(port(&a, "out"), variadic.id()).unwrap();
        b.remove_connector(variadic.id()).unwrap();
        graph.delete_node(a.id()).unwrap();

        assert_eq!(
            *seen.lock(),
            vec!["node+", "node+", "port+", "conn+", "conn-", "port-", "node-"]
        );
        assert_eq!(graph.count_connections(), 0);
    }

    #[test]
    fn test_type_change_marks_connections_errored() {
        let graph = graph();
        let a = node(&graph, vec![], vec![("out", MessageType::any())]);
        let b = node(&graph, vec![("in", MessageType::named("int"))], vec![]);
        let connection = graph.connect(port(&a, "out"), port(&b, "in")).unwrap();

        let errored = graph
            .set_connector_type(port(&a, "out"), MessageType::named("string"))
            .unwrap();
        assert_eq!(errored, vec![connection.id()]);
        assert!(connection.is_errored());
        assert_eq!(graph.count_connections(), 1);
        assert_eq!(graph.verify(), vec![connection.id()]);

        graph
            .set_connector_type(port(&a, "out"), MessageType::named("int"))
            .unwrap();
        assert!(graph.verify().is_empty());
        assert!(!connection.is_errored());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let graph = graph();
        let a = node(&graph, vec![], vec![]);
        assert_eq!(
            graph.add_node(Arc::clone(&a)).unwrap_err(),
            StructuralError::DuplicateNode(a.id())
        );
        graph.clear();
        assert_eq!(graph.count_nodes(), 0);
    }
}
