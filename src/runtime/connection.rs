//! Directed edges between connectors
//!
//! A connection refers to its endpoints weakly; connectors own the
//! connections attached to them. Each connection carries at most one
//! message in flight: after a send it stays `Unread` until the consumer
//! releases it, which is how backpressure reaches the producer.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use super::connector::Connector;
use super::errors::StructuralError;
use super::ids::{ConnectionId, ConnectorId};
use super::node_state::Point;
use super::token::Token;
use super::type_registry::TypeRegistry;

/// Per-connection delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// The consumer can take a new message
    ReadyToReceive,
    /// A message was delivered and not yet consumed
    Unread,
}

struct ConnectionInner {
    state: DeliveryState,
    errored: bool,
    waypoints: Vec<Point>,
}

pub struct Connection {
    id: ConnectionId,
    from: ConnectorId,
    to: ConnectorId,
    source: Weak<Connector>,
    sink: Weak<Connector>,
    active: AtomicBool,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    /// Check that `a` and `b` may be connected and orient them.
    ///
    /// Returns `(source, sink)`: the output-capable side first. Performs no
    /// mutation.
    pub fn validate(
        a: &Arc<Connector>,
        b: &Arc<Connector>,
        registry: &TypeRegistry,
    ) -> Result<(Arc<Connector>, Arc<Connector>), StructuralError> {
        if a.id() == b.id() {
            return Err(StructuralError::SelfConnection(a.id()));
        }

        let (source, sink) = if a.kind().can_output() && b.kind().can_input() {
            (a, b)
        } else if b.kind().can_output() && a.kind().can_input() {
            (b, a)
        } else {
            return Err(StructuralError::IncompatibleDirection {
                from: a.id(),
                to: b.id(),
            });
        };

        let from_type = source.message_type();
        let to_type = sink.message_type();
        if !registry.are_compatible(&to_type, &from_type) {
            return Err(StructuralError::IncompatibleType {
                from: source.id(),
                from_type,
                to: sink.id(),
                to_type,
            });
        }

        Ok((Arc::clone(source), Arc::clone(sink)))
    }

    /// Validate and create a connection, attaching it to both endpoints
    pub fn connect(
        a: &Arc<Connector>,
        b: &Arc<Connector>,
        registry: &TypeRegistry,
    ) -> Result<Arc<Connection>, StructuralError> {
        let (source, sink) = Self::validate(a, b, registry)?;
        if source.is_connected_to(sink.id()) {
            return Err(StructuralError::AlreadyConnected {
                from: source.id(),
                to: sink.id(),
            });
        }

        let connection = Arc::new(Self::between(&source, &sink));
        connection.attach();
        debug!("[{}] Connected {} -> {}", connection.id, source.id(), sink.id());
        Ok(connection)
    }

    fn between(source: &Arc<Connector>, sink: &Arc<Connector>) -> Self {
        Self {
            id: ConnectionId::new(),
            from: source.id(),
            to: sink.id(),
            source: Arc::downgrade(source),
            sink: Arc::downgrade(sink),
            active: AtomicBool::new(true),
            inner: Mutex::new(ConnectionInner {
                state: DeliveryState::ReadyToReceive,
                errored: false,
                waypoints: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn from(&self) -> ConnectorId {
        self.from
    }

    pub fn to(&self) -> ConnectorId {
        self.to
    }

    pub fn source(&self) -> Option<Arc<Connector>> {
        self.source.upgrade()
    }

    pub fn sink(&self) -> Option<Arc<Connector>> {
        self.sink.upgrade()
    }

    /// Register on both endpoints
    pub(crate) fn attach(self: &Arc<Self>) {
        if let Some(source) = self.source() {
            source.attach(Arc::clone(self));
        }
        if let Some(sink) = self.sink() {
            sink.attach(Arc::clone(self));
        }
    }

    /// Unregister from both endpoints; identity is kept
    pub(crate) fn detach(&self) {
        self.inner.lock().state = DeliveryState::ReadyToReceive;
        if let Some(source) = self.source() {
            source.detach(self.id);
        }
        if let Some(sink) = self.sink() {
            sink.detach(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Toggle data flow. Inactive connections are kept for editing only.
    pub fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::AcqRel) != active {
            if let Some(source) = self.source() {
                source.notify_connections_changed();
            }
            if let Some(sink) = self.sink() {
                sink.notify_connections_changed();
            }
        }
    }

    pub fn is_errored(&self) -> bool {
        self.inner.lock().errored
    }

    pub fn set_errored(&self, errored: bool) {
        self.inner.lock().errored = errored;
    }

    /// Re-check endpoint types; marks the connection errored if they no longer match.
    ///
    /// Returns true when the connection is valid.
    pub fn revalidate(&self, registry: &TypeRegistry) -> bool {
        let valid = match (self.source(), self.sink()) {
            (Some(source), Some(sink)) => {
                registry.are_compatible(&sink.message_type(), &source.message_type())
            }
            _ => false,
        };
        self.set_errored(!valid);
        valid
    }

    pub fn state(&self) -> DeliveryState {
        self.inner.lock().state
    }

    pub fn is_ready_to_receive(&self) -> bool {
        self.state() == DeliveryState::ReadyToReceive
    }

    /// Whether a send on this connection should be considered at all
    pub(crate) fn carries_data(&self) -> bool {
        self.is_active()
            && !self.is_errored()
            && self.sink().is_some_and(|sink| sink.is_enabled())
    }

    /// Deliver a message to the sink.
    ///
    /// Fails when the connection is inactive, errored or still unread. If
    /// the sink discards the message the connection is immediately ready
    /// again so the producer is not stalled.
    pub(crate) fn try_send(&self, token: Token) -> bool {
        {
            let mut inner = self.inner.lock();
            if !self.is_active() || inner.errored || inner.state != DeliveryState::ReadyToReceive {
                return false;
            }
            inner.state = DeliveryState::Unread;
        }

        let delivered = self.sink().is_some_and(|sink| sink.deliver(token));
        if !delivered {
            self.inner.lock().state = DeliveryState::ReadyToReceive;
        }
        delivered
    }

    /// Mark the message as consumed and wake the producer
    pub fn release(&self) {
        self.inner.lock().state = DeliveryState::ReadyToReceive;
        if let Some(source) = self.source() {
            source.notify_connection_released();
        }
    }

    /// Back to `ReadyToReceive` without notifying anyone
    pub fn reset(&self) {
        self.inner.lock().state = DeliveryState::ReadyToReceive;
    }

    // ────────────────────────────────────────────────────────────────────
    // Waypoints (presentation only)
    // ────────────────────────────────────────────────────────────────────

    pub fn waypoints(&self) -> Vec<Point> {
        self.inner.lock().waypoints.clone()
    }

    pub fn add_waypoint(&self, point: Point) {
        self.inner.lock().waypoints.push(point);
    }

    pub fn insert_waypoint(&self, index: usize, point: Point) -> Result<(), StructuralError> {
        let mut inner = self.inner.lock();
        if index > inner.waypoints.len() {
            return Err(self.waypoint_out_of_range(index));
        }
        inner.waypoints.insert(index, point);
        Ok(())
    }

    pub fn move_waypoint(&self, index: usize, point: Point) -> Result<(), StructuralError> {
        let mut inner = self.inner.lock();
        match inner.waypoints.get_mut(index) {
            Some(existing) => {
                *existing = point;
                Ok(())
            }
            None => Err(self.waypoint_out_of_range(index)),
        }
    }

    pub fn remove_waypoint(&self, index: usize) -> Result<Point, StructuralError> {
        let mut inner = self.inner.lock();
        if index >= inner.waypoints.len() {
            return Err(self.waypoint_out_of_range(index));
        }
        Ok(inner.waypoints.remove(index))
    }

    pub fn clear_waypoints(&self) {
        self.inner.lock().waypoints.clear();
    }

    fn waypoint_out_of_range(&self, index: usize) -> StructuralError {
        StructuralError::WaypointOutOfRange {
            connection: self.id,
            index,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("active", &self.is_active())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connector::ConnectorKind;
    use crate::runtime::ids::NodeId;
    use crate::runtime::type_registry::MessageType;
    use proptest::prelude::*;

    fn connector(kind: ConnectorKind, ty: MessageType) -> Arc<Connector> {
        Arc::new(Connector::new(NodeId::new(), kind, kind.to_string(), ty))
    }

    fn int() -> MessageType {
        MessageType::named("int")
    }

    #[test]
    fn test_connect_orients_and_attaches() {
        let registry = TypeRegistry::with_builtin_types();
        let output = connector(ConnectorKind::Output, int());
        let input = connector(ConnectorKind::Input, int());

        let connection = Connection::connect(&input, &output, &registry).unwrap();
        assert_eq!(connection.from(), output.id());
        assert_eq!(connection.to(), input.id());
        assert_eq!(output.count_connections(), 1);
        assert_eq!(input.count_connections(), 1);
    }

    #[test]
    fn test_incompatible_type_leaves_connectors_untouched() {
        let registry = TypeRegistry::with_builtin_types();
        let output = connector(ConnectorKind::Output, int());
        let input = connector(ConnectorKind::Input, MessageType::named("string"));

        let result = Connection::connect(&output, &input, &registry);
        assert!(matches!(result, Err(StructuralError::IncompatibleType { .. })));
        assert_eq!(output.count_connections(), 0);
        assert_eq!(input.count_connections(), 0);
    }

    #[test]
    fn test_direction_and_self_connection() {
        let registry = TypeRegistry::new();
        let a = connector(ConnectorKind::Input, MessageType::Any);
        let b = connector(ConnectorKind::Slot, MessageType::Any);

        assert!(matches!(
            Connection::connect(&a, &b, &registry),
            Err(StructuralError::IncompatibleDirection { .. })
        ));
        assert!(matches!(
            Connection::connect(&a, &a, &registry),
            Err(StructuralError::SelfConnection(_))
        ));
    }

    #[test]
    fn test_already_connected() {
        let registry = TypeRegistry::new();
        let output = connector(ConnectorKind::Output, MessageType::Any);
        let input = connector(ConnectorKind::Input, MessageType::Any);

        Connection::connect(&output, &input, &registry).unwrap();
        assert!(matches!(
            Connection::connect(&output, &input, &registry),
            Err(StructuralError::AlreadyConnected { .. })
        ));
    }

    #[test]
    fn test_one_message_in_flight() {
        let registry = TypeRegistry::new();
        let output = connector(ConnectorKind::Output, int());
        let input = connector(ConnectorKind::Input, int());
        let connection = Connection::connect(&output, &input, &registry).unwrap();

        assert!(connection.try_send(Token::new(int(), 1i64)));
        assert_eq!(connection.state(), DeliveryState::Unread);
        assert!(!connection.try_send(Token::new(int(), 2i64)));
        assert_eq!(input.peek().and_then(|t| t.get::<i64>().copied()), Some(1));

        connection.release();
        assert!(connection.try_send(Token::new(int(), 2i64)));
    }

    #[test]
    fn test_inactive_connection_does_not_send() {
        let registry = TypeRegistry::new();
        let output = connector(ConnectorKind::Output, int());
        let input = connector(ConnectorKind::Input, int());
        let connection = Connection::connect(&output, &input, &registry).unwrap();

        connection.set_active(false);
        assert!(!connection.try_send(Token::new(int(), 1i64)));
        assert!(!input.has_message());
    }

    #[test]
    fn test_set_type_marks_connection_errored() {
        let registry = TypeRegistry::with_builtin_types();
        let output = connector(ConnectorKind::Output, MessageType::Any);
        let input = connector(ConnectorKind::Input, int());
        let connection = Connection::connect(&output, &input, &registry).unwrap();

        let errored = output.set_type(MessageType::named("string"), &registry);
        assert_eq!(errored, vec![connection.id()]);
        assert!(connection.is_errored());
        assert_eq!(output.count_connections(), 1);

        let errored = output.set_type(MessageType::Any, &registry);
        assert!(errored.is_empty());
        assert!(!connection.is_errored());
    }

    #[test]
    fn test_detach_clears_error_when_last_connection_leaves() {
        let registry = TypeRegistry::new();
        let output = connector(ConnectorKind::Output, MessageType::Any);
        let input = connector(ConnectorKind::Input, MessageType::Any);
        let connection = Connection::connect(&output, &input, &registry).unwrap();

        input.set_error(crate::runtime::node_state::ErrorState::error("stale"));
        connection.detach();
        assert!(!input.has_error());
        assert_eq!(output.count_connections(), 0);
    }

    #[test]
    fn test_waypoints() {
        let registry = TypeRegistry::new();
        let output = connector(ConnectorKind::Output, MessageType::Any);
        let input = connector(ConnectorKind::Input, MessageType::Any);
        let connection = Connection::connect(&output, &input, &registry).unwrap();

        connection.add_waypoint(Point::new(0.0, 0.0));
        connection.insert_waypoint(0, Point::new(1.0, 1.0)).unwrap();
        connection.move_waypoint(1, Point::new(2.0, 2.0)).unwrap();
        assert_eq!(
            connection.waypoints(),
            vec![Point::new(1.0, 1.0), Point::new(2.0, 2.0)]
        );
        assert!(matches!(
            connection.remove_waypoint(5),
            Err(StructuralError::WaypointOutOfRange { index: 5, .. })
        ));
        assert_eq!(connection.remove_waypoint(0).unwrap(), Point::new(1.0, 1.0));
    }

    fn arb_type() -> impl Strategy<Value = MessageType> {
        let leaf = prop_oneof![
            Just(MessageType::Any),
            Just(MessageType::named("int")),
            Just(MessageType::named("string")),
            Just(MessageType::named("float")),
        ];
        leaf.prop_recursive(2, 4, 1, |inner| inner.prop_map(MessageType::list_of))
    }

    fn arb_kind() -> impl Strategy<Value = ConnectorKind> {
        prop_oneof![
            Just(ConnectorKind::Input),
            Just(ConnectorKind::Output),
            Just(ConnectorKind::Slot),
            Just(ConnectorKind::Event),
        ]
    }

    proptest! {
        #[test]
        fn test_connect_is_symmetric(
            kind_a in arb_kind(),
            kind_b in arb_kind(),
            type_a in arb_type(),
            type_b in arb_type(),
        ) {
            let registry = TypeRegistry::with_builtin_types();
            registry.register_compatible("int", "float");

            let a = connector(kind_a, type_a.clone());
            let b = connector(kind_b, type_b.clone());
            let forward = Connection::validate(&a, &b, &registry);

            let a2 = connector(kind_a, type_a);
            let b2 = connector(kind_b, type_b);
            let backward = Connection::validate(&b2, &a2, &registry);

            prop_assert_eq!(forward.is_ok(), backward.is_ok());
            if let (Ok((source, _)), Ok((source2, _))) = (forward, backward) {
                prop_assert_eq!(source.kind(), source2.kind());
            }
        }
    }
}
