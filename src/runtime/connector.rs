//! Typed connectors owned by nodes
//!
//! A connector is one endpoint of a node: an input, an output, an event
//! emitter or a slot receiver. It holds its attached connections, the last
//! message delivered to it (inputs and slots) or the message staged for the
//! next send (outputs and events).
//!
//! Connectors report changes to a single [`ConnectorListener`], normally the
//! owning node handle. The listener is always called after the connector's
//! own lock has been released.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::connection::{Connection, DeliveryState};
use super::ids::{ConnectionId, ConnectorId, NodeId};
use super::node_state::ErrorState;
use super::token::Token;
use super::type_registry::{MessageType, TypeRegistry};

/// Capability tag of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// Data input, takes part in readiness
    Input,
    /// Data output, takes part in backpressure
    Output,
    /// Asynchronous receiver, handled outside the process cycle
    Slot,
    /// Fire-and-forget emitter, never blocks
    Event,
}

impl ConnectorKind {
    pub fn can_input(&self) -> bool {
        matches!(self, ConnectorKind::Input | ConnectorKind::Slot)
    }

    pub fn can_output(&self) -> bool {
        matches!(self, ConnectorKind::Output | ConnectorKind::Event)
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectorKind::Input => "input",
            ConnectorKind::Output => "output",
            ConnectorKind::Slot => "slot",
            ConnectorKind::Event => "event",
        };
        write!(f, "{}", name)
    }
}

/// Receives connector state changes
pub trait ConnectorListener: Send + Sync {
    /// A message was delivered to an input or slot
    fn message_arrived(&self, connector: &Connector);

    /// A downstream consumer released one of this output's connections
    fn connection_released(&self, connector: &Connector);

    /// A connection was attached, detached or (de)activated
    fn connections_changed(&self, connector: &Connector);

    fn enabled_changed(&self, connector: &Connector);
}

/// Lifecycle events for connectors added or removed after construction
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Created(Arc<Connector>),
    Removed(Arc<Connector>),
}

struct ConnectorInner {
    label: String,
    message_type: MessageType,
    enabled: bool,
    optional: bool,
    is_virtual: bool,
    graph_port: bool,
    essential: bool,
    connections: Vec<Arc<Connection>>,
    message: Option<Token>,
    staged: Option<Token>,
    seq_no: i64,
    received: u64,
    error: Option<ErrorState>,
}

pub struct Connector {
    id: ConnectorId,
    owner: NodeId,
    kind: ConnectorKind,
    inner: Mutex<ConnectorInner>,
    listener: RwLock<Option<Weak<dyn ConnectorListener>>>,
}

impl Connector {
    pub fn new(
        owner: NodeId,
        kind: ConnectorKind,
        label: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: ConnectorId::new(),
            owner,
            kind,
            inner: Mutex::new(ConnectorInner {
                label: label.into(),
                message_type,
                enabled: true,
                optional: false,
                is_virtual: false,
                graph_port: false,
                essential: false,
                connections: Vec::new(),
                message: None,
                staged: None,
                seq_no: -1,
                received: 0,
                error: None,
            }),
            listener: RwLock::new(None),
        }
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn kind(&self) -> ConnectorKind {
        self.kind
    }

    pub fn set_listener(&self, listener: Weak<dyn ConnectorListener>) {
        *self.listener.write() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn ConnectorListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    // ────────────────────────────────────────────────────────────────────
    // Attributes
    // ────────────────────────────────────────────────────────────────────

    pub fn label(&self) -> String {
        self.inner.lock().label.clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        self.inner.lock().label = label.into();
    }

    pub fn message_type(&self) -> MessageType {
        self.inner.lock().message_type.clone()
    }

    /// Change the declared type and re-validate every attached connection.
    ///
    /// Connections that no longer type-check are marked errored (not
    /// removed); previously errored ones that now pass are cleared.
    /// Returns the ids of connections that are errored afterwards.
    pub fn set_type(&self, message_type: MessageType, registry: &TypeRegistry) -> Vec<ConnectionId> {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.message_type == message_type {
                return Vec::new();
            }
            debug!(
                "[{}] Type changed {} -> {}",
                self.id, inner.message_type, message_type
            );
            inner.message_type = message_type;
            inner.connections.clone()
        };

        connections
            .iter()
            .filter(|connection| !connection.revalidate(registry))
            .map(|connection| connection.id())
            .collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Enable or disable the connector. Attached connections are kept.
    pub fn set_enabled(&self, enabled: bool) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.enabled != enabled;
            inner.enabled = enabled;
            changed
        };
        if changed {
            if let Some(listener) = self.listener() {
                listener.enabled_changed(self);
            }
        }
    }

    pub fn is_optional(&self) -> bool {
        self.inner.lock().optional
    }

    pub fn set_optional(&self, optional: bool) {
        self.inner.lock().optional = optional;
    }

    pub fn is_virtual(&self) -> bool {
        self.inner.lock().is_virtual
    }

    pub fn set_virtual(&self, is_virtual: bool) {
        self.inner.lock().is_virtual = is_virtual;
    }

    pub fn is_graph_port(&self) -> bool {
        self.inner.lock().graph_port
    }

    pub fn set_graph_port(&self, graph_port: bool) {
        self.inner.lock().graph_port = graph_port;
    }

    pub fn is_essential(&self) -> bool {
        self.inner.lock().essential
    }

    pub fn set_essential(&self, essential: bool) {
        self.inner.lock().essential = essential;
    }

    pub fn sequence_number(&self) -> i64 {
        self.inner.lock().seq_no
    }

    /// Advance the sequence number, returning the new value
    pub fn bump_sequence(&self) -> i64 {
        let mut inner = self.inner.lock();
        inner.seq_no += 1;
        inner.seq_no
    }

    pub fn received_count(&self) -> u64 {
        self.inner.lock().received
    }

    pub fn error(&self) -> Option<ErrorState> {
        self.inner.lock().error.clone()
    }

    pub fn has_error(&self) -> bool {
        self.inner.lock().error.is_some()
    }

    pub fn set_error(&self, error: ErrorState) {
        self.inner.lock().error = Some(error);
    }

    pub fn clear_error(&self) {
        self.inner.lock().error = None;
    }

    // ────────────────────────────────────────────────────────────────────
    // Connections
    // ────────────────────────────────────────────────────────────────────

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.clone()
    }

    pub fn count_connections(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.lock().connections.is_empty()
    }

    pub fn has_active_connection(&self) -> bool {
        self.inner
            .lock()
            .connections
            .iter()
            .any(|connection| connection.is_active())
    }

    /// Whether this connector already has a connection to `other`
    pub fn is_connected_to(&self, other: ConnectorId) -> bool {
        self.inner
            .lock()
            .connections
            .iter()
            .any(|connection| connection.from() == other || connection.to() == other)
    }

    pub(crate) fn attach(&self, connection: Arc<Connection>) {
        self.inner.lock().connections.push(connection);
        self.notify_connections_changed();
    }

    /// Remove a connection; clears the error state once no connection is left
    pub(crate) fn detach(&self, connection: ConnectionId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.connections.len();
            inner.connections.retain(|existing| existing.id() != connection);
            let removed = inner.connections.len() != before;
            if removed && inner.connections.is_empty() {
                inner.error = None;
                inner.message = None;
            }
            removed
        };
        if removed {
            self.notify_connections_changed();
        }
        removed
    }

    pub(crate) fn notify_connections_changed(&self) {
        if let Some(listener) = self.listener() {
            listener.connections_changed(self);
        }
    }

    pub(crate) fn notify_connection_released(&self) {
        if let Some(listener) = self.listener() {
            listener.connection_released(self);
        }
    }

    /// Release every connection still marked unread
    pub fn release_connections(&self) {
        for connection in self.connections() {
            if connection.state() == DeliveryState::Unread {
                connection.release();
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Messages
    // ────────────────────────────────────────────────────────────────────

    /// Store an incoming message.
    ///
    /// Returns false (message discarded) if the connector is in an error state.
    pub(crate) fn deliver(&self, token: Token) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.error.is_some() {
                debug!("[{}] Discarding message on errored connector", self.id);
                return false;
            }
            inner.message = Some(token);
            inner.received += 1;
            inner.seq_no += 1;
        }
        if let Some(listener) = self.listener() {
            listener.message_arrived(self);
        }
        true
    }

    pub fn has_message(&self) -> bool {
        self.inner.lock().message.is_some()
    }

    /// Clone of the buffered message
    pub fn peek(&self) -> Option<Token> {
        self.inner.lock().message.clone()
    }

    pub fn take_message(&self) -> Option<Token> {
        self.inner.lock().message.take()
    }

    /// Stage a message to be sent with the next transition send
    pub fn stage(&self, token: Token) {
        self.inner.lock().staged = Some(token);
    }

    pub fn has_staged(&self) -> bool {
        self.inner.lock().staged.is_some()
    }

    pub fn take_staged(&self) -> Option<Token> {
        self.inner.lock().staged.take()
    }

    /// Drop buffered and staged messages and reset the sequence counter
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.message = None;
        inner.staged = None;
        inner.seq_no = -1;
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &inner.label)
            .field("type", &inner.message_type)
            .field("connections", &inner.connections.len())
            .finish()
    }
}
