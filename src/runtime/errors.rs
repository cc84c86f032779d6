//! Error types for the runtime system

use std::time::Duration;

use super::ids::{ConnectionId, ConnectorId, NodeId};
use super::thread_pool::GroupId;
use super::type_registry::MessageType;

/// Error type for structural graph operations.
///
/// Returned synchronously by the mutating call; the graph is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("Cannot connect {from} to {to}: exactly one side must be output-capable and the other input-capable")]
    IncompatibleDirection { from: ConnectorId, to: ConnectorId },

    #[error("Type mismatch: {from} ({from_type}) -> {to} ({to_type})")]
    IncompatibleType {
        from: ConnectorId,
        from_type: MessageType,
        to: ConnectorId,
        to_type: MessageType,
    },

    #[error("Connector {0} cannot be connected to itself")]
    SelfConnection(ConnectorId),

    #[error("{from} is already connected to {to}")]
    AlreadyConnected { from: ConnectorId, to: ConnectorId },

    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Connector {0} not found")]
    ConnectorNotFound(ConnectorId),

    #[error("Node {node} has no connector labelled '{label}'")]
    LabelNotFound { node: NodeId, label: String },

    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("Node {0} already exists in this graph")]
    DuplicateNode(NodeId),

    #[error("Connector {0} is not a forwarding port of this subgraph")]
    NotForwarding(ConnectorId),

    #[error("Waypoint {index} out of range for connection {connection}")]
    WaypointOutOfRange {
        connection: ConnectionId,
        index: usize,
    },
}

/// Error type for node execution.
///
/// Caught at the runner boundary and recorded as the node's error state;
/// other nodes keep running.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error("Node-specific error: {0}")]
    Process(String),

    #[error("Required input '{0}' has no message")]
    MissingInput(String),

    #[error("Invalid collection: {0}")]
    InvalidCollection(String),

    #[error("Node panicked: {0}")]
    Panicked(String),

    #[error("Node setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Structural(#[from] StructuralError),
}

/// Result type for node callbacks
pub type NodeResult<T = ()> = Result<T, NodeError>;

/// Error type for scheduling and thread-group management
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("Failed to spawn worker thread for group '{group}': {source}")]
    Spawn {
        group: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Graph did not quiesce within {0:?}")]
    DrainTimeout(Duration),

    #[error("Stepping mode is not enabled")]
    NotStepping,

    #[error("Thread group {0} does not exist")]
    UnknownGroup(GroupId),

    #[error("Node {0} has no runner in this thread pool")]
    UnknownRunner(NodeId),

    #[error("Thread group {0} cannot be removed")]
    ProtectedGroup(GroupId),

    #[error("Thread pool has been stopped")]
    Stopped,
}

/// Error type for node type resolution
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("Node type '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Node(#[from] NodeError),
}
