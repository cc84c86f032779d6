//! Execution core for visual dataflow graphs
//!
//! Nodes declare typed connectors and are wired together by connections
//! that carry one message at a time. A node becomes ready when every
//! required input holds a message and every downstream connection can take
//! a new one; a [`runtime::NodeRunner`] then queues its process task on a
//! thread group scheduler owned by the [`runtime::ThreadPool`].
//!
//! # Architecture
//!
//! - **Connectors / Connections**: single-slot delivery with explicit release
//! - **Transitions**: per-node readiness over inputs and outputs
//! - **Runners**: task queueing, frequency caps, pause and stepping
//! - **Thread pool**: named thread groups, private threads, reassignment
//! - **Graph / GraphFacade**: structure, events and runner bookkeeping
//! - **SubgraphNode**: nested graphs with per-element iteration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowgraph::nodes::{CounterSource, ExportLog};
//! use flowgraph::runtime::{Graph, GraphFacade, NodeHandle, NodeId, RuntimeConfig, ThreadPool, TypeRegistry};
//!
//! let registry = Arc::new(TypeRegistry::with_builtin_types());
//! let pool = Arc::new(ThreadPool::new(RuntimeConfig::default())?);
//! let facade = GraphFacade::new(pool, Graph::new(registry));
//!
//! let source = NodeHandle::new(NodeId::new(), "counter_source", Box::new(CounterSource::new().with_limit(10)))?;
//! let sink = NodeHandle::new(NodeId::new(), "export_log", Box::new(ExportLog::new()))?;
//! facade.add_node(Arc::clone(&source))?;
//! facade.add_node(Arc::clone(&sink))?;
//! facade.connect_by_label(source.id(), "count", sink.id(), "in")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod nodes;
pub mod runtime;

pub use nodes::{CounterSource, ExportLog, MapNode, Passthrough, SequenceSource};

pub use runtime::{
    Connection, Connector, ConnectorKind, FactoryError, Graph, GraphFacade, GroupId, MessageType,
    Node, NodeError, NodeFactory, NodeHandle, NodeId, NodeResult, NodeRunner, RuntimeConfig,
    SchedulingError, StructuralError, SubgraphNode, ThreadPool, Token, TypeRegistry,
};
