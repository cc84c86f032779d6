//! Runtime support for dataflow node graphs

pub mod config;
pub mod connection;
pub mod connector;
pub mod errors;
pub mod factory;
pub mod graph;
pub mod graph_facade;
pub mod ids;
pub mod node;
pub mod node_handle;
pub mod node_runner;
pub mod node_state;
pub mod notification;
pub mod rate;
pub mod scheduler;
pub mod signal;
pub mod subgraph;
pub mod task;
pub mod thread_pool;
pub mod token;
pub mod transition;
pub mod type_registry;
pub mod watchdog;

pub use config::RuntimeConfig;
pub use connection::{Connection, DeliveryState};
pub use connector::{Connector, ConnectorEvent, ConnectorKind, ConnectorListener};
pub use errors::{FactoryError, NodeError, NodeResult, SchedulingError, StructuralError};
pub use factory::{NodeConstructor, NodeFactory, NodeTypeResolver};
pub use graph::{Graph, GraphEvent};
pub use graph_facade::{FacadeEvent, GraphFacade};
pub use ids::{ConnectionId, ConnectorId, NodeId};
pub use node::{Continuation, Node, NodeModifier, Outputs, ProcessContext};
pub use node_handle::{NodeEvents, NodeHandle};
pub use node_runner::NodeRunner;
pub use node_state::{ErrorLevel, ErrorState, NodeState, Point};
pub use notification::Notification;
pub use scheduler::Scheduler;
pub use signal::{EventBus, SubscriptionId};
pub use subgraph::{IterationPhase, RelayMapping, SubgraphNode};
pub use task::Task;
pub use thread_pool::{GroupId, ThreadGroupInfo, ThreadPool};
pub use token::{Payload, Token};
pub use transition::{InputTransition, OutputTransition};
pub use type_registry::{MessageType, TypeRegistry};
pub use watchdog::{StallReport, Watchdog};
