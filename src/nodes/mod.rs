//! Built-in node types
//!
//! - **Sources**: [`CounterSource`], [`SequenceSource`]
//! - **Transforms**: [`Passthrough`], [`MapNode`]
//! - **Sinks**: [`ExportLog`]
//!
//! The parameterless ones are registered with the node factory by
//! [`register_builtin_nodes`].

mod export_log;
mod map;
mod passthrough;
mod sources;

pub use export_log::ExportLog;
pub use map::MapNode;
pub use passthrough::Passthrough;
pub use sources::{CounterSource, SequenceSource};

use crate::runtime::factory::NodeFactory;

pub fn register_builtin_nodes(factory: &NodeFactory) {
    factory.register("counter_source", || Box::new(CounterSource::new()));
    factory.register("passthrough", || Box::new(Passthrough::new()));
    factory.register("export_log", || Box::new(ExportLog::new()));
}
