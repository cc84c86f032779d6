//! Example: Subgraph iteration
//!
//! A sequence source emits lists of integers into a subgraph whose input
//! is iterated: the internal graph squares one element at a time and the
//! subgraph collects the results back into a list.
//!
//! Usage:
//!   cargo run --example iteration_demo -- --lists 3 --len 5

use clap::Parser;
use flowgraph::nodes::{ExportLog, MapNode, SequenceSource};
use flowgraph::runtime::{
    Graph, GraphFacade, MessageType, NodeFactory, NodeHandle, NodeId, NodeTypeResolver,
    RuntimeConfig, ThreadPool, Token, TypeRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of lists sent into the subgraph
    #[arg(long, default_value_t = 2)]
    lists: i64,

    /// Elements per list
    #[arg(long, default_value_t = 4)]
    len: i64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("=== Iteration Demo ===");

    let int = MessageType::named("int");
    let int_list = MessageType::list_of(int.clone());

    let registry = Arc::new(TypeRegistry::with_builtin_types());
    let pool = Arc::new(ThreadPool::new(RuntimeConfig::default())?);
    let facade = GraphFacade::new(pool, Graph::new(Arc::clone(&registry)));
    facade.notifications().subscribe(|n| warn!("{}", n));
    facade.pause_request(true);

    let factory = NodeFactory::with_builtin_nodes(registry);
    let subgraph_handle = factory.make_node("subgraph", NodeId::new())?;
    let subgraph = subgraph_handle
        .subgraph()
        .ok_or("subgraph node without subgraph")?;
    let items = subgraph.add_forwarding_input("items", int_list.clone())?;
    let result = subgraph.add_forwarding_output("result", int.clone())?;
    subgraph.set_iteration_enabled(items.external, true)?;
    facade.add_node(Arc::clone(&subgraph_handle))?;

    let inner = facade
        .child(subgraph.id())
        .ok_or("subgraph was not registered")?;
    let square = NodeHandle::new(NodeId::new(), "map", Box::new(MapNode::int(|v| v * v)))?;
    inner.add_node(Arc::clone(&square))?;
    let square_in = square.connector_by_label("in").ok_or("map has no input")?;
    let square_out = square.connector_by_label("out").ok_or("map has no output")?;
    inner.connect(items.internal, square_in.id())?;
    inner.connect(square_out.id(), result.internal)?;

    let inputs: Vec<Token> = (0..args.lists)
        .map(|l| {
            let elements = (0..args.len)
                .map(|i| Token::new(int.clone(), l * args.len + i))
                .collect();
            Token::list(int.clone(), elements)
        })
        .collect();
    let source = NodeHandle::new(
        NodeId::new(),
        "sequence_source",
        Box::new(SequenceSource::new(int_list, inputs)),
    )?;
    let (log, received) = ExportLog::channel();
    let sink = NodeHandle::new(NodeId::new(), "export_log", Box::new(log))?;
    facade.add_node(Arc::clone(&source))?;
    facade.add_node(Arc::clone(&sink))?;
    facade.connect_by_label(source.id(), "value", subgraph.id(), "items")?;
    facade.connect_by_label(subgraph.id(), "result", sink.id(), "in")?;

    subgraph.drained().subscribe(|index| info!("Iteration {} drained", index));
    facade.pause_request(false);

    let timeout = Duration::from_secs(5);
    for _ in 0..args.lists {
        let token = received.recv_timeout(timeout)?;
        let values: Vec<i64> = token
            .items()
            .unwrap_or_default()
            .iter()
            .filter_map(|item| item.get::<i64>().copied())
            .collect();
        info!("Result: {:?}", values);
    }

    facade.wait_until_quiescent(timeout);
    info!(
        "Subgraph activated {} times, {} drains",
        subgraph.activation_count(),
        subgraph.drain_count()
    );
    facade.stop();
    Ok(())
}
