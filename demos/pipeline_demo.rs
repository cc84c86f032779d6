//! Example: Linear pipeline
//!
//! Counter source → map (multiply) → export log, optionally rate-limited,
//! placed in a named thread group, or driven step by step.
//!
//! Usage:
//!   cargo run --example pipeline_demo -- -n 20 --scale 3
//!
//! Stepping through the first five values:
//!   cargo run --example pipeline_demo -- -n 5 --step

use clap::Parser;
use flowgraph::nodes::{CounterSource, ExportLog, MapNode};
use flowgraph::runtime::{
    Graph, GraphFacade, NodeHandle, NodeId, RuntimeConfig, ThreadPool, TypeRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of values emitted by the source
    #[arg(short, long, default_value_t = 10)]
    n: i64,

    /// Factor applied by the map node
    #[arg(long, default_value_t = 2)]
    scale: i64,

    /// Cap on the map node's execution rate in Hz (0 = unlimited)
    #[arg(long, default_value_t = 0.0)]
    max_frequency: f64,

    /// Run the map node in its own thread group
    #[arg(long)]
    group: Option<String>,

    /// Give every node a private thread
    #[arg(long)]
    private: bool,

    /// Advance the graph one source cycle at a time
    #[arg(long)]
    step: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("=== Pipeline Demo ===");

    let config = RuntimeConfig::new().with_private_threads(args.private);
    let pool = Arc::new(ThreadPool::new(config)?);
    let registry = Arc::new(TypeRegistry::with_builtin_types());
    let facade = GraphFacade::new(Arc::clone(&pool), Graph::new(registry));
    facade.notifications().subscribe(|n| warn!("{}", n));

    if args.step {
        facade.set_stepping_mode(true);
    } else {
        facade.pause_request(true);
    }

    let scale = args.scale;
    let source = NodeHandle::new(
        NodeId::new(),
        "counter_source",
        Box::new(CounterSource::new().with_limit(args.n)),
    )?;
    let map = NodeHandle::new(
        NodeId::new(),
        "map",
        Box::new(MapNode::int(move |v| v * scale).with_name("scale")),
    )?;
    let (log, received) = ExportLog::channel();
    let sink = NodeHandle::new(NodeId::new(), "export_log", Box::new(log))?;

    if args.max_frequency > 0.0 {
        map.set_max_frequency(args.max_frequency);
    }
    if let Some(name) = &args.group {
        map.set_thread_group(Some(pool.create_group(name)?));
    }

    for handle in [&source, &map, &sink] {
        facade.add_node(Arc::clone(handle))?;
    }
    facade.connect_by_label(source.id(), "count", map.id(), "in")?;
    facade.connect_by_label(map.id(), "out", sink.id(), "in")?;

    for group in pool.groups() {
        info!("Thread group {} '{}': {} members", group.id, group.name, group.members);
    }

    let timeout = Duration::from_secs(5);
    if args.step {
        for i in 0..args.n {
            facade.step()?;
            let token = received.recv_timeout(timeout)?;
            info!("Step {}: {:?}", i + 1, token.get::<i64>());
        }
    } else {
        facade.pause_request(false);
        for _ in 0..args.n {
            received.recv_timeout(timeout)?;
        }
    }

    if !facade.wait_until_quiescent(timeout) {
        warn!("Graph did not settle within {:?}", timeout);
    }
    info!(
        "Done: map ran {} times",
        facade.runner(map.id()).map_or(0, |r| r.execution_count())
    );
    facade.stop();
    Ok(())
}
