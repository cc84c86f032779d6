//! Subgraph node: a node wrapping an internal graph
//!
//! Every forwarding port on the outside has one relay connector on the
//! inside. Relays are owned by the subgraph node, registered with the
//! internal graph, and listened to by the [`SubgraphNode`] itself:
//!
//! | forwarding port | internal relay | relay transition |
//! |-----------------|----------------|------------------|
//! | input           | output         | `relay_out`      |
//! | output          | input          | `relay_in`       |
//! | slot            | event          | `relay_out`      |
//! | event           | slot           | `relay_in`       |
//!
//! An activation defers the node's process cycle and walks the iteration
//! state machine: for each element of the iterated inputs it sends one
//! message set through the output relays, waits until the internal graph
//! has drained into the input relays, then moves on. After the last element
//! the collected results are sent on the forwarding outputs and the cycle
//! completes.
//!
//! An element has drained once every connected output relay holds a
//! message, every input relay's message was taken, and no internal node is
//! mid-cycle or holding inputs it is about to process. Elements that drain
//! synchronously are advanced in a loop, so list length does not grow the
//! stack.
//!
//! Without iterated inputs an activation is a single element.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::connector::{Connector, ConnectorKind, ConnectorListener};
use super::errors::{NodeError, NodeResult, StructuralError};
use super::graph::{Graph, GraphEvent};
use super::ids::{ConnectorId, NodeId};
use super::node::{Continuation, Node, NodeModifier, Outputs, ProcessContext};
use super::node_handle::NodeHandle;
use super::signal::{EventBus, SubscriptionId};
use super::token::Token;
use super::transition::{InputTransition, OutputTransition};
use super::type_registry::{MessageType, TypeRegistry};
use super::watchdog::{Watchdog, WatchdogHandle};

/// Guard value of a live subgraph node
pub const GUARD_LIVE: i64 = -1;
/// Guard value once tear-down has started
pub const GUARD_DEAD: i64 = 0xDEAD_BEEF;

/// Type name used by the node factory
pub const SUBGRAPH_TYPE: &str = "subgraph";

/// One forwarding port and its internal relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayMapping {
    pub external: ConnectorId,
    pub internal: ConnectorId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPhase {
    Idle,
    Iterating,
    SendIteration,
    WaitProcessed,
    Finished,
}

/// Outcome of checking the current element
enum Advance {
    Pending,
    Next,
    Done,
}

#[derive(Default)]
struct PortMaps {
    inputs: Vec<RelayMapping>,
    outputs: Vec<RelayMapping>,
    slots: Vec<RelayMapping>,
    events: Vec<RelayMapping>,
    relays: HashMap<ConnectorId, Arc<Connector>>,
}

impl PortMaps {
    fn external_for(&self, internal: ConnectorId) -> Option<ConnectorId> {
        [&self.inputs, &self.outputs, &self.slots, &self.events]
            .into_iter()
            .flatten()
            .find(|mapping| mapping.internal == internal)
            .map(|mapping| mapping.external)
    }

    fn internal_for(&self, external: ConnectorId) -> Option<ConnectorId> {
        [&self.inputs, &self.outputs, &self.slots, &self.events]
            .into_iter()
            .flatten()
            .find(|mapping| mapping.external == external)
            .map(|mapping| mapping.internal)
    }

    fn remove(&mut self, external: ConnectorId) -> Option<RelayMapping> {
        for list in [
            &mut self.inputs,
            &mut self.outputs,
            &mut self.slots,
            &mut self.events,
        ] {
            if let Some(position) = list.iter().position(|m| m.external == external) {
                let mapping = list.remove(position);
                self.relays.remove(&mapping.internal);
                return Some(mapping);
            }
        }
        None
    }
}

struct RunState {
    phase: IterationPhase,
    index: usize,
    count: usize,
    iterating: bool,
    /// External input -> message of the current activation
    inputs: HashMap<ConnectorId, Token>,
    /// External output -> one result per drained element
    results: HashMap<ConnectorId, Vec<Token>>,
    continuation: Option<Continuation>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: IterationPhase::Idle,
            index: 0,
            count: 0,
            iterating: false,
            inputs: HashMap::new(),
            results: HashMap::new(),
            continuation: None,
        }
    }
}

pub struct SubgraphNode {
    id: NodeId,
    graph: Arc<Graph>,
    self_ref: Weak<SubgraphNode>,
    handle: Mutex<Weak<NodeHandle>>,
    relay_in: InputTransition,
    relay_out: OutputTransition,
    ports: RwLock<PortMaps>,
    iterated: Mutex<HashSet<ConnectorId>>,
    run: Mutex<RunState>,
    guard: AtomicI64,
    activations: AtomicU64,
    drains: AtomicU64,
    drained: EventBus<usize>,
    watchdog: Mutex<Option<WatchdogHandle>>,
    /// Internal node -> its `try_process` subscription
    node_watch: Mutex<HashMap<NodeId, SubscriptionId>>,
}

impl SubgraphNode {
    /// Create a subgraph node and the handle wrapping it
    pub fn create_handle(id: NodeId, registry: Arc<TypeRegistry>) -> NodeResult<Arc<NodeHandle>> {
        let subgraph = Arc::new_cyclic(|self_ref| Self {
            id,
            graph: Graph::with_owner(id, registry),
            self_ref: self_ref.clone(),
            handle: Mutex::new(Weak::new()),
            relay_in: InputTransition::new(),
            relay_out: OutputTransition::new(),
            ports: RwLock::new(PortMaps::default()),
            iterated: Mutex::new(HashSet::new()),
            run: Mutex::new(RunState::default()),
            guard: AtomicI64::new(GUARD_LIVE),
            activations: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            drained: EventBus::new(),
            watchdog: Mutex::new(None),
            node_watch: Mutex::new(HashMap::new()),
        });
        subgraph.watch_internal_nodes();

        let process = SubgraphProcess {
            subgraph: Arc::downgrade(&subgraph),
        };
        let handle = NodeHandle::build(id, SUBGRAPH_TYPE, Box::new(process), Some(Arc::clone(&subgraph)))?;
        *subgraph.handle.lock() = Arc::downgrade(&handle);
        Ok(handle)
    }

    /// Re-check the current element whenever an internal node ends a
    /// cycle or leaves the graph
    fn watch_internal_nodes(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.graph.events().subscribe(move |event| {
            let Some(subgraph) = weak.upgrade() else {
                return;
            };
            match event {
                GraphEvent::NodeAdded(node) => subgraph.watch(node),
                GraphEvent::NodeRemoved(node) => {
                    if let Some(subscription) = subgraph.node_watch.lock().remove(&node.id()) {
                        node.events().try_process.unsubscribe(subscription);
                    }
                    subgraph.try_finish_iteration();
                }
                _ => {}
            }
        });
    }

    fn watch(&self, node: &NodeHandle) {
        let weak = self.self_ref.clone();
        let subscription = node.events().try_process.subscribe(move |_| {
            if let Some(subgraph) = weak.upgrade() {
                subgraph.try_finish_iteration();
            }
        });
        self.node_watch.lock().insert(node.id(), subscription);
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The internal graph
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn handle(&self) -> Option<Arc<NodeHandle>> {
        self.handle.lock().upgrade()
    }

    fn is_live(&self) -> bool {
        self.guard.load(Ordering::Acquire) == GUARD_LIVE
    }

    /// Element index of every drained iteration
    pub fn drained(&self) -> &EventBus<usize> {
        &self.drained
    }

    /// Elements injected into the internal graph so far
    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Elements that fully drained so far
    pub fn drain_count(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> IterationPhase {
        self.run.lock().phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == IterationPhase::Idle
    }

    /// Track iterations; an element that never drains shows up as a stall
    pub fn set_watchdog(&self, watchdog: &Watchdog) {
        let scope = format!("subgraph {}", self.id);
        *self.watchdog.lock() = Some(watchdog.register(&scope, "iteration"));
    }

    // ────────────────────────────────────────────────────────────────────
    // Forwarding ports
    // ────────────────────────────────────────────────────────────────────

    fn owner_handle(&self) -> Result<Arc<NodeHandle>, StructuralError> {
        self.handle().ok_or(StructuralError::NodeNotFound(self.id))
    }

    fn make_relay(&self, kind: ConnectorKind, label: &str, message_type: MessageType) -> Arc<Connector> {
        let relay = Arc::new(Connector::new(self.id, kind, label, message_type));
        relay.set_virtual(true);
        relay.set_graph_port(true);
        let listener: Weak<dyn ConnectorListener> = self.self_ref.clone();
        relay.set_listener(listener);
        relay
    }

    fn add_forwarding(
        &self,
        external_kind: ConnectorKind,
        relay_kind: ConnectorKind,
        label: &str,
        message_type: MessageType,
    ) -> Result<RelayMapping, StructuralError> {
        let handle = self.owner_handle()?;
        let relay = self.make_relay(relay_kind, label, message_type.clone());
        let external = handle.add_connector(external_kind, label, message_type, false);
        let mapping = RelayMapping {
            external: external.id(),
            internal: relay.id(),
        };

        if relay_kind.can_input() {
            self.relay_in.add_connector(Arc::clone(&relay));
        } else {
            self.relay_out.add_connector(Arc::clone(&relay));
        }
        self.graph.add_relay(Arc::clone(&relay));

        let mut ports = self.ports.write();
        ports.relays.insert(relay.id(), relay);
        match external_kind {
            ConnectorKind::Input => ports.inputs.push(mapping),
            ConnectorKind::Output => ports.outputs.push(mapping),
            ConnectorKind::Slot => ports.slots.push(mapping),
            ConnectorKind::Event => ports.events.push(mapping),
        }
        debug!("[{}] Forwarding {} '{}' added", self.id, external_kind, label);
        Ok(mapping)
    }

    pub fn add_forwarding_input(&self, label: &str, message_type: MessageType) -> Result<RelayMapping, StructuralError> {
        self.add_forwarding(ConnectorKind::Input, ConnectorKind::Output, label, message_type)
    }

    pub fn add_forwarding_output(&self, label: &str, message_type: MessageType) -> Result<RelayMapping, StructuralError> {
        self.add_forwarding(ConnectorKind::Output, ConnectorKind::Input, label, message_type)
    }

    pub fn add_forwarding_slot(&self, label: &str, message_type: MessageType) -> Result<RelayMapping, StructuralError> {
        self.add_forwarding(ConnectorKind::Slot, ConnectorKind::Event, label, message_type)
    }

    pub fn add_forwarding_event(&self, label: &str, message_type: MessageType) -> Result<RelayMapping, StructuralError> {
        self.add_forwarding(ConnectorKind::Event, ConnectorKind::Slot, label, message_type)
    }

    /// Remove a forwarding port and its relay, severing both sides
    pub fn remove_forwarding(&self, external: ConnectorId) -> Result<(), StructuralError> {
        let mapping = self
            .ports
            .write()
            .remove(external)
            .ok_or(StructuralError::NotForwarding(external))?;

        self.graph.remove_relay(mapping.internal);
        self.relay_in.remove_connector(mapping.internal);
        self.relay_out.remove_connector(mapping.internal);
        self.iterated.lock().remove(&external);
        if let Some(handle) = self.handle() {
            handle.remove_connector(external)?;
        }
        debug!("[{}] Forwarding port {} removed", self.id, external);
        Ok(())
    }

    pub fn inputs(&self) -> Vec<RelayMapping> {
        self.ports.read().inputs.clone()
    }

    pub fn outputs(&self) -> Vec<RelayMapping> {
        self.ports.read().outputs.clone()
    }

    pub fn slots(&self) -> Vec<RelayMapping> {
        self.ports.read().slots.clone()
    }

    pub fn events(&self) -> Vec<RelayMapping> {
        self.ports.read().events.clone()
    }

    pub fn relay(&self, internal: ConnectorId) -> Option<Arc<Connector>> {
        self.ports.read().relays.get(&internal).cloned()
    }

    /// Internal relay of a forwarding port
    pub fn relay_for(&self, external: ConnectorId) -> Option<Arc<Connector>> {
        let ports = self.ports.read();
        let internal = ports.internal_for(external)?;
        ports.relays.get(&internal).cloned()
    }

    /// Treat the forwarding input `external` as a collection.
    ///
    /// The relay carries the element type while iteration is enabled.
    /// Inputs that are not iterated are sent into the internal graph once
    /// per activation, together with the first element. Internal nodes
    /// that combine such a value with every element must keep it
    /// themselves; an internal input fed only by a non-iterated relay is
    /// empty from the second element on.
    pub fn set_iteration_enabled(&self, external: ConnectorId, enabled: bool) -> Result<(), StructuralError> {
        let (relay, declared) = {
            let ports = self.ports.read();
            let mapping = ports
                .inputs
                .iter()
                .find(|mapping| mapping.external == external)
                .ok_or(StructuralError::NotForwarding(external))?;
            let relay = ports
                .relays
                .get(&mapping.internal)
                .cloned()
                .ok_or(StructuralError::ConnectorNotFound(mapping.internal))?;
            let declared = self
                .owner_handle()?
                .connector(external)
                .ok_or(StructuralError::ConnectorNotFound(external))?
                .message_type();
            (relay, declared)
        };

        let relay_type = if enabled {
            declared.element_type().cloned().unwrap_or_default()
        } else {
            declared
        };
        relay.set_type(relay_type, self.graph.registry());

        let mut iterated = self.iterated.lock();
        if enabled {
            iterated.insert(external);
        } else {
            iterated.remove(&external);
        }
        Ok(())
    }

    pub fn is_iterated(&self, external: ConnectorId) -> bool {
        self.iterated.lock().contains(&external)
    }

    // ────────────────────────────────────────────────────────────────────
    // Iteration
    // ────────────────────────────────────────────────────────────────────

    fn activate(&self, ctx: &mut ProcessContext) -> NodeResult<()> {
        if !self.is_live() {
            return Err(NodeError::Process(format!("subgraph {} is torn down", self.id)));
        }

        let inputs: HashMap<ConnectorId, Token> = self
            .inputs()
            .iter()
            .filter_map(|mapping| ctx.input(mapping.external).map(|t| (mapping.external, t.clone())))
            .collect();

        let iterated = self.iterated.lock().clone();
        let mut count = None;
        for external in &iterated {
            let Some(token) = inputs.get(external) else {
                continue;
            };
            let items = token.items().ok_or_else(|| {
                NodeError::InvalidCollection(format!(
                    "iterated input {} holds {}, not a list",
                    external,
                    token.message_type()
                ))
            })?;
            match count {
                None => count = Some(items.len()),
                Some(expected) if expected != items.len() => {
                    return Err(NodeError::InvalidCollection(format!(
                        "iterated inputs differ in length ({} vs {})",
                        expected,
                        items.len()
                    )));
                }
                Some(_) => {}
            }
        }

        let continuation = ctx.defer();
        let iterating = count.is_some();
        let count = count.unwrap_or(1);
        {
            let mut run = self.run.lock();
            *run = RunState {
                phase: IterationPhase::Iterating,
                index: 0,
                count,
                iterating,
                inputs,
                results: HashMap::new(),
                continuation: Some(continuation),
            };
        }
        debug!("[{}] Activated with {} elements", self.id, count);

        if count == 0 {
            self.finish_subgraph();
        } else {
            self.run_iterations();
        }
        Ok(())
    }

    /// Send elements until one has to wait for the internal graph
    fn run_iterations(&self) {
        loop {
            self.send_current_iteration();
            match self.complete_iteration() {
                Advance::Pending => return,
                Advance::Next => {}
                Advance::Done => {
                    self.finish_subgraph();
                    return;
                }
            }
        }
    }

    fn send_current_iteration(&self) {
        let iterated = self.iterated.lock().clone();
        let mappings = self.inputs();
        let (index, messages) = {
            let mut run = self.run.lock();
            run.phase = IterationPhase::SendIteration;
            let index = run.index;
            let messages: Vec<(ConnectorId, Token)> = mappings
                .iter()
                .filter_map(|mapping| {
                    let token = run.inputs.get(&mapping.external)?;
                    if iterated.contains(&mapping.external) {
                        let item = token.items()?.get(index)?.clone();
                        Some((mapping.internal, item))
                    } else if index == 0 {
                        Some((mapping.internal, token.clone()))
                    } else {
                        None
                    }
                })
                .collect();
            (index, messages)
        };

        self.activations.fetch_add(1, Ordering::Relaxed);
        if let Some(watchdog) = self.watchdog.lock().as_ref() {
            watchdog.start_operation_with(&format!("element {}", index));
        }
        for (internal, token) in messages {
            if let Some(relay) = self.relay(internal) {
                relay.stage(token);
            }
        }
        self.relay_out.send_messages();

        let mut run = self.run.lock();
        if run.phase == IterationPhase::SendIteration {
            run.phase = IterationPhase::WaitProcessed;
        }
    }

    /// Messages on output relays were taken, or loop straight back into
    /// this subgraph's own input relays
    fn relay_outputs_drained(&self) -> bool {
        self.relay_out
            .connectors()
            .iter()
            .filter(|relay| relay.kind() == ConnectorKind::Output)
            .flat_map(|relay| relay.connections())
            .filter(|connection| connection.is_active())
            .all(|connection| {
                connection.is_ready_to_receive()
                    || connection.sink().is_some_and(|sink| sink.owner() == self.id)
            })
    }

    /// Advance when the current element has drained through the graph
    fn try_finish_iteration(&self) {
        match self.complete_iteration() {
            Advance::Pending => {}
            Advance::Next => self.run_iterations(),
            Advance::Done => self.finish_subgraph(),
        }
    }

    /// Claim the current element if it has drained and collect its results
    fn complete_iteration(&self) -> Advance {
        if !self.is_live() {
            return Advance::Pending;
        }
        let internal = self.graph.node_handles();
        let index = {
            let mut run = self.run.lock();
            if run.phase != IterationPhase::WaitProcessed
                || !self.relay_in.connected_inputs_ready()
                || !self.relay_outputs_drained()
                || internal.iter().any(|node| node.has_pending_work())
            {
                return Advance::Pending;
            }
            run.phase = IterationPhase::Iterating;
            run.index
        };

        let collected = self.relay_in.collect_messages();
        self.relay_in.notify_messages_processed();
        {
            let ports = self.ports.read();
            let mut run = self.run.lock();
            for (internal, token) in collected {
                if let Some(external) = ports.external_for(internal) {
                    run.results.entry(external).or_default().push(token);
                }
            }
        }

        self.drains.fetch_add(1, Ordering::Relaxed);
        if let Some(watchdog) = self.watchdog.lock().as_ref() {
            watchdog.finish_operation();
        }
        debug!("[{}] Element {} drained", self.id, index);
        self.drained.publish(&index);

        let mut run = self.run.lock();
        run.index += 1;
        if run.index < run.count {
            Advance::Next
        } else {
            Advance::Done
        }
    }

    /// Send the collected results and complete the deferred cycle
    fn finish_subgraph(&self) {
        let (continuation, outputs, count) = {
            let ports = self.ports.read();
            let mut run = self.run.lock();
            run.phase = IterationPhase::Finished;

            let mut outputs: Outputs = Vec::new();
            for mapping in &ports.outputs {
                let results = run.results.remove(&mapping.external).unwrap_or_default();
                if run.iterating {
                    let element_type = ports
                        .relays
                        .get(&mapping.internal)
                        .map(|relay| relay.message_type())
                        .unwrap_or_default();
                    outputs.push((mapping.external, Token::list(element_type, results)));
                } else if let Some(last) = results.into_iter().last() {
                    outputs.push((mapping.external, last));
                }
            }

            let count = run.count;
            let continuation = run.continuation.take();
            *run = RunState::default();
            (continuation, outputs, count)
        };

        info!("[{}] Subgraph finished after {} elements", self.id, count);
        match continuation {
            Some(continuation) => continuation.finish(outputs),
            None => warn!("[{}] Finished without a pending activation", self.id),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Slots and events
    // ────────────────────────────────────────────────────────────────────

    /// Pass a message from a forwarding slot to its internal event relay
    pub fn forward_slot(&self, slot: ConnectorId, token: Token) -> Result<(), StructuralError> {
        let relay = {
            let ports = self.ports.read();
            ports
                .slots
                .iter()
                .find(|mapping| mapping.external == slot)
                .and_then(|mapping| ports.relays.get(&mapping.internal).cloned())
                .ok_or(StructuralError::NotForwarding(slot))?
        };
        relay.stage(token);
        self.relay_out.send_events();
        Ok(())
    }

    fn forward_event(&self, relay: &Connector) {
        let Some(token) = relay.take_message() else {
            return;
        };
        relay.release_connections();
        let external = self.ports.read().external_for(relay.id());
        match (external, self.handle()) {
            (Some(external), Some(handle)) => {
                if let Err(e) = handle.trigger_event(external, token) {
                    warn!("[{}] Event forwarding failed: {}", self.id, e);
                }
            }
            _ => warn!("[{}] Dropping event from unmapped relay {}", self.id, relay.id()),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ────────────────────────────────────────────────────────────────────

    /// Abandon any activation and clear the internal graph's messages
    pub fn reset(&self) {
        *self.run.lock() = RunState::default();
        self.relay_in.reset();
        self.relay_out.reset();
        self.graph.reset_activity();
    }

    /// Mark dead; late callbacks are ignored from here on
    pub fn tear_down(&self) {
        if self.guard.swap(GUARD_DEAD, Ordering::AcqRel) != GUARD_LIVE {
            return;
        }
        *self.run.lock() = RunState::default();
        self.graph.clear();
        debug!("[{}] Subgraph torn down", self.id);
    }
}

impl ConnectorListener for SubgraphNode {
    fn message_arrived(&self, connector: &Connector) {
        if !self.is_live() {
            return;
        }
        match connector.kind() {
            ConnectorKind::Slot => self.forward_event(connector),
            _ => self.try_finish_iteration(),
        }
    }

    fn connection_released(&self, _connector: &Connector) {
        self.try_finish_iteration();
    }

    fn connections_changed(&self, _connector: &Connector) {
        self.try_finish_iteration();
    }

    fn enabled_changed(&self, _connector: &Connector) {
        self.try_finish_iteration();
    }
}

impl fmt::Debug for SubgraphNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SubgraphNode")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("nodes", &self.graph.count_nodes())
            .finish()
    }
}

/// Node contract of a subgraph; all work is delegated to [`SubgraphNode`]
struct SubgraphProcess {
    subgraph: Weak<SubgraphNode>,
}

impl SubgraphProcess {
    fn subgraph(&self) -> NodeResult<Arc<SubgraphNode>> {
        self.subgraph
            .upgrade()
            .ok_or_else(|| NodeError::Process("subgraph dropped".to_string()))
    }
}

impl Node for SubgraphProcess {
    fn setup(&mut self, _modifier: &mut NodeModifier) -> NodeResult<()> {
        Ok(())
    }

    fn can_process(&self) -> bool {
        self.subgraph
            .upgrade()
            .is_some_and(|subgraph| subgraph.is_live() && subgraph.is_idle())
    }

    fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()> {
        self.subgraph()?.activate(ctx)
    }

    fn on_slot(&mut self, slot: ConnectorId, token: &Token, _ctx: &mut ProcessContext) -> NodeResult<()> {
        self.subgraph()?.forward_slot(slot, token.clone())?;
        Ok(())
    }

    fn tear_down(&mut self) {
        if let Some(subgraph) = self.subgraph.upgrade() {
            subgraph.tear_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{ExportLog, MapNode};
    use crate::runtime::connection::Connection;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::with_builtin_types())
    }

    fn int() -> MessageType {
        MessageType::named("int")
    }

    fn ints(values: &[i64]) -> Token {
        Token::list(int(), values.iter().map(|v| Token::new(int(), *v)).collect())
    }

    /// Raw connector wired to an external port of `handle`
    fn attach(
        handle: &NodeHandle,
        external: ConnectorId,
        kind: ConnectorKind,
        registry: &TypeRegistry,
    ) -> (Arc<Connector>, Arc<Connection>) {
        let peer = Arc::new(Connector::new(NodeId::new(), kind, "peer", MessageType::any()));
        let port = handle.connector(external).unwrap();
        let connection = Connection::connect(&peer, &port, registry).unwrap();
        (peer, connection)
    }

    /// Subgraph whose iterated input relay loops straight to its output relay
    fn looped() -> (Arc<NodeHandle>, Arc<SubgraphNode>, RelayMapping, RelayMapping) {
        let handle = SubgraphNode::create_handle(NodeId::new(), registry()).unwrap();
        let subgraph = handle.subgraph().unwrap();
        let input = subgraph
            .add_forwarding_input("items", MessageType::list_of(int()))
            .unwrap();
        let output = subgraph.add_forwarding_output("doubled", int()).unwrap();
        subgraph.set_iteration_enabled(input.external, true).unwrap();
        subgraph.graph().connect(input.internal, output.internal).unwrap();
        (handle, subgraph, input, output)
    }

    /// Add `node` to the internal graph of `subgraph`
    fn internal(subgraph: &SubgraphNode, node: impl Node + 'static, type_name: &str) -> Arc<NodeHandle> {
        let handle = NodeHandle::new(NodeId::new(), type_name, Box::new(node)).unwrap();
        subgraph.graph().add_node(Arc::clone(&handle)).unwrap();
        handle
    }

    fn port(handle: &NodeHandle, label: &str) -> ConnectorId {
        handle.connector_by_label(label).unwrap().id()
    }

    /// Iterated `items` -> increment -> `result`, with a logging tap on the
    /// increment's output
    fn tapped_chain() -> (
        Arc<NodeHandle>,
        Arc<SubgraphNode>,
        RelayMapping,
        RelayMapping,
        Arc<NodeHandle>,
        Arc<NodeHandle>,
        crossbeam_channel::Receiver<Token>,
    ) {
        let handle = SubgraphNode::create_handle(NodeId::new(), registry()).unwrap();
        let subgraph = handle.subgraph().unwrap();
        let input = subgraph
            .add_forwarding_input("items", MessageType::list_of(int()))
            .unwrap();
        let output = subgraph.add_forwarding_output("result", int()).unwrap();
        subgraph.set_iteration_enabled(input.external, true).unwrap();

        let increment = internal(&subgraph, MapNode::int(|v| v + 1), "map");
        let (log, rx) = ExportLog::channel();
        let tap = internal(&subgraph, log, "export_log");
        let graph = subgraph.graph();
        graph.connect(input.internal, port(&increment, "in")).unwrap();
        graph.connect(port(&increment, "out"), output.internal).unwrap();
        graph.connect(port(&increment, "out"), port(&tap, "in")).unwrap();
        (handle, subgraph, input, output, increment, tap, rx)
    }

    #[test]
    fn test_forwarding_ports_have_relays() {
        let (handle, subgraph, input, output) = looped();
        assert_eq!(handle.inputs().len(), 1);
        assert_eq!(handle.outputs().len(), 1);

        let relay = subgraph.relay_for(input.external).unwrap();
        assert_eq!(relay.kind(), ConnectorKind::Output);
        assert_eq!(relay.owner(), subgraph.id());
        assert!(relay.is_virtual() && relay.is_graph_port());
        assert_eq!(relay.message_type(), int());
        assert_eq!(subgraph.relay(output.internal).unwrap().kind(), ConnectorKind::Input);
        assert_eq!(subgraph.graph().count_connections(), 1);

        subgraph.set_iteration_enabled(input.external, false).unwrap();
        assert_eq!(relay.message_type(), MessageType::list_of(int()));
        assert!(matches!(
            subgraph.set_iteration_enabled(output.external, true),
            Err(StructuralError::NotForwarding(_))
        ));
    }

    #[test]
    fn test_iteration_runs_once_per_element() {
        let registry = registry();
        let (handle, subgraph, input, output) = looped();
        let (feed, feed_connection) = attach(&handle, input.external, ConnectorKind::Output, &registry);
        let (sink, _) = attach(&handle, output.external, ConnectorKind::Input, &registry);
        let drained = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&drained);
        subgraph.drained().subscribe(move |index| seen.lock().push(*index));

        assert!(feed_connection.try_send(ints(&[1, 2, 3, 4])));
        assert!(handle.execute().unwrap());

        assert_eq!(subgraph.activation_count(), 4);
        assert_eq!(subgraph.drain_count(), 4);
        assert_eq!(*drained.lock(), vec![0, 1, 2, 3]);
        assert!(subgraph.is_idle());
        assert!(!handle.is_processing());

        let result = sink.peek().unwrap();
        let values: Vec<i64> = result
            .items()
            .unwrap()
            .iter()
            .map(|t| *t.get::<i64>().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
        // the external input was consumed and its connection released
        assert!(feed_connection.is_ready_to_receive());
        assert!(!feed.has_staged());
    }

    #[test]
    fn test_empty_collection_finishes_immediately() {
        let registry = registry();
        let (handle, subgraph, input, output) = looped();
        let (_feed, feed_connection) = attach(&handle, input.external, ConnectorKind::Output, &registry);
        let (sink, _) = attach(&handle, output.external, ConnectorKind::Input, &registry);

        assert!(feed_connection.try_send(ints(&[])));
        assert!(handle.execute().unwrap());
        assert_eq!(subgraph.activation_count(), 0);
        assert!(subgraph.is_idle());
        assert_eq!(sink.peek().unwrap().items().unwrap().len(), 0);
    }

    #[test]
    fn test_mismatched_collections_rejected() {
        let registry = registry();
        let (handle, subgraph, first, _) = looped();
        let second = subgraph
            .add_forwarding_input("more", MessageType::list_of(int()))
            .unwrap();
        subgraph.set_iteration_enabled(second.external, true).unwrap();
        let (_a, to_first) = attach(&handle, first.external, ConnectorKind::Output, &registry);
        let (_b, to_second) = attach(&handle, second.external, ConnectorKind::Output, &registry);

        assert!(to_first.try_send(ints(&[1, 2])));
        assert!(to_second.try_send(ints(&[1, 2, 3])));
        let result = handle.execute();
        assert!(matches!(result, Err(NodeError::InvalidCollection(_))));
        assert_eq!(subgraph.activation_count(), 0);
        assert!(subgraph.is_idle());
        assert!(!handle.is_processing());
    }

    #[test]
    fn test_slots_and_events_are_forwarded() {
        let registry = registry();
        let handle = SubgraphNode::create_handle(NodeId::new(), Arc::clone(&registry)).unwrap();
        let subgraph = handle.subgraph().unwrap();
        let slot = subgraph.add_forwarding_slot("trigger", MessageType::any()).unwrap();
        let event = subgraph.add_forwarding_event("done", MessageType::any()).unwrap();
        subgraph.graph().connect(slot.internal, event.internal).unwrap();
        let (sink, _) = attach(&handle, event.external, ConnectorKind::Slot, &registry);

        subgraph
            .forward_slot(slot.external, Token::new(int(), 7_i64))
            .unwrap();
        assert_eq!(sink.peek().unwrap().get::<i64>(), Some(&7));
        assert!(matches!(
            subgraph.forward_slot(event.external, Token::empty(int())),
            Err(StructuralError::NotForwarding(_))
        ));
    }

    #[test]
    fn test_remove_forwarding_severs_relay() {
        let (handle, subgraph, input, _) = looped();
        subgraph.remove_forwarding(input.external).unwrap();
        assert!(handle.connector(input.external).is_none());
        assert!(subgraph.relay(input.internal).is_none());
        assert_eq!(subgraph.graph().count_connections(), 0);
        assert!(matches!(
            subgraph.remove_forwarding(input.external),
            Err(StructuralError::NotForwarding(_))
        ));
    }

    #[test]
    fn test_torn_down_subgraph_ignores_messages() {
        let registry = registry();
        let (handle, subgraph, input, _) = looped();
        let (_feed, feed_connection) = attach(&handle, input.external, ConnectorKind::Output, &registry);
        handle.tear_down();

        assert!(feed_connection.try_send(ints(&[1])));
        assert!(!handle.can_execute());
        assert_eq!(subgraph.activation_count(), 0);
    }

    #[test]
    fn test_long_collection_iterates_in_a_loop() {
        const LEN: i64 = 100_000;
        let registry = registry();
        let (handle, subgraph, input, output) = looped();
        let (_feed, feed_connection) = attach(&handle, input.external, ConnectorKind::Output, &registry);
        let (sink, _) = attach(&handle, output.external, ConnectorKind::Input, &registry);

        let values: Vec<i64> = (0..LEN).collect();
        assert!(feed_connection.try_send(ints(&values)));
        assert!(handle.execute().unwrap());

        assert_eq!(subgraph.activation_count(), LEN as u64);
        assert_eq!(subgraph.drain_count(), LEN as u64);
        assert!(subgraph.is_idle());
        let result = sink.peek().unwrap();
        let items = result.items().unwrap();
        assert_eq!(items.len(), LEN as usize);
        assert_eq!(items.last().and_then(|t| t.get::<i64>()), Some(&(LEN - 1)));
    }

    #[test]
    fn test_unwired_subgraph_drains_every_element() {
        let registry = registry();
        let handle = SubgraphNode::create_handle(NodeId::new(), Arc::clone(&registry)).unwrap();
        let subgraph = handle.subgraph().unwrap();
        let input = subgraph
            .add_forwarding_input("items", MessageType::list_of(int()))
            .unwrap();
        subgraph.set_iteration_enabled(input.external, true).unwrap();
        let (_feed, feed_connection) = attach(&handle, input.external, ConnectorKind::Output, &registry);

        let values: Vec<i64> = (0..20_000).collect();
        assert!(feed_connection.try_send(ints(&values)));
        assert!(handle.execute().unwrap());
        assert_eq!(subgraph.drain_count(), 20_000);
        assert!(subgraph.is_idle());
        assert!(feed_connection.is_ready_to_receive());
    }

    #[test]
    fn test_element_waits_for_every_internal_node() {
        let registry = registry();
        let (handle, subgraph, input, output, increment, tap, rx) = tapped_chain();
        let (_feed, feed_connection) = attach(&handle, input.external, ConnectorKind::Output, &registry);
        let (sink, _) = attach(&handle, output.external, ConnectorKind::Input, &registry);

        assert!(feed_connection.try_send(ints(&[1, 2, 3])));
        assert!(handle.execute().unwrap());
        for element in 0..3_u64 {
            assert_eq!(subgraph.activation_count(), element + 1);
            assert!(increment.execute().unwrap());
            // the result reached its relay but the tap has not run yet
            assert_eq!(subgraph.drain_count(), element);
            assert_eq!(subgraph.phase(), IterationPhase::WaitProcessed);

            assert!(tap.execute().unwrap());
            assert_eq!(subgraph.drain_count(), element + 1);
            let logged = rx.try_recv().unwrap();
            assert_eq!(logged.get::<i64>(), Some(&(element as i64 + 2)));
        }

        assert!(subgraph.is_idle());
        let result = sink.peek().unwrap();
        let values: Vec<i64> = result
            .items()
            .unwrap()
            .iter()
            .map(|t| *t.get::<i64>().unwrap())
            .collect();
        assert_eq!(values, vec![2, 3, 4]);
    }

    #[test]
    fn test_torn_down_mid_iteration_ignores_late_callbacks() {
        let registry = registry();
        let (handle, subgraph, input, output, _increment, _tap, _rx) = tapped_chain();
        let (_feed, feed_connection) = attach(&handle, input.external, ConnectorKind::Output, &registry);
        let drained = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&drained);
        subgraph.drained().subscribe(move |index| seen.lock().push(*index));

        assert!(feed_connection.try_send(ints(&[1, 2])));
        assert!(handle.execute().unwrap());
        assert_eq!(subgraph.phase(), IterationPhase::WaitProcessed);

        let result_relay = subgraph.relay(output.internal).unwrap();
        handle.tear_down();
        assert_eq!(subgraph.graph().count_nodes(), 0);

        subgraph.message_arrived(&result_relay);
        subgraph.connection_released(&result_relay);
        subgraph.connections_changed(&result_relay);
        assert_eq!(subgraph.activation_count(), 1);
        assert_eq!(subgraph.drain_count(), 0);
        assert!(drained.lock().is_empty());
        assert!(subgraph.is_idle());
    }

    #[test]
    fn test_plain_input_forwarded_once_per_activation() {
        let registry = registry();
        let (handle, subgraph, input, output) = looped();
        let offset = subgraph.add_forwarding_input("offset", int()).unwrap();
        let (log, rx) = ExportLog::channel();
        let tap = internal(&subgraph, log, "export_log");
        subgraph
            .graph()
            .connect(offset.internal, port(&tap, "in"))
            .unwrap();
        let (_a, to_items) = attach(&handle, input.external, ConnectorKind::Output, &registry);
        let (_b, to_offset) = attach(&handle, offset.external, ConnectorKind::Output, &registry);
        let (sink, _) = attach(&handle, output.external, ConnectorKind::Input, &registry);

        assert!(to_items.try_send(ints(&[1, 2, 3])));
        assert!(to_offset.try_send(Token::new(int(), 10_i64)));
        assert!(handle.execute().unwrap());
        // the first element waits until the tap took the offset
        assert_eq!(subgraph.drain_count(), 0);

        assert!(tap.execute().unwrap());
        assert_eq!(subgraph.drain_count(), 3);
        assert!(subgraph.is_idle());
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(sink.peek().unwrap().items().unwrap().len(), 3);
        assert!(to_offset.is_ready_to_receive());
    }
}
