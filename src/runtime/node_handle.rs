//! Runtime wrapper around a node
//!
//! A [`NodeHandle`] owns a node's connectors, its input and output
//! transitions and its persisted state. It runs one process cycle at a
//! time and reports readiness changes through its event buses; it never
//! schedules itself. That is the node runner's job.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use super::connector::{Connector, ConnectorEvent, ConnectorKind, ConnectorListener};
use super::errors::{NodeError, NodeResult, StructuralError};
use super::ids::{ConnectorId, NodeId};
use super::node::{Node, NodeModifier, Outputs, ProcessContext};
use super::node_state::{ErrorState, NodeState, Point};
use super::notification::Notification;
use super::scheduler::describe_panic;
use super::signal::EventBus;
use super::subgraph::SubgraphNode;
use super::thread_pool::GroupId;
use super::token::Token;
use super::transition::{InputTransition, OutputTransition};
use super::type_registry::MessageType;

/// Event buses of one node
#[derive(Default)]
pub struct NodeEvents {
    /// The node may be able to run now
    pub try_process: EventBus<()>,
    /// Parameters changed and must be re-validated before the next cycle
    pub parameters_changed: EventBus<()>,
    pub enabled_changed: EventBus<bool>,
    pub state_changed: EventBus<NodeState>,
    /// A message arrived on the given slot
    pub slot_triggered: EventBus<ConnectorId>,
    pub connectors: EventBus<ConnectorEvent>,
    pub notifications: EventBus<Notification>,
}

pub struct NodeHandle {
    id: NodeId,
    type_name: String,
    self_ref: Weak<NodeHandle>,
    node: Mutex<Box<dyn Node>>,
    subgraph: Option<Arc<SubgraphNode>>,
    connectors: RwLock<Vec<Arc<Connector>>>,
    input_transition: InputTransition,
    output_transition: OutputTransition,
    state: Mutex<NodeState>,
    error: Mutex<Option<ErrorState>>,
    processing: AtomicBool,
    cycle: AtomicU64,
    pending_cycle: Mutex<Option<u64>>,
    events: NodeEvents,
}

impl NodeHandle {
    /// Wrap `node` and run its setup
    pub fn new(id: NodeId, type_name: &str, node: Box<dyn Node>) -> NodeResult<Arc<Self>> {
        Self::build(id, type_name, node, None)
    }

    pub(crate) fn build(
        id: NodeId,
        type_name: &str,
        node: Box<dyn Node>,
        subgraph: Option<Arc<SubgraphNode>>,
    ) -> NodeResult<Arc<Self>> {
        let handle = Arc::new_cyclic(|self_ref| Self {
            id,
            type_name: type_name.to_string(),
            self_ref: self_ref.clone(),
            node: Mutex::new(node),
            subgraph,
            connectors: RwLock::new(Vec::new()),
            input_transition: InputTransition::new(),
            output_transition: OutputTransition::new(),
            state: Mutex::new(NodeState::new(type_name)),
            error: Mutex::new(None),
            processing: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            pending_cycle: Mutex::new(None),
            events: NodeEvents::default(),
        });

        {
            let mut node = handle.node.lock();
            let mut modifier = NodeModifier::new(&handle);
            node.setup(&mut modifier)?;
        }

        debug!(
            "[{}] Created {} with {} connectors",
            id,
            type_name,
            handle.connectors.read().len()
        );
        Ok(handle)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn events(&self) -> &NodeEvents {
        &self.events
    }

    /// The wrapped subgraph, if this node is one
    pub fn subgraph(&self) -> Option<Arc<SubgraphNode>> {
        self.subgraph.clone()
    }

    pub fn is_subgraph(&self) -> bool {
        self.subgraph.is_some()
    }

    pub fn input_transition(&self) -> &InputTransition {
        &self.input_transition
    }

    pub fn output_transition(&self) -> &OutputTransition {
        &self.output_transition
    }

    // ────────────────────────────────────────────────────────────────────
    // Connectors
    // ────────────────────────────────────────────────────────────────────

    /// Create a connector owned by this node (fixed or variadic)
    pub fn add_connector(
        &self,
        kind: ConnectorKind,
        label: &str,
        message_type: MessageType,
        optional: bool,
    ) -> Arc<Connector> {
        let connector = Arc::new(Connector::new(self.id, kind, label, message_type));
        connector.set_optional(optional);
        let listener: Weak<dyn ConnectorListener> = self.self_ref.clone();
        connector.set_listener(listener);

        self.connectors.write().push(Arc::clone(&connector));
        if kind.can_input() {
            self.input_transition.add_connector(Arc::clone(&connector));
        } else {
            self.output_transition.add_connector(Arc::clone(&connector));
        }

        self.events
            .connectors
            .publish(&ConnectorEvent::Created(Arc::clone(&connector)));
        connector
    }

    /// Remove a connector.
    ///
    /// Connector-removed is published first so the owning graph can sever
    /// the connections attached to it.
    pub fn remove_connector(&self, id: ConnectorId) -> Result<Arc<Connector>, StructuralError> {
        let connector = self
            .connector(id)
            .ok_or(StructuralError::ConnectorNotFound(id))?;

        self.events
            .connectors
            .publish(&ConnectorEvent::Removed(Arc::clone(&connector)));
        for connection in connector.connections() {
            connection.detach();
        }

        self.connectors.write().retain(|c| c.id() != id);
        self.input_transition.remove_connector(id);
        self.output_transition.remove_connector(id);
        self.input_transition.update();
        Ok(connector)
    }

    pub fn connector(&self, id: ConnectorId) -> Option<Arc<Connector>> {
        self.connectors.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn connector_by_label(&self, label: &str) -> Option<Arc<Connector>> {
        self.connectors
            .read()
            .iter()
            .find(|c| c.label() == label)
            .cloned()
    }

    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.read().clone()
    }

    fn connectors_of(&self, kind: ConnectorKind) -> Vec<Arc<Connector>> {
        self.connectors
            .read()
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn inputs(&self) -> Vec<Arc<Connector>> {
        self.connectors_of(ConnectorKind::Input)
    }

    pub fn outputs(&self) -> Vec<Arc<Connector>> {
        self.connectors_of(ConnectorKind::Output)
    }

    pub fn slots(&self) -> Vec<Arc<Connector>> {
        self.connectors_of(ConnectorKind::Slot)
    }

    pub fn event_connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors_of(ConnectorKind::Event)
    }

    /// No input receives data through an active connection
    pub fn is_source(&self) -> bool {
        !self
            .connectors
            .read()
            .iter()
            .any(|c| c.kind() == ConnectorKind::Input && c.has_active_connection())
    }

    pub fn is_sink(&self) -> bool {
        self.output_transition.is_sink()
    }

    // ────────────────────────────────────────────────────────────────────
    // State
    // ────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> NodeState {
        self.state.lock().clone()
    }

    /// Modify the persisted state and publish the result
    pub fn update_state(&self, update: impl FnOnce(&mut NodeState)) {
        let snapshot = {
            let mut state = self.state.lock();
            update(&mut state);
            state.clone()
        };
        self.events.state_changed.publish(&snapshot);
    }

    /// Replace the persisted state, e.g. when restoring a saved graph
    pub fn set_state(&self, state: NodeState) {
        let enabled = state.enabled;
        let was_enabled = self.is_enabled();
        self.update_state(|current| *current = state);
        if enabled != was_enabled {
            self.events.enabled_changed.publish(&enabled);
        }
    }

    pub fn label(&self) -> String {
        self.state.lock().label.clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        let label = label.into();
        self.update_state(|state| state.label = label);
    }

    pub fn set_position(&self, position: Point) {
        self.update_state(|state| state.position = position);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.is_enabled() == enabled {
            return;
        }
        self.update_state(|state| state.enabled = enabled);
        self.events.enabled_changed.publish(&enabled);
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// A muted node consumes its inputs but skips `process` and produces nothing
    pub fn set_muted(&self, muted: bool) {
        self.update_state(|state| state.muted = muted);
    }

    pub fn max_frequency(&self) -> f64 {
        self.state.lock().max_frequency
    }

    pub fn set_max_frequency(&self, frequency: f64) {
        self.update_state(|state| state.max_frequency = frequency.max(0.0));
    }

    pub fn thread_group(&self) -> Option<GroupId> {
        self.state.lock().thread_group
    }

    pub fn set_thread_group(&self, group: Option<GroupId>) {
        if self.thread_group() != group {
            self.update_state(|state| state.thread_group = group);
        }
    }

    pub fn error(&self) -> Option<ErrorState> {
        self.error.lock().clone()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Record an error state and surface it as a notification
    pub fn set_error(&self, state: ErrorState) {
        *self.error.lock() = Some(state.clone());
        self.events.notifications.publish(&Notification::from_node(
            self.id,
            state.message,
            state.level,
        ));
    }

    pub fn clear_error(&self) {
        *self.error.lock() = None;
    }

    pub(crate) fn record_error(&self, error: &NodeError) {
        error!("[{}] {}", self.label(), error);
        self.set_error(ErrorState::error(error.to_string()));
    }

    /// Ask for parameter re-validation before the next cycle
    pub fn notify_parameters_changed(&self) {
        self.events.parameters_changed.publish(&());
    }

    // ────────────────────────────────────────────────────────────────────
    // Execution
    // ────────────────────────────────────────────────────────────────────

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    fn ports_ready(&self) -> bool {
        self.is_enabled()
            && self.input_transition.is_ready()
            && self.output_transition.can_start_sending_messages()
    }

    /// Enabled, idle, inputs ready and outputs free.
    ///
    /// While another thread holds the node (slot handler, parameter check)
    /// the node's own condition is taken as met; [`execute`](Self::execute)
    /// checks it again under the lock.
    pub fn can_execute(&self) -> bool {
        if self.is_processing() || !self.ports_ready() {
            return false;
        }
        match self.node.try_lock() {
            Some(node) => node.can_process(),
            None => true,
        }
    }

    /// Mid-cycle, or holding inputs it is about to process
    pub fn has_pending_work(&self) -> bool {
        self.is_processing()
            || (!self.is_source() && self.is_enabled() && self.input_transition.is_ready())
    }

    /// Run one process cycle.
    ///
    /// Returns Ok(false) if the node was not able to run. Errors and panics
    /// from `process` end the cycle without outputs and are returned to the
    /// caller; inputs are consumed either way.
    pub fn execute(&self) -> NodeResult<bool> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        if !(self.ports_ready() && self.node.lock().can_process()) {
            self.processing.store(false, Ordering::Release);
            return Ok(false);
        }

        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        *self.pending_cycle.lock() = Some(cycle);
        let inputs = self.input_transition.collect_messages();

        if self.is_muted() {
            debug!("[{}] Muted, skipping process", self.id);
            self.finish_processing(cycle, Vec::new());
            return Ok(true);
        }

        let mut ctx = ProcessContext::new(self.id, inputs, self.self_ref.clone(), cycle);
        let outcome = {
            let mut node = self.node.lock();
            panic::catch_unwind(AssertUnwindSafe(|| node.process(&mut ctx)))
        };
        let result = outcome
            .unwrap_or_else(|payload| Err(NodeError::Panicked(describe_panic(payload.as_ref()))));

        match result {
            Ok(()) if ctx.is_deferred() => Ok(true),
            Ok(()) => {
                self.finish_processing(cycle, ctx.into_outputs());
                Ok(true)
            }
            Err(error) => {
                self.finish_processing(cycle, Vec::new());
                Err(error)
            }
        }
    }

    /// End cycle `cycle`: send outputs, consume inputs, become idle.
    ///
    /// Completions for any other cycle are stale and ignored.
    pub(crate) fn finish_processing(&self, cycle: u64, outputs: Outputs) {
        {
            let mut pending = self.pending_cycle.lock();
            if *pending != Some(cycle) {
                warn!("[{}] Ignoring completion of stale cycle {}", self.id, cycle);
                return;
            }
            *pending = None;
        }

        for (id, token) in outputs {
            match self.connector(id) {
                Some(connector) if connector.kind().can_output() => connector.stage(token),
                _ => warn!("[{}] Dropping message for unknown output {}", self.id, id),
            }
        }

        self.output_transition.send_messages();
        self.input_transition.notify_messages_processed();
        self.processing.store(false, Ordering::Release);
        self.events.try_process.publish(&());
    }

    /// Run the slot handler for a message waiting on `slot`
    pub fn handle_slot(&self, slot: ConnectorId) -> NodeResult<()> {
        let connector = self
            .connector(slot)
            .filter(|c| c.kind() == ConnectorKind::Slot)
            .ok_or(StructuralError::ConnectorNotFound(slot))?;
        let Some(token) = connector.take_message() else {
            return Ok(());
        };
        connector.release_connections();

        let mut ctx = ProcessContext::new(self.id, Vec::new(), self.self_ref.clone(), 0);
        let outcome = {
            let mut node = self.node.lock();
            panic::catch_unwind(AssertUnwindSafe(|| node.on_slot(slot, &token, &mut ctx)))
        };
        let result = outcome
            .unwrap_or_else(|payload| Err(NodeError::Panicked(describe_panic(payload.as_ref()))));

        for (id, token) in ctx.into_outputs() {
            match self.connector(id) {
                Some(event) if event.kind() == ConnectorKind::Event => event.stage(token),
                _ => warn!("[{}] Slot handlers may only trigger events", self.id),
            }
        }
        self.output_transition.send_events();
        result
    }

    /// Emit a message on an event connector right away
    pub fn trigger_event(&self, event: ConnectorId, token: Token) -> Result<(), StructuralError> {
        let connector = self
            .connector(event)
            .filter(|c| c.kind() == ConnectorKind::Event)
            .ok_or(StructuralError::ConnectorNotFound(event))?;
        connector.stage(token);
        self.output_transition.send_events();
        Ok(())
    }

    pub fn check_parameters(&self) -> NodeResult<()> {
        self.node.lock().check_parameters()
    }

    /// Drop all buffered messages and in-flight state
    pub fn reset(&self) {
        self.node.lock().reset();
        self.input_transition.reset();
        self.output_transition.reset();
        *self.pending_cycle.lock() = None;
        self.processing.store(false, Ordering::Release);
        self.clear_error();
    }

    pub fn tear_down(&self) {
        debug!("[{}] Tear down", self.id);
        self.node.lock().tear_down();
    }

    /// Number of process cycles started
    pub fn cycle_count(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }
}

impl ConnectorListener for NodeHandle {
    fn message_arrived(&self, connector: &Connector) {
        if connector.kind() == ConnectorKind::Slot {
            self.events.slot_triggered.publish(&connector.id());
        } else if self.input_transition.update() {
            self.events.try_process.publish(&());
        }
    }

    fn connection_released(&self, _connector: &Connector) {
        self.events.try_process.publish(&());
    }

    fn connections_changed(&self, _connector: &Connector) {
        self.input_transition.update();
        self.events.try_process.publish(&());
    }

    fn enabled_changed(&self, _connector: &Connector) {
        self.input_transition.update();
        self.events.try_process.publish(&());
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("connectors", &self.connectors.read().len())
            .field("processing", &self.is_processing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::Connection;
    use crate::runtime::node_state::ErrorLevel;
    use crate::runtime::type_registry::TypeRegistry;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn int() -> MessageType {
        MessageType::named("int")
    }

    /// Adds one to every input value
    struct Increment {
        input: Option<ConnectorId>,
        output: Option<ConnectorId>,
    }

    impl Node for Increment {
        fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()> {
            self.input = Some(modifier.add_input("in", int()));
            self.output = Some(modifier.add_output("out", int()));
            Ok(())
        }

        fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()> {
            let (Some(input), Some(output)) = (self.input, self.output) else {
                return Err(NodeError::Setup("ports missing".into()));
            };
            let value = *ctx.input_value::<i64>(input)?;
            if value < 0 {
                return Err(NodeError::Process("negative".into()));
            }
            ctx.set_output(output, Token::new(int(), value + 1));
            Ok(())
        }
    }

    fn increment() -> Arc<NodeHandle> {
        NodeHandle::new(
            NodeId::new(),
            "increment",
            Box::new(Increment {
                input: None,
                output: None,
            }),
        )
        .unwrap()
    }

    /// Feeds `node`'s input from a free-standing output connector
    fn feed(node: &NodeHandle) -> (Arc<Connector>, Arc<Connection>) {
        let registry = TypeRegistry::with_builtin_types();
        let source = Arc::new(Connector::new(NodeId::new(), ConnectorKind::Output, "src", int()));
        let input = node.inputs().remove(0);
        let connection = Connection::connect(&source, &input, &registry).unwrap();
        (source, connection)
    }

    #[test]
    fn test_setup_declares_ports() {
        let node = increment();
        assert_eq!(node.inputs().len(), 1);
        assert_eq!(node.outputs().len(), 1);
        assert!(node.connector_by_label("out").is_some());
        assert!(node.is_source());
    }

    #[test]
    fn test_execute_consumes_and_produces() {
        let node = increment();
        let (_source, connection) = feed(&node);
        let output = node.outputs().remove(0);
        let sink = Arc::new(Connector::new(NodeId::new(), ConnectorKind::Input, "sink", int()));
        Connection::connect(&output, &sink, &TypeRegistry::with_builtin_types()).unwrap();

        assert!(!node.can_execute());
        connection.try_send(Token::new(int(), 41i64));
        assert!(node.can_execute());

        assert!(node.execute().unwrap());
        assert_eq!(sink.peek().and_then(|t| t.get::<i64>().copied()), Some(42));
        assert!(connection.is_ready_to_receive());
        assert!(!node.is_processing());
    }

    #[test]
    fn test_held_node_lock_does_not_lose_cycle() {
        let node = increment();
        let (_source, connection) = feed(&node);
        connection.try_send(Token::new(int(), 1i64));

        let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
        let holder = {
            let node = Arc::clone(&node);
            std::thread::spawn(move || {
                let _guard = node.node.lock();
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
            })
        };
        locked_rx.recv().unwrap();

        assert!(node.can_execute());
        assert!(node.has_pending_work());
        // waits for the holder instead of declining
        assert!(node.execute().unwrap());
        holder.join().unwrap();
        assert!(connection.is_ready_to_receive());
        assert!(!node.input_transition().is_ready());
        assert_eq!(node.cycle_count(), 1);
    }

    #[test]
    fn test_pending_work_tracks_ready_inputs() {
        let node = increment();
        let (_source, connection) = feed(&node);
        assert!(!node.has_pending_work());

        connection.try_send(Token::new(int(), 1i64));
        assert!(node.has_pending_work());
        node.set_enabled(false);
        assert!(!node.has_pending_work());
        node.set_enabled(true);

        assert!(node.execute().unwrap());
        assert!(!node.has_pending_work());
    }

    #[test]
    fn test_duplicate_arrival_fires_once() {
        let node = increment();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        node.events().try_process.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (_source, connection) = feed(&node);
        let before = fired.load(Ordering::SeqCst);
        connection.try_send(Token::new(int(), 1i64));
        let input = node.inputs().remove(0);
        node.message_arrived(&input);
        node.message_arrived(&input);

        assert_eq!(fired.load(Ordering::SeqCst) - before, 1);
        assert_eq!(node.input_transition().fire_count(), 1);
    }

    #[test]
    fn test_error_is_recorded_and_inputs_consumed() {
        let node = increment();
        let (_source, connection) = feed(&node);
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notifications);
        node.events()
            .notifications
            .subscribe(move |n: &Notification| sink.lock().push(n.clone()));

        connection.try_send(Token::new(int(), -1i64));
        let error = node.execute().unwrap_err();
        node.record_error(&error);

        assert!(matches!(error, NodeError::Process(_)));
        assert_eq!(node.error().map(|e| e.level), Some(ErrorLevel::Error));
        assert_eq!(notifications.lock().len(), 1);
        assert!(connection.is_ready_to_receive());
        assert!(!node.is_processing());
    }

    #[test]
    fn test_muted_node_produces_nothing() {
        let node = increment();
        let (_source, connection) = feed(&node);
        let output = node.outputs().remove(0);
        let sink = Arc::new(Connector::new(NodeId::new(), ConnectorKind::Input, "sink", int()));
        Connection::connect(&output, &sink, &TypeRegistry::with_builtin_types()).unwrap();

        node.set_muted(true);
        connection.try_send(Token::new(int(), 1i64));
        assert!(node.execute().unwrap());
        assert!(!sink.has_message());
        assert!(connection.is_ready_to_receive());
    }

    #[test]
    fn test_disabled_node_does_not_execute() {
        let node = increment();
        let (_source, connection) = feed(&node);
        connection.try_send(Token::new(int(), 1i64));

        node.set_enabled(false);
        assert!(!node.execute().unwrap());
        node.set_enabled(true);
        assert!(node.execute().unwrap());
    }

    #[test]
    fn test_remove_variadic_connector_detaches() {
        let node = increment();
        let (source, _connection) = feed(&node);
        let input = node.inputs().remove(0);

        node.remove_connector(input.id()).unwrap();
        assert_eq!(source.count_connections(), 0);
        assert!(node.inputs().is_empty());
        assert!(matches!(
            node.remove_connector(input.id()),
            Err(StructuralError::ConnectorNotFound(_))
        ));
    }

    #[test]
    fn test_state_changes_are_published() {
        let node = increment();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        node.events()
            .state_changed
            .subscribe(move |s: &NodeState| sink.lock().push(s.clone()));

        node.set_label("inc");
        node.set_max_frequency(10.0);
        let recorded = states.lock();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].label, "inc");
        assert_eq!(recorded[1].max_frequency, 10.0);
    }
}
