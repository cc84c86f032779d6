//! Node contract
//!
//! Defines the [`Node`] trait that all node types implement, the
//! [`NodeModifier`] used to declare ports during setup, and the
//! [`ProcessContext`] handed to `process`.
//!
//! A node never touches connections directly. It reads the messages
//! collected by its input transition and stages messages for its output
//! transition; the runtime decides when to call it and what to do with the
//! result.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::warn;

use super::connector::ConnectorKind;
use super::errors::{NodeError, NodeResult};
use super::ids::{ConnectorId, NodeId};
use super::node_handle::NodeHandle;
use super::token::Token;
use super::type_registry::MessageType;

/// Messages produced by one cycle, keyed by output or event connector
pub type Outputs = Vec<(ConnectorId, Token)>;

/// A unit of computation with a declared port set
pub trait Node: Send {
    /// Declare ports. Called once, right after the node handle is created.
    fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()>;

    /// Validate parameters; runs as a separate task before the next process
    fn check_parameters(&mut self) -> NodeResult<()> {
        Ok(())
    }

    /// Extra readiness condition on top of input availability
    fn can_process(&self) -> bool {
        true
    }

    /// Consume inputs and produce outputs
    fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()>;

    /// Handle a message arriving on a slot
    fn on_slot(&mut self, _slot: ConnectorId, _token: &Token, _ctx: &mut ProcessContext) -> NodeResult<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    fn tear_down(&mut self) {}
}

/// Port declaration interface used during [`Node::setup`]
pub struct NodeModifier<'a> {
    handle: &'a NodeHandle,
}

impl<'a> NodeModifier<'a> {
    pub(crate) fn new(handle: &'a NodeHandle) -> Self {
        Self { handle }
    }

    pub fn node_id(&self) -> NodeId {
        self.handle.id()
    }

    pub fn add_input(&mut self, label: &str, message_type: MessageType) -> ConnectorId {
        self.handle
            .add_connector(ConnectorKind::Input, label, message_type, false)
            .id()
    }

    /// Input that does not have to hold a message for the node to fire
    pub fn add_optional_input(&mut self, label: &str, message_type: MessageType) -> ConnectorId {
        self.handle
            .add_connector(ConnectorKind::Input, label, message_type, true)
            .id()
    }

    pub fn add_output(&mut self, label: &str, message_type: MessageType) -> ConnectorId {
        self.handle
            .add_connector(ConnectorKind::Output, label, message_type, false)
            .id()
    }

    pub fn add_slot(&mut self, label: &str, message_type: MessageType) -> ConnectorId {
        self.handle
            .add_connector(ConnectorKind::Slot, label, message_type, false)
            .id()
    }

    pub fn add_event(&mut self, label: &str, message_type: MessageType) -> ConnectorId {
        self.handle
            .add_connector(ConnectorKind::Event, label, message_type, false)
            .id()
    }
}

/// Inputs and staged outputs of one process call
pub struct ProcessContext {
    node_id: NodeId,
    inputs: HashMap<ConnectorId, Token>,
    outputs: Outputs,
    handle: Weak<NodeHandle>,
    cycle: u64,
    deferred: bool,
}

impl ProcessContext {
    pub(crate) fn new(
        node_id: NodeId,
        inputs: Vec<(ConnectorId, Token)>,
        handle: Weak<NodeHandle>,
        cycle: u64,
    ) -> Self {
        Self {
            node_id,
            inputs: inputs.into_iter().collect(),
            outputs: Vec::new(),
            handle,
            cycle,
            deferred: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn has_input(&self, id: ConnectorId) -> bool {
        self.inputs.contains_key(&id)
    }

    pub fn input(&self, id: ConnectorId) -> Option<&Token> {
        self.inputs.get(&id)
    }

    pub fn take_input(&mut self, id: ConnectorId) -> Option<Token> {
        self.inputs.remove(&id)
    }

    /// Typed access to an input's value
    pub fn input_value<T: Any>(&self, id: ConnectorId) -> NodeResult<&T> {
        let token = self
            .inputs
            .get(&id)
            .ok_or_else(|| NodeError::MissingInput(id.to_string()))?;
        token.get::<T>().ok_or_else(|| {
            NodeError::Process(format!(
                "input {} holds {}, not {}",
                id,
                token.message_type(),
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&ConnectorId, &Token)> {
        self.inputs.iter()
    }

    /// Stage a message on an output; it is sent when the cycle completes
    pub fn set_output(&mut self, id: ConnectorId, token: Token) {
        self.outputs.retain(|(existing, _)| *existing != id);
        self.outputs.push((id, token));
    }

    /// Stage a message on an event connector
    pub fn trigger_event(&mut self, id: ConnectorId, token: Token) {
        self.set_output(id, token);
    }

    /// Complete this cycle later.
    ///
    /// Outputs staged on the context are discarded; pass them to
    /// [`Continuation::finish`] instead. Until the continuation is finished
    /// the node stays busy and its inputs stay consumed.
    pub fn defer(&mut self) -> Continuation {
        self.deferred = true;
        Continuation {
            handle: self.handle.clone(),
            cycle: self.cycle,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub(crate) fn into_outputs(self) -> Outputs {
        self.outputs
    }
}

/// Completes a deferred process cycle, possibly from another thread
pub struct Continuation {
    handle: Weak<NodeHandle>,
    cycle: u64,
}

impl Continuation {
    /// Send `outputs` and release the consumed inputs
    pub fn finish(self, outputs: Outputs) {
        match self.handle.upgrade() {
            Some(handle) => handle.finish_processing(self.cycle, outputs),
            None => warn!("Continuation finished after its node was dropped"),
        }
    }

    /// Record `error` on the node and release the consumed inputs
    pub fn fail(self, error: NodeError) {
        if let Some(handle) = self.handle.upgrade() {
            handle.finish_processing(self.cycle, Vec::new());
            handle.record_error(&error);
        }
    }

    pub fn node(&self) -> Option<Arc<NodeHandle>> {
        self.handle.upgrade()
    }
}
