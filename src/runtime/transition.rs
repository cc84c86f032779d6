//! Per-node readiness and hand-off state machines
//!
//! The input transition aggregates a node's inputs and decides when the
//! node may fire. The output transition aggregates its outputs and decides
//! when produced messages may be sent downstream.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::connector::{Connector, ConnectorKind};
use super::ids::ConnectorId;
use super::token::Token;

fn add_to(list: &RwLock<Vec<Arc<Connector>>>, connector: Arc<Connector>) {
    let mut connectors = list.write();
    if !connectors.iter().any(|c| c.id() == connector.id()) {
        connectors.push(connector);
    }
}

fn remove_from(list: &RwLock<Vec<Arc<Connector>>>, id: ConnectorId) -> bool {
    let mut connectors = list.write();
    let before = connectors.len();
    connectors.retain(|c| c.id() != id);
    connectors.len() != before
}

/// Readiness over all inputs (and slots) of a node
pub struct InputTransition {
    connectors: RwLock<Vec<Arc<Connector>>>,
    ready: Mutex<bool>,
    fired: AtomicU64,
}

impl InputTransition {
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(Vec::new()),
            ready: Mutex::new(false),
            fired: AtomicU64::new(0),
        }
    }

    pub fn add_connector(&self, connector: Arc<Connector>) {
        add_to(&self.connectors, connector);
    }

    pub fn remove_connector(&self, id: ConnectorId) -> bool {
        remove_from(&self.connectors, id)
    }

    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.read().clone()
    }

    fn inputs(&self) -> Vec<Arc<Connector>> {
        self.connectors
            .read()
            .iter()
            .filter(|c| c.kind() == ConnectorKind::Input)
            .cloned()
            .collect()
    }

    /// True when every enabled, non-optional input holds a message.
    ///
    /// Disabled inputs are ignored even if they hold an unconsumed message;
    /// an unconnected required input never has a message and keeps the
    /// node from firing.
    pub fn is_ready(&self) -> bool {
        self.inputs()
            .iter()
            .filter(|c| c.is_enabled() && !c.is_optional())
            .all(|c| c.has_message())
    }

    /// Like [`is_ready`](Self::is_ready) but only over inputs with an active
    /// connection. Used for relay inputs, where unconnected relays are unused.
    pub fn connected_inputs_ready(&self) -> bool {
        self.inputs()
            .iter()
            .filter(|c| c.is_enabled() && c.has_active_connection())
            .all(|c| c.has_message())
    }

    /// Re-evaluate readiness.
    ///
    /// Returns true only on the not-ready -> ready edge, so repeated
    /// notifications for an already satisfied transition fire once.
    pub fn update(&self) -> bool {
        let now = self.is_ready();
        let mut ready = self.ready.lock();
        let edge = now && !*ready;
        *ready = now;
        if edge {
            self.fired.fetch_add(1, Ordering::Relaxed);
        }
        edge
    }

    /// Number of not-ready -> ready edges seen so far
    pub fn fire_count(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Snapshot of the buffered messages on enabled inputs
    pub fn collect_messages(&self) -> Vec<(ConnectorId, Token)> {
        self.inputs()
            .iter()
            .filter(|c| c.is_enabled())
            .filter_map(|c| c.peek().map(|token| (c.id(), token)))
            .collect()
    }

    /// Consume the messages of the finished cycle and release their
    /// connections so producers may send again
    pub fn notify_messages_processed(&self) {
        for connector in self.inputs().iter().filter(|c| c.is_enabled()) {
            if connector.take_message().is_some() {
                connector.release_connections();
            }
        }
        self.update();
    }

    pub fn reset(&self) {
        for connector in self.connectors() {
            connector.reset();
            for connection in connector.connections() {
                connection.reset();
            }
        }
        *self.ready.lock() = false;
    }
}

impl Default for InputTransition {
    fn default() -> Self {
        Self::new()
    }
}

/// Message hand-off over all outputs (and events) of a node
pub struct OutputTransition {
    connectors: RwLock<Vec<Arc<Connector>>>,
}

impl OutputTransition {
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(Vec::new()),
        }
    }

    pub fn add_connector(&self, connector: Arc<Connector>) {
        add_to(&self.connectors, connector);
    }

    pub fn remove_connector(&self, id: ConnectorId) -> bool {
        remove_from(&self.connectors, id)
    }

    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.read().clone()
    }

    /// True if no output has an active connection
    pub fn is_sink(&self) -> bool {
        !self
            .connectors
            .read()
            .iter()
            .any(|c| c.kind() == ConnectorKind::Output && c.has_active_connection())
    }

    /// Every data-carrying connection of every output can take a new message.
    ///
    /// Events never block.
    pub fn can_start_sending_messages(&self) -> bool {
        self.connectors
            .read()
            .iter()
            .filter(|c| c.kind() == ConnectorKind::Output)
            .flat_map(|c| c.connections())
            .filter(|connection| connection.carries_data())
            .all(|connection| connection.is_ready_to_receive())
    }

    /// All connections are back in `ReadyToReceive`, events included
    pub fn are_outputs_idle(&self) -> bool {
        self.connectors
            .read()
            .iter()
            .flat_map(|c| c.connections())
            .all(|connection| connection.is_ready_to_receive())
    }

    /// Send the staged message of every output and event.
    ///
    /// Outputs without a staged message send nothing this cycle. Returns
    /// the number of deliveries made.
    pub fn send_messages(&self) -> usize {
        self.send_where(|_| true)
    }

    /// Send only staged event messages
    pub fn send_events(&self) -> usize {
        self.send_where(|kind| kind == ConnectorKind::Event)
    }

    fn send_where(&self, include: impl Fn(ConnectorKind) -> bool) -> usize {
        let mut delivered = 0;
        for connector in self.connectors() {
            if !include(connector.kind()) {
                continue;
            }
            let Some(token) = connector.take_staged() else {
                continue;
            };
            connector.bump_sequence();
            for connection in connector.connections() {
                if !connection.carries_data() {
                    continue;
                }
                if connection.try_send(token.clone()) {
                    delivered += 1;
                } else if connector.kind() == ConnectorKind::Event {
                    debug!("[{}] Event dropped, receiver busy", connector.id());
                }
            }
        }
        delivered
    }

    /// Drop staged messages without sending
    pub fn abort_sending_messages(&self) {
        for connector in self.connectors() {
            connector.take_staged();
        }
    }

    pub fn reset(&self) {
        for connector in self.connectors() {
            connector.reset();
            for connection in connector.connections() {
                connection.reset();
            }
        }
    }
}

impl Default for OutputTransition {
    fn default() -> Self {
        Self::new()
    }
}
