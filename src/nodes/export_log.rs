//! Logging sink
//!
//! Logs every received message at `info` and optionally hands it to an
//! observer through a crossbeam channel.

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::runtime::errors::NodeResult;
use crate::runtime::ids::ConnectorId;
use crate::runtime::node::{Node, NodeModifier, ProcessContext};
use crate::runtime::token::Token;
use crate::runtime::type_registry::MessageType;

/// Inputs: in
pub struct ExportLog {
    name: String,
    input: Option<ConnectorId>,
    tx: Option<Sender<Token>>,
    received: u64,
}

impl ExportLog {
    pub fn new() -> Self {
        Self {
            name: "export_log".to_string(),
            input: None,
            tx: None,
            received: 0,
        }
    }

    /// Sink whose messages can also be read from the returned receiver
    pub fn channel() -> (Self, Receiver<Token>) {
        let (tx, rx) = unbounded();
        let mut sink = Self::new();
        sink.tx = Some(tx);
        (sink, rx)
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for ExportLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for ExportLog {
    fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()> {
        self.input = Some(modifier.add_input("in", MessageType::any()));
        Ok(())
    }

    fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()> {
        let Some(token) = self.input.and_then(|input| ctx.take_input(input)) else {
            return Ok(());
        };
        self.received += 1;
        info!("[{}] #{} {:?}", self.name, self.received, token);
        if let Some(tx) = &self.tx {
            if tx.send(token).is_err() {
                warn!("[{}] Observer gone, dropping further messages", self.name);
                self.tx = None;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.received = 0;
    }
}
