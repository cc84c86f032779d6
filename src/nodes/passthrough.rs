//! Forwards every message unchanged

use crate::runtime::errors::{NodeError, NodeResult};
use crate::runtime::ids::ConnectorId;
use crate::runtime::node::{Node, NodeModifier, ProcessContext};
use crate::runtime::type_registry::MessageType;

/// Inputs: in
/// Output: out
pub struct Passthrough {
    message_type: MessageType,
    ports: Option<(ConnectorId, ConnectorId)>,
}

impl Passthrough {
    pub fn new() -> Self {
        Self::typed(MessageType::any())
    }

    pub fn typed(message_type: MessageType) -> Self {
        Self {
            message_type,
            ports: None,
        }
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for Passthrough {
    fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()> {
        let input = modifier.add_input("in", self.message_type.clone());
        let output = modifier.add_output("out", self.message_type.clone());
        self.ports = Some((input, output));
        Ok(())
    }

    fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()> {
        let (input, output) = self
            .ports
            .ok_or_else(|| NodeError::Setup("ports not declared".to_string()))?;
        let token = ctx
            .take_input(input)
            .ok_or_else(|| NodeError::MissingInput("in".to_string()))?;
        ctx.set_output(output, token);
        Ok(())
    }
}
