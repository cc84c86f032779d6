//! Source nodes
//!
//! Sources have no inputs; they fire whenever their outputs can take a
//! message (and the runner lets them).

use std::collections::VecDeque;
use tracing::debug;

use crate::runtime::errors::NodeResult;
use crate::runtime::ids::ConnectorId;
use crate::runtime::node::{Node, NodeModifier, ProcessContext};
use crate::runtime::token::Token;
use crate::runtime::type_registry::MessageType;

/// Emits 0, 1, 2, ... as `int`
///
/// Output: count
pub struct CounterSource {
    name: String,
    next: i64,
    limit: Option<i64>,
    output: Option<ConnectorId>,
}

impl CounterSource {
    pub fn new() -> Self {
        Self {
            name: "counter_source".to_string(),
            next: 0,
            limit: None,
            output: None,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stop after emitting `limit` values
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.next >= limit)
    }
}

impl Default for CounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for CounterSource {
    fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()> {
        self.output = Some(modifier.add_output("count", MessageType::named("int")));
        Ok(())
    }

    fn can_process(&self) -> bool {
        !self.exhausted()
    }

    fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()> {
        if let Some(output) = self.output {
            ctx.set_output(output, Token::new(MessageType::named("int"), self.next));
        }
        self.next += 1;
        if self.exhausted() {
            debug!("[{}] Limit reached after {} values", self.name, self.next);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.next = 0;
    }
}

/// Emits a fixed sequence of messages, one per cycle
///
/// Output: value
pub struct SequenceSource {
    name: String,
    message_type: MessageType,
    pending: VecDeque<Token>,
    initial: Vec<Token>,
    output: Option<ConnectorId>,
}

impl SequenceSource {
    pub fn new(message_type: MessageType, tokens: Vec<Token>) -> Self {
        Self {
            name: "sequence_source".to_string(),
            message_type,
            pending: tokens.iter().cloned().collect(),
            initial: tokens,
            output: None,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Node for SequenceSource {
    fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()> {
        self.output = Some(modifier.add_output("value", self.message_type.clone()));
        Ok(())
    }

    fn can_process(&self) -> bool {
        !self.pending.is_empty()
    }

    fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()> {
        if let (Some(output), Some(token)) = (self.output, self.pending.pop_front()) {
            ctx.set_output(output, token);
        }
        if self.pending.is_empty() {
            debug!("[{}] Sequence exhausted", self.name);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.pending = self.initial.iter().cloned().collect();
    }
}
