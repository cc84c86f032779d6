//! Closure-based transform node

use crate::runtime::errors::{NodeError, NodeResult};
use crate::runtime::ids::ConnectorId;
use crate::runtime::node::{Node, NodeModifier, ProcessContext};
use crate::runtime::token::Token;
use crate::runtime::type_registry::MessageType;

type Transform = Box<dyn Fn(&Token) -> NodeResult<Token> + Send>;

/// Applies a function to every message
///
/// Inputs: in
/// Output: out
pub struct MapNode {
    name: String,
    input_type: MessageType,
    output_type: MessageType,
    transform: Transform,
    ports: Option<(ConnectorId, ConnectorId)>,
}

impl MapNode {
    pub fn new(
        input_type: MessageType,
        output_type: MessageType,
        transform: impl Fn(&Token) -> NodeResult<Token> + Send + 'static,
    ) -> Self {
        Self {
            name: "map".to_string(),
            input_type,
            output_type,
            transform: Box::new(transform),
            ports: None,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Map over `int` values
    pub fn int(f: impl Fn(i64) -> i64 + Send + 'static) -> Self {
        let int = MessageType::named("int");
        let output_type = int.clone();
        Self::new(int.clone(), int, move |token| {
            let value = token
                .get::<i64>()
                .ok_or_else(|| NodeError::Process(format!("expected int, got {}", token.message_type())))?;
            Ok(Token::new(output_type.clone(), f(*value)))
        })
    }
}

impl Node for MapNode {
    fn setup(&mut self, modifier: &mut NodeModifier) -> NodeResult<()> {
        let input = modifier.add_input("in", self.input_type.clone());
        let output = modifier.add_output("out", self.output_type.clone());
        self.ports = Some((input, output));
        Ok(())
    }

    fn process(&mut self, ctx: &mut ProcessContext) -> NodeResult<()> {
        let (input, output) = self
            .ports
            .ok_or_else(|| NodeError::Setup(format!("{}: ports not declared", self.name)))?;
        let token = ctx
            .input(input)
            .ok_or_else(|| NodeError::MissingInput("in".to_string()))?;
        let mapped = (self.transform)(token)?;
        ctx.set_output(output, mapped);
        Ok(())
    }
}
