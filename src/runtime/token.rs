//! Messages flowing through connections
//!
//! A [`Token`] carries a declared [`MessageType`] and a type-erased payload.
//! Tokens are cheap to clone: values are shared behind an `Arc`, so one
//! output can deliver the same token to every downstream connection.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::type_registry::MessageType;

/// Payload of a token
#[derive(Clone)]
pub enum Payload {
    /// No value (marker message)
    Empty,
    /// A single value of any `Send + Sync` type
    Value(Arc<dyn Any + Send + Sync>),
    /// A collection of tokens, used for subgraph iteration
    List(Vec<Token>),
}

/// A message on its way through the graph
#[derive(Clone)]
pub struct Token {
    message_type: MessageType,
    payload: Payload,
}

impl Token {
    /// Create a token holding `value`
    pub fn new<T: Any + Send + Sync>(message_type: MessageType, value: T) -> Self {
        Self {
            message_type,
            payload: Payload::Value(Arc::new(value)),
        }
    }

    /// Create a token without a value
    pub fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            payload: Payload::Empty,
        }
    }

    /// Create a collection token; its type is `list<element_type>`
    pub fn list(element_type: MessageType, items: Vec<Token>) -> Self {
        Self {
            message_type: MessageType::list_of(element_type),
            payload: Payload::List(items),
        }
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.payload, Payload::Empty)
    }

    /// Downcast the payload to a concrete type.
    ///
    /// Returns None for empty and list tokens, or if the value has another type.
    pub fn get<T: Any>(&self) -> Option<&T> {
        match &self.payload {
            Payload::Value(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Elements of a collection token
    pub fn items(&self) -> Option<&[Token]> {
        match &self.payload {
            Payload::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.payload {
            Payload::Empty => write!(f, "Token[{}, empty]", self.message_type),
            Payload::Value(_) => write!(f, "Token[{}, value]", self.message_type),
            Payload::List(items) => {
                write!(f, "Token[{}, {} items]", self.message_type, items.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_downcast() {
        let token = Token::new(MessageType::named("int"), 5i64);
        assert_eq!(token.get::<i64>(), Some(&5));
        assert_eq!(token.get::<String>(), None);
        assert!(!token.is_empty());
    }

    #[test]
    fn test_list_token_type() {
        let int = MessageType::named("int");
        let items = vec![Token::new(int.clone(), 1i64), Token::new(int.clone(), 2i64)];
        let token = Token::list(int.clone(), items);
        assert_eq!(token.message_type(), &MessageType::list_of(int));
        assert_eq!(token.items().map(|i| i.len()), Some(2));
        assert_eq!(token.get::<i64>(), None);
    }

    #[test]
    fn test_clone_shares_value() {
        let token = Token::new(MessageType::named("string"), String::from("hello"));
        let copy = token.clone();
        let (Payload::Value(a), Payload::Value(b)) = (token.payload(), copy.payload()) else {
            panic!("expected value payloads");
        };
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_debug_format() {
        let token = Token::empty(MessageType::Any);
        assert_eq!(format!("{:?}", token), "Token[any, empty]");
    }
}
