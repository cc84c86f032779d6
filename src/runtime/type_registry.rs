//! Message types and the registry that decides which types may be connected
//!
//! The registry is an explicit object created at startup and shared by
//! `Arc` with every graph that needs compatibility checks.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Declared type of a connector or token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    /// Wildcard: accepts and is accepted by every type
    #[default]
    Any,
    /// A concrete, named message type (e.g. `int`, `string`)
    Named(String),
    /// A collection whose elements have the inner type
    List(Box<MessageType>),
}

impl MessageType {
    pub fn any() -> Self {
        MessageType::Any
    }

    pub fn named(name: impl Into<String>) -> Self {
        MessageType::Named(name.into())
    }

    pub fn list_of(element: MessageType) -> Self {
        MessageType::List(Box::new(element))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, MessageType::Any)
    }

    /// Element type if this is a list type
    pub fn element_type(&self) -> Option<&MessageType> {
        match self {
            MessageType::List(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageType::Any => write!(f, "any"),
            MessageType::Named(name) => write!(f, "{}", name),
            MessageType::List(inner) => write!(f, "list<{}>", inner),
        }
    }
}

/// Registry of known message types and extra compatibility pairs
pub struct TypeRegistry {
    known: RwLock<BTreeSet<String>>,
    compatible: RwLock<HashMap<String, HashSet<String>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            known: RwLock::new(BTreeSet::new()),
            compatible: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the primitive types used by the built-in nodes
    pub fn with_builtin_types() -> Self {
        let registry = Self::new();
        for name in ["int", "float", "bool", "string"] {
            registry.register_type(name);
        }
        registry
    }

    /// Register a named type
    pub fn register_type(&self, name: impl Into<String>) {
        self.known.write().insert(name.into());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.known.read().contains(name)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.known.read().iter().cloned().collect()
    }

    /// Declare two named types as mutually connectable
    pub fn register_compatible(&self, a: impl Into<String>, b: impl Into<String>) {
        let a = a.into();
        let b = b.into();
        let mut compatible = self.compatible.write();
        compatible.entry(a.clone()).or_default().insert(b.clone());
        compatible.entry(b).or_default().insert(a);
    }

    /// Whether `target` accepts a connection coming from `source`
    pub fn accepts(&self, target: &MessageType, source: &MessageType) -> bool {
        match (target, source) {
            (MessageType::Any, _) | (_, MessageType::Any) => true,
            (MessageType::Named(a), MessageType::Named(b)) => {
                a == b
                    || self
                        .compatible
                        .read()
                        .get(a)
                        .is_some_and(|accepted| accepted.contains(b))
            }
            (MessageType::List(a), MessageType::List(b)) => self.accepts(a, b),
            _ => false,
        }
    }

    /// Symmetric check: both sides must accept each other
    pub fn are_compatible(&self, a: &MessageType, b: &MessageType) -> bool {
        self.accepts(a, b) && self.accepts(b, a)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtin_types()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("known", &*self.known.read())
            .finish()
    }
}
