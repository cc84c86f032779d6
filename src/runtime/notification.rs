//! Notifications surfaced to the presentation layer

use std::fmt;

use super::ids::NodeId;
use super::node_state::ErrorLevel;

/// A (message, severity) pair, optionally attributed to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub source: Option<NodeId>,
    pub message: String,
    pub level: ErrorLevel,
}

impl Notification {
    pub fn new(message: impl Into<String>, level: ErrorLevel) -> Self {
        Self {
            source: None,
            message: message.into(),
            level,
        }
    }

    pub fn from_node(source: NodeId, message: impl Into<String>, level: ErrorLevel) -> Self {
        Self {
            source: Some(source),
            message: message.into(),
            level,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.source {
            Some(source) => write!(f, "[{}] {}: {}", source, self.level, self.message),
            None => write!(f, "{}: {}", self.level, self.message),
        }
    }
}
