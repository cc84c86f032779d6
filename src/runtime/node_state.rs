//! Persisted per-node state and error severity

use std::fmt;

use super::thread_pool::GroupId;

/// Severity of a node or connector error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ErrorLevel {
    #[default]
    None,
    Warning,
    Error,
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorLevel::None => write!(f, "none"),
            ErrorLevel::Warning => write!(f, "warning"),
            ErrorLevel::Error => write!(f, "error"),
        }
    }
}

/// Message + severity attached to a node or connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorState {
    pub message: String,
    pub level: ErrorLevel,
}

impl ErrorState {
    pub fn new(message: impl Into<String>, level: ErrorLevel) -> Self {
        Self {
            message: message.into(),
            level,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, ErrorLevel::Error)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(message, ErrorLevel::Warning)
    }
}

/// A 2D position (node placement or connection waypoint)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// State blob read and written by the persistence layer.
///
/// Presentation fields (`position`, `color`, `minimized`, `flipped`) are
/// carried through untouched; the runtime only interprets `enabled`,
/// `muted`, `thread_group` and `max_frequency`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub label: String,
    pub position: Point,
    pub enabled: bool,
    pub muted: bool,
    /// Thread group the node was last assigned to
    pub thread_group: Option<GroupId>,
    /// Maximum executions per second, 0.0 = unlimited
    pub max_frequency: f64,
    pub color: Option<[u8; 3]>,
    pub minimized: bool,
    pub flipped: bool,
}

impl NodeState {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            label: String::new(),
            position: Point::default(),
            enabled: true,
            muted: false,
            thread_group: None,
            max_frequency: 0.0,
            color: None,
            minimized: false,
            flipped: false,
        }
    }
}
