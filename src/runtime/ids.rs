//! Stable identities for graph elements
//!
//! Nodes, connectors and connections are addressed by UUIDs so that the
//! graph can be stored as an index (arena) instead of a web of pointers.

use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh, process-unique id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                // First group of the hyphenated form is enough to tell ids apart in logs
                let full = self.0.hyphenated().to_string();
                let short = full.split('-').next().unwrap_or(&full);
                write!(f, "{}:{}", $prefix, short)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a node in a graph
    NodeId,
    "node"
);

uuid_id!(
    /// Unique identifier for a connector (port) owned by a node
    ConnectorId,
    "port"
);

uuid_id!(
    /// Unique identifier for a connection between two connectors
    ConnectionId,
    "conn"
);
