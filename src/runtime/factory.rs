//! Node type resolution
//!
//! The runtime never constructs node types itself; it asks a
//! [`NodeTypeResolver`] for a handle by type name. [`NodeFactory`] is the
//! in-process resolver: a table of constructors plus the `subgraph` type.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::errors::FactoryError;
use super::ids::NodeId;
use super::node::Node;
use super::node_handle::NodeHandle;
use super::subgraph::{SubgraphNode, SUBGRAPH_TYPE};
use super::type_registry::TypeRegistry;

/// Builds a fresh node instance
pub type NodeConstructor = Arc<dyn Fn() -> Box<dyn Node> + Send + Sync>;

/// Resolves a type name to a new node handle
pub trait NodeTypeResolver: Send + Sync {
    fn make_node(&self, type_name: &str, id: NodeId) -> Result<Arc<NodeHandle>, FactoryError>;

    fn has_type(&self, type_name: &str) -> bool;
}

pub struct NodeFactory {
    registry: Arc<TypeRegistry>,
    constructors: RwLock<BTreeMap<String, NodeConstructor>>,
}

impl NodeFactory {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            constructors: RwLock::new(BTreeMap::new()),
        }
    }

    /// Factory preloaded with the node types in [`crate::nodes`]
    pub fn with_builtin_nodes(registry: Arc<TypeRegistry>) -> Self {
        let factory = Self::new(registry);
        crate::nodes::register_builtin_nodes(&factory);
        factory
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Register (or replace) a node type
    pub fn register(
        &self,
        type_name: impl Into<String>,
        constructor: impl Fn() -> Box<dyn Node> + Send + Sync + 'static,
    ) {
        let type_name = type_name.into();
        debug!("Registered node type '{}'", type_name);
        self.constructors
            .write()
            .insert(type_name, Arc::new(constructor));
    }

    /// Registered type names, `subgraph` included
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.push(SUBGRAPH_TYPE.to_string());
        names.sort();
        names
    }
}

impl NodeTypeResolver for NodeFactory {
    fn make_node(&self, type_name: &str, id: NodeId) -> Result<Arc<NodeHandle>, FactoryError> {
        if type_name == SUBGRAPH_TYPE {
            return Ok(SubgraphNode::create_handle(id, Arc::clone(&self.registry))?);
        }
        let constructor = self
            .constructors
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| FactoryError::NotFound(type_name.to_string()))?;
        Ok(NodeHandle::new(id, type_name, constructor())?)
    }

    fn has_type(&self, type_name: &str) -> bool {
        type_name == SUBGRAPH_TYPE || self.constructors.read().contains_key(type_name)
    }
}

impl fmt::Debug for NodeFactory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NodeFactory")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> NodeFactory {
        NodeFactory::with_builtin_nodes(Arc::new(TypeRegistry::with_builtin_types()))
    }

    #[test]
    fn test_builtin_types_resolve() {
        let factory = factory();
        for name in ["counter_source", "passthrough", "export_log", "subgraph"] {
            assert!(factory.has_type(name), "missing {}", name);
        }

        let id = NodeId::new();
        let handle = factory.make_node("passthrough", id).unwrap();
        assert_eq!(handle.id(), id);
        assert_eq!(handle.type_name(), "passthrough");
        assert!(handle.connector_by_label("in").is_some());
        assert!(handle.connector_by_label("out").is_some());
    }

    #[test]
    fn test_subgraph_type_is_special() {
        let factory = factory();
        let handle = factory.make_node("subgraph", NodeId::new()).unwrap();
        assert!(handle.is_subgraph());
        assert_eq!(handle.subgraph().unwrap().graph().owner(), Some(handle.id()));
    }

    #[test]
    fn test_unknown_type_not_found() {
        let factory = factory();
        let result = factory.make_node("oscilloscope", NodeId::new());
        assert!(matches!(result, Err(FactoryError::NotFound(name)) if name == "oscilloscope"));
        assert!(!factory.has_type("oscilloscope"));
    }
}
