//! Address-space collaborator.
//!
//! The engine only needs two things from the address space: turning a node id into a
//! variable accessor, and translating a symbolic browse path into a node id. The
//! in-memory implementation is intended for embedded usage, tests and the demo.

pub mod memory;
pub mod variable;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::UaResult;
use crate::node_id::NodeId;

pub use memory::InMemoryAddressSpace;
pub use variable::{ValueGetter, ValueSetter, Variable, VariableBuilder};

/// Kind of node returned when listing children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    /// An object that groups other nodes.
    Object,
    /// A variable with a value.
    Variable,
}

/// A child reference: enough to display it or to descend into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReference {
    /// Id of the child.
    pub node_id: NodeId,
    /// Name used in browse paths.
    pub browse_name: String,
    /// Whether the child is an object or a variable.
    pub node_class: NodeClass,
}

/// Resolves node ids and browse paths.
pub trait AddressSpace: Send + Sync {
    /// Returns the variable behind `node_id`.
    ///
    /// # Errors
    /// - `NodeNotFound` if no node has this id
    /// - `NotAVariable` if the node exists but has no value
    fn resolve(&self, node_id: &NodeId) -> UaResult<Arc<Variable>>;

    /// Follows `path` (browse names separated by `/` or `.`) starting at `root`.
    ///
    /// # Errors
    /// - `NoMatch` if a segment does not resolve
    /// - `InvalidBrowsePath` if the path is syntactically invalid
    fn translate_browse_path(&self, root: &NodeId, path: &str) -> UaResult<NodeId>;

    /// Lists the direct children of `node_id`.
    ///
    /// # Errors
    /// Returns `NodeNotFound` if no node has this id.
    fn children(&self, node_id: &NodeId) -> UaResult<Vec<ChildReference>>;
}
