//! In-memory address space.
//!
//! Nodes live in a single map guarded by an `RwLock`. The standard skeleton
//! (`RootFolder/Objects`, `Objects/Server/ServerStatus/BuildInfo/*`) is created on
//! construction; everything else is added by the hosting application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use crate::config::BuildInfo;
use crate::error::{ConfigurationError, ServiceError, UaError, UaResult};
use crate::node_id::{well_known, NodeId};
use crate::value::{DataType, Variant};

use super::variable::Variable;
use super::{AddressSpace, ChildReference, NodeClass};

/// Namespace used for nodes added without an explicit id.
pub const APPLICATION_NAMESPACE: u16 = 1;

#[derive(Debug)]
struct NodeEntry {
    browse_name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    variable: Option<Arc<Variable>>,
}

/// Thread-safe in-memory node tree.
#[derive(Debug)]
pub struct InMemoryAddressSpace {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    next_numeric_id: AtomicU32,
}

impl InMemoryAddressSpace {
    /// Creates the standard skeleton with default build information.
    #[must_use]
    pub fn new() -> Self {
        Self::with_build_info(&BuildInfo::default())
    }

    /// Creates the standard skeleton and publishes `build_info` under
    /// `Server.ServerStatus.BuildInfo`.
    #[must_use]
    pub fn with_build_info(build_info: &BuildInfo) -> Self {
        let mut nodes: HashMap<NodeId, NodeEntry> = HashMap::new();
        let mut link = |id: NodeId, name: &str, parent: Option<NodeId>, variable: Option<Variable>| {
            if let Some(entry) = parent.as_ref().and_then(|p| nodes.get_mut(p)) {
                entry.children.push(id.clone());
            }
            nodes.insert(
                id,
                NodeEntry {
                    browse_name: name.to_string(),
                    parent,
                    children: Vec::new(),
                    variable: variable.map(Arc::new),
                },
            );
        };

        let constant = |id: NodeId, name: &str, data_type: DataType, value: Variant| {
            Variable::builder(id, name, data_type).constant(value).build().ok()
        };

        link(well_known::ROOT_FOLDER, "Root", None, None);
        link(well_known::OBJECTS_FOLDER, "Objects", Some(well_known::ROOT_FOLDER), None);
        link(well_known::SERVER, "Server", Some(well_known::OBJECTS_FOLDER), None);
        link(well_known::SERVER_STATUS, "ServerStatus", Some(well_known::SERVER), None);
        link(well_known::BUILD_INFO, "BuildInfo", Some(well_known::SERVER_STATUS), None);
        link(
            well_known::PRODUCT_NAME,
            "ProductName",
            Some(well_known::BUILD_INFO),
            constant(
                well_known::PRODUCT_NAME,
                "ProductName",
                DataType::String,
                Variant::String(build_info.product_name.clone()),
            ),
        );
        link(
            well_known::BUILD_NUMBER,
            "BuildNumber",
            Some(well_known::BUILD_INFO),
            constant(
                well_known::BUILD_NUMBER,
                "BuildNumber",
                DataType::String,
                Variant::String(build_info.build_number.clone()),
            ),
        );
        link(
            well_known::BUILD_DATE,
            "BuildDate",
            Some(well_known::BUILD_INFO),
            constant(
                well_known::BUILD_DATE,
                "BuildDate",
                DataType::DateTime,
                Variant::DateTime(build_info.build_date),
            ),
        );

        Self {
            nodes: RwLock::new(nodes),
            next_numeric_id: AtomicU32::new(1000),
        }
    }

    fn allocate_id(&self) -> NodeId {
        NodeId::numeric(APPLICATION_NAMESPACE, self.next_numeric_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, parent: &NodeId, node_id: NodeId, browse_name: String, variable: Option<Arc<Variable>>) -> UaResult<NodeId> {
        let mut nodes = self.nodes.write().map_err(|_| UaError::poisoned("address space"))?;

        if nodes.contains_key(&node_id) {
            return Err(ConfigurationError::DuplicateNodeId { node_id }.into());
        }
        let Some(parent_entry) = nodes.get_mut(parent) else {
            return Err(ServiceError::NodeNotFound { node_id: parent.clone() }.into());
        };
        parent_entry.children.push(node_id.clone());

        nodes.insert(
            node_id.clone(),
            NodeEntry {
                browse_name,
                parent: Some(parent.clone()),
                children: Vec::new(),
                variable,
            },
        );
        Ok(node_id)
    }

    /// Adds an object (a container without a value) under `parent`.
    ///
    /// When `node_id` is `None` a numeric id in namespace 1 is allocated.
    ///
    /// # Errors
    /// - `NodeNotFound` if `parent` does not exist
    /// - `DuplicateNodeId` if `node_id` is already taken
    pub fn add_object(&self, parent: &NodeId, browse_name: impl Into<String>, node_id: Option<NodeId>) -> UaResult<NodeId> {
        let node_id = node_id.unwrap_or_else(|| self.allocate_id());
        self.insert(parent, node_id, browse_name.into(), None)
    }

    /// Adds a variable under `parent`, returning its id.
    ///
    /// # Errors
    /// - `NodeNotFound` if `parent` does not exist
    /// - `DuplicateNodeId` if the variable's id is already taken
    pub fn add_variable(&self, parent: &NodeId, variable: Variable) -> UaResult<NodeId> {
        let node_id = variable.node_id().clone();
        let browse_name = variable.browse_name().to_string();
        self.insert(parent, node_id, browse_name, Some(Arc::new(variable)))
    }

    /// Allocates an id in namespace 1 for a variable that is about to be built.
    #[must_use]
    pub fn next_node_id(&self) -> NodeId {
        self.allocate_id()
    }

    /// Removes a node and everything below it. Monitored items already bound to a
    /// removed variable keep sampling their accessor until deleted.
    ///
    /// # Errors
    /// Returns `NodeNotFound` if the node does not exist.
    pub fn remove(&self, node_id: &NodeId) -> UaResult<()> {
        let mut nodes = self.nodes.write().map_err(|_| UaError::poisoned("address space"))?;

        let Some(entry) = nodes.remove(node_id) else {
            return Err(ServiceError::NodeNotFound { node_id: node_id.clone() }.into());
        };
        if let Some(parent) = entry.parent.as_ref().and_then(|p| nodes.get_mut(p)) {
            parent.children.retain(|c| c != node_id);
        }

        let mut stack = entry.children;
        while let Some(child) = stack.pop() {
            if let Some(e) = nodes.remove(&child) {
                stack.extend(e.children);
            }
        }
        Ok(())
    }
}

impl Default for InMemoryAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn segment_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[/.]").ok()).as_ref()
}

fn namespace_prefix_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+:").ok()).as_ref()
}

/// Splits a relative path such as `/Objects/Server.ServerStatus.BuildInfo` into browse
/// names. A leading separator is optional; a `<ns>:` prefix on a segment is ignored.
fn split_browse_path(path: &str) -> Result<Vec<String>, ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidBrowsePath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix('/')
        .or_else(|| trimmed.strip_prefix('.'))
        .unwrap_or(trimmed);
    if body.is_empty() {
        return Err(invalid("path is empty"));
    }

    let (Some(sep), Some(ns)) = (segment_regex(), namespace_prefix_regex()) else {
        return Err(invalid("path parser unavailable"));
    };

    sep.split(body)
        .map(|segment| {
            let name = ns.replace(segment.trim(), "");
            if name.is_empty() {
                Err(invalid("empty segment"))
            } else {
                Ok(name.into_owned())
            }
        })
        .collect()
}

impl AddressSpace for InMemoryAddressSpace {
    fn resolve(&self, node_id: &NodeId) -> UaResult<Arc<Variable>> {
        let nodes = self.nodes.read().map_err(|_| UaError::poisoned("address space"))?;
        let entry = nodes
            .get(node_id)
            .ok_or_else(|| ServiceError::NodeNotFound { node_id: node_id.clone() })?;
        entry
            .variable
            .clone()
            .ok_or_else(|| ServiceError::NotAVariable { node_id: node_id.clone() }.into())
    }

    fn translate_browse_path(&self, root: &NodeId, path: &str) -> UaResult<NodeId> {
        let segments = split_browse_path(path)?;
        let nodes = self.nodes.read().map_err(|_| UaError::poisoned("address space"))?;

        let no_match = || ServiceError::NoMatch {
            root: root.clone(),
            path: path.to_string(),
        };

        let mut current = nodes.get(root).map(|_| root.clone()).ok_or_else(no_match)?;
        for name in &segments {
            let entry = nodes.get(&current).ok_or_else(no_match)?;
            current = entry
                .children
                .iter()
                .find(|c| nodes.get(*c).is_some_and(|e| e.browse_name == *name))
                .cloned()
                .ok_or_else(no_match)?;
        }
        Ok(current)
    }

    fn children(&self, node_id: &NodeId) -> UaResult<Vec<ChildReference>> {
        let nodes = self.nodes.read().map_err(|_| UaError::poisoned("address space"))?;
        let entry = nodes
            .get(node_id)
            .ok_or_else(|| ServiceError::NodeNotFound { node_id: node_id.clone() })?;

        Ok(entry
            .children
            .iter()
            .filter_map(|id| {
                nodes.get(id).map(|child| ChildReference {
                    node_id: id.clone(),
                    browse_name: child.browse_name.clone(),
                    node_class: if child.variable.is_some() {
                        NodeClass::Variable
                    } else {
                        NodeClass::Object
                    },
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_space() -> (InMemoryAddressSpace, NodeId) {
        let space = InMemoryAddressSpace::new();
        let device = space
            .add_object(&well_known::OBJECTS_FOLDER, "MyDevice", None)
            .unwrap();
        let var = Variable::builder(NodeId::string(1, "free_memory"), "FreeMemory", DataType::Double)
            .constant(Variant::Double(42.0))
            .build()
            .unwrap();
        space.add_variable(&device, var).unwrap();
        (space, device)
    }

    #[test]
    fn translates_standard_product_name_path() {
        let space = InMemoryAddressSpace::with_build_info(&BuildInfo {
            product_name: "MySampleServer1".to_string(),
            ..BuildInfo::default()
        });

        let id = space
            .translate_browse_path(&well_known::ROOT_FOLDER, "/Objects/Server.ServerStatus.BuildInfo.ProductName")
            .unwrap();
        assert_eq!(id, well_known::PRODUCT_NAME);
        assert_eq!(space.resolve(&id).unwrap().read(), Ok(Variant::from("MySampleServer1")));
    }

    #[test]
    fn translates_application_nodes_with_namespace_prefix() {
        let (space, _) = device_space();
        let id = space
            .translate_browse_path(&well_known::OBJECTS_FOLDER, "1:MyDevice/1:FreeMemory")
            .unwrap();
        assert_eq!(id, NodeId::string(1, "free_memory"));
    }

    #[test]
    fn unknown_segment_is_no_match() {
        let (space, _) = device_space();
        let err = space
            .translate_browse_path(&well_known::ROOT_FOLDER, "/Objects/NoSuchDevice")
            .unwrap_err();
        assert!(matches!(err, UaError::Service(ServiceError::NoMatch { .. })));
    }

    #[test]
    fn empty_segment_is_invalid_path() {
        let space = InMemoryAddressSpace::new();
        let err = space
            .translate_browse_path(&well_known::ROOT_FOLDER, "/Objects//Server")
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn resolve_distinguishes_missing_and_non_variable_nodes() {
        let (space, device) = device_space();
        assert!(matches!(
            space.resolve(&NodeId::numeric(1, 9999)).unwrap_err(),
            UaError::Service(ServiceError::NodeNotFound { .. })
        ));
        assert!(matches!(
            space.resolve(&device).unwrap_err(),
            UaError::Service(ServiceError::NotAVariable { .. })
        ));
    }

    #[test]
    fn children_lists_root_folder() {
        let space = InMemoryAddressSpace::new();
        let children = space.children(&well_known::ROOT_FOLDER).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].browse_name, "Objects");
        assert_eq!(children[0].node_class, NodeClass::Object);
    }

    #[test]
    fn remove_drops_subtree() {
        let (space, device) = device_space();
        space.remove(&device).unwrap();
        assert!(space.resolve(&NodeId::string(1, "free_memory")).is_err());
        assert!(space
            .children(&well_known::OBJECTS_FOLDER)
            .unwrap()
            .iter()
            .all(|c| c.node_id != device));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let (space, device) = device_space();
        let dup = Variable::builder(NodeId::string(1, "free_memory"), "Again", DataType::Double)
            .constant(Variant::Double(0.0))
            .build()
            .unwrap();
        let err = space.add_variable(&device, dup).unwrap_err();
        assert!(matches!(err, UaError::Configuration(ConfigurationError::DuplicateNodeId { .. })));
    }
}
