//! Node identifiers.
//!
//! A node is addressed by a namespace index plus an identifier that is numeric,
//! string, GUID or opaque (byte string). The textual form follows the usual
//! `ns=<index>;<kind>=<value>` convention, where `ns=0;` may be omitted and opaque
//! identifiers are base64 encoded:
//!
//! ```
//! use uasub::NodeId;
//!
//! let id: NodeId = "ns=1;s=free_memory".parse().unwrap();
//! assert_eq!(id, NodeId::string(1, "free_memory"));
//! assert_eq!(id.to_string(), "ns=1;s=free_memory");
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigurationError;

const NODE_ID_PATTERN: &str = r"^(?:ns=(\d{1,5});)?([isgb])=(.+)$";

fn node_id_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NODE_ID_PATTERN).ok()).as_ref()
}

/// The identifier part of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Identifier {
    /// `i=`
    Numeric(u32),
    /// `s=`
    String(String),
    /// `g=`
    Guid(Uuid),
    /// `b=`, base64 in textual form.
    Opaque(Vec<u8>),
}

/// Address of a node in the address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index. Namespace 0 holds the standard nodes.
    pub namespace: u16,
    /// Identifier within the namespace.
    pub identifier: Identifier,
}

impl NodeId {
    /// Numeric identifier (`i=`).
    #[must_use]
    pub const fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// String identifier (`s=`).
    #[must_use]
    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(value.into()),
        }
    }

    /// GUID identifier (`g=`).
    #[must_use]
    pub const fn guid(namespace: u16, value: Uuid) -> Self {
        Self {
            namespace,
            identifier: Identifier::Guid(value),
        }
    }

    /// Opaque identifier (`b=`).
    #[must_use]
    pub fn opaque(namespace: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace,
            identifier: Identifier::Opaque(value.into()),
        }
    }

    /// Parses the textual form.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidNodeId` if the text is not a valid node id.
    pub fn parse(input: &str) -> Result<Self, ConfigurationError> {
        let invalid = || ConfigurationError::InvalidNodeId {
            input: input.to_string(),
        };

        let caps = node_id_regex()
            .and_then(|re| re.captures(input.trim()))
            .ok_or_else(invalid)?;

        let namespace = match caps.get(1) {
            Some(ns) => ns.as_str().parse::<u16>().map_err(|_| invalid())?,
            None => 0,
        };
        let raw = caps.get(3).map_or("", |m| m.as_str());

        let identifier = match caps.get(2).map(|m| m.as_str()) {
            Some("i") => Identifier::Numeric(raw.parse().map_err(|_| invalid())?),
            Some("s") => Identifier::String(raw.to_string()),
            Some("g") => Identifier::Guid(raw.parse().map_err(|_| invalid())?),
            Some("b") => Identifier::Opaque(BASE64.decode(raw).map_err(|_| invalid())?),
            _ => return Err(invalid()),
        };

        Ok(Self { namespace, identifier })
    }
}

impl FromStr for NodeId {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "i={v}"),
            Identifier::String(v) => write!(f, "s={v}"),
            Identifier::Guid(v) => write!(f, "g={v}"),
            Identifier::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

/// Well-known nodes of namespace 0.
pub mod well_known {
    use super::NodeId;

    /// `RootFolder`, the top of the address space.
    pub const ROOT_FOLDER: NodeId = NodeId::numeric(0, 84);
    /// `Objects`, parent of user-defined objects.
    pub const OBJECTS_FOLDER: NodeId = NodeId::numeric(0, 85);
    /// `Server` object.
    pub const SERVER: NodeId = NodeId::numeric(0, 2253);
    /// `Server.ServerStatus`.
    pub const SERVER_STATUS: NodeId = NodeId::numeric(0, 2256);
    /// `Server.ServerStatus.BuildInfo`.
    pub const BUILD_INFO: NodeId = NodeId::numeric(0, 2260);
    /// `BuildInfo.ProductName`.
    pub const PRODUCT_NAME: NodeId = NodeId::numeric(0, 2261);
    /// `BuildInfo.BuildNumber`.
    pub const BUILD_NUMBER: NodeId = NodeId::numeric(0, 2265);
    /// `BuildInfo.BuildDate`.
    pub const BUILD_DATE: NodeId = NodeId::numeric(0, 2266);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_identifier_kind() {
        assert_eq!(NodeId::parse("i=84").unwrap(), well_known::ROOT_FOLDER);
        assert_eq!(NodeId::parse("ns=1;s=free_memory").unwrap(), NodeId::string(1, "free_memory"));
        assert_eq!(
            NodeId::parse("ns=1;b=1020FFAA").unwrap(),
            NodeId::opaque(1, vec![0xD7, 0x4D, 0xB4, 0x14, 0x50, 0x00])
        );

        let guid = Uuid::new_v4();
        assert_eq!(NodeId::parse(&format!("ns=3;g={guid}")).unwrap(), NodeId::guid(3, guid));
    }

    #[test]
    fn string_identifier_may_contain_separators() {
        let id = NodeId::parse("ns=2;s=Device/Temp;raw").unwrap();
        assert_eq!(id, NodeId::string(2, "Device/Temp;raw"));
    }

    #[test]
    fn display_round_trips_opaque() {
        let id = NodeId::parse("ns=1;b=1020FFAA").unwrap();
        assert_eq!(id.to_string(), "ns=1;b=1020FFAA");
    }

    #[test]
    fn rejects_malformed_ids() {
        for input in ["", "ns=1", "ns=1;x=3", "ns=1;i=abc", "ns=99999999;i=1", "b=***"] {
            let err = NodeId::parse(input).unwrap_err();
            assert!(matches!(err, ConfigurationError::InvalidNodeId { .. }), "{input}");
        }
    }
}
