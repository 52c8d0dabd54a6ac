//! Declarative requests for cluster capacity.
//!
//! A [`NodeSpec`] asks for one node of a given operating system and,
//! optionally, a specific node type. A [`ClusterSpec`] is an ordered
//! multiset of node specs — the unit in which tests request resources and
//! in which the cluster reports its capacity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ClusterError;
use super::node::ClusterNode;

/// Operating system label for Linux nodes.
pub const LINUX: &str = "linux";

/// Operating system label for Windows nodes.
pub const WINDOWS: &str = "windows";

/// The closed set of operating systems a node spec may name.
pub const SUPPORTED_OS_TYPES: &[&str] = &[LINUX, WINDOWS];

/// Specification for a single node.
///
/// `node_type` is a free-form label (size, architecture, whatever the
/// cluster configuration defines). `None` means "match any type".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "os")]
    pub operating_system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
}

impl NodeSpec {
    /// Creates a node spec, rejecting operating systems outside the
    /// supported set.
    pub fn new(
        operating_system: impl Into<String>,
        node_type: Option<String>,
    ) -> Result<Self, ClusterError> {
        let operating_system = operating_system.into();
        if !SUPPORTED_OS_TYPES.contains(&operating_system.as_str()) {
            return Err(ClusterError::UnsupportedOs(operating_system));
        }
        Ok(Self {
            operating_system,
            node_type,
        })
    }

    /// A Linux node of any type.
    pub fn linux() -> Self {
        Self {
            operating_system: LINUX.to_string(),
            node_type: None,
        }
    }

    /// Constructs without validating the operating system. For node specs
    /// derived from live nodes, whose OS the provider already vouched for.
    pub(crate) fn unchecked(operating_system: &str, node_type: Option<String>) -> Self {
        Self {
            operating_system: operating_system.to_string(),
            node_type,
        }
    }

    /// Whether this *requested* spec can be satisfied by a node that
    /// presents `available` as its own spec.
    ///
    /// OS must match exactly. A request without a node type accepts any
    /// type; a request with a type requires that exact type.
    pub fn matches(&self, available: &NodeSpec) -> bool {
        if self.operating_system != available.operating_system {
            return false;
        }
        match &self.node_type {
            None => true,
            Some(t) => available.node_type.as_deref() == Some(t.as_str()),
        }
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut obj = serde_json::Map::new();
        obj.insert("os".to_string(), self.operating_system.clone().into());
        if let Some(t) = &self.node_type {
            obj.insert("node_type".to_string(), t.clone().into());
        }
        write!(f, "{}", serde_json::Value::Object(obj))
    }
}

/// An ordered multiset of [`NodeSpec`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterSpec {
    nodes: Vec<NodeSpec>,
}

impl ClusterSpec {
    /// A spec requesting nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self { nodes }
    }

    /// `num_nodes` Linux nodes of any type.
    pub fn simple_linux(num_nodes: usize) -> Self {
        Self {
            nodes: vec![NodeSpec::linux(); num_nodes],
        }
    }

    /// `num_nodes` Linux nodes of a specific type.
    pub fn simple_linux_of_type(num_nodes: usize, node_type: impl Into<String>) -> Self {
        let node_type = node_type.into();
        Self {
            nodes: (0..num_nodes)
                .map(|_| NodeSpec {
                    operating_system: LINUX.to_string(),
                    node_type: Some(node_type.clone()),
                })
                .collect(),
        }
    }

    /// The spec describing an existing collection of nodes.
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a ClusterNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| n.node_spec()).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter()
    }

    /// Appends all of `other`'s node specs, returning the combined spec.
    pub fn add(mut self, other: ClusterSpec) -> Self {
        self.nodes.extend(other.nodes);
        self
    }

    /// Node counts grouped by operating system.
    pub fn os_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for spec in &self.nodes {
            *counts.entry(spec.operating_system.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Checks whether a cluster of this capacity could ever satisfy
    /// `required`, comparing per-OS node counts.
    ///
    /// Returns `None` when it fits, otherwise a human-readable message
    /// naming each shortfall.
    pub fn capacity_shortfall(&self, required: &ClusterSpec) -> Option<String> {
        let have = self.os_counts();
        let mut msg = String::new();
        for (os, needed) in required.os_counts() {
            let avail = have.get(os).copied().unwrap_or(0);
            if avail < needed {
                msg.push_str(&format!(
                    "{os} nodes requested: {needed}. {os} nodes available: {avail}. "
                ));
            }
        }
        if msg.is_empty() { None } else { Some(msg) }
    }
}

impl fmt::Display for ClusterSpec {
    /// Canonical form: a JSON array of `{os, node_type?, num_nodes}`
    /// objects, sorted by node spec.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for spec in &self.nodes {
            *counts.entry(spec.to_string()).or_insert(0) += 1;
        }
        let mut entries = Vec::new();
        for (spec_str, num_nodes) in counts {
            let mut obj: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&spec_str).expect("node spec display is valid json");
            obj.insert("num_nodes".to_string(), num_nodes.into());
            entries.push(serde_json::Value::Object(obj));
        }
        write!(f, "{}", serde_json::Value::Array(entries))
    }
}
