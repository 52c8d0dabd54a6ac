//! Node handles and the account capability surface.
//!
//! A [`ClusterNode`] is an opaque handle to one host in the cluster. The
//! interesting capabilities (ssh, scp, log scraping) live behind the
//! [`NodeAccount`] trait and are provided by the remote execution layer;
//! the harness core only needs identity, the operating system, and an
//! optional health probe.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::spec::NodeSpec;

/// Capability surface of a single host.
///
/// Implementations come from outside the harness core (an ssh-backed
/// account, a container handle, ...). The core only calls the three
/// methods below; everything else a test does with a node goes through
/// the concrete account type.
pub trait NodeAccount: Send + Sync {
    /// Hostname of the underlying machine. Node identity within the
    /// harness is hostname identity.
    fn hostname(&self) -> &str;

    /// Operating system of the machine, one of the values accepted by
    /// [`NodeSpec`](super::spec::NodeSpec).
    fn operating_system(&self) -> &str;

    /// Health probe, consulted during allocation.
    ///
    /// Returns `None` when the account has no way to check health (for
    /// example a purely local node); such nodes are treated as always
    /// healthy. `Some(false)` marks the node as bad, and the allocator
    /// will set it aside for retirement.
    fn available(&self) -> Option<bool> {
        None
    }
}

/// An account with fixed metadata and no remote capabilities.
///
/// Used for local nodes and for nodes rebuilt from a [`NodeDescriptor`]
/// inside a worker process.
pub struct StaticAccount {
    hostname: String,
    operating_system: String,
}

impl StaticAccount {
    pub fn new(hostname: impl Into<String>, operating_system: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            operating_system: operating_system.into(),
        }
    }
}

impl NodeAccount for StaticAccount {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn operating_system(&self) -> &str {
        &self.operating_system
    }
}

/// An account whose health is answered by a caller-supplied probe.
///
/// Providers wrap their liveness check in the closure; the allocator
/// calls it once per allocation attempt.
pub struct ProbedAccount {
    hostname: String,
    operating_system: String,
    probe: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl ProbedAccount {
    pub fn new(
        hostname: impl Into<String>,
        operating_system: impl Into<String>,
        probe: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            operating_system: operating_system.into(),
            probe,
        }
    }
}

impl NodeAccount for ProbedAccount {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn operating_system(&self) -> &str {
        &self.operating_system
    }

    fn available(&self) -> Option<bool> {
        Some((self.probe)())
    }
}

/// Handle to one cluster host.
///
/// Cheap to clone; all clones share the same account. Equality is
/// hostname equality, which is what container removal and the
/// one-owner-per-node invariants are keyed on.
#[derive(Clone)]
pub struct ClusterNode {
    account: Arc<dyn NodeAccount>,
    node_type: Option<String>,
}

impl ClusterNode {
    pub fn new(account: Arc<dyn NodeAccount>) -> Self {
        Self {
            account,
            node_type: None,
        }
    }

    /// Attaches a node type label (e.g. "large").
    pub fn with_node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn name(&self) -> &str {
        self.account.hostname()
    }

    pub fn operating_system(&self) -> &str {
        self.account.operating_system()
    }

    pub fn node_type(&self) -> Option<&str> {
        self.node_type.as_deref()
    }

    pub fn account(&self) -> &dyn NodeAccount {
        self.account.as_ref()
    }

    /// The spec this node satisfies.
    pub fn node_spec(&self) -> NodeSpec {
        NodeSpec::unchecked(self.operating_system(), self.node_type.clone())
    }

    /// Health at this instant. Nodes without a probe are always healthy.
    pub fn is_healthy(&self) -> bool {
        self.account.available().unwrap_or(true)
    }

    /// Serializable projection of this node, shipped to workers in the
    /// READY reply.
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            hostname: self.name().to_string(),
            operating_system: self.operating_system().to_string(),
            node_type: self.node_type.clone(),
        }
    }

    /// Rebuilds a node from its wire form. The resulting node carries a
    /// [`StaticAccount`]; live capabilities are hydrated by the remote
    /// execution layer, not here.
    pub fn from_descriptor(descriptor: &NodeDescriptor) -> Self {
        let account = StaticAccount::new(
            descriptor.hostname.clone(),
            descriptor.operating_system.clone(),
        );
        Self {
            account: Arc::new(account),
            node_type: descriptor.node_type.clone(),
        }
    }
}

impl PartialEq for ClusterNode {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for ClusterNode {}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("name", &self.name())
            .field("operating_system", &self.operating_system())
            .field("node_type", &self.node_type)
            .finish()
    }
}

/// Wire form of a node: enough to identify it and re-derive its spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub hostname: String,
    pub operating_system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
}
