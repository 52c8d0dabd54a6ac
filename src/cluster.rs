//! Cluster abstractions: node bookkeeping, capacity specs, allocation.
//!
//! A cluster is a collection of nodes with login credentials. This module
//! does not map roles or services onto nodes — it only mediates
//! reservations: tests request capacity as a [`ClusterSpec`], the cluster
//! hands back concrete [`ClusterNode`]s, and returns them to the pool when
//! the test finishes.
//!
//! # Pieces
//!
//! - [`NodeContainer`] — per-OS bucketed pool, the allocation primitive
//!   with health checks and rollback
//! - [`NodeSpec`] / [`ClusterSpec`] — declarative capacity requests
//! - [`Cluster`] — the provider-facing trait
//! - [`NodePool`] — reusable available/in-use bookkeeping for providers
//! - [`FiniteSubcluster`] — fixed-set cluster wrapping pre-allocated
//!   nodes; what a test sees as "its" cluster
//!
//! # Error semantics
//!
//! [`ClusterError::InsufficientResources`] and its refinement
//! [`ClusterError::InsufficientHealthyNodes`] are recoverable: the
//! scheduler keeps the test around and retries after the next completion.
//! [`ClusterError::NodeNotPresent`] on free is a programming error and is
//! treated as fatal by callers.

pub mod container;
pub mod finite;
pub mod node;
pub mod spec;

use tracing::warn;

pub use container::NodeContainer;
pub use finite::FiniteSubcluster;
pub use node::{ClusterNode, NodeAccount, NodeDescriptor, ProbedAccount, StaticAccount};
pub use spec::{ClusterSpec, LINUX, NodeSpec, SUPPORTED_OS_TYPES, WINDOWS};

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors from cluster bookkeeping and allocation.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A node spec named an operating system outside the supported set.
    #[error("unsupported operating system: {0}")]
    UnsupportedOs(String),

    /// A node was not where the caller claimed it was (e.g. freeing a
    /// node that is not in use).
    #[error("node not present: {0}")]
    NodeNotPresent(String),

    /// Not enough total nodes to even attempt the allocation. Nothing was
    /// mutated and no health checks ran.
    #[error("insufficient cluster resources: {0}")]
    InsufficientResources(String),

    /// Enough nodes on paper, but too many failed their health probe.
    /// The good nodes were rolled back; `bad_nodes` were removed from the
    /// pool and are the caller's to retire.
    #[error("insufficient healthy nodes: {message}")]
    InsufficientHealthyNodes {
        message: String,
        bad_nodes: Vec<ClusterNode>,
    },
}

impl ClusterError {
    /// Whether a scheduler should hold on to the test and retry later.
    ///
    /// Both insufficiency kinds are retryable — total capacity may look
    /// insufficient only until another test frees its slice, and the
    /// permanently-impossible case is caught separately by comparing
    /// against the cluster's full size.
    pub fn is_insufficient_resources(&self) -> bool {
        matches!(
            self,
            ClusterError::InsufficientResources(_)
                | ClusterError::InsufficientHealthyNodes { .. }
        )
    }
}

/// A collection of nodes that mediates reservations.
///
/// The supervisor owns a `Box<dyn Cluster>` and is its sole mutator.
/// Implementations must present a blocking interface; `alloc` may call
/// out to an external orchestrator internally.
///
/// # Contract
///
/// - Each node is allocated to at most one caller at a time.
/// - `available()` / `used()` / `all()` return snapshots, not live views.
/// - Implementations track a high-water mark of in-use nodes, updated on
///   every successful allocation and never decreasing; `max_used`
///   reports it.
/// - Nodes that fail a health probe during allocation are retired: gone
///   from `available()` and `all()` for the rest of the run.
pub trait Cluster: Send {
    /// Allocates nodes satisfying `spec`.
    fn alloc(&mut self, spec: &ClusterSpec) -> ClusterResult<Vec<ClusterNode>>;

    /// Returns a single node to the available pool.
    fn free_single(&mut self, node: ClusterNode) -> ClusterResult<()>;

    /// Returns nodes to the available pool.
    fn free(&mut self, nodes: Vec<ClusterNode>) -> ClusterResult<()> {
        for node in nodes {
            self.free_single(node)?;
        }
        Ok(())
    }

    /// Spec snapshot of the currently available nodes.
    fn available(&self) -> ClusterSpec;

    /// Spec snapshot of the currently in-use nodes.
    fn used(&self) -> ClusterSpec;

    /// Spec snapshot of every node the cluster still knows about.
    fn all(&self) -> ClusterSpec {
        self.available().add(self.used())
    }

    fn num_available_nodes(&self) -> usize {
        self.available().size()
    }

    /// Total node count (available plus in use).
    fn size(&self) -> usize {
        self.available().size() + self.used().size()
    }

    /// High-water mark of concurrently in-use nodes.
    fn max_used(&self) -> usize;
}

/// Available/in-use bookkeeping shared by cluster implementations.
///
/// Providers implement [`Cluster`] by delegating to a pool: `allocate`
/// moves nodes from available to in-use (retiring any that fail their
/// health probe), `release` moves them back, and the high-water mark is
/// maintained on every successful allocation.
#[derive(Debug, Default)]
pub struct NodePool {
    available: NodeContainer,
    in_use: NodeContainer,
    max_used: usize,
}

impl NodePool {
    pub fn new(nodes: impl IntoIterator<Item = ClusterNode>) -> Self {
        Self {
            available: NodeContainer::from_nodes(nodes),
            in_use: NodeContainer::new(),
            max_used: 0,
        }
    }

    /// Moves a spec's worth of healthy nodes from available to in-use.
    ///
    /// Nodes that fail their health probe are retired — removed from the
    /// pool and never re-added — whether or not the allocation succeeds.
    pub fn allocate(&mut self, spec: &ClusterSpec) -> ClusterResult<Vec<ClusterNode>> {
        let result = self.available.remove_spec(spec);
        match &result {
            Ok((_, bad)) if !bad.is_empty() => log_retired(bad),
            Err(ClusterError::InsufficientHealthyNodes { bad_nodes, .. }) => {
                log_retired(bad_nodes);
            }
            _ => {}
        }
        let (good, _bad) = result?;
        self.in_use.add_nodes(good.clone());
        self.max_used = self.max_used.max(self.in_use.size());
        Ok(good)
    }

    /// Moves a node from in-use back to available.
    pub fn release(&mut self, node: ClusterNode) -> ClusterResult<()> {
        let node = self.in_use.remove_node(&node)?;
        self.available.add_node(node);
        Ok(())
    }

    pub fn available_spec(&self) -> ClusterSpec {
        ClusterSpec::from_nodes(self.available.elements(None))
    }

    pub fn used_spec(&self) -> ClusterSpec {
        ClusterSpec::from_nodes(self.in_use.elements(None))
    }

    pub fn num_available(&self) -> usize {
        self.available.size()
    }

    pub fn size(&self) -> usize {
        self.available.size() + self.in_use.size()
    }

    pub fn max_used(&self) -> usize {
        self.max_used
    }
}

fn log_retired(bad_nodes: &[ClusterNode]) {
    for node in bad_nodes {
        warn!(node = node.name(), "retiring node that failed its health check");
    }
}
