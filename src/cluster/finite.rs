//! Fixed-set cluster over a block of pre-allocated nodes.

use super::node::{ClusterNode, NodeDescriptor};
use super::spec::ClusterSpec;
use super::{Cluster, ClusterResult, NodePool};

/// A cluster made of a finite, pre-allocated block of nodes.
///
/// The supervisor carves one of these out of the main cluster for each
/// test, so the test can allocate and free service nodes inside its own
/// slice without ever touching another test's nodes. It is also the
/// simplest complete [`Cluster`] implementation, which makes it the
/// cluster of choice in unit tests.
pub struct FiniteSubcluster {
    initial: Vec<ClusterNode>,
    pool: NodePool,
}

impl FiniteSubcluster {
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        Self {
            initial: nodes.clone(),
            pool: NodePool::new(nodes),
        }
    }

    /// The full node block this subcluster was created with, regardless
    /// of what is currently allocated inside it. This is what gets handed
    /// back to the parent cluster when the test finishes.
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.initial
    }

    pub fn into_nodes(self) -> Vec<ClusterNode> {
        self.initial
    }

    /// Wire form of the node block, for the READY reply.
    pub fn descriptors(&self) -> Vec<NodeDescriptor> {
        self.initial.iter().map(ClusterNode::descriptor).collect()
    }

    /// Rebuilds a subcluster from descriptors received over IPC.
    pub fn from_descriptors(descriptors: &[NodeDescriptor]) -> Self {
        Self::new(
            descriptors
                .iter()
                .map(ClusterNode::from_descriptor)
                .collect(),
        )
    }
}

impl Cluster for FiniteSubcluster {
    fn alloc(&mut self, spec: &ClusterSpec) -> ClusterResult<Vec<ClusterNode>> {
        self.pool.allocate(spec)
    }

    fn free_single(&mut self, node: ClusterNode) -> ClusterResult<()> {
        self.pool.release(node)
    }

    fn available(&self) -> ClusterSpec {
        self.pool.available_spec()
    }

    fn used(&self) -> ClusterSpec {
        self.pool.used_spec()
    }

    fn max_used(&self) -> usize {
        self.pool.max_used()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::node::StaticAccount;
    use crate::cluster::spec::LINUX;

    fn subcluster(count: usize) -> FiniteSubcluster {
        FiniteSubcluster::new(
            (0..count)
                .map(|i| ClusterNode::new(Arc::new(StaticAccount::new(format!("sub{i}"), LINUX))))
                .collect(),
        )
    }

    #[test]
    fn test_alloc_within_block() {
        let mut sub = subcluster(3);
        let allocated = sub.alloc(&ClusterSpec::simple_linux(2)).unwrap();
        assert_eq!(allocated.len(), 2);
        assert_eq!(sub.num_available_nodes(), 1);
        assert_eq!(sub.used().size(), 2);
        assert_eq!(sub.max_used(), 2);

        sub.free(allocated).unwrap();
        assert_eq!(sub.num_available_nodes(), 3);
    }

    #[test]
    fn test_alloc_beyond_block_fails() {
        let mut sub = subcluster(2);
        let err = sub.alloc(&ClusterSpec::simple_linux(3)).unwrap_err();
        assert!(err.is_insufficient_resources());
        assert_eq!(sub.num_available_nodes(), 2);
    }

    #[test]
    fn test_nodes_reports_full_block_even_while_allocated() {
        let mut sub = subcluster(2);
        let _held = sub.alloc(&ClusterSpec::simple_linux(1)).unwrap();
        assert_eq!(sub.nodes().len(), 2);
    }

    #[test]
    fn test_descriptor_round_trip_preserves_size() {
        let sub = subcluster(3);
        let rebuilt = FiniteSubcluster::from_descriptors(&sub.descriptors());
        assert_eq!(rebuilt.size(), 3);
        assert_eq!(rebuilt.all().size(), sub.all().size());
    }
}
