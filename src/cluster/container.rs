//! Per-OS bucketed pool of nodes and the allocation primitive.
//!
//! [`NodeContainer`] is the data structure behind every cluster
//! implementation: nodes grouped by operating system, FIFO within each
//! bucket. The one non-trivial operation is [`remove_spec`], which pulls a
//! [`ClusterSpec`]'s worth of nodes out of the container, health-checking
//! each candidate, and rolls the container back to its prior state when
//! there are not enough healthy nodes.
//!
//! # Failure modes
//!
//! | Error | Meaning | Container state |
//! |-------|---------|-----------------|
//! | [`ClusterError::InsufficientResources`] | Not enough total nodes of some OS/type; allocation was never attempted | Unchanged |
//! | [`ClusterError::InsufficientHealthyNodes`] | Enough nodes on paper, but health checks failed too many | Good nodes returned; bad nodes removed and handed to the caller |
//!
//! Bad nodes are never put back: the caller decides whether to retire
//! them. That keeps a failed allocation from leaking partial state while
//! still surfacing every node that flunked its probe.
//!
//! [`remove_spec`]: NodeContainer::remove_spec

use std::collections::{BTreeMap, VecDeque};

use super::ClusterError;
use super::node::ClusterNode;
use super::spec::{ClusterSpec, NodeSpec};

/// Nodes bucketed by operating system, FIFO within each bucket.
#[derive(Debug, Clone, Default)]
pub struct NodeContainer {
    os_to_nodes: BTreeMap<String, VecDeque<ClusterNode>>,
}

impl NodeContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = ClusterNode>) -> Self {
        let mut container = Self::new();
        container.add_nodes(nodes);
        container
    }

    /// Total node count across all buckets.
    pub fn size(&self) -> usize {
        self.os_to_nodes.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Iterates over the contained nodes, optionally restricted to one
    /// operating system. Restartable; yields nodes in bucket order.
    pub fn elements(&self, operating_system: Option<&str>) -> impl Iterator<Item = &ClusterNode> {
        self.os_to_nodes
            .iter()
            .filter(move |(os, _)| operating_system.is_none_or(|wanted| wanted == os.as_str()))
            .flat_map(|(_, nodes)| nodes.iter())
    }

    /// Appends a node to the back of its OS bucket.
    pub fn add_node(&mut self, node: ClusterNode) {
        self.os_to_nodes
            .entry(node.operating_system().to_string())
            .or_default()
            .push_back(node);
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = ClusterNode>) {
        for node in nodes {
            self.add_node(node);
        }
    }

    /// Removes a node by identity.
    pub fn remove_node(&mut self, node: &ClusterNode) -> Result<ClusterNode, ClusterError> {
        let bucket = self
            .os_to_nodes
            .get_mut(node.operating_system())
            .ok_or_else(|| ClusterError::NodeNotPresent(node.name().to_string()))?;
        let idx = bucket
            .iter()
            .position(|candidate| candidate == node)
            .ok_or_else(|| ClusterError::NodeNotPresent(node.name().to_string()))?;
        Ok(bucket.remove(idx).expect("index from position"))
    }

    pub fn remove_nodes(
        &mut self,
        nodes: impl IntoIterator<Item = ClusterNode>,
    ) -> Result<(), ClusterError> {
        for node in nodes {
            self.remove_node(&node)?;
        }
        Ok(())
    }

    /// Pure capacity predicate: could `spec` be removed, ignoring health?
    pub fn can_remove_spec(&self, spec: &ClusterSpec) -> bool {
        self.attempt_remove_spec(spec).is_empty()
    }

    /// Capacity check without mutation. Returns an empty string when the
    /// spec fits, otherwise a human-readable message naming each
    /// shortfall. Health is not consulted.
    pub fn attempt_remove_spec(&self, spec: &ClusterSpec) -> String {
        let mut msg = String::new();
        for (os, requests) in group_by_os(spec) {
            let bucket = self.os_to_nodes.get(os);
            let total_avail = bucket.map_or(0, VecDeque::len);
            if total_avail < requests.len() {
                msg.push_str(&format!(
                    "{os} nodes requested: {}. {os} nodes available: {total_avail}. ",
                    requests.len()
                ));
                continue;
            }
            // Typed requests additionally need enough nodes of their exact type.
            let mut typed: BTreeMap<&str, usize> = BTreeMap::new();
            for request in &requests {
                if let Some(t) = request.node_type.as_deref() {
                    *typed.entry(t).or_insert(0) += 1;
                }
            }
            for (node_type, needed) in typed {
                let avail = bucket.map_or(0, |nodes| {
                    nodes
                        .iter()
                        .filter(|n| n.node_type() == Some(node_type))
                        .count()
                });
                if avail < needed {
                    msg.push_str(&format!(
                        "{os} nodes of type {node_type} requested: {needed}. \
                         {os} nodes of type {node_type} available: {avail}. "
                    ));
                }
            }
        }
        msg
    }

    /// Removes a spec's worth of nodes, health-checking each candidate.
    ///
    /// Returns `(good, bad)`: the allocated nodes and any nodes that
    /// failed their health probe along the way. Bad nodes are removed
    /// from the container in every outcome; on failure the good nodes are
    /// rolled back in, so a failed call never leaks partial state.
    pub fn remove_spec(
        &mut self,
        spec: &ClusterSpec,
    ) -> Result<(Vec<ClusterNode>, Vec<ClusterNode>), ClusterError> {
        let err = self.attempt_remove_spec(spec);
        if !err.is_empty() {
            return Err(ClusterError::InsufficientResources(err));
        }

        let mut good_nodes = Vec::new();
        let mut bad_nodes = Vec::new();
        let mut msg = String::new();

        for (os, mut requests) in group_by_os(spec) {
            // Satisfy typed requests before untyped ones so an "any type"
            // request never steals the last node of a required type.
            requests.sort_by_key(|r| r.node_type.is_none());

            let Some(bucket) = self.os_to_nodes.get_mut(os) else {
                continue;
            };
            let mut good_per_os = Vec::new();
            for request in &requests {
                loop {
                    let idx = bucket
                        .iter()
                        .position(|node| request.matches(&node.node_spec()));
                    let Some(idx) = idx else { break };
                    let node = bucket.remove(idx).expect("index from position");
                    if node.is_healthy() {
                        good_per_os.push(node);
                        break;
                    }
                    bad_nodes.push(node);
                }
            }
            if good_per_os.len() < requests.len() {
                msg.push_str(&format!(
                    "{os} nodes requested: {}. Healthy {os} nodes available: {}. ",
                    requests.len(),
                    good_per_os.len()
                ));
            }
            good_nodes.append(&mut good_per_os);
        }

        if !msg.is_empty() {
            for node in good_nodes {
                self.add_node(node);
            }
            return Err(ClusterError::InsufficientHealthyNodes {
                message: msg,
                bad_nodes,
            });
        }

        Ok((good_nodes, bad_nodes))
    }
}

fn group_by_os(spec: &ClusterSpec) -> BTreeMap<&str, Vec<&NodeSpec>> {
    let mut by_os: BTreeMap<&str, Vec<&NodeSpec>> = BTreeMap::new();
    for node_spec in spec.iter() {
        by_os
            .entry(node_spec.operating_system.as_str())
            .or_default()
            .push(node_spec);
    }
    by_os
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::cluster::node::{ProbedAccount, StaticAccount};
    use crate::cluster::spec::{LINUX, WINDOWS};

    fn node(name: &str, os: &str) -> ClusterNode {
        ClusterNode::new(Arc::new(StaticAccount::new(name, os)))
    }

    fn sick_node(name: &str, healthy: Arc<AtomicBool>) -> ClusterNode {
        ClusterNode::new(Arc::new(ProbedAccount::new(
            name,
            LINUX,
            Arc::new(move || healthy.load(Ordering::SeqCst)),
        )))
    }

    #[test]
    fn test_size_and_elements() {
        let container = NodeContainer::from_nodes(vec![
            node("l1", LINUX),
            node("l2", LINUX),
            node("w1", WINDOWS),
        ]);
        assert_eq!(container.size(), 3);
        assert_eq!(container.elements(None).count(), 3);
        assert_eq!(container.elements(Some(LINUX)).count(), 2);
        assert_eq!(container.elements(Some(WINDOWS)).count(), 1);
        // restartable
        assert_eq!(container.elements(Some(LINUX)).count(), 2);
    }

    #[test]
    fn test_remove_node_absent_fails() {
        let mut container = NodeContainer::from_nodes(vec![node("l1", LINUX)]);
        let err = container.remove_node(&node("ghost", LINUX)).unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotPresent(_)));
        assert_eq!(container.size(), 1);
    }

    #[test]
    fn test_remove_spec_fifo_order() {
        let mut container =
            NodeContainer::from_nodes(vec![node("l1", LINUX), node("l2", LINUX), node("l3", LINUX)]);
        let (good, bad) = container.remove_spec(&ClusterSpec::simple_linux(2)).unwrap();
        assert!(bad.is_empty());
        let names: Vec<_> = good.iter().map(ClusterNode::name).collect();
        assert_eq!(names, vec!["l1", "l2"]);
        assert_eq!(container.size(), 1);
    }

    #[test]
    fn test_remove_spec_insufficient_total_does_not_mutate() {
        let mut container = NodeContainer::from_nodes(vec![node("l1", LINUX)]);
        let err = container
            .remove_spec(&ClusterSpec::simple_linux(3))
            .unwrap_err();
        assert!(matches!(err, ClusterError::InsufficientResources(_)));
        assert_eq!(container.size(), 1);
    }

    #[test]
    fn test_remove_spec_skips_bad_nodes() {
        let dead = Arc::new(AtomicBool::new(false));
        let mut container = NodeContainer::from_nodes(vec![
            sick_node("bad1", dead.clone()),
            node("l1", LINUX),
            node("l2", LINUX),
        ]);
        let (good, bad) = container.remove_spec(&ClusterSpec::simple_linux(2)).unwrap();
        assert_eq!(good.len(), 2);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].name(), "bad1");
        assert_eq!(container.size(), 0);
    }

    #[test]
    fn test_remove_spec_rolls_back_on_unhealthy_shortfall() {
        let dead = Arc::new(AtomicBool::new(false));
        let mut container = NodeContainer::from_nodes(vec![
            node("l1", LINUX),
            sick_node("bad1", dead.clone()),
            sick_node("bad2", dead.clone()),
        ]);
        let err = container
            .remove_spec(&ClusterSpec::simple_linux(2))
            .unwrap_err();
        match err {
            ClusterError::InsufficientHealthyNodes { bad_nodes, message } => {
                assert_eq!(bad_nodes.len(), 2);
                assert!(message.contains("Healthy"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // good node rolled back, bad nodes gone for the caller to retire
        assert_eq!(container.size(), 1);
        assert_eq!(container.elements(None).next().unwrap().name(), "l1");
    }

    #[test]
    fn test_attempt_then_remove_never_insufficient_resources() {
        let dead = Arc::new(AtomicBool::new(false));
        let mut container =
            NodeContainer::from_nodes(vec![node("l1", LINUX), sick_node("bad1", dead)]);
        let spec = ClusterSpec::simple_linux(2);
        assert_eq!(container.attempt_remove_spec(&spec), "");
        let err = container.remove_spec(&spec).unwrap_err();
        assert!(matches!(err, ClusterError::InsufficientHealthyNodes { .. }));
    }

    #[test]
    fn test_typed_requests_reserved_from_any_type() {
        let mut container = NodeContainer::from_nodes(vec![
            node("plain", LINUX),
            node("big", LINUX).with_node_type("large"),
        ]);
        // one "any" node plus one "large" node: the typed request must win
        // the large node even though the untyped one was added first
        let spec = ClusterSpec::simple_linux(1).add(ClusterSpec::simple_linux_of_type(1, "large"));
        let (good, _) = container.remove_spec(&spec).unwrap();
        assert_eq!(good.len(), 2);
        assert!(good.iter().any(|n| n.node_type() == Some("large")));
    }

    #[test]
    fn test_attempt_remove_spec_reports_type_shortfall() {
        let container = NodeContainer::from_nodes(vec![node("plain", LINUX)]);
        let msg = container.attempt_remove_spec(&ClusterSpec::simple_linux_of_type(1, "large"));
        assert!(msg.contains("type large"));
    }

    #[test]
    fn test_empty_spec_is_always_removable() {
        let mut container = NodeContainer::new();
        assert!(container.can_remove_spec(&ClusterSpec::empty()));
        let (good, bad) = container.remove_spec(&ClusterSpec::empty()).unwrap();
        assert!(good.is_empty());
        assert!(bad.is_empty());
    }
}
