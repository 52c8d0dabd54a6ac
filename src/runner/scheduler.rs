//! On-demand, largest-first ordering of pending tests.
//!
//! The scheduler holds every test still waiting to run, sorted from the
//! largest cluster user down. `peek` returns the first test that fits in
//! the nodes available right now — so big tests go first when they can,
//! and small tests fill the gaps, which minimizes head-of-line blocking
//! when tests run in parallel.

use crate::cluster::ClusterSpec;
use crate::test::context::TestContext;

struct ScheduledTest {
    ctx: TestContext,
    /// `None` for an unannotated test, which claims the whole cluster.
    expected_nodes: Option<usize>,
    /// Fixed sort key; claim-all tests sort as the initial cluster size.
    sort_key: usize,
}

/// Tracks tests scheduled to run and orders them against the current
/// cluster state.
pub struct TestScheduler {
    entries: Vec<ScheduledTest>,
    initial_cluster_size: usize,
}

impl TestScheduler {
    /// Creates a scheduler over `tests`, sorted largest-first. Ties keep
    /// the input (loader) order.
    pub fn new(tests: Vec<TestContext>, initial_cluster_size: usize) -> Self {
        let mut scheduler = Self {
            entries: Vec::new(),
            initial_cluster_size,
        };
        for ctx in tests {
            scheduler.entries.push(scheduler.entry_for(ctx));
        }
        scheduler.sort();
        scheduler
    }

    fn entry_for(&self, ctx: TestContext) -> ScheduledTest {
        let expected_nodes = ctx.expected_cluster_spec().map(|spec| spec.size());
        ScheduledTest {
            ctx,
            expected_nodes,
            sort_key: expected_nodes.unwrap_or(self.initial_cluster_size),
        }
    }

    fn sort(&mut self) {
        // stable: equal-sized tests stay in insertion order
        self.entries
            .sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The largest pending test that fits in `num_available` nodes, or
    /// `None` when nothing currently fits.
    ///
    /// # Panics
    ///
    /// Panics when the scheduler is empty; callers check `is_empty`
    /// first.
    pub fn peek(&self, num_available: usize, cluster_size: usize) -> Option<&TestContext> {
        assert!(!self.is_empty(), "no more tests available");
        self.entries
            .iter()
            .find(|entry| entry.expected_nodes.unwrap_or(cluster_size) <= num_available)
            .map(|entry| &entry.ctx)
    }

    /// Removes and returns what `peek` would return.
    pub fn next(&mut self, num_available: usize, cluster_size: usize) -> Option<TestContext> {
        let test_id = self.peek(num_available, cluster_size)?.test_id();
        self.remove_by_id(&test_id)
    }

    /// Removes a specific test by exact identity. Returns it, or `None`
    /// when it was not scheduled.
    pub fn remove(&mut self, ctx: &TestContext) -> Option<TestContext> {
        self.remove_by_id(&ctx.test_id())
    }

    fn remove_by_id(&mut self, test_id: &str) -> Option<TestContext> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.ctx.test_id() == test_id)?;
        Some(self.entries.remove(idx).ctx)
    }

    /// Enqueues a test (or re-enqueues one for a deflake attempt).
    pub fn put(&mut self, ctx: TestContext) {
        let entry = self.entry_for(ctx);
        self.entries.push(entry);
        self.sort();
    }

    /// Removes and returns every test whose requirement exceeds the
    /// cluster's total capacity — tests that can never run. Called after
    /// allocation failures, when the cluster may have shrunk.
    pub fn filter_unschedulable_tests(&mut self, cluster_total: &ClusterSpec) -> Vec<TestContext> {
        let mut unschedulable = Vec::new();
        let mut remaining = Vec::new();
        for entry in self.entries.drain(..) {
            let impossible = match entry.ctx.expected_cluster_spec() {
                Some(spec) => cluster_total.capacity_shortfall(&spec).is_some(),
                // a claim-all test takes whatever the cluster has
                None => false,
            };
            if impossible {
                unschedulable.push(entry.ctx);
            } else {
                remaining.push(entry);
            }
        }
        self.entries = remaining;
        unschedulable
    }
}
