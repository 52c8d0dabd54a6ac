//! The supervisor: drives a whole test run.
//!
//! One [`TestRunner`] owns the cluster, the scheduler, and the IPC
//! receiver. Its run loop alternates between two duties:
//!
//! 1. **Trigger**: while there is parallel capacity and the largest
//!    schedulable test fits in the currently available nodes, carve a
//!    subcluster out of the cluster and spawn a worker for it.
//! 2. **Drain**: wait for the next worker event and route it — replying
//!    to READY with the session, test metadata, and node block; acking
//!    lifecycle events; relaying LOG lines; and on FINISHED, freeing the
//!    subcluster, applying the deflake policy, recording the result, and
//!    joining the worker process.
//!
//! The loop never holds an allocation and a receive in flight at once, so
//! a slow allocation cannot starve event draining beyond one iteration.
//!
//! # Failure policy
//!
//! | Failure | Treatment |
//! |---------|-----------|
//! | Allocation short on healthy nodes | Keep the test scheduled, retry after the next completion |
//! | Test bigger than the whole cluster | FAIL up front, before any worker exists |
//! | Worker FAIL with deflake budget left | Re-enqueue; final PASS records FLAKY |
//! | Receive timeout | Fatal: kill all workers, abort the run |
//! | SIGINT | Stop scheduling, let active tests drain |
//! | SIGTERM / shutdown handle | Kill workers, reclaim nodes, drain |
//! | Worker slow to exit after FINISHED | Kill, record TERMINATED |

pub mod client;
pub mod scheduler;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, ClusterError, FiniteSubcluster};
use crate::ipc::{self, Receiver};
use crate::report::{FileSummaryReporter, JsonReporter, Reporter};
use crate::session::SessionContext;
use crate::test::context::TestContext;
use crate::test::event::{Event, EventKind, EventReply, LogLevel};
use crate::test::result::{TestResult, TestResults, TestStatus};

pub use client::{WorkerArgs, run_worker, worker_main};
pub use scheduler::TestScheduler;
pub use worker::{InProcessSpawner, JoinOutcome, ProcessSpawner, WorkerHandle, WorkerSpawner};

/// Default patience for a worker exiting after its FINISHED event.
pub const DEFAULT_FINISH_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies one scheduled invocation: the same test id can appear more
/// than once (deflake re-runs), the index never repeats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestKey {
    pub test_id: String,
    pub test_index: usize,
}

/// Last known state of one worker, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Running,
    Finished,
    /// Killed after overstaying its join timeout.
    Terminated,
}

/// Per-worker diagnostics.
#[derive(Debug, Clone)]
pub struct ClientReportEntry {
    pub status: ClientStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Name of the last lifecycle event this worker sent.
    pub last_event: Option<&'static str>,
}

/// Supervises one session: scheduling, allocation, workers, results.
pub struct TestRunner {
    cluster: Box<dyn Cluster>,
    session: SessionContext,
    spawner: Box<dyn WorkerSpawner>,
    scheduler: TestScheduler,
    contexts: HashMap<String, TestContext>,
    reporters: Vec<Box<dyn Reporter>>,

    deflake_num: usize,
    finish_join_timeout: Duration,
    min_port: u16,
    max_port: u16,
    hostname: String,

    stop_testing: bool,
    test_counter: usize,
    total_tests: usize,
    active_tests: HashSet<TestKey>,
    client_procs: HashMap<TestKey, Box<dyn WorkerHandle>>,
    test_subclusters: HashMap<TestKey, FiniteSubcluster>,
    client_report: HashMap<TestKey, ClientReportEntry>,
    /// FAIL attempts so far, per test id, while deflake budget remains.
    fail_counts: HashMap<String, usize>,
    results: TestResults,
    schedule_log: Vec<TestKey>,
    shutdown: CancellationToken,
}

impl TestRunner {
    /// Creates a runner over `tests`, with file reporters writing into
    /// the session results directory.
    pub fn new(
        cluster: Box<dyn Cluster>,
        session: SessionContext,
        spawner: Box<dyn WorkerSpawner>,
        tests: Vec<TestContext>,
    ) -> Self {
        let scheduler = TestScheduler::new(tests.clone(), cluster.size());
        let contexts = tests
            .into_iter()
            .map(|ctx| (ctx.test_id(), ctx))
            .collect::<HashMap<_, _>>();
        let total_tests = scheduler.len();
        let (min_port, max_port) = ipc::port_range_from_env();
        let results = TestResults::new(session.session_id.as_str());
        let reporters: Vec<Box<dyn Reporter>> = vec![
            Box::new(FileSummaryReporter::new(&session.results_dir)),
            Box::new(JsonReporter::new(&session.results_dir)),
        ];
        Self {
            cluster,
            session,
            spawner,
            scheduler,
            contexts,
            reporters,
            deflake_num: 1,
            finish_join_timeout: DEFAULT_FINISH_JOIN_TIMEOUT,
            min_port,
            max_port,
            hostname: "localhost".to_string(),
            stop_testing: false,
            test_counter: 1,
            total_tests,
            active_tests: HashSet::new(),
            client_procs: HashMap::new(),
            test_subclusters: HashMap::new(),
            client_report: HashMap::new(),
            fail_counts: HashMap::new(),
            results,
            schedule_log: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Attempts per test: 1 means no retry, `k` means a FAIL may re-run
    /// up to `k` times total.
    pub fn with_deflake_num(mut self, deflake_num: usize) -> Self {
        self.deflake_num = deflake_num.max(1);
        self
    }

    pub fn with_finish_join_timeout(mut self, timeout: Duration) -> Self {
        self.finish_join_timeout = timeout;
        self
    }

    /// Overrides the receiver's bind range (normally taken from
    /// `TEST_DRIVER_MIN_PORT` / `TEST_DRIVER_MAX_PORT`).
    pub fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Adds a reporter alongside the default file reporters.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    /// Replaces the reporter set entirely.
    pub fn with_reporters(mut self, reporters: Vec<Box<dyn Reporter>>) -> Self {
        self.reporters = reporters;
        self
    }

    /// A handle that stops the run the way SIGTERM does: workers are
    /// killed and the loop drains.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The order invocations were started in.
    pub fn schedule_log(&self) -> &[TestKey] {
        &self.schedule_log
    }

    /// Per-worker diagnostics collected during the run.
    pub fn client_report(&self) -> &HashMap<TestKey, ClientReportEntry> {
        &self.client_report
    }

    /// Runs every scheduled test to completion and returns the results.
    ///
    /// Fatal errors (receive timeout, port exhaustion, bookkeeping
    /// corruption) abort the run after killing all workers; results
    /// already recorded are preserved on disk by the file reporters.
    pub async fn run_all_tests(&mut self) -> anyhow::Result<TestResults> {
        std::fs::create_dir_all(&self.session.results_dir)?;
        let mut receiver = Receiver::bind(self.min_port, self.max_port).await?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        self.results.start_time = Some(Utc::now());
        for reporter in &self.reporters {
            reporter.on_run_start(&self.session, self.total_tests).await;
        }

        // Tests bigger than the whole cluster fail before the first wait.
        self.check_unschedulable().await;

        info!(
            "starting test run with session id {}...",
            self.session.session_id
        );
        info!("running {} tests...", self.scheduler.len());

        let outcome = self.run_loop(&mut receiver, &mut sigterm, &mut sigint).await;

        let leftover: Vec<TestKey> = self.client_procs.keys().cloned().collect();
        if !leftover.is_empty() {
            warn!("{} workers still attached, joining...", leftover.len());
        }
        for key in leftover {
            self.join_test_process(key, self.finish_join_timeout).await;
        }

        receiver.close();
        self.results.stop_time = Some(Utc::now());
        for reporter in &self.reporters {
            reporter.on_run_complete(&self.results).await;
        }

        outcome?;
        Ok(self.results.clone())
    }

    async fn run_loop(
        &mut self,
        receiver: &mut Receiver,
        sigterm: &mut Signal,
        sigint: &mut Signal,
    ) -> anyhow::Result<()> {
        let shutdown = self.shutdown.clone();
        while self.ready_to_trigger_more_tests() || self.expect_client_requests() {
            while self.ready_to_trigger_more_tests() {
                let next = self
                    .scheduler
                    .peek(self.cluster.num_available_nodes(), self.cluster.size())
                    .cloned()
                    .expect("loop condition peeked a test");
                match self.preallocate_subcluster(&next) {
                    Ok(()) => {
                        self.scheduler.remove(&next);
                        self.run_single_test(next, receiver.port()).await;
                    }
                    Err(e) if e.is_insufficient_resources() => {
                        // Not enough healthy nodes right now. Another
                        // test finishing may free some; but the cluster
                        // may also have shrunk, so re-check for tests
                        // that can never run.
                        info!(
                            "couldn't allocate nodes for {} yet, will keep trying: {e}",
                            next.test_id()
                        );
                        self.check_unschedulable().await;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if self.expect_client_requests() {
                tokio::select! {
                    received = receiver.recv(self.session.test_runner_timeout) => {
                        match received {
                            Ok(event) => self.handle(event, receiver).await?,
                            Err(e) => {
                                // Everything runs on one machine; a dead
                                // channel means the run is unrecoverable.
                                error!("exception receiving message: {e}");
                                self.terminate_all_workers();
                                return Err(e.into());
                            }
                        }
                    }
                    _ = sigint.recv() => {
                        info!("received SIGINT, waiting for running tests to finish...");
                        self.stop_testing = true;
                    }
                    _ = sigterm.recv() => {
                        self.hard_stop("SIGTERM");
                    }
                    _ = shutdown.cancelled() => {
                        self.hard_stop("shutdown request");
                    }
                }
            }
        }
        Ok(())
    }

    /// Should we pull another test from the scheduler?
    fn ready_to_trigger_more_tests(&self) -> bool {
        !self.stop_testing
            && self.active_tests.len() < self.session.max_parallel
            && !self.scheduler.is_empty()
            && self
                .scheduler
                .peek(self.cluster.num_available_nodes(), self.cluster.size())
                .is_some()
    }

    fn expect_client_requests(&self) -> bool {
        !self.active_tests.is_empty()
    }

    /// Kill all workers and reclaim their nodes so the loop can drain
    /// without waiting on events that will never come.
    fn hard_stop(&mut self, reason: &str) {
        warn!("received {reason}: killing workers and draining");
        self.stop_testing = true;
        self.terminate_all_workers();
        for (key, subcluster) in self.test_subclusters.drain() {
            if let Err(e) = self.cluster.free(subcluster.into_nodes()) {
                warn!("error reclaiming nodes of {key:?}: {e}");
            }
        }
        self.active_tests.clear();
    }

    fn terminate_all_workers(&mut self) {
        for (key, proc) in self.client_procs.iter_mut() {
            debug!("killing worker {key:?}");
            proc.kill();
        }
    }

    /// Allocates the subcluster a test will run on. Stored keyed by the
    /// TestKey the test is about to get; the matching `free` happens in
    /// FINISHED handling (or on hard stop).
    fn preallocate_subcluster(&mut self, ctx: &TestContext) -> Result<(), ClusterError> {
        let spec = match ctx.expected_cluster_spec() {
            Some(spec) => spec,
            // no annotation: claim everything currently available
            None => self.cluster.available(),
        };
        let allocated = self.cluster.alloc(&spec)?;

        if self.cluster.num_available_nodes() == 0
            && self.session.max_parallel > 1
            && self.test_subclusters.is_empty()
        {
            warn!(
                "test {} is using the entire cluster. It's possible this test has no associated \
                 cluster metadata.",
                ctx.test_id()
            );
        }

        self.test_subclusters.insert(
            TestKey {
                test_id: ctx.test_id(),
                test_index: self.test_counter,
            },
            FiniteSubcluster::new(allocated),
        );
        Ok(())
    }

    /// Starts a worker for one test invocation.
    async fn run_single_test(&mut self, ctx: TestContext, port: u16) {
        let current = self.test_counter;
        self.test_counter += 1;
        info!("triggering test {current} of {}...", self.total_tests);

        let key = TestKey {
            test_id: ctx.test_id(),
            test_index: current,
        };
        self.active_tests.insert(key.clone());
        self.schedule_log.push(key.clone());

        for reporter in &self.reporters {
            reporter.on_test_start(&ctx, current).await;
        }

        let args = WorkerArgs {
            supervisor_host: self.hostname.clone(),
            supervisor_port: port,
            test_id: ctx.test_id(),
            test_index: current,
            logger_name: ctx.logger_name(&self.session.session_id, current),
            results_dir: ctx.results_dir(&self.session.results_dir, current),
            debug: self.session.debug,
            fail_bad_cluster_utilization: self.session.fail_bad_cluster_utilization,
            deflake_num: self.deflake_num,
        };

        match self.spawner.spawn(args).await {
            Ok(proc) => {
                self.client_report.insert(
                    key.clone(),
                    ClientReportEntry {
                        status: ClientStatus::Running,
                        pid: proc.pid(),
                        exit_code: None,
                        last_event: None,
                    },
                );
                self.client_procs.insert(key, proc);
            }
            Err(e) => {
                error!("failed to spawn worker for {}: {e:#}", ctx.test_id());
                self.active_tests.remove(&key);
                if let Some(subcluster) = self.test_subclusters.remove(&key) {
                    if let Err(free_err) = self.cluster.free(subcluster.into_nodes()) {
                        warn!("error reclaiming nodes after spawn failure: {free_err}");
                    }
                }
                let now = Utc::now();
                let result = TestResult::new(
                    &ctx,
                    current,
                    ctx.results_dir(&self.session.results_dir, current),
                    TestStatus::Fail,
                    format!("failed to spawn worker process: {e:#}"),
                    None,
                    now,
                    now,
                );
                self.record_result(result).await;
            }
        }
    }

    async fn handle(&mut self, event: Event, receiver: &mut Receiver) -> anyhow::Result<()> {
        debug!(
            source = %event.source_id,
            event_id = event.event_id,
            "handling {} from {}",
            event.kind.name(),
            event.test_id
        );
        let key = TestKey {
            test_id: event.test_id.clone(),
            test_index: event.test_index,
        };
        match &event.kind {
            EventKind::Ready { .. } => self.handle_ready(&event, &key, receiver)?,
            EventKind::SettingUp | EventKind::Running { .. } | EventKind::TearingDown => {
                receiver.send(EventReply::ack_for(&event))?;
                if let Some(entry) = self.client_report.get_mut(&key) {
                    entry.last_event = Some(event.kind.name());
                }
            }
            EventKind::Log { message, level } => {
                receiver.send(EventReply::ack_for(&event))?;
                match level {
                    LogLevel::Debug => debug!("{message}"),
                    LogLevel::Info => info!("{message}"),
                    LogLevel::Warn => warn!("{message}"),
                    LogLevel::Error => error!("{message}"),
                }
            }
            EventKind::Finished { result } => {
                let result = result.clone();
                receiver.send(EventReply::ack_for(&event))?;
                self.handle_finished(key, result).await?;
            }
        }
        Ok(())
    }

    fn handle_ready(
        &mut self,
        event: &Event,
        key: &TestKey,
        receiver: &mut Receiver,
    ) -> anyhow::Result<()> {
        let ctx = self.contexts.get(&event.test_id);
        let subcluster = self.test_subclusters.get(key);
        match (ctx, subcluster) {
            (Some(ctx), Some(subcluster)) => {
                receiver.send(EventReply::ready_for(
                    event,
                    self.session.clone(),
                    ctx.clone(),
                    subcluster.descriptors(),
                ))?;
            }
            _ => {
                // stale retry or a worker we already gave up on; a bare
                // ack makes it exit non-zero and get reaped
                warn!("READY from unknown test {key:?}");
                receiver.send(EventReply::ack_for(event))?;
            }
        }
        Ok(())
    }

    async fn handle_finished(&mut self, key: TestKey, result: TestResult) -> anyhow::Result<()> {
        if !self.active_tests.remove(&key) {
            warn!("duplicate FINISHED for {key:?}, ignoring");
            return Ok(());
        }

        if result.status == TestStatus::Fail && self.session.exit_first {
            info!("exit-first is set, stopping after this failure");
            self.stop_testing = true;
        }

        // exactly one free per FINISHED, before any further allocation
        if let Some(subcluster) = self.test_subclusters.remove(&key) {
            self.cluster.free(subcluster.into_nodes())?;
        }

        let attempts = self.fail_counts.get(&result.test_id).copied().unwrap_or(0) + 1;
        if result.status == TestStatus::Fail && attempts < self.deflake_num && !self.stop_testing {
            // bounded re-execution: only FAIL retries
            *self.fail_counts.entry(result.test_id.clone()).or_insert(0) += 1;
            if let Some(ctx) = self.contexts.get(&result.test_id).cloned() {
                info!(
                    "test {} failed attempt {attempts} of {}, re-running",
                    result.test_id, self.deflake_num
                );
                self.scheduler.put(ctx);
            }
        } else {
            let mut result = result;
            let had_failures = self.fail_counts.remove(&result.test_id).is_some();
            if had_failures && result.status == TestStatus::Pass {
                result.status = TestStatus::Flaky;
            }
            self.record_result(result).await;
        }

        self.join_test_process(key, self.finish_join_timeout).await;

        if self.should_print_separator() {
            info!("{}", "~".repeat(80));
        }
        Ok(())
    }

    /// Appends a result and pushes it (plus a partial snapshot) to the
    /// reporters, so partial reports survive a killed session.
    async fn record_result(&mut self, result: TestResult) {
        self.results.append(result.clone());
        for reporter in &self.reporters {
            reporter.on_test_complete(&result).await;
            reporter.on_snapshot(&self.results).await;
        }
    }

    /// Waits for a worker to exit; kills it when it overstays.
    async fn join_test_process(&mut self, key: TestKey, timeout: Duration) {
        let Some(mut proc) = self.client_procs.remove(&key) else {
            return;
        };
        match proc.join(timeout).await {
            JoinOutcome::Exited(exit_code) => {
                if let Some(entry) = self.client_report.get_mut(&key) {
                    entry.status = ClientStatus::Finished;
                    entry.exit_code = exit_code;
                }
            }
            JoinOutcome::TimedOut => {
                error!(
                    "after waiting {}s, worker for {key:?} failed to complete. Terminating...",
                    timeout.as_secs()
                );
                proc.kill();
                let exit_code = match proc.join(Duration::from_secs(5)).await {
                    JoinOutcome::Exited(code) => code,
                    JoinOutcome::TimedOut => None,
                };
                if let Some(entry) = self.client_report.get_mut(&key) {
                    entry.status = ClientStatus::Terminated;
                    entry.exit_code = exit_code;
                }
            }
        }
    }

    /// Drops and fails every test that can no longer fit in the whole
    /// cluster.
    async fn check_unschedulable(&mut self) {
        let total = self.cluster.all();
        let unschedulable = self.scheduler.filter_unschedulable_tests(&total);
        if unschedulable.is_empty() {
            return;
        }
        error!(
            "There are {} tests which cannot be run due to insufficient cluster resources",
            unschedulable.len()
        );
        for ctx in unschedulable {
            let shortfall = ctx
                .expected_cluster_spec()
                .and_then(|spec| total.capacity_shortfall(&spec))
                .unwrap_or_default();
            let msg = format!(
                "Test {} requires more resources than are available in the whole cluster. \
                 {shortfall}",
                ctx.test_id()
            );
            error!("{msg}");

            let current = self.test_counter;
            self.test_counter += 1;
            let now = Utc::now();
            let result = TestResult::new(
                &ctx,
                current,
                ctx.results_dir(&self.session.results_dir, current),
                TestStatus::Fail,
                msg,
                None,
                now,
                now,
            );
            self.record_result(result).await;
        }
    }

    /// The twiddle between sequential tests. Only sensible when output
    /// is not interleaved and more output is expected.
    fn should_print_separator(&self) -> bool {
        self.session.max_parallel == 1
            && (self.expect_client_requests() || self.ready_to_trigger_more_tests())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::cluster::{ClusterNode, LINUX, ProbedAccount, StaticAccount};
    use crate::marks::{ClusterUseMetadata, Mark};
    use crate::test::context::ArgMap;
    use crate::test::{RegisteredTest, Test, TestEnv, TestRegistry};

    struct FnTest<F>(F);

    impl<F> Test for FnTest<F>
    where
        F: FnMut(&mut TestEnv) -> anyhow::Result<Option<Value>> + Send,
    {
        fn run(&mut self, env: &mut TestEnv) -> anyhow::Result<Option<Value>> {
            (self.0)(env)
        }
    }

    fn registered<F>(function_name: &str, num_nodes: usize, body: F) -> RegisteredTest
    where
        F: Fn() -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        RegisteredTest::new(
            "harness_tests",
            "HarnessTest",
            function_name,
            Arc::new(move || {
                let body = body.clone();
                Box::new(FnTest(move |_env: &mut TestEnv| body())) as Box<dyn Test>
            }),
        )
        .with_mark(Mark::ClusterUse(ClusterUseMetadata::num_nodes(num_nodes)))
    }

    fn sleepy<F>(function_name: &str, num_nodes: usize, millis: u64, body: F) -> RegisteredTest
    where
        F: Fn() -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        registered(function_name, num_nodes, move || {
            std::thread::sleep(Duration::from_millis(millis));
            body()
        })
    }

    fn linux_nodes(count: usize) -> Vec<ClusterNode> {
        (0..count)
            .map(|i| ClusterNode::new(Arc::new(StaticAccount::new(format!("node{i}"), LINUX))))
            .collect()
    }

    fn session(results_dir: &std::path::Path, max_parallel: usize) -> SessionContext {
        SessionContext::new("test-session", results_dir)
            .with_max_parallel(max_parallel)
            .with_test_runner_timeout(Duration::from_secs(30))
    }

    fn runner_for(
        registry: TestRegistry,
        nodes: Vec<ClusterNode>,
        session: SessionContext,
    ) -> TestRunner {
        let registry = Arc::new(registry);
        let contexts = registry.expand_all(None).unwrap();
        TestRunner::new(
            Box::new(FiniteSubcluster::new(nodes)),
            session,
            Box::new(InProcessSpawner::new(registry)),
            contexts,
        )
        .with_finish_join_timeout(Duration::from_secs(5))
    }

    fn status_of<'a>(results: &'a TestResults, function_name: &str) -> &'a TestResult {
        results
            .iter()
            .find(|r| r.function_name == function_name)
            .unwrap_or_else(|| panic!("no result for {function_name}"))
    }

    /// Simple pass + ignore + ignore-with-args + fail.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_pass_ignore_and_fail_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(registered("test_pi", 1, || {
            Ok(Some(json!({"data": 3.14159})))
        }));
        registry.register(
            registered("test_ignore1", 1, || Ok(None)).with_mark(Mark::Ignore(None)),
        );
        registry.register(
            RegisteredTest::new(
                "harness_tests",
                "HarnessTest",
                "test_ignore2",
                Arc::new(|| Box::new(FnTest(|_: &mut TestEnv| Ok(None))) as Box<dyn Test>),
            )
            .with_mark(Mark::Parametrize(
                match json!({"x": 5}) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                },
            ))
            .with_mark(Mark::Ignore(Some(match json!({"x": 5}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            })))
            .with_mark(Mark::ClusterUse(ClusterUseMetadata::num_nodes(1))),
        );
        registry.register(registered("test_failure", 1, || {
            anyhow::bail!("this test should fail")
        }));

        let mut runner = runner_for(registry, linux_nodes(2), session(dir.path(), 2));
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(status_of(&results, "test_pi").status, TestStatus::Pass);
        assert_eq!(
            status_of(&results, "test_pi").data,
            Some(json!({"data": 3.14159}))
        );
        assert_eq!(
            status_of(&results, "test_ignore1").status,
            TestStatus::Ignore
        );
        assert_eq!(
            status_of(&results, "test_ignore2").status,
            TestStatus::Ignore
        );
        let failure = status_of(&results, "test_failure");
        assert_eq!(failure.status, TestStatus::Fail);
        assert!(failure.summary.contains("this test should fail"));
        assert!(!results.get_aggregate_success());
    }

    /// Deflake: FAIL then PASS records one FLAKY result.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_deflake_records_flaky() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = TestRegistry::new();
        let shared = attempts.clone();
        registry.register(registered("test_flaky", 1, move || {
            if shared.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first attempt fails")
            }
            Ok(None)
        }));

        let mut runner =
            runner_for(registry, linux_nodes(1), session(dir.path(), 1)).with_deflake_num(2);
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(status_of(&results, "test_flaky").status, TestStatus::Flaky);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(results.get_aggregate_success());
    }

    /// Deflake exhausted: FAIL on every attempt stays FAIL.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_deflake_exhausted_stays_fail() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = TestRegistry::new();
        let shared = attempts.clone();
        registry.register(registered("test_hopeless", 1, move || {
            shared.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        }));

        let mut runner =
            runner_for(registry, linux_nodes(1), session(dir.path(), 1)).with_deflake_num(3);
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(
            status_of(&results, "test_hopeless").status,
            TestStatus::Fail
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    /// A spawner that counts how many workers were actually created.
    struct CountingSpawner {
        inner: InProcessSpawner,
        spawned: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl WorkerSpawner for CountingSpawner {
        async fn spawn(&self, args: WorkerArgs) -> anyhow::Result<Box<dyn WorkerHandle>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.inner.spawn(args).await
        }
    }

    /// Over-requested cluster: FAIL before any worker is spawned.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_test_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(registered("test_huge", 10, || Ok(None)));

        let registry = Arc::new(registry);
        let contexts = registry.expand_all(None).unwrap();
        let spawned = Arc::new(AtomicUsize::new(0));
        let mut runner = TestRunner::new(
            Box::new(FiniteSubcluster::new(linux_nodes(2))),
            session(dir.path(), 1),
            Box::new(CountingSpawner {
                inner: InProcessSpawner::new(registry),
                spawned: spawned.clone(),
            }),
            contexts,
        );
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 1);
        let failure = status_of(&results, "test_huge");
        assert_eq!(failure.status, TestStatus::Fail);
        assert!(failure.summary.contains("requires more resources"));
        assert!(failure.summary.contains("requested: 10"));
        assert_eq!(spawned.load(Ordering::SeqCst), 0, "no worker may be spawned");
    }

    /// Cluster shrink during the run: a node fails its health check on
    /// the second allocation; the 3-node test is deferred, the 2-node
    /// tests slot in, and the deferred test runs after the slow one
    /// completes.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_cluster_shrink_defers_then_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(sleepy("test_slow3", 3, 1500, || Ok(None)));
        registry.register(sleepy("test_fast3", 3, 100, || Ok(None)));
        registry.register(sleepy("test_two_a", 2, 100, || Ok(None)));
        registry.register(sleepy("test_two_b", 2, 100, || Ok(None)));

        // six nodes; node3 reports unhealthy, so it is probed (and
        // retired) by the second allocation
        let mut nodes = linux_nodes(3);
        nodes.push(ClusterNode::new(Arc::new(ProbedAccount::new(
            "node3",
            LINUX,
            Arc::new(|| false),
        ))));
        nodes.extend((4..6).map(|i| {
            ClusterNode::new(Arc::new(StaticAccount::new(format!("node{i}"), LINUX)))
        }));

        let mut runner = runner_for(registry, nodes, session(dir.path(), 4));
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 4);
        for result in results.iter() {
            assert_eq!(result.status, TestStatus::Pass, "{} failed", result.test_id);
        }

        let order: Vec<&str> = runner
            .schedule_log()
            .iter()
            .map(|key| {
                ["test_slow3", "test_fast3", "test_two_a", "test_two_b"]
                    .into_iter()
                    .find(|name| key.test_id.contains(name))
                    .unwrap()
            })
            .collect();
        assert_eq!(
            order,
            vec!["test_slow3", "test_two_a", "test_two_b", "test_fast3"]
        );
    }

    /// Hard shutdown mid-run behaves like SIGTERM: the long test's worker
    /// is killed and only tests that FINISHED beforehand have results.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_keeps_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(sleepy("test_quick", 1, 50, || Ok(None)));
        registry.register(sleepy("test_long", 1, 2000, || Ok(None)));

        let mut runner = runner_for(registry, linux_nodes(2), session(dir.path(), 2))
            .with_finish_join_timeout(Duration::from_millis(200));
        let shutdown = runner.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            shutdown.cancel();
        });

        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(status_of(&results, "test_quick").status, TestStatus::Pass);

        // the partial report on disk matches
        let raw = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["results"].as_array().unwrap().len(), 1);
    }

    /// A worker that never connects makes the receive wait expire, which
    /// is fatal for the run.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_recv_timeout_is_fatal() {
        struct MuteSpawner;

        struct MuteWorker {
            handle: tokio::task::JoinHandle<i32>,
        }

        #[async_trait::async_trait]
        impl WorkerHandle for MuteWorker {
            fn pid(&self) -> Option<u32> {
                None
            }
            fn kill(&mut self) {
                self.handle.abort();
            }
            async fn join(&mut self, timeout: Duration) -> JoinOutcome {
                match tokio::time::timeout(timeout, &mut self.handle).await {
                    Ok(_) => JoinOutcome::Exited(None),
                    Err(_) => JoinOutcome::TimedOut,
                }
            }
        }

        #[async_trait::async_trait]
        impl WorkerSpawner for MuteSpawner {
            async fn spawn(&self, _args: WorkerArgs) -> anyhow::Result<Box<dyn WorkerHandle>> {
                let handle = tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    0
                });
                Ok(Box::new(MuteWorker { handle }))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(registered("test_mute", 1, || Ok(None)));
        let contexts = registry.expand_all(None).unwrap();

        let mut runner = TestRunner::new(
            Box::new(FiniteSubcluster::new(linux_nodes(1))),
            session(dir.path(), 1).with_test_runner_timeout(Duration::from_millis(200)),
            Box::new(MuteSpawner),
            contexts,
        )
        .with_finish_join_timeout(Duration::from_millis(100));

        let err = runner.run_all_tests().await.unwrap_err();
        assert!(err.to_string().contains("unresponsive"));
    }

    /// A test annotated with zero nodes schedules immediately and never
    /// allocates, even on an empty cluster.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_node_test_runs_on_empty_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(registered("test_zero", 0, || Ok(None)));

        let mut runner = runner_for(registry, vec![], session(dir.path(), 1));
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(status_of(&results, "test_zero").status, TestStatus::Pass);
    }

    /// With max_parallel = 1, result order equals schedule order.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_sequential_run_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(registered("test_one", 1, || Ok(None)));
        registry.register(registered("test_two", 1, || Ok(None)));
        registry.register(registered("test_three", 1, || Ok(None)));

        let mut runner = runner_for(registry, linux_nodes(1), session(dir.path(), 1));
        let results = runner.run_all_tests().await.unwrap();

        let result_order: Vec<&str> = results
            .iter()
            .map(|r| r.function_name.as_str())
            .collect();
        assert_eq!(result_order, vec!["test_one", "test_two", "test_three"]);
        let schedule_order: Vec<String> = runner
            .schedule_log()
            .iter()
            .map(|k| k.test_id.clone())
            .collect();
        assert_eq!(
            schedule_order,
            results.iter().map(|r| r.test_id.clone()).collect::<Vec<_>>()
        );
    }

    /// exit_first stops scheduling after the first FAIL.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_exit_first_stops_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TestRegistry::new();
        registry.register(registered("test_bad", 1, || anyhow::bail!("boom")));
        registry.register(registered("test_never_runs", 1, || Ok(None)));

        let mut runner = runner_for(
            registry,
            linux_nodes(1),
            session(dir.path(), 1).with_exit_first(true),
        );
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(status_of(&results, "test_bad").status, TestStatus::Fail);
    }

    /// The injected-args expansion flows through the worker and back into
    /// the result.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_parametrized_args_reach_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let args: ArgMap = match json!({"x": 7}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let mut registry = TestRegistry::new();
        registry.register(
            RegisteredTest::new(
                "harness_tests",
                "HarnessTest",
                "test_args",
                Arc::new(|| {
                    Box::new(FnTest(|env: &mut TestEnv| {
                        let x: u64 = env.arg("x").expect("x injected");
                        Ok(Some(json!({"seen": x})))
                    })) as Box<dyn Test>
                }),
            )
            .with_mark(Mark::Parametrize(args))
            .with_mark(Mark::ClusterUse(ClusterUseMetadata::num_nodes(1))),
        );

        let mut runner = runner_for(registry, linux_nodes(1), session(dir.path(), 1));
        let results = runner.run_all_tests().await.unwrap();

        assert_eq!(results.len(), 1);
        let result = status_of(&results, "test_args");
        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.data, Some(json!({"seen": 7})));
        assert_eq!(result.injected_args.get("x"), Some(&json!(7)));
        assert!(result.test_id.contains(r#"{"x":7}"#));
    }
}
