//! The worker side: run one test and report back.
//!
//! A worker owns exactly one test invocation. It connects to the
//! supervisor, announces READY, and receives everything it needs in the
//! reply: the session context, its test's metadata, and the node block it
//! may use. It then walks the lifecycle —
//! `RUNNING → SETTING_UP → run → TEARING_DOWN → FINISHED` — streaming LOG
//! events throughout, and exits.
//!
//! Test phases are synchronous and run off the async runtime; panics and
//! errors are translated into a FAIL result with a truncated backtrace,
//! and teardown always runs, one isolated step at a time.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::{Cluster, FiniteSubcluster, NodeDescriptor};
use crate::ipc::Sender;
use crate::session::SessionContext;
use crate::test::context::TestContext;
use crate::test::event::{Event, EventFactory, EventReply, LogLevel};
use crate::test::result::{TestResult, TestStatus};
use crate::test::{Test, TestEnv, TestRegistry, WorkerLogger};

/// Frames kept when a failure's backtrace lands in the result summary.
const MAX_TRACEBACK_FRAMES: usize = 16;

const WORKER_SUBCOMMAND: &str = "drover-worker";

/// The argv contract for a spawned worker process.
#[derive(Debug, Clone, Parser)]
#[command(name = WORKER_SUBCOMMAND, disable_help_flag = true)]
pub struct WorkerArgs {
    #[arg(long)]
    pub supervisor_host: String,

    #[arg(long)]
    pub supervisor_port: u16,

    #[arg(long)]
    pub test_id: String,

    #[arg(long)]
    pub test_index: usize,

    #[arg(long)]
    pub logger_name: String,

    #[arg(long)]
    pub results_dir: PathBuf,

    #[arg(long)]
    pub debug: bool,

    #[arg(long)]
    pub fail_bad_cluster_utilization: bool,

    #[arg(long, default_value_t = 1)]
    pub deflake_num: usize,
}

impl WorkerArgs {
    /// Argv marker an embedding binary dispatches on.
    pub const SUBCOMMAND: &'static str = WORKER_SUBCOMMAND;

    /// Renders the argv a spawner passes to the worker process (without
    /// the subcommand marker).
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "--supervisor-host".to_string(),
            self.supervisor_host.clone(),
            "--supervisor-port".to_string(),
            self.supervisor_port.to_string(),
            "--test-id".to_string(),
            self.test_id.clone(),
            "--test-index".to_string(),
            self.test_index.to_string(),
            "--logger-name".to_string(),
            self.logger_name.clone(),
            "--results-dir".to_string(),
            self.results_dir.display().to_string(),
            "--deflake-num".to_string(),
            self.deflake_num.to_string(),
        ];
        if self.debug {
            argv.push("--debug".to_string());
        }
        if self.fail_bad_cluster_utilization {
            argv.push("--fail-bad-cluster-utilization".to_string());
        }
        argv
    }
}

/// Process entry point for worker re-execution.
///
/// The embedding binary calls this when its argv starts with
/// [`WorkerArgs::SUBCOMMAND`], passing the same registry it would hand
/// to the supervisor. Installs a SIGTERM handler that cancels the test
/// cooperatively, runs the client, and returns the process exit code.
pub async fn worker_main(registry: Arc<TestRegistry>) -> i32 {
    let args = match WorkerArgs::try_parse_from(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("bad worker argv: {e}");
            return 2;
        }
    };

    let cancel = CancellationToken::new();
    let sigterm_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("could not install SIGTERM handler: {e}");
                return;
            }
        };
        sigterm.recv().await;
        sigterm_cancel.cancel();
    });

    run_worker_with_cancel(registry, args, cancel).await
}

/// Runs one worker to completion, returning its exit code.
pub async fn run_worker(registry: Arc<TestRegistry>, args: WorkerArgs) -> i32 {
    run_worker_with_cancel(registry, args, CancellationToken::new()).await
}

/// Like [`run_worker`], with an externally controlled cancellation token.
/// Cancellation is cooperative: it is observed at phase boundaries.
pub async fn run_worker_with_cancel(
    registry: Arc<TestRegistry>,
    args: WorkerArgs,
    cancel: CancellationToken,
) -> i32 {
    let client = match RunnerClient::connect(registry, args, cancel).await {
        Ok(client) => client,
        Err(e) => {
            error!("worker failed before READY completed: {e:#}");
            return 1;
        }
    };
    match client.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("worker failed: {e:#}");
            1
        }
    }
}

/// Runs a single test.
struct RunnerClient {
    registry: Arc<TestRegistry>,
    args: WorkerArgs,
    factory: EventFactory,
    sender: Sender,
    session: SessionContext,
    ctx: TestContext,
    descriptors: Vec<NodeDescriptor>,
    cancel: CancellationToken,
}

impl RunnerClient {
    /// Announces READY and absorbs the supervisor's reply.
    async fn connect(
        registry: Arc<TestRegistry>,
        args: WorkerArgs,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let factory = EventFactory::new(&args.test_id, args.test_index);
        let mut sender = Sender::new(
            args.supervisor_host.clone(),
            args.supervisor_port,
            factory.clone(),
        );

        let reply = sender.send(factory.ready()).await?;
        let payload = reply
            .ready
            .context("READY reply carried no session payload")?;

        Ok(Self {
            registry,
            args,
            factory,
            sender,
            session: payload.session_context,
            ctx: payload.test_metadata,
            descriptors: payload.cluster,
            cancel,
        })
    }

    async fn run(mut self) -> anyhow::Result<()> {
        info!(
            logger = %self.args.logger_name,
            deflake_budget = self.args.deflake_num,
            "loading test {}",
            self.ctx.test_id()
        );

        self.send(self.factory.running()).await?;

        if self.ctx.ignore {
            let now = Utc::now();
            let result = TestResult::new(
                &self.ctx,
                self.args.test_index,
                self.args.results_dir.clone(),
                TestStatus::Ignore,
                "",
                None,
                now,
                now,
            );
            self.send(self.factory.finished(result)).await?;
            return Ok(());
        }

        std::fs::create_dir_all(&self.args.results_dir)
            .with_context(|| format!("creating {}", self.args.results_dir.display()))?;

        let start_time = Utc::now();
        let mut status = TestStatus::Pass;
        let mut summary = String::new();
        let mut data: Option<Value> = None;

        let subcluster = FiniteSubcluster::from_descriptors(&self.descriptors);
        if let Some(expected) = self.ctx.expected_cluster_spec()
            && let Some(shortfall) = subcluster.all().capacity_shortfall(&expected)
        {
            status = TestStatus::Fail;
            summary = format!(
                "There are not enough nodes available in the cluster to run this test. {shortfall}"
            );
        }

        let registered = self
            .registry
            .find(&self.ctx.module, &self.ctx.cls_name, &self.ctx.function_name);
        if status == TestStatus::Pass && registered.is_none() {
            status = TestStatus::Fail;
            summary = format!("test {} is not registered in this worker", self.ctx.test_id());
        }

        if let Some(registered) = registered.filter(|_| status == TestStatus::Pass) {
            let (log_tx, mut log_rx) = mpsc::unbounded_channel();
            let env = TestEnv::new(
                subcluster,
                self.ctx.injected_args.clone(),
                WorkerLogger::new(log_tx),
            );
            let test = (registered.factory)();

            // setup
            self.send(self.factory.setting_up()).await?;
            self.log(LogLevel::Info, "setting up").await;
            let (test, env, outcome) = self
                .run_phase(test, env, &mut log_rx, |test, env| {
                    test.setup(env).map(|()| None)
                })
                .await?;
            if let Err(e) = outcome {
                status = TestStatus::Fail;
                summary.push_str(&e);
            }

            // test body
            let (test, env) = if status == TestStatus::Pass && !self.cancelled(&mut status, &mut summary) {
                self.log(LogLevel::Info, "running").await;
                let (test, env, outcome) = self
                    .run_phase(test, env, &mut log_rx, |test, env| test.run(env))
                    .await?;
                match outcome {
                    Ok(returned) => {
                        data = returned;
                        self.log(LogLevel::Info, "PASS").await;
                    }
                    Err(e) => {
                        status = TestStatus::Fail;
                        summary.push_str(&e);
                        self.log(LogLevel::Info, format!("FAIL: {e}")).await;
                    }
                }
                (test, env)
            } else {
                (test, env)
            };

            // teardown, every step isolated
            self.send(self.factory.tearing_down()).await?;
            self.log(LogLevel::Info, "tearing down").await;
            let teardown_services = !self.session.no_teardown;
            let env = if teardown_services {
                let (_test, env, outcome) = self
                    .run_phase(test, env, &mut log_rx, |test, env| {
                        test.teardown(env).map(|()| None)
                    })
                    .await?;
                if let Err(e) = outcome {
                    warn!("error running teardown method: {e}");
                    summary.push('\n');
                    summary.push_str(&format!("Error running teardown method: {e}"));
                }
                env
            } else {
                drop(test);
                env
            };

            let failed = status == TestStatus::Fail;
            let results_dir = self.args.results_dir.clone();
            let mut env = env;
            let env = tokio::task::spawn_blocking(move || {
                env.teardown_services(teardown_services, failed, &results_dir);
                env
            })
            .await
            .context("service teardown task failed")?;

            let service_errors = env.services.errors();
            if !service_errors.is_empty() {
                summary.push_str("\n\n");
                summary.push_str(&service_errors);
            }

            if self.args.fail_bad_cluster_utilization
                && status == TestStatus::Pass
                && env.cluster.max_used() < env.cluster.size()
            {
                status = TestStatus::Fail;
                summary.push_str(&format!(
                    "Test requested {} nodes but used at most {}",
                    env.cluster.size(),
                    env.cluster.max_used()
                ));
            }
        }

        let stop_time = Utc::now();
        let result = TestResult::new(
            &self.ctx,
            self.args.test_index,
            self.args.results_dir.clone(),
            status,
            summary,
            data,
            start_time,
            stop_time,
        );

        info!("summary: {}", result.summary);
        self.send(self.factory.finished(result)).await?;
        Ok(())
    }

    /// Folds a pending cancellation into the test status.
    fn cancelled(&self, status: &mut TestStatus, summary: &mut String) -> bool {
        if self.cancel.is_cancelled() {
            *status = TestStatus::Fail;
            summary.push_str("test cancelled by SIGTERM before its body ran");
            true
        } else {
            false
        }
    }

    /// Runs one blocking test phase off the runtime, pumping the test's
    /// log lines to the supervisor while it runs. Panics and errors come
    /// back as `Err(summary)`.
    async fn run_phase<F>(
        &mut self,
        test: Box<dyn Test>,
        env: TestEnv,
        log_rx: &mut mpsc::UnboundedReceiver<(LogLevel, String)>,
        phase: F,
    ) -> anyhow::Result<(Box<dyn Test>, TestEnv, Result<Option<Value>, String>)>
    where
        F: FnOnce(&mut dyn Test, &mut TestEnv) -> anyhow::Result<Option<Value>> + Send + 'static,
    {
        let mut task = tokio::task::spawn_blocking(move || {
            let mut test = test;
            let mut env = env;
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| phase(test.as_mut(), &mut env)));
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(error_summary(&e)),
                Err(payload) => Err(panic_summary(payload.as_ref())),
            };
            (test, env, result)
        });

        loop {
            tokio::select! {
                joined = &mut task => {
                    while let Ok((level, message)) = log_rx.try_recv() {
                        self.forward_log(level, message).await;
                    }
                    return joined.context("test phase task was aborted");
                }
                received = log_rx.recv() => {
                    if let Some((level, message)) = received {
                        self.forward_log(level, message).await;
                    }
                }
            }
        }
    }

    /// Logs locally and forwards to the supervisor. Best effort — a lost
    /// LOG event never fails the test.
    async fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = format!("{}: {}", self.ctx.test_name(), message.into());
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        self.forward_log(level, message).await;
    }

    async fn forward_log(&mut self, level: LogLevel, message: String) {
        if let Err(e) = self.sender.send(self.factory.log(message, level)).await {
            warn!("failed to forward log line to supervisor: {e}");
        }
    }

    /// Sends a lifecycle event; these must get through.
    async fn send(&mut self, event: Event) -> anyhow::Result<EventReply> {
        let name = event.kind.name();
        self.sender
            .send(event)
            .await
            .with_context(|| format!("sending {name} to supervisor"))
    }
}

fn error_summary(err: &anyhow::Error) -> String {
    let mut summary = format!("{err:#}");
    let backtrace = err.backtrace();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        summary.push('\n');
        summary.push_str(&truncate_frames(&backtrace.to_string(), MAX_TRACEBACK_FRAMES));
    }
    summary
}

fn panic_summary(payload: &(dyn std::any::Any + Send)) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    format!("test panicked: {message}")
}

/// Keeps at most `max_frames` frames of a rendered backtrace.
fn truncate_frames(backtrace: &str, max_frames: usize) -> String {
    let mut frames_seen = 0;
    let mut kept = Vec::new();
    for line in backtrace.lines() {
        let trimmed = line.trim_start();
        if trimmed
            .split_once(':')
            .is_some_and(|(idx, _)| !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit()))
        {
            frames_seen += 1;
            if frames_seen > max_frames {
                kept.push("   ... frames omitted ...");
                break;
            }
        }
        kept.push(line);
    }
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_round_trip() {
        let args = WorkerArgs {
            supervisor_host: "localhost".to_string(),
            supervisor_port: 5556,
            test_id: "m.C.f".to_string(),
            test_index: 3,
            logger_name: "s1.m.C.f.3".to_string(),
            results_dir: PathBuf::from("/tmp/results/C/f/3"),
            debug: true,
            fail_bad_cluster_utilization: false,
            deflake_num: 2,
        };

        let mut argv = vec![WorkerArgs::SUBCOMMAND.to_string()];
        argv.extend(args.to_argv());
        let parsed = WorkerArgs::try_parse_from(argv).unwrap();

        assert_eq!(parsed.supervisor_port, 5556);
        assert_eq!(parsed.test_id, "m.C.f");
        assert_eq!(parsed.test_index, 3);
        assert!(parsed.debug);
        assert!(!parsed.fail_bad_cluster_utilization);
        assert_eq!(parsed.deflake_num, 2);
    }

    #[test]
    fn test_truncate_frames() {
        let backtrace = (0..40)
            .map(|i| format!("  {i}: some::module::function\n      at src/lib.rs:{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let truncated = truncate_frames(&backtrace, 16);
        assert!(truncated.contains("15: some::module::function"));
        assert!(!truncated.contains("17: some::module::function"));
        assert!(truncated.contains("frames omitted"));
    }

    #[test]
    fn test_panic_summary_formats() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_summary(boxed.as_ref()), "test panicked: boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new("ouch".to_string());
        assert_eq!(panic_summary(boxed.as_ref()), "test panicked: ouch");
    }
}
