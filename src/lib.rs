//! # drover
//!
//! The core of a distributed-system test harness: it takes a set of
//! discovered, parametrized, cluster-annotated test contexts and turns
//! them into an ordered execution — allocating and reclaiming cluster
//! nodes, supervising per-test worker processes over an IPC channel,
//! surviving worker crashes and cluster shrinkage, and producing a
//! deterministic result set.
//!
//! ## Architecture
//!
//! ```text
//!   Loader (external)                TestRunner                    Worker
//!        │                               │                           │
//!        │ expand marks                  │                           │
//!        ▼                               │                           │
//!   Vec<TestContext> ──────────────────► │ peek largest that fits    │
//!                                        ▼                           │
//!                              Cluster.alloc(spec)                   │
//!                                        │                           │
//!                              FiniteSubcluster                      │
//!                                        │      spawn ─────────────► │
//!                                        │ ◄──── READY ───────────── │
//!                                        │ ───── session+test+nodes ►│
//!                                        │ ◄──── RUNNING/LOG/... ─── │
//!                                        │ ◄──── FINISHED(result) ── │
//!                                        ▼                           │
//!                              free subcluster, join,                │
//!                              record result, report                 ▼
//! ```
//!
//! ## Subsystems
//!
//! - [`cluster`] — node bookkeeping: [`ClusterSpec`] requests,
//!   [`NodeContainer`] pools with health-checked allocation and
//!   rollback, the [`Cluster`] trait, and [`FiniteSubcluster`] blocks.
//! - [`marks`] — annotations ([`Mark`]) that expand one test function
//!   into concrete parametrized contexts.
//! - [`test`] — the [`Test`](test::Test) trait, the
//!   [`TestRegistry`](test::TestRegistry), services, and the result data
//!   model.
//! - [`runner`] — the [`TestRunner`] supervisor, the largest-first
//!   [`TestScheduler`](runner::TestScheduler), and the worker client.
//! - [`ipc`] — the request/reply event transport between supervisor and
//!   workers.
//! - [`report`] — reporters fed after every completed test.
//!
//! ## Embedding
//!
//! The harness is a library; the embedding binary registers its tests,
//! expands them, and hands them to a [`TestRunner`]. When workers run as
//! separate processes, the same binary dispatches worker argv to
//! [`runner::worker_main`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use drover::cluster::FiniteSubcluster;
//! use drover::runner::{ProcessSpawner, TestRunner, WorkerArgs, worker_main};
//! use drover::session::SessionContext;
//! use drover::test::TestRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(build_registry());
//!
//!     // worker re-execution path
//!     if std::env::args().nth(1).as_deref() == Some(WorkerArgs::SUBCOMMAND) {
//!         std::process::exit(worker_main(registry).await);
//!     }
//!
//!     let session = SessionContext::new("2026-08-01--001", "./results")
//!         .with_max_parallel(4);
//!     let cluster = Box::new(FiniteSubcluster::new(load_nodes()?));
//!     let tests = registry.expand_all(None)?;
//!
//!     let mut runner = TestRunner::new(
//!         cluster,
//!         session,
//!         Box::new(ProcessSpawner::current_exe()?),
//!         tests,
//!     );
//!     let results = runner.run_all_tests().await?;
//!     std::process::exit(if results.get_aggregate_success() { 0 } else { 1 });
//! }
//! # fn build_registry() -> TestRegistry { TestRegistry::new() }
//! # fn load_nodes() -> anyhow::Result<Vec<drover::cluster::ClusterNode>> { Ok(vec![]) }
//! ```

pub mod cluster;
pub mod ipc;
pub mod marks;
pub mod report;
pub mod runner;
pub mod session;

pub use cluster::{
    Cluster, ClusterError, ClusterNode, ClusterSpec, FiniteSubcluster, NodeContainer, NodeSpec,
};
pub use marks::{Mark, MarkedFunctionExpander};
pub use report::Reporter;
pub use runner::TestRunner;
pub use session::SessionContext;
pub use test::context::TestContext;
pub use test::result::{TestResult, TestResults, TestStatus};
