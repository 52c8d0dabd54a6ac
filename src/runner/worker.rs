//! Spawning and supervising worker processes.
//!
//! The supervisor talks to workers through two small traits so the same
//! run loop drives real OS processes and in-process tasks:
//!
//! - [`ProcessSpawner`] re-executes a program (usually the current
//!   binary) with the [`WorkerArgs`] argv; the embedding binary must
//!   route that argv to [`worker_main`](crate::runner::client::worker_main).
//! - [`InProcessSpawner`] runs the client on a tokio task inside the
//!   supervisor's process. No process isolation, but no exec either —
//!   right for single-machine runs and for the harness's own tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::client::{WorkerArgs, run_worker};
use crate::test::TestRegistry;

/// How a worker left (or failed to leave) the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The worker exited; the code is `None` when it was killed by a
    /// signal or aborted.
    Exited(Option<i32>),
    /// Still running when the deadline passed.
    TimedOut,
}

/// A handle to one running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// OS pid, when the worker is a real process.
    fn pid(&self) -> Option<u32>;

    /// Force-terminates the worker (SIGKILL for processes, abort for
    /// tasks). Does not wait; follow up with `join`.
    fn kill(&mut self);

    /// Waits up to `timeout` for the worker to finish.
    async fn join(&mut self, timeout: Duration) -> JoinOutcome;
}

/// Creates workers for the supervisor.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, args: WorkerArgs) -> anyhow::Result<Box<dyn WorkerHandle>>;
}

/// Spawns each worker as an independent OS process.
pub struct ProcessSpawner {
    program: PathBuf,
    prefix_args: Vec<String>,
}

impl ProcessSpawner {
    /// Workers re-execute the current binary with the worker subcommand
    /// prefix. The binary must dispatch that argv to
    /// [`worker_main`](crate::runner::client::worker_main).
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: vec![WorkerArgs::SUBCOMMAND.to_string()],
        }
    }

    /// Overrides the argv prefix inserted before the worker arguments.
    pub fn with_prefix_args(mut self, prefix_args: Vec<String>) -> Self {
        self.prefix_args = prefix_args;
        self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, args: WorkerArgs) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.prefix_args)
            .args(args.to_argv())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ProcessWorker { child, exit: None }))
    }
}

struct ProcessWorker {
    child: tokio::process::Child,
    exit: Option<Option<i32>>,
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn kill(&mut self) {
        let _ = self.child.start_kill();
    }

    async fn join(&mut self, timeout: Duration) -> JoinOutcome {
        if let Some(code) = self.exit {
            return JoinOutcome::Exited(code);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(status.code());
                JoinOutcome::Exited(status.code())
            }
            Ok(Err(_)) => {
                self.exit = Some(None);
                JoinOutcome::Exited(None)
            }
            Err(_) => JoinOutcome::TimedOut,
        }
    }
}

/// Runs each worker as a tokio task in the current process.
pub struct InProcessSpawner {
    registry: Arc<TestRegistry>,
}

impl InProcessSpawner {
    pub fn new(registry: Arc<TestRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(&self, args: WorkerArgs) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let registry = self.registry.clone();
        let handle = tokio::spawn(run_worker(registry, args));
        Ok(Box::new(TaskWorker { handle, exit: None }))
    }
}

struct TaskWorker {
    handle: JoinHandle<i32>,
    exit: Option<Option<i32>>,
}

#[async_trait]
impl WorkerHandle for TaskWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn kill(&mut self) {
        self.handle.abort();
    }

    async fn join(&mut self, timeout: Duration) -> JoinOutcome {
        if let Some(code) = self.exit {
            return JoinOutcome::Exited(code);
        }
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(code)) => {
                self.exit = Some(Some(code));
                JoinOutcome::Exited(Some(code))
            }
            Ok(Err(_)) => {
                // aborted or panicked
                self.exit = Some(None);
                JoinOutcome::Exited(None)
            }
            Err(_) => JoinOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_worker_join_caches_outcome() {
        let handle = tokio::spawn(async { 7 });
        let mut worker = TaskWorker { handle, exit: None };
        let outcome = worker.join(Duration::from_secs(1)).await;
        assert_eq!(outcome, JoinOutcome::Exited(Some(7)));
        // second join must not re-poll the finished handle
        let outcome = worker.join(Duration::from_secs(1)).await;
        assert_eq!(outcome, JoinOutcome::Exited(Some(7)));
    }

    #[tokio::test]
    async fn test_task_worker_kill_then_join() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            0
        });
        let mut worker = TaskWorker { handle, exit: None };
        worker.kill();
        let outcome = worker.join(Duration::from_secs(1)).await;
        assert_eq!(outcome, JoinOutcome::Exited(None));
    }

    #[tokio::test]
    async fn test_task_worker_join_times_out() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            0
        });
        let mut worker = TaskWorker { handle, exit: None };
        let outcome = worker.join(Duration::from_millis(20)).await;
        assert_eq!(outcome, JoinOutcome::TimedOut);
        worker.kill();
    }
}
