//! Session-wide context shared by the supervisor and every worker.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default timeout for the supervisor waiting on worker events.
pub const DEFAULT_TEST_RUNNER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The "global" knobs of one harness invocation.
///
/// A single `SessionContext` is created per run. The supervisor threads
/// it through scheduling and reporting, and ships a serialized copy to
/// each worker in the READY reply — workers never share the live object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Global session identifier, e.g. `2026-08-01--003`.
    pub session_id: String,

    /// All results and logs for this session land under this directory.
    pub results_dir: PathBuf,

    /// Verbose logging in supervisor and workers.
    #[serde(default)]
    pub debug: bool,

    /// Stop scheduling new tests after the first FAIL.
    #[serde(default)]
    pub exit_first: bool,

    /// Skip stopping and cleaning services during worker teardown.
    /// Log collection and node release still happen.
    #[serde(default)]
    pub no_teardown: bool,

    /// Maximum number of concurrently running tests.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Fail tests that allocated more nodes than they ever used.
    #[serde(default)]
    pub fail_bad_cluster_utilization: bool,

    /// How long the supervisor waits for any worker event before
    /// declaring the run dead.
    #[serde(default = "default_test_runner_timeout")]
    pub test_runner_timeout: Duration,

    /// User-defined globals, passed through to tests untouched.
    #[serde(default)]
    pub globals: serde_json::Map<String, Value>,
}

fn default_max_parallel() -> usize {
    1
}

fn default_test_runner_timeout() -> Duration {
    DEFAULT_TEST_RUNNER_TIMEOUT
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            results_dir: results_dir.into(),
            debug: false,
            exit_first: false,
            no_teardown: false,
            max_parallel: default_max_parallel(),
            fail_bad_cluster_utilization: false,
            test_runner_timeout: DEFAULT_TEST_RUNNER_TIMEOUT,
            globals: serde_json::Map::new(),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_exit_first(mut self, exit_first: bool) -> Self {
        self.exit_first = exit_first;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_no_teardown(mut self, no_teardown: bool) -> Self {
        self.no_teardown = no_teardown;
        self
    }

    pub fn with_fail_bad_cluster_utilization(mut self, fail: bool) -> Self {
        self.fail_bad_cluster_utilization = fail;
        self
    }

    pub fn with_test_runner_timeout(mut self, timeout: Duration) -> Self {
        self.test_runner_timeout = timeout;
        self
    }

    pub fn with_globals(mut self, globals: serde_json::Map<String, Value>) -> Self {
        self.globals = globals;
        self
    }
}

/// Generates the next session id, persisting the last-used id in
/// `session_id_file`.
///
/// Ids look like `2026-08-01--003`: the current date plus a counter that
/// resets each day.
pub fn generate_session_id(session_id_file: &Path) -> std::io::Result<String> {
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();

    let previous = if session_id_file.is_file() {
        let mut contents = String::new();
        std::fs::File::open(session_id_file)?.read_to_string(&mut contents)?;
        Some(contents.trim().to_string())
    } else {
        None
    };

    let next_num = match previous {
        Some(prev) if prev.starts_with(&today) => prev
            .rsplit("--")
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0)
            .saturating_add(1),
        _ => 1,
    };
    let session_id = format!("{today}--{next_num:03}");

    if let Some(parent) = session_id_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::File::create(session_id_file)?.write_all(session_id.as_bytes())?;

    Ok(session_id)
}

/// Directory name for a session's results.
pub fn generate_results_dir(root: &Path, session_id: &str) -> PathBuf {
    root.join(format!("{session_id}-test-results"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let session = SessionContext::new("s1", "/tmp/results");
        assert_eq!(session.max_parallel, 1);
        assert!(!session.exit_first);
        assert_eq!(session.test_runner_timeout, DEFAULT_TEST_RUNNER_TIMEOUT);
    }

    #[test]
    fn test_round_trip() {
        let session = SessionContext::new("s1", "/tmp/results")
            .with_max_parallel(4)
            .with_exit_first(true);
        let json = serde_json::to_string(&session).unwrap();
        let back: SessionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, "s1");
        assert_eq!(back.max_parallel, 4);
        assert!(back.exit_first);
    }

    #[test]
    fn test_session_id_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let id_file = dir.path().join("metadata").join("session_id");

        let first = generate_session_id(&id_file).unwrap();
        let second = generate_session_id(&id_file).unwrap();
        assert!(first.ends_with("--001"));
        assert!(second.ends_with("--002"));
        assert_eq!(&first[..10], &second[..10]);
    }

    #[test]
    fn test_results_dir_name() {
        let dir = generate_results_dir(Path::new("/results"), "2026-08-01--001");
        assert_eq!(
            dir,
            PathBuf::from("/results/2026-08-01--001-test-results")
        );
    }
}
