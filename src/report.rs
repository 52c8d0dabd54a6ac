//! Result reporting.
//!
//! The supervisor pushes run progress into a set of [`Reporter`]s. File
//! reporters rewrite their whole output after every completed test, so a
//! session killed partway through still leaves usable partial results on
//! disk.
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`ConsoleReporter`] | Progress bar and colored per-test lines |
//! | [`FileSummaryReporter`] | `summary.txt` in the session results dir |
//! | [`JsonReporter`] | `report.json` in the session results dir |
//! | [`MultiReporter`] | Fans out to child reporters |
//! | [`NullReporter`] | Discards everything |

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::warn;

use crate::session::SessionContext;
use crate::test::context::TestContext;
use crate::test::result::{TestResult, TestResults, TestStatus};

/// Receives run progress from the supervisor.
///
/// All methods default to doing nothing, so implementations override
/// only what they need. `on_snapshot` fires after every completed test
/// with the full result set so far; `on_run_complete` fires once at the
/// end.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_run_start(&self, session: &SessionContext, total_tests: usize) {
        let _ = (session, total_tests);
    }

    async fn on_test_start(&self, ctx: &TestContext, test_index: usize) {
        let _ = (ctx, test_index);
    }

    async fn on_test_complete(&self, result: &TestResult) {
        let _ = result;
    }

    /// Partial results after each completion.
    async fn on_snapshot(&self, results: &TestResults) {
        let _ = results;
    }

    async fn on_run_complete(&self, results: &TestResults) {
        let _ = results;
    }
}

/// Discards all events.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {}

/// Forwards every event to multiple child reporters, in order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, session: &SessionContext, total_tests: usize) {
        for reporter in &self.reporters {
            reporter.on_run_start(session, total_tests).await;
        }
    }

    async fn on_test_start(&self, ctx: &TestContext, test_index: usize) {
        for reporter in &self.reporters {
            reporter.on_test_start(ctx, test_index).await;
        }
    }

    async fn on_test_complete(&self, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_test_complete(result).await;
        }
    }

    async fn on_snapshot(&self, results: &TestResults) {
        for reporter in &self.reporters {
            reporter.on_snapshot(results).await;
        }
    }

    async fn on_run_complete(&self, results: &TestResults) {
        for reporter in &self.reporters {
            reporter.on_run_complete(results).await;
        }
    }
}

/// Terminal reporter: progress bar plus a colored line per finished test.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// With `verbose`, prints a line for every result; otherwise only
    /// non-passes.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }

    fn styled_status(status: TestStatus) -> console::StyledObject<&'static str> {
        match status {
            TestStatus::Pass => console::style("PASS").green(),
            TestStatus::Flaky => console::style("FLAKY").yellow(),
            TestStatus::Fail => console::style("FAIL").red(),
            TestStatus::Ignore => console::style("IGNORE").dim(),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, session: &SessionContext, total_tests: usize) {
        println!(
            "session {}: running {} tests",
            session.session_id, total_tests
        );
        let bar = indicatif::ProgressBar::new(total_tests as u64);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("static template is valid")
                .progress_chars("#>-"),
        );
        *self.progress.lock().expect("progress lock") = Some(bar);
    }

    async fn on_test_complete(&self, result: &TestResult) {
        let guard = self.progress.lock().expect("progress lock");
        if let Some(bar) = guard.as_ref() {
            bar.inc(1);
            if self.verbose || result.status != TestStatus::Pass {
                bar.println(format!(
                    "{} {} ({:.1}s)",
                    Self::styled_status(result.status),
                    result.test_id,
                    result.run_time().as_secs_f64()
                ));
            }
        }
    }

    async fn on_run_complete(&self, results: &TestResults) {
        if let Some(bar) = self.progress.lock().expect("progress lock").take() {
            bar.finish_and_clear();
        }
        println!();
        println!("session {} results:", results.session_id);
        println!("  passed:  {}", console::style(results.num_passed()).green());
        println!("  failed:  {}", console::style(results.num_failed()).red());
        println!("  ignored: {}", results.num_ignored());
        if results.num_flaky() > 0 {
            println!("  flaky:   {}", console::style(results.num_flaky()).yellow());
        }
        println!("  duration: {:.1}s", results.run_time().as_secs_f64());
    }
}

/// Writes a plain-text summary into the session results directory after
/// every completed test.
pub struct FileSummaryReporter {
    results_dir: PathBuf,
}

impl FileSummaryReporter {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    fn render(results: &TestResults) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "session: {}\npassed: {}  failed: {}  ignored: {}  flaky: {}\n\n",
            results.session_id,
            results.num_passed(),
            results.num_failed(),
            results.num_ignored(),
            results.num_flaky(),
        ));
        for result in results.iter() {
            out.push_str(&format!(
                "{:<7} {:<60} {:.2}s\n",
                result.status.to_string(),
                result.test_id,
                result.run_time().as_secs_f64()
            ));
            if !result.summary.is_empty() {
                for line in result.summary.lines() {
                    out.push_str(&format!("        {line}\n"));
                }
            }
        }
        out
    }
}

#[async_trait]
impl Reporter for FileSummaryReporter {
    async fn on_snapshot(&self, results: &TestResults) {
        let path = self.results_dir.join("summary.txt");
        if let Err(e) = std::fs::write(&path, Self::render(results)) {
            warn!("failed to write {}: {e}", path.display());
        }
    }

    async fn on_run_complete(&self, results: &TestResults) {
        self.on_snapshot(results).await;
    }
}

/// Writes the full result set as `report.json` after every completed
/// test.
pub struct JsonReporter {
    results_dir: PathBuf,
}

impl JsonReporter {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    fn render(results: &TestResults) -> serde_json::Value {
        serde_json::json!({
            "session_id": results.session_id,
            "start_time": results.start_time,
            "stop_time": results.stop_time,
            "num_passed": results.num_passed(),
            "num_failed": results.num_failed(),
            "num_ignored": results.num_ignored(),
            "num_flaky": results.num_flaky(),
            "aggregate_success": results.get_aggregate_success(),
            "results": results.iter().collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_snapshot(&self, results: &TestResults) {
        let path = self.results_dir.join("report.json");
        let rendered = match serde_json::to_string_pretty(&Self::render(results)) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("failed to serialize report: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(&path, rendered) {
            warn!("failed to write {}: {e}", path.display());
        }
    }

    async fn on_run_complete(&self, results: &TestResults) {
        self.on_snapshot(results).await;
    }
}
