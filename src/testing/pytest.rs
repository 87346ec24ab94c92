//! pytest-backed [`TestExecutor`] with degrading fallbacks.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use super::discovery::{Discovery, discover};
use super::{TestExecutor, TestMethod, TestOutcome, patch, static_check};
use crate::bugsniper_config::TestsSection;
use crate::util::first_lines;

/// pytest exits with 1 when tests ran and some failed.
const TESTS_FAILED: i32 = 1;
/// pytest exits with 5 when it collected nothing.
const NO_TESTS_COLLECTED: i32 = 5;

static PASSED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passed").unwrap());
static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failed").unwrap());
static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) errors?\b").unwrap());
static COLLECTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) tests? collected").unwrap());

/// Counts parsed from a verbose pytest run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub failing: Vec<String>,
}

impl RunCounts {
    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.errors
    }
}

fn capture_count(re: &Regex, text: &str) -> Option<u32> {
    re.captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse `pytest -v` output. Summary counts win over per-test lines.
pub fn parse_run_output(output: &str) -> RunCounts {
    let mut counts = RunCounts::default();
    for line in output.lines().filter(|l| l.contains("::")) {
        if line.contains(" PASSED") {
            counts.passed += 1;
        } else if line.contains(" FAILED") {
            counts.failed += 1;
            counts.failing.push(line.trim().to_string());
        } else if line.contains(" ERROR") {
            counts.errors += 1;
            counts.failing.push(line.trim().to_string());
        }
    }

    let summary = (
        capture_count(&PASSED_RE, output),
        capture_count(&FAILED_RE, output),
        capture_count(&ERROR_RE, output),
    );
    if summary != (None, None, None) {
        counts.passed = summary.0.unwrap_or(0);
        counts.failed = summary.1.unwrap_or(0);
        counts.errors = summary.2.unwrap_or(0);
    }
    counts
}

/// Parse `pytest --collect-only -q` output.
pub fn parse_collected(output: &str) -> u32 {
    capture_count(&COLLECTED_RE, output)
        .unwrap_or_else(|| output.lines().filter(|l| l.contains("::")).count() as u32)
}

enum Invocation {
    Finished(Output),
    TimedOut,
    SpawnFailed(String),
}

/// Runs pytest in a tree, degrading to collection, then static heuristics,
/// then a synthesized baseline.
pub struct PytestAdapter {
    config: TestsSection,
}

impl PytestAdapter {
    pub fn new(config: TestsSection) -> Self {
        Self { config }
    }

    fn command(&self, root: &Path) -> Option<Command> {
        let mut parts = self.config.runner.split_whitespace();
        let program = parts.next()?;
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Some(cmd)
    }

    async fn invoke(&self, root: &Path, args: &[&str], limit: Duration) -> Invocation {
        let Some(mut cmd) = self.command(root) else {
            return Invocation::SpawnFailed("empty runner command".into());
        };
        cmd.args(args);
        match timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => Invocation::Finished(output),
            Ok(Err(e)) => Invocation::SpawnFailed(e.to_string()),
            Err(_) => Invocation::TimedOut,
        }
    }

    async fn runner_available(&self, root: &Path) -> bool {
        let limit = Duration::from_secs(self.config.version_timeout_secs);
        match self.invoke(root, &["--version"], limit).await {
            Invocation::Finished(output) => output.status.success(),
            Invocation::TimedOut => {
                tracing::warn!(runner = %self.config.runner, "runner version check timed out");
                false
            }
            Invocation::SpawnFailed(e) => {
                tracing::debug!(runner = %self.config.runner, error = %e, "runner unavailable");
                false
            }
        }
    }

    fn combined(output: &Output) -> String {
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push('\n');
            text.push_str(&stderr);
        }
        text
    }

    async fn real_run(&self, root: &Path) -> Option<TestOutcome> {
        let secs = self.config.run_timeout_secs;
        let output = match self
            .invoke(root, &["-v", "--tb=short"], Duration::from_secs(secs))
            .await
        {
            Invocation::Finished(output) => output,
            Invocation::TimedOut => {
                return Some(
                    TestOutcome::new(1, 1, TestMethod::RealRun)
                        .with_diagnostic(format!("timed out after {}s", secs))
                        .with_error(format!("pytest timed out after {}s", secs)),
                );
            }
            Invocation::SpawnFailed(e) => {
                tracing::warn!(error = %e, "runner failed to start for real run");
                return None;
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let text = Self::combined(&output);
        let counts = parse_run_output(&text);

        if code == NO_TESTS_COLLECTED || (code == 0 && counts.total() == 0) {
            return Some(TestOutcome::new(0, 0, TestMethod::RealRun));
        }
        // Interrupted, internal error, usage error or a signal.
        if code != 0 && code != TESTS_FAILED {
            let failed = (counts.failed + counts.errors).max(1);
            return Some(
                TestOutcome::new(counts.total(), failed, TestMethod::RealRun)
                    .with_diagnostics(first_lines(&text, self.config.max_diagnostics))
                    .with_error(format!("pytest exited with code {}", code)),
            );
        }
        if code != 0 && counts.total() == 0 {
            return Some(
                TestOutcome::new(1, 1, TestMethod::RealRun)
                    .with_diagnostics(first_lines(&text, self.config.max_diagnostics)),
            );
        }

        let mut failed = counts.failed + counts.errors;
        if code == TESTS_FAILED {
            failed = failed.max(1);
        }
        let diagnostics: Vec<String> = counts
            .failing
            .iter()
            .take(self.config.max_diagnostics)
            .cloned()
            .collect();
        Some(TestOutcome::new(counts.total(), failed, TestMethod::RealRun).with_diagnostics(diagnostics))
    }

    async fn collect_only(&self, root: &Path) -> Option<TestOutcome> {
        let secs = self.config.collect_timeout_secs;
        let output = match self
            .invoke(root, &["--collect-only", "-q"], Duration::from_secs(secs))
            .await
        {
            Invocation::Finished(output) => output,
            Invocation::TimedOut => {
                return Some(
                    TestOutcome::new(1, 1, TestMethod::SyntaxCheck)
                        .with_diagnostic(format!("timed out after {}s", secs))
                        .with_error(format!("pytest collection timed out after {}s", secs)),
                );
            }
            Invocation::SpawnFailed(e) => {
                tracing::warn!(error = %e, "runner failed to start for collection");
                return None;
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let text = Self::combined(&output);
        if code == 0 || code == NO_TESTS_COLLECTED {
            return Some(TestOutcome::new(parse_collected(&text), 0, TestMethod::SyntaxCheck));
        }
        Some(
            TestOutcome::new(1, 1, TestMethod::SyntaxCheck)
                .with_diagnostics(first_lines(&text, self.config.max_diagnostics)),
        )
    }

    async fn static_tier(&self, root: &Path, sources: Vec<PathBuf>) -> TestOutcome {
        let root_buf = root.to_path_buf();
        let max = self.config.max_diagnostics;
        let fallback_files = sources.clone();
        match tokio::task::spawn_blocking(move || static_check::check_files(&root_buf, &sources, max))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "static check panicked, using baseline");
                static_check::baseline(root, &fallback_files, max)
            }
        }
    }

    async fn run_chain(&self, root: &Path) -> TestOutcome {
        let walk_root = root.to_path_buf();
        let found: Discovery = match tokio::task::spawn_blocking(move || discover(&walk_root)).await
        {
            Ok(found) => found,
            Err(e) => return TestOutcome::task_error(format!("discovery failed: {}", e)),
        };

        if !found.has_sources() {
            return TestOutcome::empty();
        }

        if self.config.mock {
            return self.static_tier(root, found.source_files).await;
        }

        if self.runner_available(root).await {
            let attempt = if found.has_tests() {
                self.real_run(root).await
            } else {
                self.collect_only(root).await
            };
            if let Some(outcome) = attempt {
                return outcome;
            }
        }

        self.static_tier(root, found.source_files).await
    }
}

#[async_trait]
impl TestExecutor for PytestAdapter {
    async fn run(&self, root: &Path) -> TestOutcome {
        let start = Instant::now();
        let outcome = self.run_chain(root).await;
        let elapsed = start.elapsed().as_millis() as u64;
        tracing::info!(
            root = %root.display(),
            method = %outcome.method(),
            total = outcome.total_tests(),
            failed = outcome.failed_tests(),
            elapsed_ms = elapsed,
            "tests finished"
        );
        outcome.with_duration_ms(elapsed)
    }

    async fn run_with_patch(&self, root: &Path, diff: &str) -> TestOutcome {
        let copy = match patch::copy_tree(root).await {
            Ok(copy) => copy,
            Err(e) => return patch::apply_failure(&e),
        };
        let outcome = match patch::apply(&copy, diff).await {
            Ok(()) => self.run(&copy).await,
            Err(e) => patch::apply_failure(&e),
        };
        patch::remove_copy(&copy).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn mock_config() -> TestsSection {
        TestsSection {
            mock: true,
            ..TestsSection::default()
        }
    }

    #[test]
    fn test_parse_run_output_summary_wins() {
        let output = "tests/test_a.py::test_one PASSED\n\
                      tests/test_a.py::test_two FAILED\n\
                      ==== 3 failed, 7 passed in 0.12s ====\n";
        let counts = parse_run_output(output);
        assert_eq!(counts.passed, 7);
        assert_eq!(counts.failed, 3);
        assert_eq!(counts.total(), 10);
        assert_eq!(counts.failing, vec!["tests/test_a.py::test_two FAILED"]);
    }

    #[test]
    fn test_parse_run_output_lines_only() {
        let output = "t.py::a PASSED\nt.py::b ERROR\nt.py::c PASSED\n";
        let counts = parse_run_output(output);
        assert_eq!((counts.passed, counts.failed, counts.errors), (2, 0, 1));
    }

    #[test]
    fn test_parse_run_output_errors_plural() {
        let counts = parse_run_output("=== 1 passed, 2 errors in 0.5s ===");
        assert_eq!(counts.errors, 2);
        assert_eq!(counts.passed, 1);
    }

    #[test]
    fn test_parse_collected() {
        assert_eq!(parse_collected("a.py::x\na.py::y\n\n2 tests collected in 0.01s"), 2);
        assert_eq!(parse_collected("a.py::x\nb.py::y\nc.py::z\n"), 3);
        assert_eq!(parse_collected("no tests ran in 0.01s"), 0);
    }

    #[tokio::test]
    async fn test_empty_tree_passes_with_zero_total() {
        let dir = tempdir().unwrap();
        let outcome = PytestAdapter::new(TestsSection::default()).run(dir.path()).await;
        assert!(outcome.passed());
        assert_eq!(outcome.total_tests(), 0);
        assert_eq!(outcome.method(), TestMethod::SynthesizedBaseline);
    }

    #[tokio::test]
    async fn test_mock_mode_uses_static_tier() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "x = eval(input())\n").unwrap();
        let outcome = PytestAdapter::new(mock_config()).run(dir.path()).await;
        assert_eq!(outcome.method(), TestMethod::StaticHeuristic);
        assert!(!outcome.passed());
    }

    #[tokio::test]
    async fn test_missing_runner_falls_back_to_static() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "X = 1\n").unwrap();
        let config = TestsSection {
            runner: "/nonexistent/pytest-binary".into(),
            ..TestsSection::default()
        };
        let outcome = PytestAdapter::new(config).run(dir.path()).await;
        assert_eq!(outcome.method(), TestMethod::StaticHeuristic);
        assert!(outcome.passed());
        assert_eq!(outcome.total_tests(), 1);
    }

    /// A tree with one test file and a shell script standing in for pytest.
    fn fake_pytest(body: &str) -> (tempfile::TempDir, TestsSection) {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "X = 1\n").unwrap();
        fs::write(dir.path().join("test_app.py"), "def test_x():\n    pass\n").unwrap();
        let script = dir.path().join("fake_pytest.sh");
        fs::write(
            &script,
            format!(
                "if [ \"$1\" = \"--version\" ]; then echo 'pytest 8.0.0'; exit 0; fi\n{}\n",
                body
            ),
        )
        .unwrap();
        let config = TestsSection {
            runner: format!("sh {}", script.display()),
            ..TestsSection::default()
        };
        (dir, config)
    }

    #[tokio::test]
    async fn test_real_run_counts_failures() {
        let (dir, config) = fake_pytest(
            "echo 'test_app.py::test_x FAILED'\necho '=== 1 failed, 2 passed in 0.1s ==='\nexit 1",
        );
        let outcome = PytestAdapter::new(config).run(dir.path()).await;
        assert_eq!(outcome.method(), TestMethod::RealRun);
        assert!(!outcome.passed());
        assert_eq!((outcome.total_tests(), outcome.failed_tests()), (3, 1));
        assert!(outcome.error_details().is_none());
    }

    #[tokio::test]
    async fn test_real_run_interrupted_is_an_error() {
        let (dir, config) = fake_pytest(
            "echo 'test_app.py::test_x PASSED'\necho '=== 1 passed, 1 error in 0.1s ==='\necho 'Interrupted: 1 error during collection'\nexit 2",
        );
        let outcome = PytestAdapter::new(config).run(dir.path()).await;
        assert_eq!(outcome.method(), TestMethod::RealRun);
        assert!(!outcome.passed());
        assert_eq!(outcome.error_details(), Some("pytest exited with code 2"));
    }

    #[tokio::test]
    async fn test_real_run_internal_error_with_only_passes_fails() {
        let (dir, config) = fake_pytest("echo '=== 4 passed in 0.1s ==='\nexit 3");
        let outcome = PytestAdapter::new(config).run(dir.path()).await;
        assert!(!outcome.passed());
        assert_eq!(outcome.failed_tests(), 1);
        assert_eq!(outcome.error_details(), Some("pytest exited with code 3"));
    }

    #[tokio::test]
    async fn test_real_run_timeout_records_error() {
        let (dir, mut config) = fake_pytest("sleep 5");
        config.run_timeout_secs = 1;
        let outcome = PytestAdapter::new(config).run(dir.path()).await;
        assert_eq!(outcome.method(), TestMethod::RealRun);
        assert!(!outcome.passed());
        assert_eq!(outcome.diagnostics(), ["timed out after 1s".to_string()]);
        assert_eq!(outcome.error_details(), Some("pytest timed out after 1s"));
    }
}
