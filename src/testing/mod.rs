//! Test execution for a checked-out source tree.
//!
//! [`TestExecutor`] is the seam the dispatcher depends on. The production
//! implementation is [`pytest::PytestAdapter`], which degrades from a real
//! run to collection, then static heuristics, then a synthesized baseline.

pub mod discovery;
pub mod patch;
pub mod pytest;
pub mod static_check;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use pytest::PytestAdapter;

/// How a [`TestOutcome`] was obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestMethod {
    RealRun,
    SyntaxCheck,
    StaticHeuristic,
    SynthesizedBaseline,
    /// The test task itself failed or timed out.
    TaskError,
}

impl TestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RealRun => "real_run",
            Self::SyntaxCheck => "syntax_check",
            Self::StaticHeuristic => "static_heuristic",
            Self::SynthesizedBaseline => "synthesized_baseline",
            Self::TaskError => "task_error",
        }
    }
}

impl std::fmt::Display for TestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of testing one source tree.
///
/// Fields are read-only outside this module so `failed_tests <= total_tests`
/// and `passed == (failed_tests == 0)` always hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestOutcome {
    passed: bool,
    total_tests: u32,
    failed_tests: u32,
    diagnostics: Vec<String>,
    error_details: Option<String>,
    duration_ms: u64,
    method: TestMethod,
}

impl TestOutcome {
    /// `total` is raised to `failed` when smaller.
    pub fn new(total: u32, failed: u32, method: TestMethod) -> Self {
        Self {
            passed: failed == 0,
            total_tests: total.max(failed),
            failed_tests: failed,
            diagnostics: Vec::new(),
            error_details: None,
            duration_ms: 0,
            method,
        }
    }

    /// An empty tree: nothing to test, nothing failed.
    pub fn empty() -> Self {
        Self::new(0, 0, TestMethod::SynthesizedBaseline)
    }

    /// Error-shaped outcome for a test task that failed or timed out.
    pub fn task_error(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(1, 1, TestMethod::TaskError)
            .with_diagnostic(format!("Test task failed: {}", reason))
            .with_error(reason)
    }

    pub fn with_diagnostic(mut self, line: impl Into<String>) -> Self {
        self.diagnostics.push(line.into());
        self
    }

    pub fn with_diagnostics(mut self, lines: impl IntoIterator<Item = String>) -> Self {
        self.diagnostics.extend(lines);
        self
    }

    pub fn with_error(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn total_tests(&self) -> u32 {
        self.total_tests
    }

    pub fn failed_tests(&self) -> u32 {
        self.failed_tests
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn error_details(&self) -> Option<&str> {
        self.error_details.as_deref()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn method(&self) -> TestMethod {
        self.method
    }

    pub fn is_task_error(&self) -> bool {
        self.method == TestMethod::TaskError
    }

    /// One-line human summary, e.g. `3/10 failed (real_run)`.
    pub fn summary(&self) -> String {
        if self.passed {
            format!("{} passed ({})", self.total_tests, self.method)
        } else {
            format!(
                "{}/{} failed ({})",
                self.failed_tests, self.total_tests, self.method
            )
        }
    }
}

/// Runs tests for a source tree. Implementations never return errors: every
/// failure mode is expressed as a [`TestOutcome`].
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn run(&self, root: &Path) -> TestOutcome;

    /// Run against a copy of `root` with `patch` applied. `root` itself is
    /// left untouched.
    async fn run_with_patch(&self, root: &Path, patch: &str) -> TestOutcome;
}
