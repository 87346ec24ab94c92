use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category of a detected problem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    SyntaxError,
    LogicalBug,
    RuntimeError,
    SecurityVulnerability,
    ExceptionHandling,
    #[default]
    CodeQuality,
    Performance,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyntaxError => "syntax_error",
            Self::LogicalBug => "logical_bug",
            Self::RuntimeError => "runtime_error",
            Self::SecurityVulnerability => "security_vulnerability",
            Self::ExceptionHandling => "exception_handling",
            Self::CodeQuality => "code_quality",
            Self::Performance => "performance",
        }
    }
}

impl FromStr for FindingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "syntax_error" => Ok(Self::SyntaxError),
            "logical_bug" => Ok(Self::LogicalBug),
            "runtime_error" => Ok(Self::RuntimeError),
            "security_vulnerability" => Ok(Self::SecurityVulnerability),
            "exception_handling" => Ok(Self::ExceptionHandling),
            "code_quality" => Ok(Self::CodeQuality),
            "performance" => Ok(Self::Performance),
            _ => Err(format!("Invalid finding kind: {}", s)),
        }
    }
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity level, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Performance,
    Security,
    #[default]
    Maintainability,
    Readability,
}

impl SuggestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Security => "security",
            Self::Maintainability => "maintainability",
            Self::Readability => "readability",
        }
    }
}

impl std::fmt::Display for SuggestionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the analyzed commit is considered safe to ship.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployableStatus {
    Deployable,
    NotDeployable,
    #[default]
    Unknown,
}

impl DeployableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployable => "deployable",
            Self::NotDeployable => "not_deployable",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for DeployableStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deployable" => Ok(Self::Deployable),
            "not_deployable" => Ok(Self::NotDeployable),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid deployable status: {}", s)),
        }
    }
}

impl std::fmt::Display for DeployableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which extraction tier produced an [`AnalysisResult`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    Fenced,
    Direct,
    GreedySpan,
    Repaired,
    Partial,
    Fallback,
    /// The analysis task itself failed before any text was extracted.
    TaskError,
}

impl ExtractionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fenced => "fenced",
            Self::Direct => "direct",
            Self::GreedySpan => "greedy_span",
            Self::Repaired => "repaired",
            Self::Partial => "partial",
            Self::Fallback => "fallback",
            Self::TaskError => "task_error",
        }
    }

    /// True when the record came from a complete parse of the response.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            Self::Fenced | Self::Direct | Self::GreedySpan | Self::Repaired
        )
    }
}

impl std::fmt::Display for ExtractionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single detected problem, in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub file: String,
    pub line: u32,
    pub description: String,
    pub impact: String,
    pub reproduction: String,
}

impl Finding {
    pub fn new(kind: FindingKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            file: UNKNOWN_FILE.to_string(),
            line: 0,
            description: description.into(),
            impact: String::new(),
            reproduction: String::new(),
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = impact.into();
        self
    }

    /// `file:line`, or just the file when no line is known.
    pub fn location(&self) -> String {
        if self.line > 0 {
            format!("{}:{}", self.file, self.line)
        } else {
            self.file.clone()
        }
    }
}

pub const UNKNOWN_FILE: &str = "unknown";

/// A proposed improvement that is not a defect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub file: String,
    pub line: u32,
    pub current_approach: String,
    pub suggested_approach: String,
    pub benefit: String,
}

/// Typed result of the analysis task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub issue_summary: String,
    pub findings: Vec<Finding>,
    pub suggestions: Vec<Suggestion>,
    pub patch: String,
    pub deployable_status: DeployableStatus,
    pub confidence_score: f64,
    pub tier: ExtractionTier,
}

/// Confidence attached to the fallback record.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

impl AnalysisResult {
    /// Record used when no tier could recover anything from the response.
    pub fn fallback() -> Self {
        Self {
            issue_summary: "Unable to extract a structured analysis from the generator response; \
                            manual review required."
                .to_string(),
            findings: Vec::new(),
            suggestions: Vec::new(),
            patch: String::new(),
            deployable_status: DeployableStatus::NotDeployable,
            confidence_score: FALLBACK_CONFIDENCE,
            tier: ExtractionTier::Fallback,
        }
    }

    /// Error-shaped record written by a failed or timed-out analysis task.
    pub fn task_error(reason: &str) -> Self {
        Self {
            issue_summary: format!("Analysis failed: {}", reason),
            findings: vec![Finding::new(
                FindingKind::RuntimeError,
                Severity::Medium,
                format!("Analysis task error: {}", reason),
            )],
            suggestions: Vec::new(),
            patch: String::new(),
            deployable_status: DeployableStatus::Unknown,
            confidence_score: 0.0,
            tier: ExtractionTier::TaskError,
        }
    }

    pub fn is_task_error(&self) -> bool {
        self.tier == ExtractionTier::TaskError
    }

    pub fn has_patch(&self) -> bool {
        !self.patch.trim().is_empty()
    }

    pub fn count_severity(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    pub fn count_kind(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }
}
