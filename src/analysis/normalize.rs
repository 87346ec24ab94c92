//! Boundary types for generator output and their normalization into the
//! canonical [`AnalysisResult`].
//!
//! Generators return findings either as objects or as bare strings, use
//! free-text severities and mix numbers with strings. Everything here is
//! total: any JSON value maps to exactly one canonical value.

use serde::Deserialize;
use serde_json::Value;

use super::models::{
    AnalysisResult, DeployableStatus, ExtractionTier, Finding, FindingKind, Severity, Suggestion,
    SuggestionKind, UNKNOWN_FILE,
};

pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Top-level response object as the generator is asked to produce it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawAnalysis {
    pub issue_summary: Option<Value>,
    pub bugs_detected: Option<Value>,
    pub optimizations: Option<Value>,
    pub patch: Option<Value>,
    pub deployable_status: Option<Value>,
    pub confidence_score: Option<Value>,
}

/// A finding as delivered: an object, a bare string, or something else.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawFinding {
    Text(String),
    Object(RawFindingFields),
    Other(Value),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawFindingFields {
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    pub severity: Option<Value>,
    pub file: Option<Value>,
    pub line: Option<Value>,
    pub description: Option<Value>,
    pub impact: Option<Value>,
    pub reproduction: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawSuggestion {
    Text(String),
    Object(RawSuggestionFields),
    Other(Value),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawSuggestionFields {
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    pub file: Option<Value>,
    pub line: Option<Value>,
    pub current_approach: Option<Value>,
    pub suggested_approach: Option<Value>,
    pub benefit: Option<Value>,
}

/// Normalize a parsed top-level object into the canonical record.
pub fn normalize_value(value: Value, tier: ExtractionTier) -> AnalysisResult {
    let raw: RawAnalysis = serde_json::from_value(value).unwrap_or_default();
    normalize(raw, tier)
}

pub fn normalize(raw: RawAnalysis, tier: ExtractionTier) -> AnalysisResult {
    let issue_summary = raw
        .issue_summary
        .as_ref()
        .map(value_text)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "No summary provided".to_string());

    AnalysisResult {
        issue_summary,
        findings: as_items(raw.bugs_detected)
            .into_iter()
            .map(|v| finding_from_raw(raw_finding(v)))
            .collect(),
        suggestions: as_items(raw.optimizations)
            .into_iter()
            .map(|v| suggestion_from_raw(raw_suggestion(v)))
            .collect(),
        patch: raw.patch.as_ref().map(value_text).unwrap_or_default(),
        deployable_status: raw
            .deployable_status
            .as_ref()
            .map(map_deployable)
            .unwrap_or_default(),
        confidence_score: raw
            .confidence_score
            .as_ref()
            .map(map_confidence)
            .unwrap_or(DEFAULT_CONFIDENCE),
        tier,
    }
}

fn as_items(value: Option<Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => vec![other],
    }
}

fn raw_finding(value: Value) -> RawFinding {
    serde_json::from_value(value.clone()).unwrap_or(RawFinding::Other(value))
}

fn raw_suggestion(value: Value) -> RawSuggestion {
    serde_json::from_value(value.clone()).unwrap_or(RawSuggestion::Other(value))
}

pub fn finding_from_raw(raw: RawFinding) -> Finding {
    match raw {
        RawFinding::Text(text) => Finding::new(FindingKind::CodeQuality, Severity::Medium, text),
        RawFinding::Other(value) => Finding::new(
            FindingKind::CodeQuality,
            Severity::Medium,
            value_text(&value),
        ),
        RawFinding::Object(fields) => Finding {
            kind: fields
                .kind
                .as_ref()
                .map(|v| map_finding_kind(&value_text(v)))
                .unwrap_or_default(),
            severity: fields
                .severity
                .as_ref()
                .map(|v| map_severity(&value_text(v)))
                .unwrap_or_default(),
            file: text_or(fields.file.as_ref(), UNKNOWN_FILE),
            line: fields.line.as_ref().map(map_line).unwrap_or(0),
            description: text_or(fields.description.as_ref(), "Unspecified issue"),
            impact: text_or(fields.impact.as_ref(), ""),
            reproduction: text_or(fields.reproduction.as_ref(), ""),
        },
    }
}

pub fn suggestion_from_raw(raw: RawSuggestion) -> Suggestion {
    let bare = |text: String| Suggestion {
        kind: SuggestionKind::Maintainability,
        file: UNKNOWN_FILE.to_string(),
        line: 0,
        current_approach: String::new(),
        suggested_approach: text,
        benefit: String::new(),
    };
    match raw {
        RawSuggestion::Text(text) => bare(text),
        RawSuggestion::Other(value) => bare(value_text(&value)),
        RawSuggestion::Object(fields) => Suggestion {
            kind: fields
                .kind
                .as_ref()
                .map(|v| map_suggestion_kind(&value_text(v)))
                .unwrap_or_default(),
            file: text_or(fields.file.as_ref(), UNKNOWN_FILE),
            line: fields.line.as_ref().map(map_line).unwrap_or(0),
            current_approach: text_or(fields.current_approach.as_ref(), ""),
            suggested_approach: text_or(fields.suggested_approach.as_ref(), ""),
            benefit: text_or(fields.benefit.as_ref(), ""),
        },
    }
}

/// Render any JSON value as plain text. Strings are taken verbatim.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text_or(value: Option<&Value>, default: &str) -> String {
    value
        .map(value_text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn canonical_word(s: &str) -> String {
    s.trim().to_lowercase().replace(['-', ' '], "_")
}

/// Map a free-text severity onto the four-level scale. Unknown words map to
/// `Medium`.
pub fn map_severity(s: &str) -> Severity {
    match canonical_word(s).as_str() {
        "critical" | "severe" | "blocker" | "fatal" | "urgent" | "catastrophic" | "p0" => {
            Severity::Critical
        }
        "high" | "major" | "important" | "error" | "serious" | "p1" => Severity::High,
        "medium" | "moderate" | "warning" | "warn" | "normal" | "p2" => Severity::Medium,
        "low" | "minor" | "trivial" | "info" | "informational" | "cosmetic" | "note" | "p3" => {
            Severity::Low
        }
        _ => Severity::Medium,
    }
}

pub fn map_finding_kind(s: &str) -> FindingKind {
    let word = canonical_word(s);
    if let Ok(kind) = word.parse::<FindingKind>() {
        return kind;
    }
    if word.contains("syntax") {
        FindingKind::SyntaxError
    } else if word.contains("secur")
        || word.contains("vulnerab")
        || word.contains("injection")
        || word.contains("xss")
    {
        FindingKind::SecurityVulnerability
    } else if word.contains("exception") || word.contains("error_handling") {
        FindingKind::ExceptionHandling
    } else if word.contains("runtime") || word.contains("crash") {
        FindingKind::RuntimeError
    } else if word.contains("logic") {
        FindingKind::LogicalBug
    } else if word.contains("perf") {
        FindingKind::Performance
    } else {
        FindingKind::CodeQuality
    }
}

pub fn map_suggestion_kind(s: &str) -> SuggestionKind {
    let word = canonical_word(s);
    if word.contains("perf") || word.contains("speed") || word.contains("efficien") {
        SuggestionKind::Performance
    } else if word.contains("secur") {
        SuggestionKind::Security
    } else if word.contains("readab")
        || word.contains("style")
        || word.contains("naming")
        || word.contains("format")
    {
        SuggestionKind::Readability
    } else {
        SuggestionKind::Maintainability
    }
}

/// Map a boolean or loosely worded status onto [`DeployableStatus`].
pub fn map_deployable(value: &Value) -> DeployableStatus {
    match value {
        Value::Bool(true) => DeployableStatus::Deployable,
        Value::Bool(false) => DeployableStatus::NotDeployable,
        Value::String(s) => map_deployable_text(s),
        _ => DeployableStatus::Unknown,
    }
}

fn map_deployable_text(s: &str) -> DeployableStatus {
    let text = s.trim().to_lowercase().replace(['_', '-'], " ");
    let text = text.trim_end_matches(['.', '!']);
    const NEGATIVE: &[&str] = &[
        "not deployable",
        "non deployable",
        "undeployable",
        "no",
        "false",
        "not ready",
        "unsafe",
        "blocked",
        "do not deploy",
        "not safe to deploy",
        "not safe",
    ];
    const POSITIVE: &[&str] = &[
        "deployable",
        "yes",
        "true",
        "ready",
        "ready to deploy",
        "safe",
        "safe to deploy",
        "ok",
    ];
    if NEGATIVE.contains(&text) {
        DeployableStatus::NotDeployable
    } else if POSITIVE.contains(&text) {
        DeployableStatus::Deployable
    } else {
        DeployableStatus::Unknown
    }
}

/// Parse a confidence value, clamped to `[0, 1]`. Non-numeric input gives
/// [`DEFAULT_CONFIDENCE`].
pub fn map_confidence(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f64>().ok().map(|p| p / 100.0),
                None => s.parse::<f64>().ok(),
            }
        }
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

pub fn map_line(value: &Value) -> u32 {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match n {
        Some(v) if v.is_finite() && v > 0.0 => v.min(u32::MAX as f64) as u32,
        _ => 0,
    }
}
