//! Partial-field recovery for responses no parser can accept.
//!
//! Scans the raw text for the fields the generator was asked for and
//! rebuilds a minimal record from whatever survived, then applies keyword
//! heuristics so a response that clearly describes a problem never yields an
//! empty finding list.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::models::{
    AnalysisResult, DeployableStatus, ExtractionTier, Finding, FindingKind, Severity,
};
use super::normalize::{RawFinding, finding_from_raw, map_confidence, map_deployable};
use super::repair::repair;
use crate::util::truncate_chars;

/// Confidence used when the response did not state one.
pub const PARTIAL_CONFIDENCE: f64 = 0.3;

const SUMMARY_CHARS: usize = 300;

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:issue_summary|summary)"\s*:\s*"((?:[^"\\]|\\.)*)"?"#).unwrap()
});
static PATCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""patch"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());
static DEPLOYABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""deployable_status"\s*:\s*("(?:[^"\\]|\\.)*"|true|false)"#).unwrap()
});
static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""confidence_score"\s*:\s*("?-?[0-9]+(?:\.[0-9]+)?%?"?)"#).unwrap()
});
/// A flat object that carries a description, i.e. a bug-shaped object.
static BUG_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{[^{}]*"description"\s*:\s*"(?:[^"\\]|\\.)*"[^{}]*\}?"#).unwrap());
/// The string entries of a `bugs_detected` list of bare strings.
static BUG_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""bugs_detected"\s*:\s*\[\s*((?:"(?:[^"\\]|\\.)*"\s*,?\s*)+)"#).unwrap());
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).unwrap());

/// Keyword heuristics, checked in order; the first match decides.
const KEYWORD_RULES: &[(&[&str], FindingKind, Severity)] = &[
    (
        &["security", "vulnerab", "injection", "xss", "csrf"],
        FindingKind::SecurityVulnerability,
        Severity::Critical,
    ),
    (&["syntax error", "syntaxerror"], FindingKind::SyntaxError, Severity::High),
    (
        &["crash", "runtime error", "traceback"],
        FindingKind::RuntimeError,
        Severity::High,
    ),
    (
        &["unhandled exception", "exception", "bare except"],
        FindingKind::ExceptionHandling,
        Severity::Medium,
    ),
    (
        &["performance", "slow", "inefficient"],
        FindingKind::Performance,
        Severity::Low,
    ),
    (&["bug", "logic error", "incorrect"], FindingKind::LogicalBug, Severity::Medium),
];

/// Recover what can be recovered. Returns `None` when the text carries
/// neither a known field nor any sign of an issue.
pub fn extract_partial(raw: &str) -> Option<AnalysisResult> {
    let summary = capture_string(&SUMMARY_RE, raw);
    let patch = capture_string(&PATCH_RE, raw);
    let deployable = DEPLOYABLE_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .map(|v| map_deployable(&v));
    let confidence = CONFIDENCE_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| {
            let text = m.as_str().trim_matches('"');
            map_confidence(&Value::String(text.to_string()))
        });

    let mut findings = recover_bug_objects(raw);
    if findings.is_empty() {
        findings = recover_bug_strings(raw);
    }

    let field_found = summary.is_some()
        || patch.is_some()
        || deployable.is_some()
        || confidence.is_some()
        || !findings.is_empty();

    let evidence_text = summary.clone().unwrap_or_else(|| raw.to_string());
    let keyword_finding = keyword_finding(&evidence_text);

    if !field_found && keyword_finding.is_none() {
        return None;
    }

    if findings.is_empty() {
        findings.push(keyword_finding.unwrap_or_else(|| {
            Finding::new(
                FindingKind::CodeQuality,
                Severity::Medium,
                "Generator response was incomplete; manual review recommended",
            )
        }));
    }

    let issue_summary = summary
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| summarize_prose(raw));

    Some(AnalysisResult {
        issue_summary,
        findings,
        suggestions: Vec::new(),
        patch: patch.unwrap_or_default(),
        deployable_status: deployable.unwrap_or(DeployableStatus::Unknown),
        confidence_score: confidence.unwrap_or(PARTIAL_CONFIDENCE),
        tier: ExtractionTier::Partial,
    })
}

/// Capture group 1 of `re` decoded as a JSON string body.
fn capture_string(re: &Regex, raw: &str) -> Option<String> {
    let body = re.captures(raw)?.get(1)?.as_str();
    Some(unescape(body))
}

fn unescape(body: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", body))
        .unwrap_or_else(|_| body.replace("\\n", "\n").replace("\\\"", "\""))
}

fn recover_bug_objects(raw: &str) -> Vec<Finding> {
    BUG_OBJECT_RE
        .find_iter(raw)
        .filter_map(|m| serde_json::from_str::<Value>(&repair(m.as_str())).ok())
        .filter(Value::is_object)
        .filter_map(|v| serde_json::from_value::<RawFinding>(v).ok())
        .map(finding_from_raw)
        .collect()
}

fn recover_bug_strings(raw: &str) -> Vec<Finding> {
    let Some(list) = BUG_LIST_RE.captures(raw).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    QUOTED_RE
        .captures_iter(list.as_str())
        .filter_map(|c| c.get(1))
        .map(|m| unescape(m.as_str()))
        .filter(|s| !s.trim().is_empty())
        .map(|s| finding_from_raw(RawFinding::Text(s)))
        .collect()
}

/// Build a finding from issue keywords in `text`, if any are present.
pub fn keyword_finding(text: &str) -> Option<Finding> {
    let lower = text.to_lowercase();
    KEYWORD_RULES
        .iter()
        .find(|(words, _, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, kind, severity)| {
            Finding::new(*kind, *severity, first_sentence(text)).with_impact(
                "Recovered from an unstructured response; verify manually",
            )
        })
}

fn first_sentence(text: &str) -> String {
    let trimmed = text.trim();
    let end = trimmed
        .find(['.', '\n'])
        .map(|i| i + 1)
        .unwrap_or(trimmed.len());
    truncate_chars(trimmed[..end].trim(), SUMMARY_CHARS)
}

fn summarize_prose(raw: &str) -> String {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        "Partial analysis recovered from an incomplete response".to_string()
    } else {
        truncate_chars(&text, SUMMARY_CHARS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_injection_prose() {
        let raw = "The handler builds queries by string concatenation, \
                   which is a SQL injection vulnerability.";
        let result = extract_partial(raw).unwrap();
        assert_eq!(result.tier, ExtractionTier::Partial);
        assert!(result.findings.iter().any(|f| {
            f.kind == FindingKind::SecurityVulnerability && f.severity == Severity::Critical
        }));
    }

    #[test]
    fn test_summary_field_recovered() {
        let raw = r#"garbage {"issue_summary": "Syntax error in main.py", "bugs_detected": [ {"type""#;
        let result = extract_partial(raw).unwrap();
        assert_eq!(result.issue_summary, "Syntax error in main.py");
        assert_eq!(result.findings[0].kind, FindingKind::SyntaxError);
    }

    #[test]
    fn test_truncated_summary_value() {
        let raw = r#"{"issue_summary": "Found an unhandled exception in the par"#;
        let result = extract_partial(raw).unwrap();
        assert!(result.issue_summary.starts_with("Found an unhandled"));
        assert_eq!(result.findings[0].kind, FindingKind::ExceptionHandling);
    }

    #[test]
    fn test_bug_objects_recovered() {
        let raw = r#"{"issue_summary": "two bugs", "bugs_detected": [
            {"type": "logical_bug", "severity": "major", "file": "calc.py", "line": 18, "description": "Division by zero risk"},
            {"type": "security", "description": "Unsafe eval() usage", "line": 36}
          ], "patch": "--- a/calc.py\n+++ b/calc.py", "confidence_score": 0.8 oops"#;
        let result = extract_partial(raw).unwrap();
        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.findings[0].severity, Severity::High);
        assert_eq!(result.findings[0].line, 18);
        assert_eq!(
            result.findings[1].kind,
            FindingKind::SecurityVulnerability
        );
        assert!(result.patch.starts_with("--- a/calc.py\n"));
        assert_eq!(result.confidence_score, 0.8);
    }

    #[test]
    fn test_bare_string_bug_list_recovered() {
        let raw = r#"{"bugs_detected": ["Missing colon (line 80)", "Unused import"] , "patch": "#;
        let result = extract_partial(raw).unwrap();
        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.findings[1].description, "Unused import");
    }

    #[test]
    fn test_generic_finding_when_only_fields() {
        let raw = r#"{"issue_summary": "Looks fine overall", "deployable_status": "yes"#;
        let result = extract_partial(raw).unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].kind, FindingKind::CodeQuality);
        assert_eq!(result.findings[0].severity, Severity::Medium);
        assert_eq!(result.confidence_score, PARTIAL_CONFIDENCE);
    }

    #[test]
    fn test_deployable_bool_recovered() {
        let raw = r#"{"issue_summary": "x", "deployable_status": false, "bugs"#;
        let result = extract_partial(raw).unwrap();
        assert_eq!(result.deployable_status, DeployableStatus::NotDeployable);
    }

    #[test]
    fn test_nothing_recoverable() {
        assert!(extract_partial("").is_none());
        assert!(extract_partial("Hello! All good here.").is_none());
    }

    #[test]
    fn test_keyword_priority() {
        let f = keyword_finding("A syntax error that is also a security hole").unwrap();
        assert_eq!(f.kind, FindingKind::SecurityVulnerability);
        assert!(keyword_finding("nothing to see").is_none());
    }
}
