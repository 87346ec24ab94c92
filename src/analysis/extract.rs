//! Tiered extraction of an [`AnalysisResult`] from raw generator text.
//!
//! ```text
//! fenced block ─> direct parse ─> greedy {..} span ─> whole-text repair
//!      ─> partial field scan ─> fallback record
//! ```
//!
//! Each tier runs only when the one before it produced nothing. The last
//! tier cannot fail, so [`extract_analysis`] always returns a record.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::models::{AnalysisResult, ExtractionTier};
use super::normalize::normalize_value;
use super::partial::extract_partial;
use super::repair::repair;

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap());

/// Convert raw generator output into a typed record. Never fails.
pub fn extract_analysis(raw: &str) -> AnalysisResult {
    let (result, tier) = match structured(raw) {
        Some((value, tier)) => (normalize_value(value, tier), tier),
        None => match extract_partial(raw) {
            Some(result) => (result, ExtractionTier::Partial),
            None => (AnalysisResult::fallback(), ExtractionTier::Fallback),
        },
    };
    if tier.is_structured() {
        tracing::debug!(tier = %tier, findings = result.findings.len(), "extracted analysis");
    } else {
        tracing::warn!(tier = %tier, raw_len = raw.len(), "generator response needed degraded extraction");
    }
    result
}

/// Tiers 1 to 4: find a complete top-level object.
fn structured(raw: &str) -> Option<(Value, ExtractionTier)> {
    if let Some(value) = fenced(raw) {
        return Some((value, ExtractionTier::Fenced));
    }

    let trimmed = raw.trim();
    if let Some(value) = parse_object(trimmed) {
        return Some((value, ExtractionTier::Direct));
    }

    if let Some(span) = greedy_span(trimmed) {
        if let Some(value) = parse_object(span) {
            return Some((value, ExtractionTier::GreedySpan));
        }
        if let Some(value) = parse_object(&repair(span)) {
            return Some((value, ExtractionTier::Repaired));
        }
    }

    parse_object(&repair(trimmed)).map(|value| (value, ExtractionTier::Repaired))
}

fn fenced(raw: &str) -> Option<Value> {
    FENCED_RE
        .captures_iter(raw)
        .filter_map(|c| c.get(1))
        .find_map(|m| parse_object(m.as_str().trim()))
}

/// Slice from the first `{` through the last `}`.
fn greedy_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Strict parse that only accepts a JSON object.
fn parse_object(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
}
