//! Analysis prompt construction from a workspace and its commit.

use std::path::Path;

use anyhow::{Context, Result};

use crate::jobs::models::CommitInfo;
use crate::testing::discovery::is_test_file_name;
use crate::util::{is_ignored_dir, relative_display, truncate_chars};

/// Limits on how much of the workspace goes into one prompt.
#[derive(Debug, Clone)]
pub struct PromptLimits {
    pub max_files: usize,
    pub max_file_chars: usize,
    pub max_structure_entries: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_file_chars: 2000,
            max_structure_entries: 200,
        }
    }
}

/// A source file selected for the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Everything the prompt needs from the workspace.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceContext {
    pub structure: Vec<String>,
    pub files: Vec<SourceFile>,
}

impl WorkspaceContext {
    /// Walk `root` and pick the files to show the generator.
    ///
    /// Non-test sources come first, test files last, each group in path
    /// order. Unreadable or non-UTF-8 files are skipped.
    pub fn gather(root: &Path, limits: &PromptLimits) -> Result<Self> {
        let mut structure = Vec::new();
        let mut candidates = Vec::new();

        for entry in walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored_dir(e))
        {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_display(root, entry.path());
            if structure.len() < limits.max_structure_entries {
                structure.push(rel.clone());
            }
            if rel.ends_with(".py") {
                let is_test = is_test_file_name(&entry.file_name().to_string_lossy());
                candidates.push((is_test, rel, entry.into_path()));
            }
        }

        candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let files = candidates
            .into_iter()
            .filter_map(|(_, rel, path)| {
                let content = std::fs::read_to_string(&path).ok()?;
                Some(SourceFile {
                    path: rel,
                    content: truncate_chars(&content, limits.max_file_chars),
                })
            })
            .take(limits.max_files)
            .collect();

        Ok(Self { structure, files })
    }
}

const RESPONSE_FORMAT: &str = r#"Respond with a single JSON object and nothing else (no markdown fences, no commentary):
{
  "issue_summary": "One or two sentences summarizing the problems found",
  "bugs_detected": [
    {
      "type": "syntax_error|logical_bug|runtime_error|security_vulnerability|exception_handling|code_quality|performance",
      "severity": "critical|high|medium|low",
      "file": "path/relative/to/repo.py",
      "line": 0,
      "description": "One sentence naming the defect and its location",
      "impact": "What goes wrong if it ships",
      "reproduction": "How to trigger it"
    }
  ],
  "optimizations": [
    {
      "type": "performance|security|maintainability|readability",
      "file": "path/relative/to/repo.py",
      "line": 0,
      "current_approach": "What the code does now",
      "suggested_approach": "What it should do instead",
      "benefit": "Why the change helps"
    }
  ],
  "patch": "A unified diff (git apply compatible, paths prefixed a/ and b/) fixing the most severe issues, or an empty string",
  "deployable_status": "deployable|not_deployable|unknown",
  "confidence_score": 0.0
}"#;

const REVIEW_GUIDANCE: &str = r#"Review the files line by line. Look for syntax errors, logic errors, unhandled exceptions, security problems (injection, eval/exec on input, path traversal, unsafe deserialization), resource leaks, performance problems and maintainability issues. Reference exact files and line numbers. Keep each description to one sentence.

deployable_status:
- "deployable": no critical or high severity bugs, no security vulnerabilities, nothing that would stop the code from running.
- "not_deployable": any critical bug, any security vulnerability, any syntax or runtime error, or high severity bugs that can lose data or crash.
- "unknown": not enough information to decide, or confidence below 0.7.

confidence_score is a number between 0 and 1: 0.9 and above for a thorough review, 0.5 to 0.7 when parts of the code could not be assessed, below 0.5 when the review has significant gaps."#;

/// Build the prompt sent to the text generator.
pub fn build_analysis_prompt(commit: &CommitInfo, context: &WorkspaceContext) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are reviewing a single commit of a Python project. Find bugs, security issues and \
         improvement opportunities, and propose a patch for the most important problems.\n\n",
    );

    prompt.push_str("## Commit\n");
    prompt.push_str(&format!("- SHA: {}\n", commit.sha));
    prompt.push_str(&format!("- Author: {}\n", commit.author));
    prompt.push_str(&format!(
        "- Message: {}\n\n",
        if commit.message.trim().is_empty() {
            "(no message)"
        } else {
            commit.message.trim()
        }
    ));

    prompt.push_str("## Repository structure\n```\n");
    for path in &context.structure {
        prompt.push_str(path);
        prompt.push('\n');
    }
    prompt.push_str("```\n\n");

    prompt.push_str("## Files\n");
    if context.files.is_empty() {
        prompt.push_str("(no Python source files found)\n");
    }
    for file in &context.files {
        prompt.push_str(&format!("\n--- {} ---\n", file.path));
        prompt.push_str(&number_lines(&file.content));
        prompt.push('\n');
    }

    prompt.push_str("\n## Instructions\n");
    prompt.push_str(REVIEW_GUIDANCE);
    prompt.push_str("\n\n");
    prompt.push_str(RESPONSE_FORMAT);
    prompt.push('\n');
    prompt
}

fn number_lines(content: &str) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:4}| {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}
