//! Approval: turn a reviewed job into a branch and a pull request.

use std::collections::BTreeSet;

use chrono::{DateTime, Local};

use super::db::{DbHandle, JobResult};
use super::github::{PullRequestDraft, PullRequestPublisher};
use super::models::{Job, JobStatus, PatchRecord};
use crate::analysis::models::DeployableStatus;
use crate::errors::JobError;
use crate::util::short_sha;

/// Line counts for a unified diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

fn diff_path(rest: &str, prefix: &str) -> Option<String> {
    let path = rest.split('\t').next()?.trim();
    if path == "/dev/null" {
        return None;
    }
    Some(path.strip_prefix(prefix).unwrap_or(path).to_string())
}

/// Line count of one side of a hunk range: `start,count` or `start`.
fn range_len(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((_, count)) => count.parse().ok(),
        None => range.parse::<usize>().ok().map(|_| 1),
    }
}

/// Old and new line counts from `@@ -a,b +c,d @@`.
fn hunk_lens(line: &str) -> Option<(usize, usize)> {
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, _) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(" +")?;
    Some((range_len(old)?, range_len(new)?))
}

/// Count files, added and removed lines in a unified diff.
///
/// Inside a hunk every line is body until the header's counts are used up,
/// so removed lines that start with `-- ` are not mistaken for file headers.
pub fn patch_stats(diff: &str) -> PatchStats {
    let mut files = BTreeSet::new();
    let mut stats = PatchStats::default();
    let mut pending_old: Option<String> = None;
    let (mut old_left, mut new_left) = (0usize, 0usize);

    for line in diff.lines() {
        if old_left > 0 || new_left > 0 {
            match line.as_bytes().first() {
                Some(b'+') => {
                    stats.additions += 1;
                    new_left = new_left.saturating_sub(1);
                }
                Some(b'-') => {
                    stats.deletions += 1;
                    old_left = old_left.saturating_sub(1);
                }
                Some(b'\\') => {}
                _ => {
                    old_left = old_left.saturating_sub(1);
                    new_left = new_left.saturating_sub(1);
                }
            }
            continue;
        }

        if let Some((old, new)) = hunk_lens(line) {
            old_left = old;
            new_left = new;
        } else if let Some(rest) = line.strip_prefix("--- ") {
            pending_old = diff_path(rest, "a/");
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(path) = diff_path(rest, "b/").or_else(|| pending_old.take()) {
                files.insert(path);
            }
            pending_old = None;
        } else if line.starts_with('+') {
            stats.additions += 1;
        } else if line.starts_with('-') {
            stats.deletions += 1;
        }
    }

    stats.files_changed = files.len();
    stats
}

pub fn branch_name(now: DateTime<Local>) -> String {
    format!("bugsniper/fix-{}", now.format("%Y%m%d_%H%M%S"))
}

pub fn pr_title(commit_sha: &str) -> String {
    format!("BugSniper: Fix issues in {}", short_sha(commit_sha))
}

fn deployable_badge(status: DeployableStatus) -> &'static str {
    match status {
        DeployableStatus::Deployable => "🟢 DEPLOYABLE",
        DeployableStatus::NotDeployable => "🔴 NOT DEPLOYABLE",
        DeployableStatus::Unknown => "🟡 UNKNOWN",
    }
}

/// Render the PR description from the job's typed results.
pub fn render_pr_body(job: &Job) -> String {
    let mut body = String::from("## BugSniper Analysis Results\n\n");

    let commit = job.commit.clone().unwrap_or_default();
    body.push_str(&format!("**Commit:** {}  \n", job.commit_sha));
    body.push_str(&format!("**Author:** {}  \n", commit.author));
    body.push_str(&format!(
        "**Message:** {}\n\n",
        commit.message.lines().next().unwrap_or("")
    ));

    body.push_str("### Issues Detected\n");
    match &job.analysis {
        Some(analysis) if !analysis.findings.is_empty() => {
            for finding in &analysis.findings {
                body.push_str(&format!(
                    "- **[{}]** {} at `{}`: {}\n",
                    finding.severity, finding.kind, finding.location(), finding.description
                ));
            }
        }
        _ => body.push_str("- None\n"),
    }

    body.push_str("\n### Optimizations\n");
    match &job.analysis {
        Some(analysis) if !analysis.suggestions.is_empty() => {
            for suggestion in &analysis.suggestions {
                body.push_str(&format!(
                    "- **{}** `{}:{}`: {}\n",
                    suggestion.kind, suggestion.file, suggestion.line, suggestion.suggested_approach
                ));
            }
        }
        _ => body.push_str("- None\n"),
    }

    body.push_str("\n### Test Results\n");
    match &job.test_outcome {
        Some(outcome) => {
            body.push_str(&format!(
                "- **Status:** {}\n",
                if outcome.passed() { "✅ PASSED" } else { "❌ FAILED" }
            ));
            body.push_str(&format!(
                "- **Tests:** {} total, {} failed\n",
                outcome.total_tests(),
                outcome.failed_tests()
            ));
            body.push_str(&format!("- **Method:** {}\n", outcome.method()));
        }
        None => body.push_str("- Not run\n"),
    }
    if let Some(validation) = &job.patch_validation {
        body.push_str(&format!("- **With patch:** {}\n", validation.summary()));
    }
    let confidence = job.analysis.as_ref().map(|a| a.confidence_score).unwrap_or(0.0);
    body.push_str(&format!("- **Confidence:** {:.2}\n", confidence));

    body.push_str("\n### Deployable Status\n");
    let status = job
        .analysis
        .as_ref()
        .map(|a| a.deployable_status)
        .unwrap_or_default();
    body.push_str(deployable_badge(status));
    body.push_str("\n\n---\n*This PR was generated by BugSniper*\n");
    body
}

/// Build the publisher input for a job that carries a patch.
pub fn build_draft(job: &Job, branch: String) -> Option<PullRequestDraft> {
    let analysis = job.analysis.as_ref().filter(|a| a.has_patch())?;
    Some(PullRequestDraft {
        repo_path: job.repo_path.clone(),
        repo_full_name: job.repo_full_name.clone(),
        commit_sha: job.commit_sha.clone(),
        branch_name: branch,
        title: pr_title(&job.commit_sha),
        commit_message: format!("{}\n\n{}", pr_title(&job.commit_sha), analysis.issue_summary),
        body: render_pr_body(job),
        patch: analysis.patch.clone(),
    })
}

/// Approve a `ReadyForReview` job and publish its patch.
///
/// Success ends in `Completed` with a [`PatchRecord`]. Any publishing
/// failure ends in `Failed` with the error text stored, and is returned as
/// [`JobError::Approval`].
pub async fn approve(
    db: &DbHandle,
    publisher: &dyn PullRequestPublisher,
    id: &str,
) -> JobResult<Job> {
    let job_id = id.to_string();
    let job = db
        .call(move |db| {
            let job = db.require_job(&job_id)?;
            if job.status != JobStatus::ReadyForReview {
                return Err(JobError::precondition(
                    &job_id,
                    JobStatus::ReadyForReview.as_str(),
                    job.status,
                ));
            }
            db.transition(&job_id, JobStatus::Approved)
        })
        .await?;
    tracing::info!(job_id = %id, "job approved");

    let branch = branch_name(Local::now());
    let result = match build_draft(&job, branch.clone()) {
        Some(draft) => publisher
            .publish(&draft)
            .await
            .map(|pr| (pr, patch_stats(&draft.patch))),
        None => Err(anyhow::anyhow!("Analysis produced no patch to apply")),
    };

    match result {
        Ok((pr, stats)) => {
            let record = PatchRecord {
                branch_name: branch,
                pr_url: pr.url,
                pr_number: pr.number,
                files_changed: stats.files_changed,
                additions: stats.additions,
                deletions: stats.deletions,
            };
            let job_id = id.to_string();
            db.call(move |db| db.complete(&job_id, &record)).await
        }
        Err(e) => {
            let message = format!("Approval failed: {:#}", e);
            tracing::error!(job_id = %id, error = %message, "publishing failed");
            let job_id = id.to_string();
            db.call(move |db| db.fail(&job_id, &message)).await?;
            Err(JobError::Approval(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::models::{
        AnalysisResult, ExtractionTier, Finding, FindingKind, Severity, Suggestion, SuggestionKind,
    };
    use crate::jobs::db::JobDb;
    use crate::jobs::github::PublishedPullRequest;
    use crate::jobs::models::{CommitInfo, JobRequest};
    use crate::testing::{TestMethod, TestOutcome};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const DIFF: &str = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n-x = eval(input())\n+x = int(input())\n print(x)\n--- a/old.py\n+++ /dev/null\n@@ -1 +0,0 @@\n-gone = True\n";

    struct FakePublisher {
        fail: bool,
        drafts: Mutex<Vec<PullRequestDraft>>,
    }

    impl FakePublisher {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                drafts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PullRequestPublisher for FakePublisher {
        async fn publish(&self, draft: &PullRequestDraft) -> anyhow::Result<PublishedPullRequest> {
            self.drafts.lock().unwrap().push(draft.clone());
            if self.fail {
                anyhow::bail!("push rejected");
            }
            Ok(PublishedPullRequest {
                url: "https://github.com/acme/widgets/pull/7".into(),
                number: Some(7),
            })
        }
    }

    fn analysis(patch: &str) -> AnalysisResult {
        AnalysisResult {
            issue_summary: "Unsafe eval".into(),
            findings: vec![
                Finding::new(
                    FindingKind::SecurityVulnerability,
                    Severity::Critical,
                    "eval on user input",
                )
                .at("app.py", 1),
            ],
            suggestions: vec![Suggestion {
                kind: SuggestionKind::Security,
                file: "app.py".into(),
                line: 1,
                current_approach: "eval".into(),
                suggested_approach: "parse with int()".into(),
                benefit: "no code execution".into(),
            }],
            patch: patch.into(),
            deployable_status: DeployableStatus::NotDeployable,
            confidence_score: 0.85,
            tier: ExtractionTier::Direct,
        }
    }

    fn ready_job(db: &DbHandle, patch: &str) -> Job {
        let guard = db.lock_sync().unwrap();
        let job = guard
            .create_job(&JobRequest {
                repo_path: PathBuf::from("/tmp/repo"),
                commit_sha: "0123456789abcdef".into(),
                repo_full_name: Some("acme/widgets".into()),
            })
            .unwrap();
        guard
            .set_commit(
                &job.id,
                &CommitInfo {
                    sha: "0123456789abcdef".into(),
                    message: "Add calculator\n\nbody".into(),
                    author: "Dev".into(),
                    ..CommitInfo::default()
                },
            )
            .unwrap();
        guard.transition(&job.id, JobStatus::Analyzing).unwrap();
        guard.transition(&job.id, JobStatus::Testing).unwrap();
        guard
            .set_test_outcome(&job.id, &TestOutcome::new(10, 3, TestMethod::RealRun))
            .unwrap();
        guard.set_analysis(&job.id, &analysis(patch)).unwrap();
        guard.mark_ready(&job.id).unwrap()
    }

    #[test]
    fn test_patch_stats() {
        let stats = patch_stats(DIFF);
        assert_eq!(
            stats,
            PatchStats {
                files_changed: 2,
                additions: 1,
                deletions: 2
            }
        );
        assert_eq!(patch_stats(""), PatchStats::default());
    }

    #[test]
    fn test_patch_stats_header_lookalikes_in_hunk() {
        let diff = "--- a/q.sql\n+++ b/q.sql\n@@ -1,2 +1,2 @@\n--- old comment\n+++ new comment\n select 1;\n";
        assert_eq!(
            patch_stats(diff),
            PatchStats {
                files_changed: 1,
                additions: 1,
                deletions: 1
            }
        );
    }

    #[test]
    fn test_patch_stats_hunk_without_counts() {
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -3 +3 @@\n-a = 1\n+a = 2\n\\ No newline at end of file\n--- a/b.py\n+++ b/b.py\n@@ -1,0 +1 @@\n+b = 1\n";
        assert_eq!(
            patch_stats(diff),
            PatchStats {
                files_changed: 2,
                additions: 2,
                deletions: 1
            }
        );
    }

    #[test]
    fn test_branch_and_title() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(branch_name(now), "bugsniper/fix-20240309_140507");
        assert_eq!(pr_title("0123456789abcdef"), "BugSniper: Fix issues in 01234567");
    }

    #[tokio::test]
    async fn test_pr_body_lists_typed_results() {
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let job = ready_job(&db, DIFF);
        let body = render_pr_body(&job);
        assert!(body.contains("**Commit:** 0123456789abcdef"));
        assert!(body.contains("**Message:** Add calculator\n"));
        assert!(body.contains("- **[critical]** security_vulnerability at `app.py:1`: eval on user input"));
        assert!(body.contains("- **security** `app.py:1`: parse with int()"));
        assert!(body.contains("10 total, 3 failed"));
        assert!(body.contains("❌ FAILED"));
        assert!(body.contains("**Confidence:** 0.85"));
        assert!(body.contains("🔴 NOT DEPLOYABLE"));
    }

    #[tokio::test]
    async fn test_approve_success_completes() {
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let job = ready_job(&db, DIFF);
        let publisher = FakePublisher::new(false);

        let done = approve(&db, &publisher, &job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let record = done.patch_record.unwrap();
        assert_eq!(record.pr_number, Some(7));
        assert_eq!(record.files_changed, 2);
        assert!(record.branch_name.starts_with("bugsniper/fix-"));

        let drafts = publisher.drafts.lock().unwrap();
        assert_eq!(drafts[0].title, "BugSniper: Fix issues in 01234567");
        assert!(drafts[0].commit_message.ends_with("Unsafe eval"));
        assert_eq!(drafts[0].repo_full_name.as_deref(), Some("acme/widgets"));
    }

    #[tokio::test]
    async fn test_approve_from_wrong_state_is_precondition() {
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let job = db
            .call(|db| {
                db.create_job(&JobRequest {
                    repo_path: PathBuf::from("/tmp/repo"),
                    commit_sha: "abc".into(),
                    repo_full_name: None,
                })
            })
            .await
            .unwrap();
        let publisher = FakePublisher::new(false);
        let err = approve(&db, &publisher, &job.id).await.unwrap_err();
        assert!(err.is_precondition());
        assert!(publisher.drafts.lock().unwrap().is_empty());

        let err = approve(&db, &publisher, "missing").await.unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_publisher_failure_fails_job() {
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let job = ready_job(&db, DIFF);
        let err = approve(&db, &FakePublisher::new(true), &job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Approval(_)));

        let job = db.lock_sync().unwrap().require_job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("push rejected"));

        let again = approve(&db, &FakePublisher::new(false), &job.id)
            .await
            .unwrap_err();
        assert!(again.is_precondition());
    }

    #[tokio::test]
    async fn test_approve_without_patch_fails_job() {
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let job = ready_job(&db, "   ");
        let publisher = FakePublisher::new(false);
        let err = approve(&db, &publisher, &job.id).await.unwrap_err();
        assert!(matches!(err, JobError::Approval(_)));
        assert!(publisher.drafts.lock().unwrap().is_empty());
        let job = db.lock_sync().unwrap().require_job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("no patch"));
    }
}
