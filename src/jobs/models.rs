use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analysis::models::AnalysisResult;
use crate::testing::TestOutcome;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Analyzing,
    Testing,
    Fixing,
    ReadyForReview,
    Approved,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Testing => "testing",
            Self::Fixing => "fixing",
            Self::ReadyForReview => "ready_for_review",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        is_valid_transition(*self, to)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analyzing" => Ok(Self::Analyzing),
            "testing" => Ok(Self::Testing),
            "fixing" => Ok(Self::Fixing),
            "ready_for_review" => Ok(Self::ReadyForReview),
            "approved" => Ok(Self::Approved),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that a job status transition is legal.
///
/// Background task failures never appear here: they are recorded in the
/// task's own result field. A job fails when acquisition or the approval
/// chain fails, or when one of its results cannot be stored.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Analyzing)
            | (Pending, Failed)
            | (Analyzing, Testing)
            | (Analyzing, Failed)
            | (Testing, Fixing)
            | (Testing, ReadyForReview)
            | (Testing, Failed)
            | (Fixing, ReadyForReview)
            | (Fixing, Failed)
            | (ReadyForReview, Approved)
            | (Approved, Completed)
            | (Approved, Failed)
    )
}

/// What to analyze: a commit in a local clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub repo_path: PathBuf,
    pub commit_sha: String,
    /// `owner/repo` on the hosting platform, when known.
    #[serde(default)]
    pub repo_full_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub timestamp: String,
}

/// Outcome of the approval chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchRecord {
    pub branch_name: String,
    pub pr_url: String,
    pub pr_number: Option<u64>,
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub repo_path: PathBuf,
    pub repo_full_name: Option<String>,
    pub commit_sha: String,
    pub commit: Option<CommitInfo>,
    pub test_outcome: Option<TestOutcome>,
    pub analysis: Option<AnalysisResult>,
    pub patch_validation: Option<TestOutcome>,
    pub patch_record: Option<PatchRecord>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Both background tasks have reported, successfully or not.
    pub fn both_reported(&self) -> bool {
        self.test_outcome.is_some() && self.analysis.is_some()
    }

    pub fn request(&self) -> JobRequest {
        JobRequest {
            repo_path: self.repo_path.clone(),
            commit_sha: self.commit_sha.clone(),
            repo_full_name: self.repo_full_name.clone(),
        }
    }
}

/// Progress notifications broadcast while jobs run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    StatusChanged { job_id: String, status: JobStatus },
    TestsReported { job_id: String, passed: bool },
    AnalysisReported { job_id: String, findings: usize },
    WorkspaceReleased { job_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Analyzing,
        JobStatus::Testing,
        JobStatus::Fixing,
        JobStatus::ReadyForReview,
        JobStatus::Approved,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    #[test]
    fn test_job_status_roundtrip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_serde_snake_case() {
        let json = serde_json::to_string(&JobStatus::ReadyForReview).unwrap();
        assert_eq!(json, "\"ready_for_review\"");
    }

    #[test]
    fn test_valid_transitions() {
        use JobStatus::*;
        assert!(is_valid_transition(Pending, Analyzing));
        assert!(is_valid_transition(Analyzing, Testing));
        assert!(is_valid_transition(Testing, Fixing));
        assert!(is_valid_transition(Testing, ReadyForReview));
        assert!(is_valid_transition(Fixing, ReadyForReview));
        assert!(is_valid_transition(ReadyForReview, Approved));
        assert!(is_valid_transition(Approved, Completed));
        assert!(is_valid_transition(Approved, Failed));
        assert!(is_valid_transition(Pending, Failed));
        assert!(is_valid_transition(Testing, Failed));
        assert!(is_valid_transition(Fixing, Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        use JobStatus::*;
        assert!(!is_valid_transition(Approved, ReadyForReview));
        assert!(!is_valid_transition(ReadyForReview, Failed));
        assert!(!is_valid_transition(Pending, ReadyForReview));
        assert!(!is_valid_transition(Testing, Approved));
        assert!(!is_valid_transition(Fixing, Testing));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [JobStatus::Completed, JobStatus::Failed] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_pending_is_only_entry() {
        for to in ALL {
            if to != JobStatus::Pending {
                continue;
            }
            for from in ALL {
                assert!(!is_valid_transition(from, to));
            }
        }
    }

    #[test]
    fn test_job_event_tagged() {
        let event = JobEvent::StatusChanged {
            job_id: "j".into(),
            status: JobStatus::Testing,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StatusChanged");
        assert_eq!(json["data"]["status"], "testing");
    }
}
