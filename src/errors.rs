//! Typed error hierarchy for bugsniper.
//!
//! Only job-level failures are errors. A failing background task is recorded
//! as an error-shaped result in its own field, and a response the extractor
//! cannot parse resolves to the fallback record, so neither appears here.

use thiserror::Error;

use crate::jobs::models::JobStatus;

/// Errors from the job state machine, the dispatcher and the approval flow.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} is {actual}, expected {expected}")]
    Precondition {
        id: String,
        expected: String,
        actual: JobStatus,
    },

    #[error("Workspace acquisition failed: {0}")]
    Acquisition(#[source] anyhow::Error),

    #[error("Approval failed: {0}")]
    Approval(#[source] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn precondition(id: &str, expected: impl Into<String>, actual: JobStatus) -> Self {
        JobError::Precondition {
            id: id.to_string(),
            expected: expected.into(),
            actual,
        }
    }

    /// True for errors caused by the caller asking for something the job's
    /// current state does not allow.
    pub fn is_precondition(&self) -> bool {
        matches!(self, JobError::Precondition { .. })
    }
}
