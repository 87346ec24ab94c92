use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::models::*;
use crate::analysis::models::AnalysisResult;
use crate::errors::JobError;
use crate::testing::TestOutcome;

pub type JobResult<T> = std::result::Result<T, JobError>;

trait DbContext<T> {
    fn db(self, what: &str) -> JobResult<T>;
}

impl<T> DbContext<T> for rusqlite::Result<T> {
    fn db(self, what: &str) -> JobResult<T> {
        self.map_err(|e| JobError::Database(anyhow::Error::new(e).context(what.to_string())))
    }
}

fn to_json<T: Serialize>(value: &T) -> JobResult<String> {
    serde_json::to_string(value).map_err(|e| JobError::Database(e.into()))
}

fn from_json<T: DeserializeOwned>(column: &str, raw: Option<String>) -> JobResult<Option<T>> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            JobError::Database(anyhow::Error::new(e).context(format!("Corrupt {} column", column)))
        })
    })
    .transpose()
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Async-safe handle to the job store.
///
/// One mutex guards the connection. Every closure passed to [`DbHandle::call`]
/// runs under that lock on the blocking pool, so a read-check-write inside a
/// single closure cannot interleave with another writer.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run `f` with the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> JobResult<R>
    where
        F: FnOnce(&JobDb) -> JobResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| JobError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| JobError::Other(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    /// Lock synchronously. For startup, CLI paths and tests only.
    pub fn lock_sync(&self) -> JobResult<std::sync::MutexGuard<'_, JobDb>> {
        self.inner.lock().map_err(|_| JobError::LockPoisoned)
    }
}

pub struct JobDb {
    conn: Connection,
}

struct JobRow {
    id: String,
    status: String,
    repo_path: String,
    repo_full_name: Option<String>,
    commit_sha: String,
    commit_info: Option<String>,
    test_outcome: Option<String>,
    analysis: Option<String>,
    patch_validation: Option<String>,
    patch_record: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self) -> JobResult<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| JobError::Database(anyhow::anyhow!(e)))?;
        Ok(Job {
            id: self.id,
            status,
            repo_path: PathBuf::from(self.repo_path),
            repo_full_name: self.repo_full_name,
            commit_sha: self.commit_sha,
            commit: from_json("commit_info", self.commit_info)?,
            test_outcome: from_json("test_outcome", self.test_outcome)?,
            analysis: from_json("analysis", self.analysis)?,
            patch_validation: from_json("patch_validation", self.patch_validation)?,
            patch_record: from_json("patch_record", self.patch_record)?,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, status, repo_path, repo_full_name, commit_sha, commit_info, \
     test_outcome, analysis, patch_validation, patch_record, error, created_at, updated_at";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        status: row.get(1)?,
        repo_path: row.get(2)?,
        repo_full_name: row.get(3)?,
        commit_sha: row.get(4)?,
        commit_info: row.get(5)?,
        test_outcome: row.get(6)?,
        analysis: row.get(7)?,
        patch_validation: row.get(8)?,
        patch_record: row.get(9)?,
        error: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl JobDb {
    /// Open (or create) a database file and run migrations.
    pub fn new(path: &Path) -> JobResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobError::Database(anyhow::Error::new(e).context("Failed to create database directory"))
            })?;
        }
        let conn = Connection::open(path).db("Failed to open SQLite database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory database for tests and one-shot CLI runs.
    pub fn new_in_memory() -> JobResult<Self> {
        let conn = Connection::open_in_memory().db("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    /// Raw SQL against the connection, for tests that need to break the store.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> rusqlite::Result<()> {
        self.conn.execute_batch(sql)
    }

    fn run_migrations(&self) -> JobResult<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'pending',
                    repo_path TEXT NOT NULL,
                    repo_full_name TEXT,
                    commit_sha TEXT NOT NULL,
                    commit_info TEXT,
                    test_outcome TEXT,
                    analysis TEXT,
                    patch_validation TEXT,
                    patch_record TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);
                ",
            )
            .db("Failed to run migrations")
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn get_job(&self, id: &str) -> JobResult<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                read_row,
            )
            .optional()
            .db("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    /// Like [`JobDb::get_job`] but a missing job is an error.
    pub fn require_job(&self, id: &str) -> JobResult<Job> {
        self.get_job(id)?
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })
    }

    pub fn list_jobs(&self) -> JobResult<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM jobs ORDER BY created_at, rowid",
                JOB_COLUMNS
            ))
            .db("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map([], read_row)
            .db("Failed to query jobs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .db("Failed to read job row")?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    // ── Writes ────────────────────────────────────────────────────────

    pub fn create_job(&self, request: &JobRequest) -> JobResult<Job> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO jobs (id, status, repo_path, repo_full_name, commit_sha, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id,
                    JobStatus::Pending.as_str(),
                    request.repo_path.to_string_lossy().to_string(),
                    request.repo_full_name,
                    request.commit_sha,
                    ts,
                ],
            )
            .db("Failed to insert job")?;
        self.require_job(&id)
    }

    /// Delete every job. Returns how many were removed.
    pub fn clear_jobs(&self) -> JobResult<usize> {
        self.conn
            .execute("DELETE FROM jobs", [])
            .db("Failed to clear jobs")
    }

    fn set_column(&self, id: &str, column: &str, value: Option<String>) -> JobResult<Job> {
        let changed = self
            .conn
            .execute(
                &format!("UPDATE jobs SET {} = ?1, updated_at = ?2 WHERE id = ?3", column),
                params![value, now(), id],
            )
            .db("Failed to update job")?;
        if changed == 0 {
            return Err(JobError::NotFound { id: id.to_string() });
        }
        self.require_job(id)
    }

    pub fn set_commit(&self, id: &str, commit: &CommitInfo) -> JobResult<Job> {
        self.set_column(id, "commit_info", Some(to_json(commit)?))
    }

    pub fn set_test_outcome(&self, id: &str, outcome: &TestOutcome) -> JobResult<Job> {
        self.set_column(id, "test_outcome", Some(to_json(outcome)?))
    }

    pub fn set_analysis(&self, id: &str, analysis: &AnalysisResult) -> JobResult<Job> {
        self.set_column(id, "analysis", Some(to_json(analysis)?))
    }

    pub fn set_patch_validation(&self, id: &str, outcome: &TestOutcome) -> JobResult<Job> {
        self.set_column(id, "patch_validation", Some(to_json(outcome)?))
    }

    fn write_status(&self, id: &str, to: JobStatus, error: Option<&str>) -> JobResult<()> {
        match error {
            Some(msg) => self.conn.execute(
                "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![to.as_str(), msg, now(), id],
            ),
            None => self.conn.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), now(), id],
            ),
        }
        .db("Failed to update job status")?;
        Ok(())
    }

    /// Move a job to `to` if the state machine allows it from its current
    /// status.
    pub fn transition(&self, id: &str, to: JobStatus) -> JobResult<Job> {
        let job = self.require_job(id)?;
        if !job.status.can_transition_to(to) {
            return Err(JobError::precondition(
                id,
                format!("a state that can move to {}", to),
                job.status,
            ));
        }
        self.write_status(id, to, None)?;
        tracing::debug!(job_id = %id, from = %job.status, to = %to, "job transition");
        self.require_job(id)
    }

    /// Move `from -> to` only if the job is currently `from`. Returns whether
    /// the move happened.
    pub fn advance_if(&self, id: &str, from: JobStatus, to: JobStatus) -> JobResult<bool> {
        let job = self.require_job(id)?;
        if job.status != from || !from.can_transition_to(to) {
            return Ok(false);
        }
        self.write_status(id, to, None)?;
        Ok(true)
    }

    /// Move to `ReadyForReview`. Requires both task results to be present.
    pub fn mark_ready(&self, id: &str) -> JobResult<Job> {
        let job = self.require_job(id)?;
        if !job.both_reported() {
            return Err(JobError::precondition(
                id,
                "both test and analysis results",
                job.status,
            ));
        }
        self.transition(id, JobStatus::ReadyForReview)
    }

    /// Move to `Failed` and record `error`.
    pub fn fail(&self, id: &str, error: &str) -> JobResult<Job> {
        let job = self.require_job(id)?;
        if !job.status.can_transition_to(JobStatus::Failed) {
            return Err(JobError::precondition(
                id,
                "a state that can fail",
                job.status,
            ));
        }
        self.write_status(id, JobStatus::Failed, Some(error))?;
        tracing::warn!(job_id = %id, from = %job.status, error = %error, "job failed");
        self.require_job(id)
    }

    /// Store the PR record and move `Approved -> Completed`.
    pub fn complete(&self, id: &str, record: &PatchRecord) -> JobResult<Job> {
        let job = self.require_job(id)?;
        if !job.status.can_transition_to(JobStatus::Completed) {
            return Err(JobError::precondition(
                id,
                JobStatus::Approved.as_str(),
                job.status,
            ));
        }
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, patch_record = ?2, updated_at = ?3 WHERE id = ?4",
                params![JobStatus::Completed.as_str(), to_json(record)?, now(), id],
            )
            .db("Failed to complete job")?;
        self.require_job(id)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestMethod;

    fn request() -> JobRequest {
        JobRequest {
            repo_path: PathBuf::from("/tmp/repo"),
            commit_sha: "abc123".into(),
            repo_full_name: Some("acme/widgets".into()),
        }
    }

    fn to_testing(db: &JobDb, id: &str) {
        db.transition(id, JobStatus::Analyzing).unwrap();
        db.transition(id, JobStatus::Testing).unwrap();
    }

    #[test]
    fn test_migrations_are_idempotent() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        db.run_migrations()?;
        let count: i32 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
                [],
                |row| row.get(0),
            )
            .db("count")?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn test_create_and_get_job() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let job = db.create_job(&request())?;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.commit_sha, "abc123");
        assert_eq!(job.repo_full_name.as_deref(), Some("acme/widgets"));
        assert!(job.test_outcome.is_none());
        assert!(job.analysis.is_none());

        let fetched = db.get_job(&job.id)?.unwrap();
        assert_eq!(fetched.id, job.id);
        assert!(db.get_job("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_and_clear_jobs() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let a = db.create_job(&request())?;
        let b = db.create_job(&request())?;
        let ids: Vec<String> = db.list_jobs()?.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(db.clear_jobs()?, 2);
        assert!(db.list_jobs()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_illegal_transition_is_precondition() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let job = db.create_job(&request())?;
        let err = db.transition(&job.id, JobStatus::Approved).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(db.require_job(&job.id)?.status, JobStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let db = JobDb::new_in_memory().unwrap();
        assert!(matches!(
            db.transition("nope", JobStatus::Analyzing),
            Err(JobError::NotFound { .. })
        ));
        assert!(matches!(
            db.set_analysis("nope", &AnalysisResult::fallback()),
            Err(JobError::NotFound { .. })
        ));
    }

    #[test]
    fn test_field_updates_are_independent() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let job = db.create_job(&request())?;
        to_testing(&db, &job.id);

        db.set_test_outcome(&job.id, &TestOutcome::new(4, 1, TestMethod::RealRun))?;
        let after = db.set_analysis(&job.id, &AnalysisResult::fallback())?;
        assert_eq!(after.test_outcome.unwrap().failed_tests(), 1);
        assert!(after.analysis.is_some());
        assert_eq!(after.status, JobStatus::Testing);
        Ok(())
    }

    #[test]
    fn test_mark_ready_requires_both_fields() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let job = db.create_job(&request())?;
        to_testing(&db, &job.id);

        db.set_test_outcome(&job.id, &TestOutcome::empty())?;
        assert!(db.mark_ready(&job.id).unwrap_err().is_precondition());

        db.set_analysis(&job.id, &AnalysisResult::fallback())?;
        let ready = db.mark_ready(&job.id)?;
        assert_eq!(ready.status, JobStatus::ReadyForReview);
        Ok(())
    }

    #[test]
    fn test_mark_ready_from_fixing() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let job = db.create_job(&request())?;
        to_testing(&db, &job.id);
        db.set_analysis(&job.id, &AnalysisResult::fallback())?;
        assert!(db.advance_if(&job.id, JobStatus::Testing, JobStatus::Fixing)?);
        assert!(!db.advance_if(&job.id, JobStatus::Testing, JobStatus::Fixing)?);
        db.set_test_outcome(&job.id, &TestOutcome::empty())?;
        assert_eq!(db.mark_ready(&job.id)?.status, JobStatus::ReadyForReview);
        Ok(())
    }

    #[test]
    fn test_fail_records_error() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let job = db.create_job(&request())?;
        let failed = db.fail(&job.id, "clone failed")?;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("clone failed"));
        assert!(db.fail(&job.id, "again").unwrap_err().is_precondition());
        Ok(())
    }

    #[test]
    fn test_complete_requires_approved() -> JobResult<()> {
        let db = JobDb::new_in_memory()?;
        let job = db.create_job(&request())?;
        let record = PatchRecord {
            branch_name: "bugsniper/fix-1".into(),
            pr_url: "https://github.com/acme/widgets/pull/7".into(),
            pr_number: Some(7),
            files_changed: 1,
            additions: 2,
            deletions: 1,
        };
        assert!(db.complete(&job.id, &record).unwrap_err().is_precondition());

        to_testing(&db, &job.id);
        db.set_test_outcome(&job.id, &TestOutcome::empty())?;
        db.set_analysis(&job.id, &AnalysisResult::fallback())?;
        db.mark_ready(&job.id)?;
        db.transition(&job.id, JobStatus::Approved)?;
        let done = db.complete(&job.id, &record)?;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.patch_record.unwrap().pr_number, Some(7));
        Ok(())
    }

    #[test]
    fn test_file_database_persists() -> JobResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let id = JobDb::new(&path)?.create_job(&request())?.id;
        let reopened = JobDb::new(&path)?;
        assert_eq!(reopened.require_job(&id)?.status, JobStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> JobResult<()> {
        let handle = DbHandle::new(JobDb::new_in_memory()?);
        let job = handle.call(|db| db.create_job(&request())).await?;
        let id = job.id.clone();
        let fetched = handle.call(move |db| db.require_job(&id)).await?;
        assert_eq!(fetched.id, job.id);
        assert_eq!(handle.lock_sync()?.list_jobs()?.len(), 1);
        Ok(())
    }
}
