//! Runs one job: acquire a workspace, test and analyze it concurrently,
//! join, validate the proposed patch, release the workspace.
//!
//! ```text
//!            ┌── test task ─────> set_test_outcome ──┐
//! acquire ───┤                                       ├── join ─> patch check ─> release ─> ReadyForReview
//!            └── analysis task ─> set_analysis ──────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::db::{DbHandle, JobResult};
use super::models::{CommitInfo, Job, JobEvent, JobRequest, JobStatus};
use crate::analysis::extract::extract_analysis;
use crate::analysis::generator::TextGenerator;
use crate::analysis::models::AnalysisResult;
use crate::analysis::prompt::{PromptLimits, WorkspaceContext, build_analysis_prompt};
use crate::errors::JobError;
use crate::testing::{TestExecutor, TestOutcome};
use crate::workspace::{SourceProvider, Workspace, WorkspaceManager};

/// Timeouts and switches for a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub generator_timeout: Duration,
    pub test_timeout: Duration,
    pub validate_patches: bool,
    pub prompt_limits: PromptLimits,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            generator_timeout: Duration::from_secs(300),
            test_timeout: Duration::from_secs(300),
            validate_patches: true,
            prompt_limits: PromptLimits::default(),
        }
    }
}

/// Owns the collaborators and fans each job out into two background tasks.
pub struct Dispatcher {
    db: DbHandle,
    workspaces: WorkspaceManager,
    source: Arc<dyn SourceProvider>,
    generator: Arc<dyn TextGenerator>,
    tests: Arc<dyn TestExecutor>,
    events: broadcast::Sender<JobEvent>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        db: DbHandle,
        workspaces: WorkspaceManager,
        source: Arc<dyn SourceProvider>,
        generator: Arc<dyn TextGenerator>,
        tests: Arc<dyn TestExecutor>,
        config: DispatchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            workspaces,
            source,
            generator,
            tests,
            events,
            config,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn transition(&self, id: &str, to: JobStatus) -> JobResult<Job> {
        let job_id = id.to_string();
        let job = self.db.call(move |db| db.transition(&job_id, to)).await?;
        self.emit(JobEvent::StatusChanged {
            job_id: id.to_string(),
            status: to,
        });
        Ok(job)
    }

    /// Create a pending job and start it in the background.
    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> JobResult<(Job, JoinHandle<()>)> {
        let job = self.db.call(move |db| db.create_job(&request)).await?;
        tracing::info!(job_id = %job.id, commit = %job.commit_sha, "job submitted");

        let this = Arc::clone(self);
        let id = job.id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.run_job(&id).await {
                tracing::error!(job_id = %id, error = %e, "job run failed");
            }
        });
        Ok((job, handle))
    }

    /// Drive a pending job until it is `ReadyForReview` or `Failed`.
    pub async fn run_job(&self, id: &str) -> JobResult<Job> {
        let job_id = id.to_string();
        let job = self.db.call(move |db| db.require_job(&job_id)).await?;
        if job.status != JobStatus::Pending {
            return Err(JobError::precondition(id, JobStatus::Pending.as_str(), job.status));
        }
        let request = job.request();

        let (workspace, commit) = match self
            .workspaces
            .acquire(self.source.as_ref(), id, &request)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                let err = JobError::Acquisition(e);
                tracing::error!(job_id = %id, error = %err, "workspace acquisition failed");
                return self.fail_job(id, err).await;
            }
        };
        let workspace = Arc::new(workspace);

        let outcome = self.fan_out(id, &workspace, commit).await;
        self.finalize(id, &workspace).await;

        let ready = match outcome {
            Ok(()) => {
                let job_id = id.to_string();
                self.db.call(move |db| db.mark_ready(&job_id)).await
            }
            Err(e) => Err(e),
        };
        match ready {
            Ok(ready) => {
                self.emit(JobEvent::StatusChanged {
                    job_id: id.to_string(),
                    status: JobStatus::ReadyForReview,
                });
                tracing::info!(job_id = %id, "job ready for review");
                Ok(ready)
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "failed to store job progress");
                self.fail_job(id, e).await
            }
        }
    }

    /// Record `err` on the job and move it to `Failed`. If even that write
    /// is rejected, the original error is returned.
    async fn fail_job(&self, id: &str, err: JobError) -> JobResult<Job> {
        let job_id = id.to_string();
        let message = err.to_string();
        match self.db.call(move |db| db.fail(&job_id, &message)).await {
            Ok(failed) => {
                self.emit(JobEvent::StatusChanged {
                    job_id: id.to_string(),
                    status: JobStatus::Failed,
                });
                Ok(failed)
            }
            Err(fail_err) => {
                tracing::error!(job_id = %id, error = %fail_err, "could not mark job failed");
                Err(err)
            }
        }
    }

    async fn fan_out(&self, id: &str, workspace: &Arc<Workspace>, commit: CommitInfo) -> JobResult<()> {
        let job_id = id.to_string();
        let stored = commit.clone();
        self.db.call(move |db| db.set_commit(&job_id, &stored)).await?;
        self.transition(id, JobStatus::Analyzing).await?;
        self.transition(id, JobStatus::Testing).await?;

        let test_task = tokio::spawn(test_task(
            id.to_string(),
            Arc::clone(workspace),
            Arc::clone(&self.tests),
            self.db.clone(),
            self.events.clone(),
            self.config.test_timeout,
        ));
        let analysis_task = tokio::spawn(analysis_task(
            id.to_string(),
            Arc::clone(workspace),
            commit,
            Arc::clone(&self.generator),
            self.db.clone(),
            self.events.clone(),
            self.config.clone(),
        ));

        let (test_joined, analysis_joined) = tokio::join!(test_task, analysis_task);

        // A panicked task never wrote its field; record that here.
        match test_joined {
            Ok(stored) => stored?,
            Err(e) => {
                let job_id = id.to_string();
                let outcome = TestOutcome::task_error(format!("test task panicked: {}", e));
                self.db
                    .call(move |db| db.set_test_outcome(&job_id, &outcome))
                    .await?;
            }
        }
        match analysis_joined {
            Ok(stored) => stored?,
            Err(e) => {
                let job_id = id.to_string();
                let analysis =
                    AnalysisResult::task_error(&format!("analysis task panicked: {}", e));
                self.db
                    .call(move |db| db.set_analysis(&job_id, &analysis))
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs once per job after both tasks have finished. The only place a
    /// workspace is deleted.
    async fn finalize(&self, id: &str, workspace: &Arc<Workspace>) {
        if self.config.validate_patches {
            if let Err(e) = self.validate_patch(id, workspace).await {
                tracing::warn!(job_id = %id, error = %e, "patch validation skipped");
            }
        }
        if workspace.release().await {
            self.emit(JobEvent::WorkspaceReleased {
                job_id: id.to_string(),
            });
        }
    }

    async fn validate_patch(&self, id: &str, workspace: &Workspace) -> JobResult<()> {
        let job_id = id.to_string();
        let job = self.db.call(move |db| db.require_job(&job_id)).await?;
        let Some(analysis) = job.analysis.filter(AnalysisResult::has_patch) else {
            return Ok(());
        };
        let limit = self.config.test_timeout;
        let outcome = match tokio::time::timeout(
            limit,
            self.tests.run_with_patch(workspace.path(), &analysis.patch),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => TestOutcome::task_error(format!(
                "patch validation timed out after {}s",
                limit.as_secs()
            )),
        };
        tracing::info!(
            job_id = %id,
            passed = outcome.passed(),
            method = %outcome.method(),
            "patch validated"
        );
        let job_id = id.to_string();
        self.db
            .call(move |db| db.set_patch_validation(&job_id, &outcome))
            .await?;
        Ok(())
    }
}

async fn test_task(
    id: String,
    workspace: Arc<Workspace>,
    tests: Arc<dyn TestExecutor>,
    db: DbHandle,
    events: broadcast::Sender<JobEvent>,
    limit: Duration,
) -> JobResult<()> {
    let outcome = match tokio::time::timeout(limit, tests.run(workspace.path())).await {
        Ok(outcome) => outcome,
        Err(_) => TestOutcome::task_error(format!("timed out after {}s", limit.as_secs())),
    };
    let passed = outcome.passed();
    let job_id = id.clone();
    match db.call(move |db| db.set_test_outcome(&job_id, &outcome)).await {
        Ok(_) => {
            let _ = events.send(JobEvent::TestsReported { job_id: id, passed });
            Ok(())
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "failed to store test outcome");
            Err(e)
        }
    }
}

async fn generate_analysis(
    workspace: &Workspace,
    commit: &CommitInfo,
    generator: &dyn TextGenerator,
    config: &DispatchConfig,
) -> AnalysisResult {
    let root = workspace.path().to_path_buf();
    let limits = config.prompt_limits.clone();
    let context = match tokio::task::spawn_blocking(move || WorkspaceContext::gather(&root, &limits)).await
    {
        Ok(Ok(context)) => context,
        Ok(Err(e)) => return AnalysisResult::task_error(&format!("{:#}", e)),
        Err(e) => return AnalysisResult::task_error(&format!("context task panicked: {}", e)),
    };
    let prompt = build_analysis_prompt(commit, &context);

    match tokio::time::timeout(config.generator_timeout, generator.generate(&prompt)).await {
        Ok(Ok(raw)) => extract_analysis(&raw),
        Ok(Err(e)) => AnalysisResult::task_error(&format!("{:#}", e)),
        Err(_) => AnalysisResult::task_error(&format!(
            "generator timed out after {}s",
            config.generator_timeout.as_secs()
        )),
    }
}

async fn analysis_task(
    id: String,
    workspace: Arc<Workspace>,
    commit: CommitInfo,
    generator: Arc<dyn TextGenerator>,
    db: DbHandle,
    events: broadcast::Sender<JobEvent>,
    config: DispatchConfig,
) -> JobResult<()> {
    let analysis = generate_analysis(&workspace, &commit, generator.as_ref(), &config).await;
    if analysis.is_task_error() {
        tracing::warn!(job_id = %id, generator = generator.name(), summary = %analysis.issue_summary, "analysis task failed");
    }
    let findings = analysis.findings.len();

    let job_id = id.clone();
    let stored = db
        .call(move |db| {
            db.set_analysis(&job_id, &analysis)?;
            db.advance_if(&job_id, JobStatus::Testing, JobStatus::Fixing)
        })
        .await;
    match stored {
        Ok(advanced) => {
            let _ = events.send(JobEvent::AnalysisReported {
                job_id: id.clone(),
                findings,
            });
            if advanced {
                let _ = events.send(JobEvent::StatusChanged {
                    job_id: id,
                    status: JobStatus::Fixing,
                });
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "failed to store analysis");
            Err(e)
        }
    }
}
