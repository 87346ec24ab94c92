//! Job commands: `bugsniper analyze`, `status`, `approve` and `jobs`.

use std::path::Path;

use anyhow::{Context, Result, bail};

use bugsniper::analysis::models::{FindingKind, Severity};
use bugsniper::bugsniper_config::BugsniperConfig;
use bugsniper::jobs::approval;
use bugsniper::jobs::github::GhCliPublisher;
use bugsniper::jobs::models::{Job, JobRequest, JobStatus};
use bugsniper::util::short_sha;

pub async fn cmd_analyze(
    config: &BugsniperConfig,
    repo: &Path,
    sha: &str,
    repo_name: Option<String>,
    json: bool,
) -> Result<()> {
    let repo_path = repo
        .canonicalize()
        .with_context(|| format!("Repository not found: {}", repo.display()))?;
    let db = super::open_db(config)?;
    let dispatcher = super::build_dispatcher(config, db.clone())?;

    let request = JobRequest {
        repo_path,
        commit_sha: sha.trim().to_string(),
        repo_full_name: repo_name,
    };
    let pending = db.call(move |db| db.create_job(&request)).await?;
    tracing::info!(job_id = %pending.id, commit = %short_sha(&pending.commit_sha), "analyzing");

    let job = dispatcher.run_job(&pending.id).await?;
    print_job(&job, json)?;

    if job.status == JobStatus::Failed {
        bail!(
            "Job {} failed: {}",
            job.id,
            job.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

pub async fn cmd_status(config: &BugsniperConfig, id: &str, json: bool) -> Result<()> {
    let db = super::open_db(config)?;
    let job_id = id.to_string();
    let job = db.call(move |db| db.require_job(&job_id)).await?;
    print_job(&job, json)
}

pub async fn cmd_approve(config: &BugsniperConfig, id: &str) -> Result<()> {
    let db = super::open_db(config)?;
    let job = approval::approve(&db, &GhCliPublisher, id).await?;
    if let Some(record) = &job.patch_record {
        println!("Pull request opened: {}", record.pr_url);
        println!(
            "  branch {} ({} files, +{} -{})",
            record.branch_name, record.files_changed, record.additions, record.deletions
        );
    }
    Ok(())
}

pub async fn cmd_jobs(config: &BugsniperConfig, clear: bool) -> Result<()> {
    let db = super::open_db(config)?;
    if clear {
        let deleted = db.call(|db| db.clear_jobs()).await?;
        println!("Deleted {} job(s).", deleted);
        return Ok(());
    }

    let jobs = db.call(|db| db.list_jobs()).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!("{:<36}  {:<16}  {:<8}  REPOSITORY", "ID", "STATUS", "COMMIT");
    for job in &jobs {
        println!(
            "{:<36}  {:<16}  {:<8}  {}",
            job.id,
            job.status.as_str(),
            short_sha(&job.commit_sha),
            job.repo_path.display()
        );
    }
    Ok(())
}

fn print_job(job: &Job, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }

    println!();
    println!("Job {}", job.id);
    println!("  status: {}", job.status);
    println!("  commit: {} in {}", short_sha(&job.commit_sha), job.repo_path.display());
    if let Some(commit) = &job.commit {
        println!("  author: {} <{}>", commit.author, commit.author_email);
        if let Some(subject) = commit.message.lines().next() {
            println!("  message: {}", subject);
        }
    }
    if let Some(error) = &job.error {
        println!("  error: {}", error);
    }

    if let Some(outcome) = &job.test_outcome {
        println!();
        println!("Tests: {}", outcome.summary());
        for line in outcome.diagnostics() {
            println!("  - {}", line);
        }
    }

    if let Some(analysis) = &job.analysis {
        println!();
        println!(
            "Analysis ({}, confidence {:.2}): {}",
            analysis.tier.as_str(),
            analysis.confidence_score,
            analysis.issue_summary
        );
        if !analysis.findings.is_empty() {
            println!(
                "  {} finding(s): {} critical, {} high, {} security",
                analysis.findings.len(),
                analysis.count_severity(Severity::Critical),
                analysis.count_severity(Severity::High),
                analysis.count_kind(FindingKind::SecurityVulnerability)
            );
        }
        for finding in &analysis.findings {
            println!(
                "  [{}] {} at {}: {}",
                finding.severity,
                finding.kind,
                finding.location(),
                finding.description
            );
        }
        for suggestion in &analysis.suggestions {
            println!(
                "  ({}) {}: {}",
                suggestion.kind, suggestion.file, suggestion.suggested_approach
            );
        }
        println!("  deployable: {}", analysis.deployable_status);
        println!("  patch: {}", if analysis.has_patch() { "yes" } else { "none" });
    }

    if let Some(validation) = &job.patch_validation {
        println!("  with patch: {}", validation.summary());
    }
    if let Some(record) = &job.patch_record {
        println!();
        println!("Pull request: {}", record.pr_url);
    }
    if job.status == JobStatus::ReadyForReview {
        println!();
        println!("Run 'bugsniper approve {}' to open a pull request.", job.id);
    }
    println!();
    Ok(())
}
