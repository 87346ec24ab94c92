//! Per-job working copies of the repository under review.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use crate::jobs::models::{CommitInfo, JobRequest};
use crate::util::output_within;

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Produces a source tree for a commit at `dest`.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn acquire(&self, request: &JobRequest, dest: &Path) -> Result<CommitInfo>;
}

/// Checks the commit out of a local git repository into a detached clone.
#[derive(Debug, Default, Clone)]
pub struct GitSnapshotProvider;

async fn git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = output_within(&mut cmd, GIT_TIMEOUT)
        .await
        .with_context(|| format!("git {} did not complete", args.first().unwrap_or(&"")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse `git show -s --format=%H%x1f%an%x1f%ae%x1f%aI%x1f%B`.
fn parse_commit(raw: &str) -> Result<CommitInfo> {
    let mut parts = raw.splitn(5, '\x1f');
    let mut next = |field: &str| {
        parts
            .next()
            .map(str::to_string)
            .with_context(|| format!("git show output is missing {}", field))
    };
    Ok(CommitInfo {
        sha: next("sha")?.trim().to_string(),
        author: next("author")?,
        author_email: next("author email")?,
        timestamp: next("timestamp")?,
        message: next("message")?.trim().to_string(),
    })
}

#[async_trait]
impl SourceProvider for GitSnapshotProvider {
    async fn acquire(&self, request: &JobRequest, dest: &Path) -> Result<CommitInfo> {
        let repo = request.repo_path.to_string_lossy().to_string();
        let dest_str = dest.to_string_lossy().to_string();
        git(
            &["clone", "--quiet", "--no-checkout", "--shared", &repo, &dest_str],
            None,
        )
        .await
        .with_context(|| format!("Failed to clone {}", repo))?;
        git(
            &["checkout", "--quiet", "--detach", &request.commit_sha],
            Some(dest),
        )
        .await
        .with_context(|| format!("Commit {} not found in {}", request.commit_sha, repo))?;
        let raw = git(
            &["show", "-s", "--format=%H%x1f%an%x1f%ae%x1f%aI%x1f%B", "HEAD"],
            Some(dest),
        )
        .await?;
        parse_commit(&raw)
    }
}

/// A job's working copy. Deleted exactly once by [`Workspace::release`].
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: AtomicBool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory. Returns `true` only for the call that removed it.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
            }
        }
        true
    }
}

/// Allocates workspace directories under one root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `<root>/<job_id>` and fill it from `provider`. On failure the
    /// partial directory is removed before returning.
    pub async fn acquire(
        &self,
        provider: &dyn SourceProvider,
        job_id: &str,
        request: &JobRequest,
    ) -> Result<(Workspace, CommitInfo)> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let path = self.root.join(job_id);
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("Failed to clear stale {}", path.display()))?;
        }

        match provider.acquire(request, &path).await {
            Ok(commit) => Ok((
                Workspace {
                    path,
                    released: AtomicBool::new(false),
                },
                commit,
            )),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&path).await;
                Err(e)
            }
        }
    }
}

impl Default for WorkspaceManager {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("bugsniper"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sh_git(dir: &Path, args: &[&str]) -> String {
        let out = std::process::Command::new("git")
            .args(["-c", "user.name=Dev", "-c", "user.email=dev@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn repo_with_commit(dir: &Path) -> String {
        sh_git(dir, &["init", "--quiet"]);
        fs::write(dir.join("app.py"), "print('hi')\n").unwrap();
        sh_git(dir, &["add", "."]);
        sh_git(dir, &["commit", "--quiet", "-m", "Add app\n\nLonger body"]);
        sh_git(dir, &["rev-parse", "HEAD"])
    }

    #[test]
    fn test_parse_commit() {
        let raw = "abc\x1fDev\x1fdev@example.com\x1f2024-01-01T00:00:00+00:00\x1fFix it\n\nbody\n";
        let commit = parse_commit(raw).unwrap();
        assert_eq!(commit.sha, "abc");
        assert_eq!(commit.author, "Dev");
        assert_eq!(commit.message, "Fix it\n\nbody");
        assert!(parse_commit("abc").is_err());
    }

    #[tokio::test]
    async fn test_git_snapshot_checks_out_commit() {
        let repo = tempdir().unwrap();
        let sha = repo_with_commit(repo.path());
        let scratch = tempdir().unwrap();
        let manager = WorkspaceManager::new(scratch.path());
        let request = JobRequest {
            repo_path: repo.path().to_path_buf(),
            commit_sha: sha.clone(),
            repo_full_name: None,
        };

        let (ws, commit) = manager
            .acquire(&GitSnapshotProvider, "job-1", &request)
            .await
            .unwrap();
        assert_eq!(commit.sha, sha);
        assert_eq!(commit.author, "Dev");
        assert!(commit.message.starts_with("Add app"));
        assert!(ws.path().join("app.py").exists());
        assert!(ws.release().await);
        assert!(!ws.path().exists());
    }

    #[tokio::test]
    async fn test_unknown_commit_fails_and_cleans_up() {
        let repo = tempdir().unwrap();
        repo_with_commit(repo.path());
        let scratch = tempdir().unwrap();
        let manager = WorkspaceManager::new(scratch.path());
        let request = JobRequest {
            repo_path: repo.path().to_path_buf(),
            commit_sha: "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".into(),
            repo_full_name: None,
        };
        let err = manager
            .acquire(&GitSnapshotProvider, "job-2", &request)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("not found"));
        assert!(!scratch.path().join("job-2").exists());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_under_contention() {
        let scratch = tempdir().unwrap();
        let path = scratch.path().join("ws");
        fs::create_dir_all(&path).unwrap();
        let ws = Arc::new(Workspace {
            path: path.clone(),
            released: AtomicBool::new(false),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ws = ws.clone();
                tokio::spawn(async move { ws.release().await })
            })
            .collect();
        let mut removed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
        assert!(!ws.release().await);
        assert!(!path.exists());
    }
}
