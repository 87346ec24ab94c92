//! Apply a proposed diff to a scratch copy of a workspace.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

use super::{TestMethod, TestOutcome};
use crate::util::output_within;

const GIT_APPLY_TIMEOUT: Duration = Duration::from_secs(60);

fn copy_path(root: &Path) -> PathBuf {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "workspace".into());
    root.with_file_name(format!("{}-patched-{}", name, uuid::Uuid::new_v4().simple()))
}

fn patch_file(copy: &Path) -> PathBuf {
    PathBuf::from(format!("{}.patch", copy.display()))
}

fn copy_blocking(root: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !(e.depth() > 0 && e.file_name() == std::ffi::OsStr::new(".git")))
    {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .context("walked outside the workspace root")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Copy `root` into a fresh sibling directory, leaving out `.git`.
pub async fn copy_tree(root: &Path) -> Result<PathBuf> {
    let src = root.to_path_buf();
    let dest = copy_path(root);
    let target = dest.clone();
    let copied = tokio::task::spawn_blocking(move || copy_blocking(&src, &target))
        .await
        .context("copy task panicked")
        .and_then(|copied| copied);
    if let Err(e) = copied {
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            remove_copy(&dest).await;
        }
        return Err(e);
    }
    Ok(dest)
}

async fn git_apply(copy: &Path, args: &[&str], patch: &Path) -> Result<()> {
    let ceiling = copy.parent().unwrap_or(copy);
    let mut cmd = Command::new("git");
    cmd.arg("apply")
        .args(args)
        .arg(patch)
        .current_dir(copy)
        .env("GIT_CEILING_DIRECTORIES", ceiling)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let output = output_within(&mut cmd, GIT_APPLY_TIMEOUT)
        .await
        .context("git apply did not complete")?;
    if !output.status.success() {
        bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}

/// Check then apply `diff` inside `copy`.
pub async fn apply(copy: &Path, diff: &str) -> Result<()> {
    let file = patch_file(copy);
    let mut body = diff.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    tokio::fs::write(&file, body)
        .await
        .with_context(|| format!("Failed to write {}", file.display()))?;

    let result = async {
        git_apply(copy, &["--check"], &file).await?;
        git_apply(copy, &[], &file).await
    }
    .await;

    let _ = tokio::fs::remove_file(&file).await;
    result
}

/// Remove a scratch copy. Errors are logged, not returned.
pub async fn remove_copy(copy: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(copy).await {
        tracing::warn!(path = %copy.display(), error = %e, "failed to remove patched copy");
    }
}

/// Outcome recorded when the diff cannot be applied.
pub fn apply_failure(err: &anyhow::Error) -> TestOutcome {
    TestOutcome::new(1, 1, TestMethod::SynthesizedBaseline)
        .with_diagnostic(format!("Failed to apply patch: {:#}", err))
        .with_error(format!("{:#}", err))
}
