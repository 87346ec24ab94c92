//! Shared utility functions for the bugsniper crate.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Directory names never descended into when scanning a source tree.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "env",
    "node_modules",
    ".tox",
    "build",
    "dist",
    ".mypy_cache",
    ".pytest_cache",
    ".eggs",
];

/// True when a walkdir entry is a directory that should be skipped.
pub fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name) || name.ends_with(".egg-info"))
}

/// Truncate to at most `max` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// The first `n` non-empty lines of `text`.
pub fn first_lines(text: &str, n: usize) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .take(n)
        .map(str::to_string)
        .collect()
}

/// `path` relative to `root` with forward slashes, or the full path when it
/// is not under `root`.
pub fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// First eight characters of a commit sha.
pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(8) {
        Some((idx, _)) => &sha[..idx],
        None => sha,
    }
}

/// Run `cmd` to completion, killing the child if it outlives `limit`.
pub async fn output_within(cmd: &mut tokio::process::Command, limit: Duration) -> Result<Output> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.kill_on_drop(true);
    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("Failed to run {}", program)),
        Err(_) => bail!("{} timed out after {:?}", program, limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_truncate_chars_short() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }

    #[test]
    fn test_truncate_chars_long() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll...");
    }

    #[test]
    fn test_first_lines_skips_blank() {
        let lines = first_lines("\n a \n\nb\nc\n", 2);
        assert_eq!(lines, vec![" a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_relative_display() {
        let root = PathBuf::from("/tmp/ws");
        assert_eq!(
            relative_display(&root, &root.join("pkg").join("mod.py")),
            "pkg/mod.py"
        );
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("0123456789abcdef"), "01234567");
        assert_eq!(short_sha("abc"), "abc");
    }

    #[test]
    fn test_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let skipped: Vec<String> = walkdir::WalkDir::new(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(is_ignored_dir)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(skipped, vec!["__pycache__".to_string()]);
    }

    #[tokio::test]
    async fn test_output_within_returns_output() {
        let mut cmd = tokio::process::Command::new("echo");
        cmd.arg("hi").stdout(std::process::Stdio::piped());
        let output = output_within(&mut cmd, Duration::from_secs(10)).await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hi");
    }

    #[tokio::test]
    async fn test_output_within_kills_slow_command() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");
        let started = std::time::Instant::now();
        let err = output_within(&mut cmd, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sleep timed out after 100ms"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_output_within_missing_program() {
        let mut cmd = tokio::process::Command::new("bugsniper-no-such-program");
        let err = output_within(&mut cmd, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("Failed to run bugsniper-no-such-program"));
    }
}
