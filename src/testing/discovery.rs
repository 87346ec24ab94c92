//! Locate Python sources and tests in a tree.

use std::path::{Path, PathBuf};

use crate::util::is_ignored_dir;

const CONTENT_MARKERS: &[&str] = &["def test_", "import pytest", "unittest.TestCase"];

const CONFIG_FILES: &[&str] = &["pytest.ini", "conftest.py", "tox.ini", "setup.cfg"];

/// What was found in a source tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub source_files: Vec<PathBuf>,
    pub test_files: Vec<PathBuf>,
    pub config_files: Vec<PathBuf>,
}

impl Discovery {
    pub fn has_sources(&self) -> bool {
        !self.source_files.is_empty()
    }

    pub fn has_tests(&self) -> bool {
        !self.test_files.is_empty()
    }
}

/// `test_*.py` or `*_test.py`.
pub fn is_test_file_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".py") else {
        return false;
    };
    stem.starts_with("test_") || stem.ends_with("_test")
}

fn in_test_dir(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .parent()
        .is_some_and(|dir| {
            dir.components()
                .any(|c| matches!(c.as_os_str().to_str(), Some("tests") | Some("test")))
        })
}

fn has_test_content(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|content| CONTENT_MARKERS.iter().any(|m| content.contains(m)))
        .unwrap_or(false)
}

fn is_config_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if CONFIG_FILES.contains(&name) {
        return true;
    }
    name == "pyproject.toml"
        && std::fs::read_to_string(path)
            .map(|c| c.contains("[tool.pytest"))
            .unwrap_or(false)
}

/// Walk `root`, skipping VCS, cache and virtualenv directories.
///
/// A `.py` file counts as a test when its name matches, when it sits under a
/// `tests/` or `test/` directory, or when its content carries a test marker.
/// Results are in path order.
pub fn discover(root: &Path) -> Discovery {
    let mut found = Discovery::default();

    for entry in walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e))
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        if is_config_file(path) {
            found.config_files.push(path.to_path_buf());
        }

        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if is_test_file_name(&name) || in_test_dir(root, path) || has_test_content(path) {
            found.test_files.push(path.to_path_buf());
        }
        found.source_files.push(path.to_path_buf());
    }

    tracing::debug!(
        root = %root.display(),
        sources = found.source_files.len(),
        tests = found.test_files.len(),
        configs = found.config_files.len(),
        "discovered python files"
    );
    found
}
