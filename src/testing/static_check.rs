//! Tree-sitter based heuristics used when no test runner is available.

use std::path::{Path, PathBuf};

use tree_sitter::{Node, Parser};

use super::{TestMethod, TestOutcome};
use crate::util::relative_display;

const HARDCODED_PATH_MARKERS: &[&str] = &["/tmp/", "/var/", "/home/", "/etc/", "C:\\"];

/// A single heuristic hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub line: usize,
    pub message: String,
}

fn python_parser() -> Option<Parser> {
    let mut parser = Parser::new();
    match parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
        Ok(()) => Some(parser),
        Err(e) => {
            tracing::warn!(error = %e, "python grammar failed to load");
            None
        }
    }
}

fn node_text<'a>(node: &Node, content: &'a str) -> &'a str {
    content.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

fn is_bare_except(node: &Node) -> bool {
    let mut cursor = node.walk();
    let bare = node
        .named_children(&mut cursor)
        .all(|c| matches!(c.kind(), "block" | "comment"));
    bare
}

fn called_name<'a>(node: &Node, content: &'a str) -> Option<&'a str> {
    let function = node.child_by_field_name("function")?;
    (function.kind() == "identifier").then(|| node_text(&function, content))
}

fn has_docstring(node: &Node) -> bool {
    let Some(body) = node.child_by_field_name("body") else {
        return false;
    };
    let Some(first) = body.named_child(0) else {
        return false;
    };
    first.kind() == "expression_statement"
        && first.named_child(0).is_some_and(|s| s.kind() == "string")
}

fn inside_with_item(node: &Node) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        if parent.kind() == "with_item" {
            return true;
        }
        current = parent.parent();
    }
    false
}

/// Walk a parsed module and collect heuristic flags.
pub fn flag_tree(root: &Node, content: &str) -> Vec<Flag> {
    let mut flags = Vec::new();
    let closes_files = content.contains(".close()");
    let mut cursor = root.walk();

    loop {
        let node = cursor.node();
        let line = node.start_position().row + 1;

        match node.kind() {
            "except_clause" if is_bare_except(&node) => flags.push(Flag {
                line,
                message: "bare except clause".into(),
            }),
            "call" => match called_name(&node, content) {
                Some(name @ ("eval" | "exec")) => flags.push(Flag {
                    line,
                    message: format!("use of {}()", name),
                }),
                Some("open") if !closes_files && !inside_with_item(&node) => flags.push(Flag {
                    line,
                    message: "open() without a with block or close()".into(),
                }),
                _ => {}
            },
            "function_definition" => {
                let public = node
                    .child_by_field_name("name")
                    .is_some_and(|n| !node_text(&n, content).starts_with('_'));
                if public && !has_docstring(&node) {
                    let name = node
                        .child_by_field_name("name")
                        .map(|n| node_text(&n, content))
                        .unwrap_or("?");
                    flags.push(Flag {
                        line,
                        message: format!("public function '{}' has no docstring", name),
                    });
                }
            }
            "string" => {
                let text = node_text(&node, content);
                if HARDCODED_PATH_MARKERS.iter().any(|m| text.contains(m)) {
                    flags.push(Flag {
                        line,
                        message: "hard-coded absolute path".into(),
                    });
                }
            }
            _ => {}
        }

        if cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return flags;
            }
        }
    }
}

/// Static heuristic pass over `files`. Blocking; call from `spawn_blocking`.
///
/// Each file is one parse unit, each flag one more unit. A file that does
/// not parse cleanly fails its own unit.
pub fn check_files(root: &Path, files: &[PathBuf], max_diagnostics: usize) -> TestOutcome {
    let Some(mut parser) = python_parser() else {
        return baseline(root, files, max_diagnostics);
    };

    let mut flagged = 0u32;
    let mut broken = 0u32;
    let mut diagnostics = Vec::new();

    for path in files {
        let rel = relative_display(root, path);
        let Ok(content) = std::fs::read_to_string(path) else {
            broken += 1;
            diagnostics.push(format!("{}: unreadable or not UTF-8", rel));
            continue;
        };
        let Some(tree) = parser.parse(&content, None) else {
            broken += 1;
            diagnostics.push(format!("{}: parser gave up", rel));
            continue;
        };
        let root_node = tree.root_node();
        if root_node.has_error() {
            broken += 1;
            diagnostics.push(format!("{}: syntax error", rel));
        }
        for flag in flag_tree(&root_node, &content) {
            flagged += 1;
            diagnostics.push(format!("{}:{}: {}", rel, flag.line, flag.message));
        }
    }

    let total = files.len() as u32 + flagged;
    diagnostics.truncate(max_diagnostics);
    TestOutcome::new(total, flagged + broken, TestMethod::StaticHeuristic)
        .with_diagnostics(diagnostics)
}

/// Last resort: one unit per file, failed when the file cannot be read.
pub fn baseline(root: &Path, files: &[PathBuf], max_diagnostics: usize) -> TestOutcome {
    let unreadable: Vec<String> = files
        .iter()
        .filter(|p| std::fs::read_to_string(p).is_err())
        .map(|p| format!("{}: unreadable or not UTF-8", relative_display(root, p)))
        .collect();
    let failed = unreadable.len() as u32;
    TestOutcome::new(files.len() as u32, failed, TestMethod::SynthesizedBaseline)
        .with_diagnostics(unreadable.into_iter().take(max_diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn flags_for(source: &str) -> Vec<Flag> {
        let mut parser = python_parser().unwrap();
        let tree = parser.parse(source, None).unwrap();
        flag_tree(&tree.root_node(), source)
    }

    #[test]
    fn test_clean_code_has_no_flags() {
        let source = "def add(a, b):\n    \"\"\"Add.\"\"\"\n    return a + b\n\ndef _helper():\n    pass\n";
        assert!(flags_for(source).is_empty());
    }

    #[test]
    fn test_bare_except_flagged() {
        let source = "try:\n    x = 1\nexcept:\n    pass\n";
        let flags = flags_for(source);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].line, 3);
        assert!(flags[0].message.contains("bare except"));
    }

    #[test]
    fn test_typed_except_not_flagged() {
        let source = "try:\n    x = 1\nexcept ValueError:\n    pass\n";
        assert!(flags_for(source).is_empty());
    }

    #[test]
    fn test_eval_and_exec_flagged() {
        let flags = flags_for("x = eval(input())\nexec('y = 1')\n");
        let messages: Vec<&str> = flags.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, vec!["use of eval()", "use of exec()"]);
    }

    #[test]
    fn test_missing_docstring_flagged_for_public_only() {
        let flags = flags_for("def run():\n    return 1\n");
        assert_eq!(flags.len(), 1);
        assert!(flags[0].message.contains("'run'"));
    }

    #[test]
    fn test_hardcoded_path_flagged() {
        let flags = flags_for("LOG = '/tmp/app.log'\n");
        assert_eq!(flags.len(), 1);
        assert!(flags[0].message.contains("hard-coded"));
    }

    #[test]
    fn test_open_outside_with() {
        assert_eq!(flags_for("f = open('data.txt')\n").len(), 1);
        assert!(flags_for("with open('data.txt') as f:\n    pass\n").is_empty());
        assert!(flags_for("f = open('data.txt')\nf.close()\n").is_empty());
    }

    #[test]
    fn test_check_files_counts_units() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.py");
        let bad = dir.path().join("bad.py");
        fs::write(&good, "X = 1\n").unwrap();
        fs::write(&bad, "x = eval('1')\n").unwrap();

        let outcome = check_files(dir.path(), &[good, bad], 20);
        assert_eq!(outcome.method(), TestMethod::StaticHeuristic);
        assert_eq!(outcome.total_tests(), 3);
        assert_eq!(outcome.failed_tests(), 1);
        assert!(!outcome.passed());
        assert!(outcome.diagnostics()[0].starts_with("bad.py:1"));
    }

    #[test]
    fn test_check_files_syntax_error() {
        let dir = tempdir().unwrap();
        let broken = dir.path().join("broken.py");
        fs::write(&broken, "def f(:\n").unwrap();
        let outcome = check_files(dir.path(), &[broken], 20);
        assert!(!outcome.passed());
        assert!(outcome.diagnostics().iter().any(|d| d.contains("syntax error")));
    }

    #[test]
    fn test_baseline_fails_unreadable() {
        let dir = tempdir().unwrap();
        let ok = dir.path().join("ok.py");
        let binary = dir.path().join("bin.py");
        fs::write(&ok, "x = 1\n").unwrap();
        fs::write(&binary, [0xff, 0xfe, 0x00]).unwrap();
        let outcome = baseline(dir.path(), &[ok, binary], 20);
        assert_eq!(outcome.method(), TestMethod::SynthesizedBaseline);
        assert_eq!(outcome.total_tests(), 2);
        assert_eq!(outcome.failed_tests(), 1);
    }
}
