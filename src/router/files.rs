//! File-path extraction from agent turn text (`SPEC_FULL.md` §4.3/§8,
//! testable property 8): agents report output files by mentioning an
//! absolute path in their response; the router lifts those into separate
//! file attachments and strips the mention from the posted text.

use std::collections::BTreeSet;
use std::path::Path;

/// Extensions recognized as agent-produced output files worth attaching.
const RECOGNIZED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "pdf", "txt", "md", "csv", "json", "log", "zip", "svg",
];

/// Extract the deduplicated, sorted set of absolute paths in `text` whose
/// extension is recognized and whose realpath resolves under
/// `project_root`'s realpath.
#[must_use]
pub fn extract_file_paths(text: &str, project_root: &Path) -> Vec<String> {
    let project_root = std::fs::canonicalize(project_root).unwrap_or_else(|_| project_root.to_path_buf());
    let mut found = BTreeSet::new();

    for token in tokenize_candidates(text) {
        let path = Path::new(&token);
        if !path.is_absolute() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !RECOGNIZED_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            continue;
        }
        let Ok(real) = std::fs::canonicalize(path) else {
            continue;
        };
        if real.starts_with(&project_root) {
            found.insert(token);
        }
    }

    found.into_iter().collect()
}

/// Remove every occurrence of `paths` from `text` (whether bare, wrapped
/// in backticks, or embedded in a markdown image `![...](path)`), then
/// collapse runs of 3+ newlines down to 2.
#[must_use]
pub fn strip_file_paths(text: &str, paths: &[String]) -> String {
    let mut output = text.to_string();
    for path in paths {
        output = output.replace(&format!("`{path}`"), "");
        output = output.replace(&format!("]({path})"), "]()");
        output = output.replace(path.as_str(), "");
    }
    collapse_blank_lines(&output)
}

fn collapse_blank_lines(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut newline_run = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                result.push(ch);
            }
        } else {
            newline_run = 0;
            result.push(ch);
        }
    }
    result
}

/// Split text on whitespace and common delimiters that might wrap a path
/// mention (backticks, parens, brackets), yielding candidate path tokens.
fn tokenize_candidates(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || matches!(c, '`' | '(' | ')' | '[' | ']'))
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn extracts_recognized_paths_under_project_root() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let file_path = dir.path().join("out.png");
        fs::write(&file_path, b"data").unwrap_or_else(|err| panic!("write: {err}"));

        let text = format!("done see {}", file_path.display());
        let paths = extract_file_paths(&text, dir.path());
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn ignores_paths_outside_project_root() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let outside = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let file_path = outside.path().join("out.png");
        fs::write(&file_path, b"data").unwrap_or_else(|err| panic!("write: {err}"));

        let text = format!("see {}", file_path.display());
        let paths = extract_file_paths(&text, dir.path());
        assert!(paths.is_empty());
    }

    #[test]
    fn strip_file_paths_removes_mentions_and_collapses_blank_lines() {
        let text = "line one\n\n\n\n/tmp/out.png\nline two";
        let stripped = strip_file_paths(text, &["/tmp/out.png".to_string()]);
        assert!(!stripped.contains("/tmp/out.png"));
        assert!(!stripped.contains("\n\n\n"));
    }
}
