// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Unified-diff application.
//!
//! Supports the common subset the model actually produces: `--- a/x` /
//! `+++ b/x` file headers (with `/dev/null` for creation and deletion) and
//! `@@ -l,c +l,c @@` hunks.  Hunks are verified against the file content;
//! when line numbers have drifted the hunk is located by matching its
//! context within a small window.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::backups::atomic_write;
use crate::builtin::gate_path_mutation;
use crate::env::ToolEnv;
use crate::tool::{Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

/// How far from the declared line a hunk may be found before giving up.
const DRIFT_WINDOW: usize = 40;

pub struct ApplyPatchTool {
    env: Arc<ToolEnv>,
}

impl ApplyPatchTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to the project. Headers: --- a/path / +++ b/path\n\
         (use /dev/null for file creation or deletion). Hunk context must match\n\
         the current file content; small line-number drift is tolerated."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patch": { "type": "string", "description": "Unified diff text" }
            },
            "required": ["patch"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(patch) = call.str_arg("patch") else {
            return ToolError::invalid_args("missing 'patch'").output(&call.id);
        };

        let files = match parse_patch(patch) {
            Ok(f) => f,
            Err(e) => return e.output(&call.id),
        };
        if files.is_empty() {
            return ToolError::invalid_args("patch contains no file sections")
                .with_hint("expected --- a/<path> and +++ b/<path> headers")
                .output(&call.id);
        }

        let mut summary = Vec::new();
        for file in files {
            match self.apply_file(&file).await {
                Ok(line) => summary.push(line),
                Err(e) => {
                    // Fail fast: earlier files are already applied, say so.
                    summary.push(e.render());
                    return ToolOutput::err(&call.id, summary.join("\n"));
                }
            }
        }
        ToolOutput::ok(&call.id, summary.join("\n"))
    }
}

impl ApplyPatchTool {
    async fn apply_file(&self, file: &FilePatch) -> Result<String, ToolError> {
        match file.kind {
            FileKind::Delete => {
                let path = self.env.resolve_write_path(&file.path)?;
                gate_path_mutation(&self.env, "apply_patch", &path).await?;
                self.env.backups.backup(&path)?;
                std::fs::remove_file(&path)
                    .map_err(|e| ToolError::new(ToolErrorCode::Io, e.to_string()))?;
                Ok(format!("deleted {}", path.display()))
            }
            FileKind::Create => {
                let path = self.env.resolve_write_path(&file.path)?;
                gate_path_mutation(&self.env, "apply_patch", &path).await?;
                let body: String = file
                    .hunks
                    .iter()
                    .flat_map(|h| h.lines.iter())
                    .filter_map(|l| match l {
                        HunkLine::Add(t) | HunkLine::Context(t) => Some(t.as_str()),
                        HunkLine::Remove(_) => None,
                    })
                    .map(|l| format!("{l}\n"))
                    .collect();
                atomic_write(&path, body.as_bytes())?;
                Ok(format!("created {}", path.display()))
            }
            FileKind::Modify => {
                let path = self.env.resolve_write_path(&file.path)?;
                let before = std::fs::read_to_string(&path).map_err(|e| {
                    ToolError::new(
                        ToolErrorCode::NotFound,
                        format!("cannot patch {}: {e}", path.display()),
                    )
                })?;
                let after = apply_hunks(&before, &file.hunks, &file.path)?;
                gate_path_mutation(&self.env, "apply_patch", &path).await?;
                self.env.backups.backup(&path)?;
                atomic_write(&path, after.as_bytes())?;
                Ok(format!(
                    "patched {} ({} hunk{})",
                    path.display(),
                    file.hunks.len(),
                    if file.hunks.len() == 1 { "" } else { "s" }
                ))
            }
        }
    }
}

// ─── Patch model & parser ─────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum FileKind {
    Create,
    Delete,
    Modify,
}

#[derive(Debug, PartialEq, Clone)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug)]
struct Hunk {
    /// 1-indexed start line in the original file.
    old_start: usize,
    lines: Vec<HunkLine>,
}

#[derive(Debug)]
struct FilePatch {
    path: String,
    kind: FileKind,
    hunks: Vec<Hunk>,
}

fn strip_prefix(header: &str) -> &str {
    let p = header.trim();
    p.strip_prefix("a/")
        .or_else(|| p.strip_prefix("b/"))
        .unwrap_or(p)
}

fn parse_patch(patch: &str) -> Result<Vec<FilePatch>, ToolError> {
    let mut files: Vec<FilePatch> = Vec::new();
    let mut lines = patch.lines().peekable();

    while let Some(line) = lines.next() {
        if !line.starts_with("--- ") {
            continue;
        }
        let old_header = strip_prefix(&line[4..]).to_string();
        let Some(plus) = lines.next() else {
            return Err(ToolError::invalid_args("--- header without +++ line"));
        };
        if !plus.starts_with("+++ ") {
            return Err(ToolError::invalid_args("--- header without +++ line"));
        }
        let new_header = strip_prefix(&plus[4..]).to_string();

        let (kind, path) = if old_header == "/dev/null" {
            (FileKind::Create, new_header)
        } else if new_header == "/dev/null" {
            (FileKind::Delete, old_header)
        } else {
            (FileKind::Modify, new_header)
        };

        let mut hunks = Vec::new();
        while let Some(peek) = lines.peek() {
            if !peek.starts_with("@@") {
                break;
            }
            let header = lines.next().unwrap_or_default();
            let old_start = parse_hunk_header(header)?;
            let mut body = Vec::new();
            while let Some(peek) = lines.peek() {
                match peek.chars().next() {
                    Some(' ') => body.push(HunkLine::Context(peek[1..].to_string())),
                    Some('-') if !peek.starts_with("---") => {
                        body.push(HunkLine::Remove(peek[1..].to_string()))
                    }
                    Some('+') if !peek.starts_with("+++") => {
                        body.push(HunkLine::Add(peek[1..].to_string()))
                    }
                    Some('\\') => {} // "\ No newline at end of file"
                    _ => break,
                }
                lines.next();
            }
            hunks.push(Hunk {
                old_start,
                lines: body,
            });
        }
        if kind == FileKind::Modify && hunks.is_empty() {
            return Err(ToolError::invalid_args(format!(
                "no hunks for modified file {path}"
            )));
        }
        files.push(FilePatch { path, kind, hunks });
    }
    Ok(files)
}

/// Extract the old-file start line from `@@ -l,c +l,c @@`.
fn parse_hunk_header(header: &str) -> Result<usize, ToolError> {
    let inner = header.trim_start_matches('@').trim();
    let old = inner
        .split_whitespace()
        .find(|p| p.starts_with('-'))
        .ok_or_else(|| ToolError::invalid_args(format!("malformed hunk header: {header}")))?;
    let start = old[1..]
        .split(',')
        .next()
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| ToolError::invalid_args(format!("malformed hunk header: {header}")))?;
    Ok(start.max(1))
}

/// Apply hunks to `before`, locating each by declared position first and by
/// context search within the drift window second.
fn apply_hunks(before: &str, hunks: &[Hunk], path: &str) -> Result<String, ToolError> {
    let mut result: Vec<String> = before.lines().map(str::to_string).collect();
    // Apply in reverse so earlier hunk edits do not shift later offsets.
    for hunk in hunks.iter().rev() {
        let expected: Vec<&String> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(t) | HunkLine::Remove(t) => Some(t),
                HunkLine::Add(_) => None,
            })
            .collect();

        let at = locate(&result, &expected, hunk.old_start.saturating_sub(1)).ok_or_else(
            || {
                ToolError::new(
                    ToolErrorCode::Validation,
                    format!("hunk at line {} does not match {path}", hunk.old_start),
                )
                .with_hint("re-read the file and regenerate the patch against its current content")
            },
        )?;

        let replacement: Vec<String> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(t) | HunkLine::Add(t) => Some(t.clone()),
                HunkLine::Remove(_) => None,
            })
            .collect();
        result.splice(at..at + expected.len(), replacement);
    }

    let mut out = result.join("\n");
    if before.ends_with('\n') || out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Find where `expected` matches `lines`, preferring the declared position,
/// then scanning outward within the drift window.
fn locate(lines: &[String], expected: &[&String], declared: usize) -> Option<usize> {
    let matches_at = |at: usize| -> bool {
        at + expected.len() <= lines.len()
            && expected.iter().enumerate().all(|(i, e)| &&lines[at + i] == e)
    };
    if expected.is_empty() {
        return Some(declared.min(lines.len()));
    }
    if matches_at(declared) {
        return Some(declared);
    }
    for delta in 1..=DRIFT_WINDOW {
        if declared >= delta && matches_at(declared - delta) {
            return Some(declared - delta);
        }
        if matches_at(declared + delta) {
            return Some(declared + delta);
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backups::BackupManager;

    fn tool_in(dir: &std::path::Path) -> ApplyPatchTool {
        ApplyPatchTool::new(Arc::new(ToolEnv::new(
            dir.to_path_buf(),
            BackupManager::new(dir.join(".backups"), 5),
        )))
    }

    fn call(patch: &str) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "apply_patch".into(),
            args: json!({"patch": patch}),
        }
    }

    #[tokio::test]
    async fn modifies_file_with_matching_hunk() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n";
        let out = tool_in(tmp.path()).execute(&call(patch)).await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(),
            "one\nTWO\nthree\n"
        );
        assert!(out.content.contains("1 hunk"));
    }

    #[tokio::test]
    async fn creates_file_from_dev_null() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n";
        let out = tool_in(tmp.path()).execute(&call(patch)).await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("new.txt")).unwrap(),
            "hello\nworld\n"
        );
    }

    #[tokio::test]
    async fn deletes_file_to_dev_null() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("gone.txt"), "bye\n").unwrap();
        let patch = "--- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n";
        let out = tool_in(tmp.path()).execute(&call(patch)).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(!tmp.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn drifted_hunk_found_by_context() {
        let tmp = tempfile::tempdir().unwrap();
        // Three extra lines before the declared position.
        std::fs::write(
            tmp.path().join("a.txt"),
            "pad1\npad2\npad3\none\ntwo\nthree\n",
        )
        .unwrap();
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n";
        let out = tool_in(tmp.path()).execute(&call(patch)).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(std::fs::read_to_string(tmp.path().join("a.txt"))
            .unwrap()
            .contains("TWO"));
    }

    #[tokio::test]
    async fn mismatched_hunk_is_validation_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "completely\ndifferent\n").unwrap();
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n one\n-two\n+TWO\n";
        let out = tool_in(tmp.path()).execute(&call(patch)).await;
        assert!(out.is_error);
        assert!(out.content.contains("code=validation"));
        // File untouched on failure.
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(),
            "completely\ndifferent\n"
        );
    }

    #[tokio::test]
    async fn patch_without_headers_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tool_in(tmp.path()).execute(&call("not a patch at all")).await;
        assert!(out.is_error);
        assert!(out.content.contains("no file sections"));
    }

    #[tokio::test]
    async fn multi_file_patch_applies_all() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "aaa\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "bbb\n").unwrap();
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-aaa\n+AAA\n\
                     --- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-bbb\n+BBB\n";
        let out = tool_in(tmp.path()).execute(&call(patch)).await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "AAA\n");
        assert_eq!(std::fs::read_to_string(tmp.path().join("b.txt")).unwrap(), "BBB\n");
    }
}
