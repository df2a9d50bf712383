// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! In-place file editors: exact-string replacement, line-range replacement,
//! and line insertion.  Every mutation backs up the previous version and
//! writes atomically; results carry a short unified-diff preview.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;

use crate::backups::atomic_write;
use crate::builtin::gate_path_mutation;
use crate::env::ToolEnv;
use crate::tool::{Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

/// Diff preview line cap in tool results.
const DIFF_PREVIEW_LINES: usize = 40;

fn diff_preview(before: &str, after: &str) -> String {
    let diff = TextDiff::from_lines(before, after);
    let full = diff
        .unified_diff()
        .context_radius(2)
        .to_string();
    let lines: Vec<&str> = full.lines().collect();
    if lines.len() > DIFF_PREVIEW_LINES {
        let mut shown = lines[..DIFF_PREVIEW_LINES].join("\n");
        shown.push_str(&format!(
            "\n[... {} more diff lines]",
            lines.len() - DIFF_PREVIEW_LINES
        ));
        shown
    } else {
        full
    }
}

/// Load a file for editing, with uniform error codes.
fn load(env: &ToolEnv, raw: &str) -> Result<(PathBuf, String), ToolError> {
    let path = env.resolve_write_path(raw)?;
    let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ToolError::new(
            ToolErrorCode::NotFound,
            format!("no such file: {}", path.display()),
        )
        .with_hint("use write_file to create a new file"),
        _ => ToolError::new(ToolErrorCode::Io, format!("read error: {e}")),
    })?;
    Ok((path, text))
}

async fn commit(
    env: &ToolEnv,
    action: &str,
    path: &Path,
    after: &str,
) -> Result<(), ToolError> {
    gate_path_mutation(env, action, path).await?;
    env.backups.backup(path)?;
    atomic_write(path, after.as_bytes())
}

// ─── edit_file: exact old/new replacement ─────────────────────────────────────

pub struct EditFileTool {
    env: Arc<ToolEnv>,
}

impl EditFileTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace one exact occurrence of old_str with new_str. old_str must\n\
         match the file exactly (including indentation) and uniquely — add\n\
         surrounding lines if it matches more than once. Strip any L{n}:\n\
         prefixes copied from read_file output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "old_str": { "type": "string", "description": "Exact text to replace" },
                "new_str": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "old_str", "new_str"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (Some(raw), Some(old_str), Some(new_str)) = (
            call.str_arg("path"),
            call.str_arg("old_str"),
            call.str_arg("new_str"),
        ) else {
            return ToolError::invalid_args("edit_file requires 'path', 'old_str', 'new_str'")
                .output(&call.id);
        };

        let (path, before) = match load(&self.env, raw) {
            Ok(x) => x,
            Err(e) => return e.output(&call.id),
        };

        let occurrences = before.matches(old_str).count();
        if occurrences == 0 {
            return ToolError::new(
                ToolErrorCode::NotFound,
                format!("old_str not found in {}", path.display()),
            )
            .with_hint("re-read the file; the text may have changed since it was last read")
            .output(&call.id);
        }
        if occurrences > 1 {
            return ToolError::invalid_args(format!(
                "old_str matches {occurrences} locations in {}",
                path.display()
            ))
            .with_hint("include more surrounding lines to make the match unique")
            .output(&call.id);
        }

        let after = before.replacen(old_str, new_str, 1);
        if let Err(e) = commit(&self.env, "edit_file", &path, &after).await {
            return e.output(&call.id);
        }
        ToolOutput::ok(
            &call.id,
            format!("edited {}\n{}", path.display(), diff_preview(&before, &after)),
        )
    }
}

// ─── edit_range: line-range replacement ───────────────────────────────────────

pub struct EditRangeTool {
    env: Arc<ToolEnv>,
}

impl EditRangeTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for EditRangeTool {
    fn name(&self) -> &str {
        "edit_range"
    }

    fn description(&self) -> &str {
        "Replace lines start_line..=end_line (1-indexed, inclusive) with the\n\
         replacement text. Line numbers match read_file's L{n} prefixes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "start_line": { "type": "integer" },
                "end_line": { "type": "integer" },
                "replacement": { "type": "string" }
            },
            "required": ["path", "start_line", "end_line", "replacement"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (Some(raw), Some(start), Some(end), Some(replacement)) = (
            call.str_arg("path"),
            call.u64_arg("start_line"),
            call.u64_arg("end_line"),
            call.str_arg("replacement"),
        ) else {
            return ToolError::invalid_args(
                "edit_range requires 'path', 'start_line', 'end_line', 'replacement'",
            )
            .output(&call.id);
        };
        let (start, end) = (start as usize, end as usize);
        if start == 0 || end < start {
            return ToolError::invalid_args("line numbers are 1-indexed and end_line >= start_line")
                .output(&call.id);
        }

        let (path, before) = match load(&self.env, raw) {
            Ok(x) => x,
            Err(e) => return e.output(&call.id),
        };
        let lines: Vec<&str> = before.lines().collect();
        if start > lines.len() {
            return ToolError::invalid_args(format!(
                "start_line {start} is past the end of the file ({} lines)",
                lines.len()
            ))
            .output(&call.id);
        }
        let end = end.min(lines.len());

        let mut after_lines: Vec<&str> = Vec::with_capacity(lines.len());
        after_lines.extend(&lines[..start - 1]);
        after_lines.extend(replacement.lines());
        after_lines.extend(&lines[end..]);
        let mut after = after_lines.join("\n");
        if before.ends_with('\n') {
            after.push('\n');
        }

        if let Err(e) = commit(&self.env, "edit_range", &path, &after).await {
            return e.output(&call.id);
        }
        ToolOutput::ok(
            &call.id,
            format!(
                "edited {} lines {start}-{end}\n{}",
                path.display(),
                diff_preview(&before, &after)
            ),
        )
    }
}

// ─── insert_file: insert text before a line ───────────────────────────────────

pub struct InsertFileTool {
    env: Arc<ToolEnv>,
}

impl InsertFileTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for InsertFileTool {
    fn name(&self) -> &str {
        "insert_file"
    }

    fn description(&self) -> &str {
        "Insert text before the given 1-indexed line. line = 1 prepends;\n\
         line = file length + 1 appends."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "line": { "type": "integer", "description": "1-indexed insertion point" },
                "text": { "type": "string" }
            },
            "required": ["path", "line", "text"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (Some(raw), Some(line), Some(text)) = (
            call.str_arg("path"),
            call.u64_arg("line"),
            call.str_arg("text"),
        ) else {
            return ToolError::invalid_args("insert_file requires 'path', 'line', 'text'")
                .output(&call.id);
        };
        let line = line as usize;
        if line == 0 {
            return ToolError::invalid_args("line is 1-indexed").output(&call.id);
        }

        let (path, before) = match load(&self.env, raw) {
            Ok(x) => x,
            Err(e) => return e.output(&call.id),
        };
        let lines: Vec<&str> = before.lines().collect();
        if line > lines.len() + 1 {
            return ToolError::invalid_args(format!(
                "line {line} is past the end of the file ({} lines)",
                lines.len()
            ))
            .output(&call.id);
        }

        let inserted = text.lines().count();
        let mut after_lines: Vec<&str> = Vec::with_capacity(lines.len() + inserted);
        after_lines.extend(&lines[..line - 1]);
        after_lines.extend(text.lines());
        after_lines.extend(&lines[line - 1..]);
        let mut after = after_lines.join("\n");
        if before.ends_with('\n') || before.is_empty() {
            after.push('\n');
        }

        if let Err(e) = commit(&self.env, "insert_file", &path, &after).await {
            return e.output(&call.id);
        }
        ToolOutput::ok(
            &call.id,
            format!(
                "inserted {inserted} line(s) into {} at line {line}",
                path.display()
            ),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
