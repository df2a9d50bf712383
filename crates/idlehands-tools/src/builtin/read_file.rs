// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::env::ToolEnv;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

/// Default number of lines returned when the caller sets no limit.
const DEFAULT_LINE_LIMIT: usize = 200;
/// Hard byte ceiling applied in addition to the line limit.
const MAX_BYTES: usize = 20_000;
/// Shared byte budget for a read_files batch.
const BATCH_BYTES: usize = 40_000;
/// Maximum files per read_files call.
const BATCH_FILES: usize = 12;

pub struct ReadFileTool {
    env: Arc<ToolEnv>,
}

impl ReadFileTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Default: 200 lines / 20 KB, whichever comes first.\n\
         Lines are formatted L{n}:content (1-indexed); a pagination notice shows the\n\
         next offset when more lines exist. Pass search=<substring> to return only\n\
         matching lines instead of a range. Prefer search_files to locate the right\n\
         region first, then read only those lines with offset+limit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, absolute or relative to the working directory" },
                "offset": { "type": "integer", "description": "1-indexed line to start from (default 1)" },
                "limit": { "type": "integer", "description": "Maximum lines to return (default 200)" },
                "search": { "type": "string", "description": "Return only lines containing this substring" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.str_arg("path") {
            Some(p) => p,
            None => return ToolError::invalid_args("missing 'path'").output(&call.id),
        };
        let offset = call.u64_arg("offset").unwrap_or(1).max(1) as usize;
        let limit = call.u64_arg("limit").unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;
        let search = call.str_arg("search");

        debug!(path, offset, limit, search = ?search, "read_file");
        match read_one(&self.env, path, offset, limit, search, MAX_BYTES) {
            Ok(body) => ToolOutput::ok(&call.id, body),
            Err(e) => e.output(&call.id),
        }
    }
}

/// Batched variant: one call reads several related files under a shared
/// byte budget.
pub struct ReadFilesTool {
    env: Arc<ToolEnv>,
}

impl ReadFilesTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for ReadFilesTool {
    fn name(&self) -> &str {
        "read_files"
    }

    fn description(&self) -> &str {
        "Read up to 12 files in one call under a shared 40 KB budget. Use when\n\
         exploring a group of related files; each file is capped individually and\n\
         the batch stops when the budget is spent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "description": "File paths to read, in priority order",
                    "items": { "type": "string" }
                },
                "limit": { "type": "integer", "description": "Per-file line cap (default 100)" }
            },
            "required": ["paths"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(paths) = call.args.get("paths").and_then(|v| v.as_array()) else {
            return ToolError::invalid_args("missing 'paths'").output(&call.id);
        };
        let limit = call.u64_arg("limit").unwrap_or(100) as usize;

        let mut sections = Vec::new();
        let mut spent = 0usize;
        for (i, p) in paths.iter().take(BATCH_FILES).enumerate() {
            let Some(path) = p.as_str() else { continue };
            if spent >= BATCH_BYTES {
                sections.push(format!(
                    "=== {} ===\n[skipped: batch byte budget spent; read individually]",
                    path
                ));
                continue;
            }
            let remaining = (BATCH_BYTES - spent).min(MAX_BYTES);
            let body = match read_one(&self.env, path, 1, limit, None, remaining) {
                Ok(b) => b,
                Err(e) => e.render(),
            };
            spent += body.len();
            sections.push(format!("=== {} ===\n{}", path, body));
            if i + 1 == BATCH_FILES && paths.len() > BATCH_FILES {
                sections.push(format!(
                    "[{} more paths omitted: read_files caps at {BATCH_FILES} files]",
                    paths.len() - BATCH_FILES
                ));
            }
        }
        ToolOutput::ok(&call.id, sections.join("\n\n"))
    }
}

/// Shared read path.  Directories come back as an advisory, `search=`
/// filters to matching lines (zero matches → header only).
fn read_one(
    env: &ToolEnv,
    raw_path: &str,
    offset: usize,
    limit: usize,
    search: Option<&str>,
    byte_cap: usize,
) -> Result<String, ToolError> {
    let path = env.resolve_path(raw_path);

    if path.is_dir() {
        return Ok(format!(
            "{} is a directory — use list_dir to see its entries",
            path.display()
        ));
    }

    let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ToolError::new(
            ToolErrorCode::NotFound,
            format!("no such file: {}", path.display()),
        )
        .with_hint("check the path with list_dir or search_files"),
        _ => ToolError::new(ToolErrorCode::Io, format!("read error: {e}")),
    })?;

    if bytes.contains(&0u8) {
        return Ok(format!(
            "{} is a binary file ({} bytes) — not shown",
            path.display(),
            bytes.len()
        ));
    }

    let text = String::from_utf8_lossy(&bytes);
    let all_lines: Vec<&str> = text.lines().collect();
    let total = all_lines.len();

    // search= mode: matching lines only, header first.
    if let Some(term) = search {
        let matches: Vec<String> = all_lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.contains(term))
            .take(limit)
            .map(|(i, l)| format!("L{}:{}", i + 1, l))
            .collect();
        let header = format!(
            "{} matches for `{}` in {}",
            matches.len(),
            term,
            path.display()
        );
        return Ok(if matches.is_empty() {
            header
        } else {
            format!("{header}\n{}", matches.join("\n"))
        });
    }

    let start = offset.saturating_sub(1);
    let mut selected: Vec<String> = Vec::new();
    let mut byte_count = 0usize;
    let mut truncated_by_bytes = false;
    for (i, line) in all_lines.iter().enumerate().skip(start).take(limit) {
        let needed = line.len() + 1;
        if byte_count + needed > byte_cap {
            truncated_by_bytes = true;
            break;
        }
        selected.push(format!("L{}:{}", i + 1, line));
        byte_count += needed;
    }

    let last_shown = start + selected.len();
    let mut content = selected.join("\n");
    if last_shown < total {
        let reason = if truncated_by_bytes {
            format!("byte limit ({byte_cap} B) reached")
        } else {
            format!("{} more lines", total - last_shown)
        };
        content.push_str(&format!(
            "\n...[{} — showing L{}-L{} of {}; use offset={} to continue]",
            reason,
            offset,
            offset + selected.len().saturating_sub(1),
            total,
            last_shown + 1
        ));
    }
    Ok(content)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backups::BackupManager;
    use serde_json::json;

    fn env_in(dir: &std::path::Path) -> Arc<ToolEnv> {
        Arc::new(ToolEnv::new(
            dir.to_path_buf(),
            BackupManager::new(dir.join(".backups"), 5),
        ))
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn reads_numbered_lines() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let t = ReadFileTool::new(env_in(tmp.path()));
        let out = t.execute(&call(json!({"path": "a.txt"}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("L1:alpha"));
        assert!(out.content.contains("L3:gamma"));
    }

    #[tokio::test]
    async fn offset_and_limit_paginate() {
        let tmp = tempfile::tempdir().unwrap();
        let body: String = (1..=50).map(|i| format!("line{i}\n")).collect();
        std::fs::write(tmp.path().join("a.txt"), body).unwrap();
        let t = ReadFileTool::new(env_in(tmp.path()));
        let out = t
            .execute(&call(json!({"path": "a.txt", "offset": 10, "limit": 5})))
            .await;
        assert!(out.content.contains("L10:line10"));
        assert!(out.content.contains("L14:line14"));
        assert!(!out.content.contains("L15:line15"));
        assert!(out.content.contains("use offset=15"));
    }

    #[tokio::test]
    async fn directory_returns_advisory_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let t = ReadFileTool::new(env_in(tmp.path()));
        let out = t.execute(&call(json!({"path": "."}))).await;
        assert!(!out.is_error, "reading a directory must not be a crash");
        assert!(out.content.contains("is a directory"));
        assert!(out.content.contains("list_dir"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let t = ReadFileTool::new(env_in(tmp.path()));
        let out = t.execute(&call(json!({"path": "nope.txt"}))).await;
        assert!(out.is_error);
        assert!(out.content.starts_with("ERROR: code=not_found"));
    }

    #[tokio::test]
    async fn search_zero_matches_returns_header_only() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha\nbeta\n").unwrap();
        let t = ReadFileTool::new(env_in(tmp.path()));
        let out = t
            .execute(&call(json!({"path": "a.txt", "search": "zeta"})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("0 matches for `zeta`"));
        assert!(!out.content.contains("alpha"));
    }

    #[tokio::test]
    async fn search_returns_matching_lines_with_numbers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha\nbeta\nalphabet\n").unwrap();
        let t = ReadFileTool::new(env_in(tmp.path()));
        let out = t
            .execute(&call(json!({"path": "a.txt", "search": "alpha"})))
            .await;
        assert!(out.content.starts_with("2 matches"));
        assert!(out.content.contains("L1:alpha"));
        assert!(out.content.contains("L3:alphabet"));
    }

    #[tokio::test]
    async fn binary_file_not_dumped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("blob.bin"), [0u8, 159, 146, 150]).unwrap();
        let t = ReadFileTool::new(env_in(tmp.path()));
        let out = t.execute(&call(json!({"path": "blob.bin"}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("binary file"));
    }

    #[tokio::test]
    async fn read_files_batches_with_headers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "one\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "two\n").unwrap();
        let t = ReadFilesTool::new(env_in(tmp.path()));
        let out = t
            .execute(&ToolCall {
                id: "1".into(),
                name: "read_files".into(),
                args: json!({"paths": ["a.txt", "b.txt"]}),
            })
            .await;
        assert!(out.content.contains("=== a.txt ==="));
        assert!(out.content.contains("L1:one"));
        assert!(out.content.contains("=== b.txt ==="));
        assert!(out.content.contains("L1:two"));
    }

    #[tokio::test]
    async fn read_files_reports_missing_inline() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "one\n").unwrap();
        let t = ReadFilesTool::new(env_in(tmp.path()));
        let out = t
            .execute(&ToolCall {
                id: "1".into(),
                name: "read_files".into(),
                args: json!({"paths": ["a.txt", "ghost.txt"]}),
            })
            .await;
        assert!(!out.is_error, "one missing file must not fail the batch");
        assert!(out.content.contains("code=not_found"));
    }
}
