// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::env::ToolEnv;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolError, ToolOutput};

const DEFAULT_MAX_RESULTS: usize = 200;
/// Per-file size ceiling; larger files are skipped (build artefacts, logs).
const MAX_FILE_BYTES: u64 = 2_000_000;
/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

pub struct SearchFilesTool {
    env: Arc<ToolEnv>,
}

impl SearchFilesTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search file contents with a regex across the project tree.\n\
         Results are `path:line: text` — the right way to locate code before\n\
         reading. Use ext to restrict by extension (e.g. \"rs\"). Skips\n\
         binary files, .git, target, and node_modules."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regex to search for" },
                "path": { "type": "string", "description": "Root to search under (default: working directory)" },
                "ext": { "type": "string", "description": "Restrict to files with this extension" },
                "max_results": { "type": "integer", "description": "Result cap (default 200)" }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(pattern) = call.str_arg("pattern") else {
            return ToolError::invalid_args("missing 'pattern'").output(&call.id);
        };
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => {
                return ToolError::invalid_args(format!("invalid regex: {e}"))
                    .with_hint("escape special characters or simplify the pattern")
                    .output(&call.id)
            }
        };
        let root = self.env.resolve_path(call.str_arg("path").unwrap_or("."));
        let ext = call.str_arg("ext").map(str::to_string);
        let max_results = call.u64_arg("max_results").unwrap_or(DEFAULT_MAX_RESULTS as u64) as usize;

        let mut matches: Vec<String> = Vec::new();
        let mut files_scanned = 0usize;
        let mut hit_cap = false;

        'walk: for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !e.file_type().is_dir()
                    || !SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref())
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(want) = &ext {
                let has = entry
                    .path()
                    .extension()
                    .is_some_and(|e| e.to_string_lossy() == *want);
                if !has {
                    continue;
                }
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_FILE_BYTES {
                continue;
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            if bytes.contains(&0u8) {
                continue;
            }
            files_scanned += 1;
            let text = String::from_utf8_lossy(&bytes);
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .display();
            for (i, line) in text.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}: {}", rel, i + 1, line.trim_end()));
                    if matches.len() >= max_results {
                        hit_cap = true;
                        break 'walk;
                    }
                }
            }
        }

        let mut out = format!(
            "{} matches for /{}/ in {} files",
            matches.len(),
            pattern,
            files_scanned
        );
        if !matches.is_empty() {
            out.push('\n');
            out.push_str(&matches.join("\n"));
        }
        if hit_cap {
            out.push_str("\n[result cap reached — tighten the pattern to see the rest]");
        }
        ToolOutput::ok(&call.id, out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backups::BackupManager;

    fn tool_in(dir: &std::path::Path) -> SearchFilesTool {
        SearchFilesTool::new(Arc::new(ToolEnv::new(
            dir.to_path_buf(),
            BackupManager::new(dir.join(".backups"), 5),
        )))
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "search_files".into(),
            args,
        }
    }

    #[tokio::test]
    async fn finds_matches_with_path_line_format() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();
        let out = tool_in(tmp.path())
            .execute(&call(json!({"pattern": "fn alpha"})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("1 matches"));
        assert!(out.content.contains("a.rs:1: fn alpha() {}"));
    }

    #[tokio::test]
    async fn zero_matches_reports_header() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "nothing here\n").unwrap();
        let out = tool_in(tmp.path())
            .execute(&call(json!({"pattern": "unfindable_token"})))
            .await;
        assert!(out.content.starts_with("0 matches"));
    }

    #[tokio::test]
    async fn ext_filter_restricts_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "needle\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "needle\n").unwrap();
        let out = tool_in(tmp.path())
            .execute(&call(json!({"pattern": "needle", "ext": "rs"})))
            .await;
        assert!(out.content.contains("a.rs:1"));
        assert!(!out.content.contains("b.txt"));
    }

    #[tokio::test]
    async fn skips_git_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/config"), "needle\n").unwrap();
        let out = tool_in(tmp.path())
            .execute(&call(json!({"pattern": "needle"})))
            .await;
        assert!(out.content.starts_with("0 matches"));
    }

    #[tokio::test]
    async fn invalid_regex_is_invalid_args() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tool_in(tmp.path())
            .execute(&call(json!({"pattern": "(["})))
            .await;
        assert!(out.is_error);
        assert!(out.content.starts_with("ERROR: code=invalid_args"));
    }

    #[tokio::test]
    async fn result_cap_noted() {
        let tmp = tempfile::tempdir().unwrap();
        let body: String = (0..50).map(|i| format!("needle {i}\n")).collect();
        std::fs::write(tmp.path().join("big.txt"), body).unwrap();
        let out = tool_in(tmp.path())
            .execute(&call(json!({"pattern": "needle", "max_results": 10})))
            .await;
        assert!(out.content.contains("result cap reached"));
    }
}
