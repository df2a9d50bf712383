// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::env::ToolEnv;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

const MAX_ENTRIES: usize = 500;

pub struct ListDirTool {
    env: Arc<ToolEnv>,
}

impl ListDirTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory. Directories are shown with a trailing slash, files\n\
         with their size in bytes. Entries are sorted; dotfiles included."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path (default: working directory)" }
            },
            "required": [],
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
        let raw = call.str_arg("path").unwrap_or(".");
        let path = self.env.resolve_path(raw);

        if path.is_file() {
            return ToolOutput::ok(
                &call.id,
                format!("{} is a file — use read_file", path.display()),
            );
        }

        let entries = match std::fs::read_dir(&path) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolError::new(
                    ToolErrorCode::NotFound,
                    format!("no such directory: {}", path.display()),
                )
                .output(&call.id)
            }
            Err(e) => {
                return ToolError::new(ToolErrorCode::Io, format!("list error: {e}"))
                    .output(&call.id)
            }
        };

        let mut lines: Vec<String> = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata() {
                Ok(m) if m.is_dir() => lines.push(format!("{name}/")),
                Ok(m) => lines.push(format!("{name}  {} B", m.len())),
                Err(_) => lines.push(name),
            }
        }
        lines.sort();

        let total = lines.len();
        if total > MAX_ENTRIES {
            lines.truncate(MAX_ENTRIES);
            lines.push(format!("[{} more entries omitted]", total - MAX_ENTRIES));
        }
        if lines.is_empty() {
            return ToolOutput::ok(&call.id, format!("{} is empty", path.display()));
        }
        ToolOutput::ok(&call.id, lines.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
