// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::backups::atomic_write;
use crate::builtin::gate_path_mutation;
use crate::env::ToolEnv;
use crate::tool::{Tool, ToolCall, ToolError, ToolOutput};

pub struct WriteFileTool {
    env: Arc<ToolEnv>,
}

impl WriteFileTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content. The previous\n\
         version (if any) is backed up first; the write is atomic. For small\n\
         changes to an existing file prefer edit_file / edit_range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Target file path" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (Some(raw_path), Some(content)) = (call.str_arg("path"), call.str_arg("content"))
        else {
            return ToolError::invalid_args("write_file requires 'path' and 'content'")
                .output(&call.id);
        };

        let path = match self.env.resolve_write_path(raw_path) {
            Ok(p) => p,
            Err(e) => return e.output(&call.id),
        };
        if let Err(e) = gate_path_mutation(&self.env, "write_file", &path).await {
            return e.output(&call.id);
        }
        if let Err(e) = self.env.backups.backup(&path) {
            return e.output(&call.id);
        }
        if let Err(e) = atomic_write(&path, content.as_bytes()) {
            return e.output(&call.id);
        }
        debug!(path = %path.display(), bytes = content.len(), "write_file");
        ToolOutput::ok(
            &call.id,
            format!("wrote {} ({} bytes)", path.display(), content.len()),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
