// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::env::ToolEnv;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Read-only snapshot of the execution environment: platform, working
/// directory, scope, time.  Lets the model orient without shelling out.
pub struct SysContextTool {
    env: Arc<ToolEnv>,
}

impl SysContextTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for SysContextTool {
    fn name(&self) -> &str {
        "sys_context"
    }

    fn description(&self) -> &str {
        "Report the execution environment: OS, architecture, working directory,\n\
         write scope, and current time. Takes no arguments."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": [],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let roots = if self.env.allowed_write_roots.is_empty() {
            "cwd only".to_string()
        } else {
            format!(
                "cwd + {}",
                self.env
                    .allowed_write_roots
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let body = format!(
            "os: {}\narch: {}\ncwd: {}\nwrite scope: {}\napproval mode: {}\nutc now: {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            self.env.cwd.display(),
            if self.env.sys_mode { "sys (unconfined)".to_string() } else { roots },
            self.env.approval_mode(),
            chrono::Utc::now().to_rfc3339(),
        );
        ToolOutput::ok(&call.id, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backups::BackupManager;

    #[tokio::test]
    async fn reports_cwd_and_os() {
        let tmp = tempfile::tempdir().unwrap();
        let env = Arc::new(ToolEnv::new(
            tmp.path().to_path_buf(),
            BackupManager::new(tmp.path().join(".backups"), 5),
        ));
        let out = SysContextTool::new(env)
            .execute(&ToolCall {
                id: "1".into(),
                name: "sys_context".into(),
                args: json!({}),
            })
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains(&format!("os: {}", std::env::consts::OS)));
        assert!(out.content.contains(&tmp.path().display().to_string()));
        assert!(out.content.contains("approval mode: default"));
    }
}
