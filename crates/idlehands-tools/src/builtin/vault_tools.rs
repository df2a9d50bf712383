// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Model-facing access to the session memory store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::env::ToolEnv;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

const DEFAULT_SEARCH_LIMIT: u64 = 8;

fn vault_of(env: &ToolEnv) -> Result<&Arc<idlehands_vault::Vault>, ToolError> {
    env.vault.as_ref().ok_or_else(|| {
        ToolError::new(ToolErrorCode::Internal, "the vault is disabled for this session")
            .with_hint("proceed without persistent memory")
    })
}

/// Persist a keyed note into the vault.
pub struct VaultNoteTool {
    env: Arc<ToolEnv>,
}

impl VaultNoteTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for VaultNoteTool {
    fn name(&self) -> &str {
        "vault_note"
    }

    fn description(&self) -> &str {
        "Save a durable note under a key. Notes survive context compaction and\n\
         future sessions can find them with vault_search. Re-using a key\n\
         replaces the previous note."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Stable identifier, e.g. 'decision:auth-flow'" },
                "value": { "type": "string", "description": "Note body" }
            },
            "required": ["key", "value"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (Some(key), Some(value)) = (call.str_arg("key"), call.str_arg("value")) else {
            return ToolError::invalid_args("vault_note requires 'key' and 'value'")
                .output(&call.id);
        };
        let vault = match vault_of(&self.env) {
            Ok(v) => v,
            Err(e) => return e.output(&call.id),
        };
        match vault.upsert_note(key, value, idlehands_vault::EntryKind::Note) {
            Ok(_) => ToolOutput::ok(&call.id, format!("noted under '{key}'")),
            Err(e) => ToolError::new(ToolErrorCode::Io, format!("vault write failed: {e}"))
                .output(&call.id),
        }
    }
}

/// Search notes and archived tool output.
pub struct VaultSearchTool {
    env: Arc<ToolEnv>,
}

impl VaultSearchTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for VaultSearchTool {
    fn name(&self) -> &str {
        "vault_search"
    }

    fn description(&self) -> &str {
        "Full-text search over saved notes and archived tool results. Useful for\n\
         recovering details dropped by context compaction — search before\n\
         re-reading files or re-running commands."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer", "description": "Max results (default 8)" }
            },
            "required": ["query"],
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
        let Some(query) = call.str_arg("query") else {
            return ToolError::invalid_args("missing 'query'").output(&call.id);
        };
        let limit = call.u64_arg("limit").unwrap_or(DEFAULT_SEARCH_LIMIT) as usize;
        let vault = match vault_of(&self.env) {
            Ok(v) => v,
            Err(e) => return e.output(&call.id),
        };
        let entries = match vault.search(query, limit) {
            Ok(e) => e,
            Err(e) => {
                return ToolError::new(ToolErrorCode::Io, format!("vault search failed: {e}"))
                    .output(&call.id)
            }
        };
        if entries.is_empty() {
            return ToolOutput::ok(&call.id, format!("no vault entries match `{query}`"));
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|e| {
                let body = e
                    .value
                    .as_deref()
                    .or(e.snippet.as_deref())
                    .or(e.content.as_deref())
                    .unwrap_or("");
                format!(
                    "[{}] {} — {} ({})",
                    e.kind,
                    e.key.as_deref().unwrap_or("-"),
                    body,
                    e.updated_at
                )
            })
            .collect();
        ToolOutput::ok(&call.id, lines.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backups::BackupManager;
    use idlehands_vault::{Vault, VaultOptions};

    fn env_with_vault(dir: &std::path::Path) -> Arc<ToolEnv> {
        let mut env = ToolEnv::new(
            dir.to_path_buf(),
            BackupManager::new(dir.join(".backups"), 5),
        );
        env.vault = Some(Arc::new(
            Vault::open_in_memory(VaultOptions::default()).unwrap(),
        ));
        Arc::new(env)
    }

    #[tokio::test]
    async fn note_then_search_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env_with_vault(tmp.path());
        let note = VaultNoteTool::new(env.clone());
        let search = VaultSearchTool::new(env);

        let out = note
            .execute(&ToolCall {
                id: "1".into(),
                name: "vault_note".into(),
                args: json!({"key": "decision:db", "value": "use sqlite for the index"}),
            })
            .await;
        assert!(!out.is_error, "{}", out.content);

        let out = search
            .execute(&ToolCall {
                id: "2".into(),
                name: "vault_search".into(),
                args: json!({"query": "sqlite index"}),
            })
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("decision:db"));
    }

    #[tokio::test]
    async fn search_no_matches_says_so() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env_with_vault(tmp.path());
        let out = VaultSearchTool::new(env)
            .execute(&ToolCall {
                id: "1".into(),
                name: "vault_search".into(),
                args: json!({"query": "nonexistent_topic"}),
            })
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("no vault entries match"));
    }

    #[tokio::test]
    async fn disabled_vault_is_clean_error() {
        let tmp = tempfile::tempdir().unwrap();
        let env = Arc::new(ToolEnv::new(
            tmp.path().to_path_buf(),
            BackupManager::new(tmp.path().join(".backups"), 5),
        ));
        let out = VaultNoteTool::new(env)
            .execute(&ToolCall {
                id: "1".into(),
                name: "vault_note".into(),
                args: json!({"key": "k", "value": "v"}),
            })
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("vault is disabled"));
    }
}
