// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent dispatch: `spawn_task` runs a focused task in an isolated
//! nested session.  Sub-agents share the vault (when configured) but never
//! the conversation, and execute strictly serially — one at a time across
//! the whole session tree (single-GPU assumption).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use idlehands_config::{ApprovalMode, Config};
use idlehands_model::ChatClient;
use idlehands_tools::{
    register_builtins, BackupManager, Tool, ToolCall, ToolEnv, ToolError, ToolErrorCode,
    ToolOutput, ToolRegistry,
};
use idlehands_vault::Vault;

use crate::agent::{Agent, AgentOptions};
use crate::events::HookBus;

/// Context-file clipping rules.
const MAX_CONTEXT_FILES: usize = 12;
const MAX_FILE_CHARS: usize = 4000;
const MAX_TOTAL_CHARS: usize = 24_000;

/// How the nested session ended.
#[derive(Debug)]
enum SubAgentStatus {
    Completed,
    Failed(String),
    TimedOut(u64),
}

impl std::fmt::Display for SubAgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubAgentStatus::Completed => write!(f, "completed"),
            SubAgentStatus::Failed(e) => write!(f, "failed: {e}"),
            SubAgentStatus::TimedOut(s) => write!(f, "timed out after {s}s"),
        }
    }
}

/// FIFO queue serializing sub-agent execution.  Tokio's mutex hands the
/// lock out in acquisition order, so waiting tasks form a fair tail chain.
#[derive(Default)]
pub struct SubAgentQueue {
    lock: tokio::sync::Mutex<()>,
    queued: AtomicUsize,
}

impl SubAgentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sub-agents queued or running right now.
    pub fn depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Join the queue; returns the 1-based position at entry.
    fn enqueue(&self) -> usize {
        self.queued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn leave(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawn a nested session to complete a focused task.
pub struct SpawnTaskTool {
    client: Arc<dyn ChatClient>,
    config: Arc<Config>,
    parent_env: Arc<ToolEnv>,
    vault: Option<Arc<Vault>>,
    queue: Arc<SubAgentQueue>,
}

impl SpawnTaskTool {
    pub fn new(
        client: Arc<dyn ChatClient>,
        config: Arc<Config>,
        parent_env: Arc<ToolEnv>,
        vault: Option<Arc<Vault>>,
        queue: Arc<SubAgentQueue>,
    ) -> Self {
        Self {
            client,
            config,
            parent_env,
            vault,
            queue,
        }
    }

    /// Build the isolated environment for a nested session.  The parent's
    /// abort signal is shared so cancellation cascades down; the vault is
    /// shared weakly (the sub-agent never closes it).
    fn build_sub_env(&self, approval: ApprovalMode) -> Arc<ToolEnv> {
        let mut env = ToolEnv::new(
            self.parent_env.cwd.clone(),
            BackupManager::new(
                self.config.tools.resolve_state_dir().join("backups"),
                self.config.tools.backup_retention,
            ),
        );
        env.allowed_write_roots = self.parent_env.allowed_write_roots.clone();
        env.sys_mode = self.parent_env.sys_mode;
        env.no_confirm = self.parent_env.no_confirm;
        env.confirmer = Arc::clone(&self.parent_env.confirmer);
        env.abort = self.parent_env.abort.clone();
        env.exec_timeout = self.parent_env.exec_timeout;
        if self.config.sub_agents.inherit_vault {
            env.vault = self.vault.clone();
        }
        env.set_approval_mode(approval);
        Arc::new(env)
    }

    /// Read and clip context files: at most 12 files, 4000 chars each,
    /// 24000 total; binary, missing, and out-of-tree files are skipped.
    fn gather_context(&self, paths: &[&str]) -> String {
        let mut sections = Vec::new();
        let mut total = 0usize;
        for raw in paths.iter().take(MAX_CONTEXT_FILES) {
            let path = self.parent_env.resolve_path(raw);
            if !path.starts_with(&self.parent_env.cwd) {
                debug!(path = %path.display(), "context file outside cwd skipped");
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if bytes.contains(&0u8) {
                continue;
            }
            if total >= MAX_TOTAL_CHARS {
                break;
            }
            let budget = MAX_FILE_CHARS.min(MAX_TOTAL_CHARS - total);
            let text = String::from_utf8_lossy(&bytes);
            let clipped: String = text.chars().take(budget).collect();
            total += clipped.len();
            sections.push(format!("=== {raw} ===\n{clipped}"));
        }
        sections.join("\n\n")
    }
}

#[async_trait]
impl Tool for SpawnTaskTool {
    fn name(&self) -> &str {
        "spawn_task"
    }

    fn description(&self) -> &str {
        "Delegate a focused task to an isolated sub-agent and return its final\n\
         answer as a [sub-agent] block. Sub-agents run one at a time; provide\n\
         context_files so the sub-agent does not re-explore the repository.\n\
         The sub-agent's approval mode can never exceed the session's."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "What the sub-agent should accomplish" },
                "context_files": {
                    "type": "array",
                    "description": "Files to inline as context (max 12, clipped)",
                    "items": { "type": "string" }
                },
                "approval_mode": {
                    "type": "string",
                    "enum": ["plan", "reject", "default", "auto-edit", "yolo"],
                    "description": "Requested approval mode (capped at the parent's)"
                },
                "max_iterations": { "type": "integer" },
                "timeout_sec": { "type": "integer" }
            },
            "required": ["task"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        if !self.config.sub_agents.enabled {
            return ToolError::new(ToolErrorCode::Validation, "sub-agents are disabled")
                .output(&call.id);
        }
        let Some(task) = call.str_arg("task") else {
            return ToolError::invalid_args("missing 'task'").output(&call.id);
        };

        let requested_mode = match call.str_arg("approval_mode") {
            None => self.parent_env.approval_mode(),
            Some("plan") => ApprovalMode::Plan,
            Some("reject") => ApprovalMode::Reject,
            Some("default") => ApprovalMode::Default,
            Some("auto-edit") => ApprovalMode::AutoEdit,
            Some("yolo") => ApprovalMode::Yolo,
            Some(other) => {
                return ToolError::invalid_args(format!("unknown approval_mode: {other}"))
                    .output(&call.id)
            }
        };
        let mode = requested_mode.capped_at(self.parent_env.approval_mode());

        let max_iterations = call
            .u64_arg("max_iterations")
            .map(|n| n as u32)
            .unwrap_or(self.config.sub_agents.max_iterations)
            .min(self.config.sub_agents.max_iterations);
        let timeout_sec = call
            .u64_arg("timeout_sec")
            .unwrap_or(self.config.sub_agents.timeout_sec)
            .min(self.config.sub_agents.timeout_sec);

        // Inline context before queueing so file reads reflect the state
        // at spawn time, not at dequeue time.
        let context_paths: Vec<&str> = call
            .args
            .get("context_files")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        let context = if self.config.sub_agents.inherit_context_file {
            self.gather_context(&context_paths)
        } else {
            String::new()
        };
        let full_task = if context.is_empty() {
            task.to_string()
        } else {
            format!("{task}\n\nContext files:\n\n{context}")
        };

        // ── Serialize on the session-tree queue ───────────────────────────────
        let position = self.queue.enqueue();
        debug!(position, task = %first_chars(task, 60), "sub-agent queued");
        let _guard = self.queue.lock.lock().await;

        let mut sub_config = (*self.config).clone();
        sub_config.agent.max_iterations = max_iterations;
        sub_config.agent.timeout = timeout_sec;
        let sub_config = Arc::new(sub_config);

        let sub_env = self.build_sub_env(mode);
        let mut registry = ToolRegistry::new();
        register_builtins(&mut registry, Arc::clone(&sub_env));
        // spawn_task is deliberately not registered in the nested session:
        // the tree-wide serialization lock is held while it runs, so a
        // grandchild would deadlock waiting for its own ancestor.

        let mut agent = Agent::new(
            Arc::clone(&self.client),
            Arc::new(registry),
            sub_env,
            sub_config,
            self.config
                .sub_agents
                .inherit_vault
                .then(|| self.vault.clone())
                .flatten(),
            Arc::new(HookBus::new()),
            AgentOptions::default(),
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_sec),
            agent.ask(&full_task),
        )
        .await;

        let (status, text) = match outcome {
            Err(_) => (SubAgentStatus::TimedOut(timeout_sec), String::new()),
            Ok(Err(e)) => (SubAgentStatus::Failed(e.to_string()), String::new()),
            Ok(Ok(result)) => (SubAgentStatus::Completed, result.text),
        };
        let touched = agent.mutated_files();
        self.queue.leave();

        let capped = cap_tokens(&text, self.config.sub_agents.result_token_cap);
        let files_line = if touched.is_empty() {
            "(none)".to_string()
        } else {
            touched
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let block = format!(
            "[sub-agent] task: {}\nstatus: {status}\nfiles touched: {files_line}\n---\n{capped}",
            first_chars(task, 80)
        );
        match status {
            SubAgentStatus::Completed => ToolOutput::ok(&call.id, block),
            _ => ToolOutput::err(&call.id, block),
        }
    }
}

/// Clip to an approximate token cap (chars/4 heuristic).
fn cap_tokens(text: &str, token_cap: usize) -> String {
    let char_cap = token_cap * 4;
    if text.len() <= char_cap {
        return text.to_string();
    }
    let mut end = char_cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... sub-agent output clipped at ~{token_cap} tokens]", &text[..end])
}

fn first_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
