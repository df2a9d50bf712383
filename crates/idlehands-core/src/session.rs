// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use idlehands_model::{Message, MessageContent, Role};
use uuid::Uuid;

/// In-memory conversation state with running token accounting.
///
/// Invariant maintained by the orchestrator and the compactor: after any
/// completed turn, every assistant tool-call id has exactly one matching
/// tool message before the next assistant message, and the first message
/// is always the system prompt.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate token total for `messages` (chars/4 heuristic).
    pub token_count: usize,
    /// Model context window in tokens.
    pub context_window: usize,
    /// Completion reservation subtracted from the usable prompt budget.
    pub max_completion_tokens: usize,
}

impl Session {
    pub fn new(context_window: usize, max_completion_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            context_window,
            max_completion_tokens,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    /// Recalculate the token total from scratch (after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// True when the estimate (plus per-request overhead) crosses the
    /// compaction threshold.  The completion reservation counts against
    /// the budget alongside the prompt.
    pub fn over_budget(&self, schema_tokens: usize, compact_at: f32) -> bool {
        if self.context_window == 0 {
            return false;
        }
        let needed = self.token_count + schema_tokens + self.max_completion_tokens;
        (needed as f32) >= compact_at * self.context_window as f32
    }

    /// The last substantive user text — the current objective.  Skips
    /// injected system-style nudges (bracketed notices).
    pub fn last_user_objective(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .filter_map(|m| m.as_text())
            .find(|t| !t.trim_start().starts_with('['))
    }

    /// Ids of assistant tool calls that have no matching tool result yet.
    pub fn unanswered_tool_calls(&self) -> Vec<String> {
        let mut open: Vec<String> = Vec::new();
        for m in &self.messages {
            match &m.content {
                MessageContent::ToolCall { tool_call_id, .. } => {
                    open.push(tool_call_id.clone());
                }
                MessageContent::ToolResult { tool_call_id, .. } => {
                    open.retain(|id| id != tool_call_id);
                }
                _ => {}
            }
        }
        open
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
