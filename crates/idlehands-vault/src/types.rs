// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0

/// What kind of record an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A keyed note written by the agent or an embedder.
    Note,
    /// An archived tool result (keyed by tool name, idempotent per call id).
    Tool,
    /// Runtime bookkeeping (failure notes, internal markers).
    System,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Note => "note",
            EntryKind::Tool => "tool",
            EntryKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(EntryKind::Note),
            "tool" => Some(EntryKind::Tool),
            "system" => Some(EntryKind::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stored record.
#[derive(Debug, Clone)]
pub struct VaultEntry {
    pub id: i64,
    pub kind: EntryKind,
    pub key: Option<String>,
    pub value: Option<String>,
    pub tool: Option<String>,
    pub tool_call_id: Option<String>,
    pub content: Option<String>,
    pub snippet: Option<String>,
    pub project_dir: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl VaultEntry {
    /// Text used for search matching and snippet extraction.
    pub fn search_text(&self) -> String {
        [
            self.key.as_deref(),
            self.value.as_deref(),
            self.tool.as_deref(),
            self.content.as_deref(),
            self.snippet.as_deref(),
        ]
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }
}
