// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Plan mode: mutating tool calls are intercepted before dispatch and
//! queued as plan steps the user can execute later.

use serde_json::Value;

/// One intercepted mutating action.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub index: usize,
    pub tool: String,
    pub args: Value,
    /// One-line human rendering of the intended action.
    pub summary: String,
    pub executed: bool,
}

/// The queue of intercepted steps for one session.
#[derive(Debug, Default)]
pub struct PlanQueue {
    steps: Vec<PlanStep>,
}

impl PlanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intercepted call; returns the step index.
    pub fn record(&mut self, tool: &str, args: &Value) -> usize {
        let index = self.steps.len();
        let summary = summarize(tool, args);
        self.steps.push(PlanStep {
            index,
            tool: tool.to_string(),
            args: args.clone(),
            summary,
            executed: false,
        });
        index
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps selected for execution: the given index, or every
    /// not-yet-executed step in order.
    pub fn select(&self, index: Option<usize>) -> Vec<usize> {
        match index {
            Some(i) => self
                .steps
                .get(i)
                .filter(|s| !s.executed)
                .map(|s| vec![s.index])
                .unwrap_or_default(),
            None => self
                .steps
                .iter()
                .filter(|s| !s.executed)
                .map(|s| s.index)
                .collect(),
        }
    }

    pub fn mark_executed(&mut self, index: usize) {
        if let Some(s) = self.steps.get_mut(index) {
            s.executed = true;
        }
    }
}

/// Compact rendering of the intended action for plan listings.
fn summarize(tool: &str, args: &Value) -> String {
    let detail = args
        .get("path")
        .or_else(|| args.get("command"))
        .or_else(|| args.get("key"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if detail.is_empty() {
        tool.to_string()
    } else {
        format!("{tool} {detail}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_assigns_sequential_indices() {
        let mut q = PlanQueue::new();
        assert_eq!(q.record("write_file", &json!({"path": "a.txt"})), 0);
        assert_eq!(q.record("exec", &json!({"command": "make"})), 1);
        assert_eq!(q.steps().len(), 2);
    }

    #[test]
    fn summary_names_tool_and_target() {
        let mut q = PlanQueue::new();
        q.record("edit_range", &json!({"path": "src/main.rs", "start_line": 3}));
        assert_eq!(q.steps()[0].summary, "edit_range src/main.rs");
    }

    #[test]
    fn select_none_returns_all_unexecuted_in_order() {
        let mut q = PlanQueue::new();
        q.record("a", &json!({}));
        q.record("b", &json!({}));
        q.record("c", &json!({}));
        q.mark_executed(1);
        assert_eq!(q.select(None), vec![0, 2]);
    }

    #[test]
    fn select_index_skips_executed() {
        let mut q = PlanQueue::new();
        q.record("a", &json!({}));
        q.mark_executed(0);
        assert!(q.select(Some(0)).is_empty());
        assert!(q.select(Some(9)).is_empty(), "out of range is empty");
    }
}
