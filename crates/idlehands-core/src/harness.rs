// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Per-model quirk profiles.
//!
//! Different model families misbehave in different ways: some leak
//! `<think>` blocks into text, some emit unreliable `tool_calls` arrays,
//! some cannot handle parallel calls.  The harness captures those quirks
//! so the orchestrator stays model-agnostic.

/// Quirk profile for the active model.
#[derive(Debug, Clone)]
pub struct Harness {
    pub id: String,
    /// Strip `<think>…</think>` blocks from visible assistant text.
    pub strip_think_blocks: bool,
    /// Whether the structured `tool_calls` array can be trusted.  When
    /// false, tool calls are parsed from assistant text instead.
    pub tool_calls_reliable: bool,
    /// Whether read-only calls of one turn may execute concurrently.
    pub parallel_tool_calls: bool,
    /// Harness-imposed ceiling on iterations per ask (None → config value).
    pub max_iterations_cap: Option<u32>,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            id: "generic".into(),
            strip_think_blocks: true,
            tool_calls_reliable: true,
            parallel_tool_calls: true,
            max_iterations_cap: None,
        }
    }
}

impl Harness {
    /// Pick a profile from the model id.  Substring matching on the model
    /// family name — ids vary wildly across servers (`qwen2.5-coder:7b`,
    /// `Qwen/Qwen2.5-Coder-7B`, `qwen2.5-coder-7b-instruct-q4_K_M`).
    pub fn for_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.contains("qwen") || lower.contains("qwq") {
            return Self {
                id: "qwen".into(),
                strip_think_blocks: true,
                tool_calls_reliable: true,
                parallel_tool_calls: false,
                max_iterations_cap: None,
            };
        }
        if lower.contains("deepseek") {
            return Self {
                id: "deepseek".into(),
                strip_think_blocks: true,
                tool_calls_reliable: true,
                parallel_tool_calls: false,
                max_iterations_cap: None,
            };
        }
        if lower.contains("llama") {
            return Self {
                id: "llama".into(),
                strip_think_blocks: false,
                // Older llama fine-tunes write tool calls into text.
                tool_calls_reliable: false,
                parallel_tool_calls: false,
                max_iterations_cap: Some(32),
            };
        }
        if lower.contains("mistral") || lower.contains("mixtral") {
            return Self {
                id: "mistral".into(),
                strip_think_blocks: false,
                tool_calls_reliable: true,
                parallel_tool_calls: true,
                max_iterations_cap: None,
            };
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qwen_profile_disables_parallel_calls() {
        let h = Harness::for_model("qwen2.5-coder:7b-instruct");
        assert_eq!(h.id, "qwen");
        assert!(!h.parallel_tool_calls);
        assert!(h.strip_think_blocks);
    }

    #[test]
    fn llama_profile_distrusts_tool_calls_array() {
        let h = Harness::for_model("Meta-Llama-3-8B-Instruct");
        assert!(!h.tool_calls_reliable);
        assert_eq!(h.max_iterations_cap, Some(32));
    }

    #[test]
    fn unknown_model_gets_generic_profile() {
        let h = Harness::for_model("some-exotic-model-v9");
        assert_eq!(h.id, "generic");
        assert!(h.tool_calls_reliable);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(Harness::for_model("DeepSeek-R1-Distill").id, "deepseek");
    }
}
