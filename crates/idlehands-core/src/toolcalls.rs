// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Assistant-text post-processing: reasoning-block stripping, content-mode
//! tool-call extraction, ghost-call dedupe, and the planning-narration
//! heuristic.

use idlehands_model::RawToolCall;
use regex::Regex;
use tracing::debug;

/// Strip `<think>…</think>` blocks from visible text.  An unclosed block
/// (the model was cut off mid-thought) swallows the rest of the text.
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Remove leaked XML tool-call fragments from visible text.  Some models
/// emit both a structured call and a textual echo of it.
pub fn strip_leaked_tool_xml(text: &str) -> String {
    let re = Regex::new(r"(?s)<(tool_call|function=[^>]*)>.*?(</tool_call>|</function>)")
        .expect("static regex");
    let cleaned = re.replace_all(text, "");
    cleaned.trim().to_string()
}

/// Parse tool calls out of assistant text (content mode, or harnesses that
/// distrust the structured array).  Accepted shapes:
///
/// 1. Fenced JSON block: ```json {"name": …, "arguments": {…}} ```
/// 2. XML function tag: `<function=name>{…}</function>`
/// 3. A bare JSON object with `name` and `arguments` keys.
///
/// Synthetic ids are assigned in order of appearance.
pub fn parse_tool_calls_from_text(text: &str) -> Vec<RawToolCall> {
    let mut calls = Vec::new();

    // 1. Fenced blocks.
    let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex");
    for cap in fence.captures_iter(text) {
        if let Some(call) = parse_call_object(&cap[1]) {
            calls.push(call);
        }
    }

    // 2. XML function tags.
    let xml = Regex::new(r"(?s)<function=([A-Za-z0-9_]+)>\s*(\{.*?\})\s*</function>")
        .expect("static regex");
    for cap in xml.captures_iter(text) {
        if serde_json::from_str::<serde_json::Value>(&cap[2]).is_ok() {
            calls.push(RawToolCall {
                id: String::new(),
                name: cap[1].to_string(),
                arguments: cap[2].to_string(),
            });
        }
    }

    // 3. Bare object (only when nothing else matched — a bare object is
    //    also what the fence regex captured, so this avoids duplicates).
    if calls.is_empty() {
        let trimmed = text.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            if let Some(call) = parse_call_object(trimmed) {
                calls.push(call);
            }
        }
    }

    for (i, call) in calls.iter_mut().enumerate() {
        if call.id.is_empty() {
            call.id = format!("textcall_{i}");
        }
    }
    calls
}

fn parse_call_object(s: &str) -> Option<RawToolCall> {
    let v: serde_json::Value = serde_json::from_str(s).ok()?;
    let name = v.get("name")?.as_str()?.to_string();
    let arguments = match v.get("arguments") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(obj) => obj.to_string(),
        None => "{}".to_string(),
    };
    Some(RawToolCall {
        id: String::new(),
        name,
        arguments,
    })
}

/// Drop "ghost" split calls: some servers emit the same tool call twice,
/// once complete and once with a truncated argument object.  A call is a
/// ghost when a sibling has the same name and strictly more argument keys.
pub fn dedupe_ghost_calls(calls: Vec<RawToolCall>) -> Vec<RawToolCall> {
    let key_count = |c: &RawToolCall| -> usize {
        serde_json::from_str::<serde_json::Value>(&c.arguments)
            .ok()
            .and_then(|v| v.as_object().map(|o| o.len()))
            .unwrap_or(0)
    };
    let counts: Vec<usize> = calls.iter().map(key_count).collect();
    calls
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            let ghost = calls.iter().enumerate().any(|(j, other)| {
                j != *i && other.name == c.name && counts[j] > counts[*i]
            });
            !ghost
        })
        .map(|(_, c)| c.clone())
        .collect()
}

/// Heuristic: does this text read like planning narration rather than a
/// final answer?  A tunable regex ensemble — the matched pattern is logged
/// so embedders can audit misclassifications.
pub fn looks_like_planning(text: &str) -> Option<&'static str> {
    const PATTERNS: &[(&str, &str)] = &[
        (r"(?i)^\s*(i('| a)?m going to|i will|i'll)\b", "first-person-future"),
        (r"(?i)^\s*(let me|let's)\b", "let-me-opener"),
        (r"(?i)^\s*(first|next|now),? i\b", "step-narration"),
        (r"(?i)\b(i need to|i should) (check|read|look|examine|inspect)\b", "need-to-inspect"),
        (r"(?i)(going to|about to) (call|use|run) the\b", "tool-announcement"),
    ];
    let head: String = text.chars().take(400).collect();
    for (pattern, label) in PATTERNS {
        if Regex::new(pattern).expect("static regex").is_match(&head) {
            debug!(label, "text classified as planning narration");
            return Some(label);
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── think stripping ──────────────────────────────────────────────────────

    #[test]
    fn think_block_removed_text_kept() {
        let s = "<think>hmm, let me reason</think>The answer is 4.";
        assert_eq!(strip_think_blocks(s), "The answer is 4.");
    }

    #[test]
    fn unclosed_think_block_swallows_rest() {
        let s = "prefix <think>never closed";
        assert_eq!(strip_think_blocks(s), "prefix");
    }

    #[test]
    fn multiple_think_blocks_removed() {
        let s = "<think>a</think>one<think>b</think>two";
        assert_eq!(strip_think_blocks(s), "onetwo");
    }

    #[test]
    fn leaked_tool_xml_removed() {
        let s = "Here you go.<tool_call>{\"name\":\"exec\"}</tool_call>";
        assert_eq!(strip_leaked_tool_xml(s), "Here you go.");
    }

    // ── content-mode parsing ─────────────────────────────────────────────────

    #[test]
    fn fenced_json_call_parsed() {
        let text = "I'll read it.\n```json\n{\"name\": \"read_file\", \"arguments\": {\"path\": \"a.txt\"}}\n```";
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert!(calls[0].arguments.contains("a.txt"));
        assert_eq!(calls[0].id, "textcall_0");
    }

    #[test]
    fn fenced_block_without_language_tag_parsed() {
        let text = "```\n{\"name\": \"list_dir\", \"arguments\": {}}\n```";
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_dir");
    }

    #[test]
    fn xml_function_tag_parsed() {
        let text = "<function=exec>{\"command\": \"ls\"}</function>";
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "exec");
        assert_eq!(calls[0].arguments, "{\"command\": \"ls\"}");
    }

    #[test]
    fn bare_json_object_parsed() {
        let text = r#"{"name": "sys_context", "arguments": {}}"#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "sys_context");
    }

    #[test]
    fn arguments_as_string_passed_through() {
        let text = r#"{"name": "exec", "arguments": "{\"command\": \"ls\"}"}"#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls[0].arguments, "{\"command\": \"ls\"}");
    }

    #[test]
    fn prose_without_calls_yields_nothing() {
        assert!(parse_tool_calls_from_text("The fix is complete; tests pass.").is_empty());
    }

    #[test]
    fn json_without_name_key_ignored() {
        assert!(parse_tool_calls_from_text(r#"{"result": 42}"#).is_empty());
    }

    // ── ghost dedupe ─────────────────────────────────────────────────────────

    #[test]
    fn ghost_with_fewer_args_dropped() {
        let calls = vec![
            RawToolCall {
                id: "a".into(),
                name: "read_file".into(),
                arguments: r#"{"path":"a.txt","limit":200}"#.into(),
            },
            RawToolCall {
                id: "b".into(),
                name: "read_file".into(),
                arguments: r#"{"path":"a.txt"}"#.into(),
            },
        ];
        let kept = dedupe_ghost_calls(calls);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "a");
    }

    #[test]
    fn equal_arg_counts_both_kept() {
        let calls = vec![
            RawToolCall {
                id: "a".into(),
                name: "read_file".into(),
                arguments: r#"{"path":"a.txt"}"#.into(),
            },
            RawToolCall {
                id: "b".into(),
                name: "read_file".into(),
                arguments: r#"{"path":"b.txt"}"#.into(),
            },
        ];
        assert_eq!(dedupe_ghost_calls(calls).len(), 2);
    }

    #[test]
    fn different_tools_never_ghosted() {
        let calls = vec![
            RawToolCall {
                id: "a".into(),
                name: "read_file".into(),
                arguments: r#"{"path":"a.txt","limit":1}"#.into(),
            },
            RawToolCall {
                id: "b".into(),
                name: "list_dir".into(),
                arguments: r#"{}"#.into(),
            },
        ];
        assert_eq!(dedupe_ghost_calls(calls).len(), 2);
    }

    // ── planning heuristic ───────────────────────────────────────────────────

    #[test]
    fn planning_narration_detected() {
        assert!(looks_like_planning("I'll start by reading the config file.").is_some());
        assert!(looks_like_planning("Let me check the test suite first.").is_some());
        assert!(looks_like_planning("First, I need to check the imports.").is_some());
    }

    #[test]
    fn final_answers_not_planning() {
        assert!(looks_like_planning("The bug is in parse_header: the offset is off by one.").is_none());
        assert!(looks_like_planning("Done. All three tests pass now.").is_none());
        assert!(looks_like_planning("42").is_none());
    }
}
