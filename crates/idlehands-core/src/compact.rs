// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! History compaction: budget-driven truncation that never orphans a tool
//! message, with vault archival of the dropped history and optional LLM
//! summary synthesis.  The pure planning helpers live here; the agent owns
//! the model call and the vault.

use idlehands_model::{Message, MessageContent, Role};

/// Minimum dropped-token mass before a summary call is worth its cost.
pub(crate) const SUMMARY_WORTHWHILE_TOKENS: usize = 200;
/// The post-compaction hint clips the objective to this many characters.
pub(crate) const HINT_CLIP_CHARS: usize = 1600;

pub(crate) const SUMMARY_PROMPT: &str = "You are a context compaction assistant for a coding \
agent. Summarise the following conversation history into one dense paragraph covering: files \
read and modified, key findings, decisions made, and what remains to be done. Preserve exact \
file paths, symbol names, and error messages. The summary replaces the original history.";

/// Arguments for a manual or automatic compaction run.
#[derive(Debug, Clone, Default)]
pub struct CompactionOptions {
    /// Optional topic to focus the summary on.
    pub topic: Option<String>,
    /// Keep only the system message and the last two messages.
    pub hard: bool,
    /// Tighten min_tail to 2 and the trigger to 0.5 for this run.
    pub force: bool,
    /// Compute and report savings without mutating the session.
    pub dry: bool,
    pub reason: Option<String>,
}

/// Observable compactor state, guarded by the single-writer lock.
#[derive(Debug, Clone, Default)]
pub struct CompactionState {
    pub in_progress: bool,
    pub runs: u64,
    pub failed_runs: u64,
    pub last_reason: Option<String>,
    pub last_error: Option<String>,
}

/// What a compaction run did.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// Already under budget (or nothing droppable).
    NotNeeded,
    /// Dry run: what a real run would have freed.
    Dry {
        messages_dropped: usize,
        tokens_freed: usize,
    },
    Compacted {
        messages_dropped: usize,
        tokens_before: usize,
        tokens_after: usize,
        /// True when an LLM summary replaced the dropped span (false →
        /// the terse auto-compaction note was used).
        summarized: bool,
    },
}

/// Pick the cut index: messages `[1..cut]` are dropped (index 0 is the
/// system head).  The cut walks forward from the front until the estimate
/// fits the target or the protected tail is reached, then retreats until
/// it no longer splits an assistant-plus-tool group.
pub(crate) fn plan_cut(
    messages: &[Message],
    min_tail: usize,
    target_tokens: usize,
    extra_tokens: usize,
) -> usize {
    if messages.len() <= min_tail + 1 {
        return 1.min(messages.len());
    }
    let tail_start = messages.len() - min_tail;
    let total: usize = messages.iter().map(|m| m.approx_tokens()).sum();

    let mut cut = 1;
    let mut dropped = 0usize;
    while cut < tail_start {
        let remaining = total - dropped + extra_tokens;
        if remaining <= target_tokens {
            break;
        }
        dropped += messages[cut].approx_tokens();
        cut += 1;
    }
    retreat_to_group_boundary(messages, cut)
}

/// Retreat `cut` until the kept region starts at a group boundary.
///
/// A kept region must not begin with a ToolResult (its call would be
/// dropped — an orphan the server rejects) and must not begin with a
/// ToolCall whose sibling calls from the same assistant turn would be
/// dropped.  Beginning at the *first* ToolCall of a group keeps the whole
/// group and is safe.
fn retreat_to_group_boundary(messages: &[Message], mut cut: usize) -> usize {
    while cut > 1 {
        let splits_group = match &messages[cut].content {
            MessageContent::ToolResult { .. } => true,
            MessageContent::ToolCall { .. } => {
                matches!(messages[cut - 1].content, MessageContent::ToolCall { .. })
            }
            _ => false,
        };
        if !splits_group {
            break;
        }
        cut -= 1;
    }
    cut
}

/// The cut for a hard compaction: keep the system head plus the last two
/// messages, extended backward so the kept tail starts at a group boundary.
pub(crate) fn plan_hard_cut(messages: &[Message]) -> usize {
    if messages.len() <= 3 {
        return 1.min(messages.len());
    }
    retreat_to_group_boundary(messages, messages.len() - 2)
}

/// Tool results among the dropped span, paired with the tool name from the
/// matching assistant call, ready for vault archival.
pub(crate) fn dropped_tool_results(dropped: &[Message]) -> Vec<(String, String, String)> {
    let mut names: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for m in dropped {
        if let MessageContent::ToolCall {
            tool_call_id,
            function,
        } = &m.content
        {
            names.insert(tool_call_id, &function.name);
        }
    }
    dropped
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => Some((
                tool_call_id.clone(),
                names.get(tool_call_id.as_str()).unwrap_or(&"unknown").to_string(),
                content.clone(),
            )),
            _ => None,
        })
        .collect()
}

/// Serialize dropped history as plain text for the summary prompt.
pub(crate) fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Terse fallback note used when summary synthesis is disabled or fails.
pub(crate) fn compaction_note(dropped: usize) -> Message {
    Message::system(format!(
        "[auto-compacted: {dropped} messages dropped to stay within the context \
         window; details were archived and can be recovered with vault_search]"
    ))
}

/// Clip the objective for the post-compaction hint.
pub(crate) fn clip_objective(text: &str) -> String {
    if text.len() <= HINT_CLIP_CHARS {
        return text.to_string();
    }
    let mut end = HINT_CLIP_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use idlehands_model::Message;

    fn filler(n: usize) -> Vec<Message> {
        // Alternating user/assistant messages of known size.
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i} {}", "x".repeat(80)))
                } else {
                    Message::assistant(format!("answer {i} {}", "y".repeat(80)))
                }
            })
            .collect()
    }

    fn with_system(mut body: Vec<Message>) -> Vec<Message> {
        let mut msgs = vec![Message::system("system prompt")];
        msgs.append(&mut body);
        msgs
    }

    // ── plan_cut ─────────────────────────────────────────────────────────────

    #[test]
    fn cut_never_drops_system_message() {
        let msgs = with_system(filler(30));
        let cut = plan_cut(&msgs, 12, 10, 0);
        assert!(cut >= 1, "index 0 (system) is never part of the dropped range");
    }

    #[test]
    fn cut_respects_min_tail() {
        let msgs = with_system(filler(30));
        // Impossible target: even dropping everything droppable won't fit.
        let cut = plan_cut(&msgs, 12, 0, 0);
        assert!(cut <= msgs.len() - 12, "tail of 12 messages must survive");
    }

    #[test]
    fn cut_zero_when_already_fits() {
        let msgs = with_system(filler(6));
        let cut = plan_cut(&msgs, 3, 1_000_000, 0);
        assert_eq!(cut, 1, "nothing to drop when under target");
    }

    #[test]
    fn cut_retreats_out_of_tool_groups() {
        let mut msgs = vec![Message::system("sys")];
        msgs.push(Message::user("do something"));
        msgs.push(Message::assistant("ok"));
        msgs.push(Message::tool_call("c1", "read_file", "{}"));
        msgs.push(Message::tool_result("c1", &"r".repeat(400)));
        for m in filler(8) {
            msgs.push(m);
        }
        // Force the walk to land inside the tool group, then verify the
        // retreat: the kept region never starts with an orphan ToolResult
        // or a mid-group ToolCall.
        for candidate_tail in 1..=4usize {
            let cut = plan_cut(&msgs, candidate_tail, 50, 0);
            assert!(
                !matches!(msgs[cut].content, MessageContent::ToolResult { .. }),
                "cut at {cut} orphans a tool result (tail {candidate_tail})"
            );
            if matches!(msgs[cut].content, MessageContent::ToolCall { .. }) {
                assert!(
                    !matches!(msgs[cut - 1].content, MessageContent::ToolCall { .. }),
                    "cut at {cut} splits sibling tool calls"
                );
            }
        }
    }

    #[test]
    fn cut_may_start_at_first_call_of_a_group() {
        // Alternating call/result pairs: each pair is its own group, so a
        // cut landing on a pair's ToolCall is legal and the walk must not
        // retreat through the whole run.
        let mut msgs = vec![Message::system("sys"), Message::user("go")];
        for i in 0..6 {
            msgs.push(Message::tool_call(format!("c{i}"), "read_file", "{}"));
            msgs.push(Message::tool_result(format!("c{i}"), "r".repeat(200)));
        }
        msgs.push(Message::assistant("done"));
        let cut = plan_cut(&msgs, 3, 60, 0);
        assert!(cut > 2, "the walk must make progress through pair runs, got {cut}");
        assert!(!matches!(msgs[cut].content, MessageContent::ToolResult { .. }));
    }

    #[test]
    fn dropping_reduces_estimate_below_target() {
        let msgs = with_system(filler(40));
        let total: usize = msgs.iter().map(|m| m.approx_tokens()).sum();
        let target = total / 2;
        let cut = plan_cut(&msgs, 4, target, 0);
        let remaining: usize = msgs[cut..].iter().map(|m| m.approx_tokens()).sum::<usize>()
            + msgs[0].approx_tokens();
        assert!(
            remaining <= target + msgs[0].approx_tokens() + 60,
            "remaining {remaining} should be near or below target {target}"
        );
    }

    // ── plan_hard_cut ────────────────────────────────────────────────────────

    #[test]
    fn hard_cut_keeps_last_two() {
        let msgs = with_system(filler(10));
        let cut = plan_hard_cut(&msgs);
        assert_eq!(cut, msgs.len() - 2);
    }

    #[test]
    fn hard_cut_keeps_trailing_pair_intact() {
        let mut msgs = with_system(filler(6));
        msgs.push(Message::tool_call("c9", "exec", "{}"));
        msgs.push(Message::tool_result("c9", "out"));
        let cut = plan_hard_cut(&msgs);
        // The kept tail starts at the pair's ToolCall — never at the
        // orphaned ToolResult.
        assert!(matches!(msgs[cut].content, MessageContent::ToolCall { .. }));
        assert!(!matches!(msgs[cut].content, MessageContent::ToolResult { .. }));
    }

    // ── archival pairing ─────────────────────────────────────────────────────

    #[test]
    fn dropped_tool_results_pair_names() {
        let dropped = vec![
            Message::tool_call("c1", "read_file", r#"{"path":"a"}"#),
            Message::tool_result("c1", "file body"),
            Message::tool_call("c2", "exec", r#"{"command":"ls"}"#),
            Message::tool_result("c2", "listing"),
        ];
        let archived = dropped_tool_results(&dropped);
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0], ("c1".into(), "read_file".into(), "file body".into()));
        assert_eq!(archived[1].1, "exec");
    }

    #[test]
    fn orphan_result_archived_with_unknown_tool() {
        let dropped = vec![Message::tool_result("c9", "body")];
        let archived = dropped_tool_results(&dropped);
        assert_eq!(archived[0].1, "unknown");
    }

    // ── misc helpers ─────────────────────────────────────────────────────────

    #[test]
    fn serialize_history_includes_roles_and_tool_calls() {
        let msgs = vec![
            Message::system("hidden"),
            Message::user("hi"),
            Message::tool_call("c1", "exec", r#"{"command":"ls"}"#),
            Message::tool_result("c1", "a.txt"),
        ];
        let s = serialize_history(&msgs);
        assert!(!s.contains("hidden"), "system text stays out of summaries");
        assert!(s.contains("User: hi"));
        assert!(s.contains("[tool_call: exec"));
        assert!(s.contains("[tool_result: a.txt]"));
    }

    #[test]
    fn clip_objective_caps_length() {
        let long = "word ".repeat(1000);
        let clipped = clip_objective(&long);
        assert!(clipped.len() <= HINT_CLIP_CHARS + '…'.len_utf8());
        assert!(clipped.ends_with('…'));
        assert_eq!(clip_objective("short"), "short");
    }

    #[test]
    fn compaction_note_mentions_count_and_vault() {
        let note = compaction_note(17);
        let text = note.as_text().unwrap();
        assert!(text.contains("17 messages"));
        assert!(text.contains("vault_search"));
    }
}
