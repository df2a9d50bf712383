// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! SSE frame parsing for `/chat/completions` streams.
//!
//! A single SSE event may be split across multiple TCP packets, so parsing
//! maintains a persistent line buffer: only complete `\n`-terminated lines
//! are consumed, and a trailing partial line stays in the buffer until the
//! next chunk extends it.

use serde_json::Value;

use crate::{ClientError, StreamEvent, Usage};

/// Drain all complete `\n`-terminated `data:` lines from `buf` into events.
///
/// The trailing incomplete line (if any) is left in `buf`.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<StreamEvent, ClientError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse one complete SSE `data:` line.  Returns `None` for empty lines,
/// comments, and unparseable payloads.
fn parse_sse_data_line(line: &str) -> Option<Result<StreamEvent, ClientError>> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(StreamEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Interpret one parsed SSE JSON chunk.
pub(crate) fn parse_sse_chunk(v: &Value) -> StreamEvent {
    // Usage totals arrive in a trailing chunk with `choices: []` when
    // `stream_options.include_usage` is set.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return StreamEvent::Usage(parse_usage(usage));
    }

    let choice = &v["choices"][0];

    if choice["finish_reason"].as_str() == Some("length") {
        return StreamEvent::MaxTokens;
    }

    let delta = &choice["delta"];

    // Tool-call fragment.  OpenAI interleaves parallel calls by index; the
    // index routes accumulation downstream.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return StreamEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        };
    }

    // Reasoning deltas: `reasoning_content` (llama.cpp, DeepSeek) preferred,
    // `reasoning` (aggregators) as fallback.
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking {
        if !t.is_empty() {
            return StreamEvent::ThinkingDelta(t.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return StreamEvent::TextDelta(text.to_string());
    }

    StreamEvent::TextDelta(String::new())
}

pub(crate) fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_parsed() {
        let v = serde_json::json!({"choices": [{"delta": {"content": "hi"}}]});
        assert!(matches!(parse_sse_chunk(&v), StreamEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn tool_call_fragment_preserves_index_id_name() {
        let v = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 2,
                "id": "call_x",
                "function": {"name": "exec", "arguments": "{\"com"}
            }]}}]
        });
        match parse_sse_chunk(&v) {
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                assert_eq!(index, 2);
                assert_eq!(id, "call_x");
                assert_eq!(name, "exec");
                assert_eq!(arguments, "{\"com");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn trailing_usage_chunk_with_empty_choices() {
        let v = serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30}
        });
        assert!(matches!(
            parse_sse_chunk(&v),
            StreamEvent::Usage(Usage { prompt_tokens: 120, completion_tokens: 30 })
        ));
    }

    #[test]
    fn null_usage_falls_through_to_delta() {
        let v = serde_json::json!({"usage": null, "choices": [{"delta": {"content": "x"}}]});
        assert!(matches!(parse_sse_chunk(&v), StreamEvent::TextDelta(t) if t == "x"));
    }

    #[test]
    fn finish_reason_length_is_max_tokens() {
        let v = serde_json::json!({"choices": [{"finish_reason": "length", "delta": {}}]});
        assert!(matches!(parse_sse_chunk(&v), StreamEvent::MaxTokens));
    }

    #[test]
    fn reasoning_content_becomes_thinking_delta() {
        let v = serde_json::json!({"choices": [{"delta": {"reasoning_content": "hmm"}}]});
        assert!(matches!(parse_sse_chunk(&v), StreamEvent::ThinkingDelta(t) if t == "hmm"));
    }

    #[test]
    fn done_sentinel_parsed() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done)));
    }

    #[test]
    fn partial_line_stays_in_buffer() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        assert_eq!(buf, partial);
    }

    #[test]
    fn event_split_across_two_chunks_reassembled() {
        let full = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"read_file","arguments":""}}]}}]}"#;
        let (a, b) = full.split_at(full.len() / 2);
        let mut buf = String::new();
        buf.push_str(a);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        buf.push_str(b);
        buf.push('\n');
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Ok(StreamEvent::ToolCallDelta { id, name, .. }) if id == "c1" && name == "read_file"
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_events_in_one_chunk_all_parsed() {
        let chunk = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        );
        let mut buf = chunk.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn crlf_line_endings_handled() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(StreamEvent::TextDelta(t)) if t == "hi"));
    }
}
