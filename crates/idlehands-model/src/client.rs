// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{ChatRequest, ChatResponse, ClientError, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

/// The interface the orchestrator drives.
///
/// Implementations: [`crate::HttpChatClient`] for OpenAI-compatible servers,
/// and the scripted mocks in [`crate::mock`] for tests.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// List the model ids the endpoint currently serves.
    ///
    /// Used for auto-pick and drift detection.  Fails with
    /// [`ClientError::Unavailable`] on transport errors.
    async fn models(&self) -> Result<Vec<String>, ClientError>;

    /// Non-streaming completion.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ClientError>;

    /// Streaming completion.  The returned stream applies the per-frame
    /// read timeout and the non-stream fallback internally.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream, ClientError>;

    /// Current model id (may change on drift detection).
    fn model(&self) -> String;

    /// Replace the target model for subsequent completions.
    fn set_model(&self, model: &str);

    /// True once the tool-call compatibility fallback has switched this
    /// session to content mode (tools described in the prompt, calls parsed
    /// from assistant text).
    fn content_mode(&self) -> bool {
        false
    }
}

/// Convert a completed [`ChatResponse`] into the equivalent event stream.
///
/// Used by the 400-on-streaming and read-timeout fallbacks so consumers see
/// a uniform stream regardless of which path produced the completion.
pub fn response_into_events(resp: ChatResponse) -> Vec<Result<StreamEvent, ClientError>> {
    let mut events = Vec::new();
    if !resp.text.is_empty() {
        events.push(Ok(StreamEvent::TextDelta(resp.text)));
    }
    for (i, tc) in resp.tool_calls.into_iter().enumerate() {
        events.push(Ok(StreamEvent::ToolCallDelta {
            index: i as u32,
            id: tc.id,
            name: tc.name,
            arguments: tc.arguments,
        }));
    }
    if let Some(u) = resp.usage {
        events.push(Ok(StreamEvent::Usage(u)));
    }
    events.push(Ok(StreamEvent::Done));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawToolCall, Usage};

    #[test]
    fn response_into_events_orders_text_tools_usage_done() {
        let resp = ChatResponse {
            text: "hello".into(),
            tool_calls: vec![RawToolCall {
                id: "c1".into(),
                name: "read_file".into(),
                arguments: "{}".into(),
            }],
            usage: Some(Usage {
                prompt_tokens: 1,
                completion_tokens: 2,
            }),
        };
        let events = response_into_events(resp);
        assert!(matches!(events[0], Ok(StreamEvent::TextDelta(_))));
        assert!(matches!(events[1], Ok(StreamEvent::ToolCallDelta { .. })));
        assert!(matches!(events[2], Ok(StreamEvent::Usage(_))));
        assert!(matches!(events[3], Ok(StreamEvent::Done)));
    }

    #[test]
    fn empty_response_is_just_done() {
        let events = response_into_events(ChatResponse::default());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done)));
    }
}
