// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic mock clients for tests.  No network access: a scripted
//! client replays exact event sequences — tool calls, errors, usage — so
//! agent-loop tests can pin precise wire behavior.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::{response_into_events, ChatClient, EventStream};
use crate::{ChatRequest, ChatResponse, ClientError, RawToolCall, StreamEvent, Usage};

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Emit these events and finish.
    Events(Vec<StreamEvent>),
    /// Fail the request with this HTTP error.
    HttpError { status: u16, body: String },
}

impl ScriptedTurn {
    /// Convenience: a plain text answer.
    pub fn text(reply: impl Into<String>) -> Self {
        ScriptedTurn::Events(vec![
            StreamEvent::TextDelta(reply.into()),
            StreamEvent::Usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
            }),
            StreamEvent::Done,
        ])
    }

    /// Convenience: a single tool call.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Self {
        ScriptedTurn::Events(vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args_json.into(),
            },
            StreamEvent::Done,
        ])
    }
}

/// Pops the next scripted turn on every `chat`/`chat_stream` call and
/// records each request for later inspection.
pub struct ScriptedClient {
    scripts: Mutex<Vec<ScriptedTurn>>,
    model: Mutex<String>,
    /// Models reported by `models()` — drift tests swap this out.
    pub served_models: Mutex<Vec<String>>,
    /// Every request seen, in order.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<ScriptedTurn>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            model: Mutex::new("scripted-model".into()),
            served_models: Mutex::new(vec!["scripted-model".into()]),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Client that always answers with the same text.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedTurn::text(reply)])
    }

    fn next_turn(&self, req: &ChatRequest) -> ScriptedTurn {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req.clone());
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        if scripts.is_empty() {
            ScriptedTurn::text("[no more scripts]")
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn models(&self) -> Result<Vec<String>, ClientError> {
        Ok(self
            .served_models
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ClientError> {
        match self.next_turn(req) {
            ScriptedTurn::HttpError { status, body } => Err(ClientError::Http {
                status,
                body_prefix: body,
                retryable: false,
            }),
            ScriptedTurn::Events(events) => {
                let mut resp = ChatResponse::default();
                for ev in events {
                    match ev {
                        StreamEvent::TextDelta(t) => resp.text.push_str(&t),
                        StreamEvent::ToolCallDelta {
                            id,
                            name,
                            arguments,
                            ..
                        } => resp.tool_calls.push(RawToolCall {
                            id,
                            name,
                            arguments,
                        }),
                        StreamEvent::Usage(u) => resp.usage = Some(u),
                        _ => {}
                    }
                }
                Ok(resp)
            }
        }
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream, ClientError> {
        match self.next_turn(req) {
            ScriptedTurn::HttpError { status, body } => Err(ClientError::Http {
                status,
                body_prefix: body,
                retryable: false,
            }),
            ScriptedTurn::Events(events) => {
                let wrapped: Vec<Result<StreamEvent, ClientError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(futures::stream::iter(wrapped)))
            }
        }
    }

    fn model(&self) -> String {
        self.model.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_model(&self, model: &str) {
        *self.model.lock().unwrap_or_else(|e| e.into_inner()) = model.to_string();
    }
}

/// Echo client: replies with the last user message.  Handy for smoke tests.
#[derive(Default)]
pub struct EchoClient;

#[async_trait]
impl ChatClient for EchoClient {
    async fn models(&self) -> Result<Vec<String>, ClientError> {
        Ok(vec!["echo".into()])
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ClientError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        Ok(ChatResponse {
            text: format!("ECHO: {reply}"),
            tool_calls: vec![],
            usage: None,
        })
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream, ClientError> {
        let resp = self.chat(req).await?;
        Ok(Box::pin(futures::stream::iter(response_into_events(resp))))
    }

    fn model(&self) -> String {
        "echo".into()
    }

    fn set_model(&self, _model: &str) {}
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use futures::StreamExt;

    fn req(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user(text)],
            max_tokens: 64,
            temperature: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripted_turns_pop_in_order() {
        let c = ScriptedClient::new(vec![ScriptedTurn::text("one"), ScriptedTurn::text("two")]);
        assert_eq!(c.chat(&req("a")).await.unwrap().text, "one");
        assert_eq!(c.chat(&req("b")).await.unwrap().text, "two");
        assert_eq!(c.chat(&req("c")).await.unwrap().text, "[no more scripts]");
    }

    #[tokio::test]
    async fn scripted_error_surfaces_status() {
        let c = ScriptedClient::new(vec![ScriptedTurn::HttpError {
            status: 413,
            body: "too large".into(),
        }]);
        let err = c.chat_stream(&req("x")).await.err().unwrap();
        assert_eq!(err.status(), Some(413));
    }

    #[tokio::test]
    async fn scripted_records_requests() {
        let c = ScriptedClient::always_text("ok");
        let _ = c.chat(&req("inspect me")).await;
        let seen = c.requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0].as_text(), Some("inspect me"));
    }

    #[tokio::test]
    async fn echo_streams_reply_then_done() {
        let c = EchoClient;
        let mut stream = c.chat_stream(&req("hi")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamEvent::TextDelta(t) if t == "ECHO: hi"));
        let last = stream.next().await.unwrap().unwrap();
        assert!(matches!(last, StreamEvent::Done));
    }
}
