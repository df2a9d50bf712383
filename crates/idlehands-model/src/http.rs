// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible HTTP driver: `POST /chat/completions` (streaming and
//! non-streaming) and `GET /models`, with the retry/backoff, timeout, and
//! compatibility-fallback policy the orchestrator relies on.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::client::{response_into_events, ChatClient, EventStream};
use crate::compat::{is_tool_template_failure, tool_description_block, CompatPatterns};
use crate::sse::drain_complete_sse_lines;
use crate::{
    sanitize, BackpressureMonitor, ChatRequest, ChatResponse, ClientError, Message,
    MessageContent, RateLimiter, RawToolCall, StreamEvent, Usage,
};

/// Retry attempts for retryable HTTP statuses (429/503/5xx).
const MAX_HTTP_ATTEMPTS: u32 = 3;
/// Retry attempts for connection-level failures.
const MAX_CONNECT_ATTEMPTS: u32 = 3;
/// Spacing between connection-failure retries.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Leading bytes compared when deciding a 5xx is deterministic.
const BODY_PREFIX_LEN: usize = 120;
/// Warn when a response takes this multiple of the rolling average.
const DEGRADED_FACTOR: f32 = 3.0;

pub struct HttpClientOptions {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Header-arrival timeout after the first completed request.
    pub connection_timeout: Duration,
    /// Header-arrival timeout for the session's first request (model load).
    pub initial_connection_timeout: Duration,
    /// Per-SSE-frame read timeout.
    pub read_timeout: Duration,
    /// Re-issue as non-streaming when the stream times out with no data.
    pub stream_fallback: bool,
    pub compat_patterns_file: Option<PathBuf>,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".into(),
            model: String::new(),
            api_key: None,
            connection_timeout: Duration::from_secs(10),
            initial_connection_timeout: Duration::from_secs(600),
            read_timeout: Duration::from_secs(30),
            stream_fallback: true,
            compat_patterns_file: None,
        }
    }
}

struct Inner {
    chat_url: String,
    models_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    model: Mutex<String>,
    /// Once set, the session stays in content mode (spec: permanent switch).
    content_mode: AtomicBool,
    first_request_done: AtomicBool,
    connection_timeout: Duration,
    initial_connection_timeout: Duration,
    read_timeout: Duration,
    stream_fallback: bool,
    limiter: RateLimiter,
    monitor: BackpressureMonitor,
    compat: CompatPatterns,
}

/// Cheaply cloneable handle (the streaming pump task clones it).
#[derive(Clone)]
pub struct HttpChatClient {
    inner: Arc<Inner>,
}

impl HttpChatClient {
    pub fn new(opts: HttpClientOptions) -> Self {
        let base = opts.base_url.trim_end_matches('/');
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let compat = CompatPatterns::new(opts.compat_patterns_file.clone());
        let prearmed = compat.prearmed(&opts.model);
        if prearmed {
            debug!(model = %opts.model, "model pre-armed into content mode");
        }

        Self {
            inner: Arc::new(Inner {
                chat_url: format!("{base}/chat/completions"),
                models_url: format!("{base}/models"),
                api_key: opts.api_key,
                http,
                model: Mutex::new(opts.model),
                content_mode: AtomicBool::new(prearmed),
                first_request_done: AtomicBool::new(false),
                connection_timeout: opts.connection_timeout,
                initial_connection_timeout: opts.initial_connection_timeout,
                read_timeout: opts.read_timeout,
                stream_fallback: opts.stream_fallback,
                limiter: RateLimiter::new(),
                monitor: BackpressureMonitor::new(),
                compat,
            }),
        }
    }

    fn header_timeout(&self) -> Duration {
        if self.inner.first_request_done.load(Ordering::Relaxed) {
            self.inner.connection_timeout
        } else {
            self.inner.initial_connection_timeout
        }
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        build_request_body(
            &self.model(),
            req,
            stream,
            self.inner.content_mode.load(Ordering::Relaxed),
        )
    }

    /// POST the chat body, applying the full retry policy.  Rebuilds the
    /// body on every attempt so a mid-retry content-mode switch takes
    /// effect immediately.
    async fn post_chat(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ClientError> {
        let mut http_attempts = 0u32;
        let mut connect_attempts = 0u32;
        let mut last_5xx: Option<(u16, String)> = None;

        loop {
            self.inner.limiter.throttle().await;
            let body = self.build_body(req, stream);
            let mut request = self.inner.http.post(&self.inner.chat_url).json(&body);
            if let Some(key) = &self.inner.api_key {
                request = request.bearer_auth(key);
            }

            let started = Instant::now();
            let sent = tokio::time::timeout(self.header_timeout(), request.send()).await;

            let resp = match sent {
                Err(_) => {
                    return Err(ClientError::Unavailable(format!(
                        "no response headers within {:?}",
                        self.header_timeout()
                    )));
                }
                Ok(Err(e)) => {
                    connect_attempts += 1;
                    self.inner.limiter.record();
                    if connect_attempts >= MAX_CONNECT_ATTEMPTS {
                        return Err(ClientError::Unavailable(e.to_string()));
                    }
                    debug!(attempt = connect_attempts, error = %e, "connect failed; retrying");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    continue;
                }
                Ok(Ok(r)) => r,
            };

            let status = resp.status().as_u16();
            if resp.status().is_success() {
                let elapsed = started.elapsed();
                if self.inner.monitor.is_degraded(elapsed, DEGRADED_FACTOR) {
                    warn!(?elapsed, "endpoint response time well above rolling average");
                }
                self.inner.monitor.observe(elapsed);
                self.inner.first_request_done.store(true, Ordering::Relaxed);
                return Ok(resp);
            }

            let text = resp.text().await.unwrap_or_default();
            let prefix: String = text.chars().take(BODY_PREFIX_LEN).collect();

            match status {
                429 | 503 => {
                    self.inner.limiter.record();
                    http_attempts += 1;
                    if http_attempts >= MAX_HTTP_ATTEMPTS {
                        return Err(ClientError::Http {
                            status,
                            body_prefix: prefix,
                            retryable: true,
                        });
                    }
                    let backoff = Duration::from_secs(2u64 << http_attempts.saturating_sub(1));
                    debug!(status, attempt = http_attempts, ?backoff, "rate limited; backing off");
                    tokio::time::sleep(backoff).await;
                }
                500..=599 => {
                    // Template/tool-parse failures flip the session to
                    // content mode and retry immediately with the rewritten
                    // request (idempotent per call, permanent per session).
                    if !self.inner.content_mode.load(Ordering::Relaxed)
                        && !req.tools.is_empty()
                        && is_tool_template_failure(&text)
                    {
                        warn!(status, "tool template failure; switching to content mode");
                        self.inner.content_mode.store(true, Ordering::Relaxed);
                        continue;
                    }
                    // Two consecutive identical 5xx responses are treated as
                    // deterministic — retrying would spin.
                    if let Some((prev_status, prev_prefix)) = &last_5xx {
                        if *prev_status == status && *prev_prefix == prefix {
                            return Err(ClientError::Http {
                                status,
                                body_prefix: prefix,
                                retryable: false,
                            });
                        }
                    }
                    last_5xx = Some((status, prefix.clone()));
                    self.inner.limiter.record();
                    http_attempts += 1;
                    if http_attempts >= MAX_HTTP_ATTEMPTS {
                        return Err(ClientError::Http {
                            status,
                            body_prefix: prefix,
                            retryable: true,
                        });
                    }
                    let backoff = Duration::from_secs(2u64 << http_attempts.saturating_sub(1));
                    tokio::time::sleep(backoff).await;
                }
                _ => {
                    return Err(ClientError::Http {
                        status,
                        body_prefix: prefix,
                        retryable: false,
                    });
                }
            }
        }
    }

    /// Pump the SSE byte stream into parsed events, enforcing the per-frame
    /// read timeout and the no-data fallback.
    async fn pump_stream(
        self,
        resp: reqwest::Response,
        req: ChatRequest,
        tx: mpsc::Sender<Result<StreamEvent, ClientError>>,
    ) {
        let mut bytes = resp.bytes_stream();
        let mut buf = String::new();
        let mut got_data = false;
        let read_timeout = self.inner.read_timeout;

        loop {
            match tokio::time::timeout(read_timeout, bytes.next()).await {
                Err(_) => {
                    if !got_data && self.inner.stream_fallback {
                        debug!("stream produced no data before read timeout; falling back to non-stream");
                        match self.chat(&req).await {
                            Ok(r) => {
                                for ev in response_into_events(r) {
                                    if tx.send(ev).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                            }
                        }
                    } else {
                        let _ = tx
                            .send(Err(ClientError::ReadTimeout(read_timeout.as_secs())))
                            .await;
                    }
                    return;
                }
                Ok(None) => {
                    // Server closed without [DONE]; treat as normal end.
                    let _ = tx.send(Ok(StreamEvent::Done)).await;
                    return;
                }
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(ClientError::Transport(e.to_string()))).await;
                    return;
                }
                Ok(Some(Ok(chunk))) => {
                    got_data = true;
                    buf.push_str(&String::from_utf8_lossy(&chunk));
                    for ev in drain_complete_sse_lines(&mut buf) {
                        let done = matches!(ev, Ok(StreamEvent::Done));
                        if tx.send(ev).await.is_err() || done {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn models(&self) -> Result<Vec<String>, ClientError> {
        let mut request = self.inner.http.get(&self.inner.models_url);
        if let Some(key) = &self.inner.api_key {
            request = request.bearer_auth(key);
        }
        let resp = tokio::time::timeout(self.inner.connection_timeout, request.send())
            .await
            .map_err(|_| ClientError::Unavailable("models request timed out".into()))?
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ClientError::Unavailable(format!(
                "models endpoint returned {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;
        let ids = body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ClientError> {
        let resp = self.post_chat(req, false).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(parse_completion_body(&body))
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream, ClientError> {
        let resp = match self.post_chat(req, true).await {
            Ok(r) => r,
            // The server rejected streaming itself — fall back to one
            // non-streaming call and synthesize the event stream.
            Err(ClientError::Http { status: 400, .. }) => {
                debug!("HTTP 400 on streaming request; retrying non-streaming");
                let r = self.chat(req).await?;
                return Ok(Box::pin(futures::stream::iter(response_into_events(r))));
            }
            Err(e) => return Err(e),
        };

        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let req = req.clone();
        tokio::spawn(async move {
            this.pump_stream(resp, req, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn model(&self) -> String {
        self.inner
            .model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_model(&self, model: &str) {
        *self.inner.model.lock().unwrap_or_else(|e| e.into_inner()) = model.to_string();
        // Known-bad models go straight to content mode, no round-trip.
        if self.inner.compat.prearmed(model) {
            debug!(model, "model pre-armed into content mode");
            self.inner.content_mode.store(true, Ordering::Relaxed);
        }
    }

    fn content_mode(&self) -> bool {
        self.inner.content_mode.load(Ordering::Relaxed)
    }
}

/// Build the wire body for a chat request.  Free function for testability.
fn build_request_body(model: &str, req: &ChatRequest, stream: bool, content_mode: bool) -> Value {
    let mut messages = req.messages.clone();
    if content_mode && !req.tools.is_empty() {
        inject_tool_block(&mut messages, &tool_description_block(&req.tools));
    }

    let mut body = json!({
        "model": model,
        "messages": wire_messages(&messages),
        "stream": stream,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
    });
    if let Some(top_p) = req.top_p {
        body["top_p"] = json!(top_p);
    }
    if stream {
        body["stream_options"] = json!({ "include_usage": true });
    }
    if !content_mode {
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(choice) = &req.tool_choice {
            body["tool_choice"] = json!(choice);
        }
    }
    sanitize::sanitize_body(&mut body);
    body
}

/// Append the content-mode tool block to the system message (creating one
/// when the conversation lacks it).
fn inject_tool_block(messages: &mut Vec<Message>, block: &str) {
    if let Some(first) = messages.first_mut() {
        if first.role == crate::Role::System {
            if let MessageContent::Text(t) = &first.content {
                first.content = MessageContent::Text(format!("{t}{block}"));
                return;
            }
        }
    }
    messages.insert(0, Message::system(block.trim_start().to_string()));
}

/// Serialize messages into the OpenAI wire format, coalescing consecutive
/// ToolCall messages into one assistant message with a `tool_calls` array
/// (required for parallel tool calls).
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    fn role_str(r: &crate::Role) -> &'static str {
        match r {
            crate::Role::System => "system",
            crate::Role::User => "user",
            crate::Role::Assistant => "assistant",
            crate::Role::Tool => "tool",
        }
    }

    let mut result = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        if let MessageContent::ToolCall {
            tool_call_id,
            function,
        } = &messages[i].content
        {
            let mut calls = vec![json!({
                "id": tool_call_id,
                "type": "function",
                "function": { "name": function.name, "arguments": function.arguments },
            })];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall {
                    tool_call_id,
                    function,
                } = &messages[i].content
                {
                    calls.push(json!({
                        "id": tool_call_id,
                        "type": "function",
                        "function": { "name": function.name, "arguments": function.arguments },
                    }));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let m = &messages[i];
        let v = match &m.content {
            MessageContent::Text(t) => json!({ "role": role_str(&m.role), "content": t }),
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
        };
        result.push(v);
        i += 1;
    }
    result
}

/// Parse a non-streaming completion body into a [`ChatResponse`].
fn parse_completion_body(body: &Value) -> ChatResponse {
    let message = &body["choices"][0]["message"];
    let text = message["content"].as_str().unwrap_or("").to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|tc| RawToolCall {
                    id: tc["id"].as_str().unwrap_or("").to_string(),
                    name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                    arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let usage = body.get("usage").filter(|u| !u.is_null()).map(|u| Usage {
        prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
    });
    ChatResponse {
        text,
        tool_calls,
        usage,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
