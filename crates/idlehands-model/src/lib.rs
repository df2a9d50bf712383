// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Chat-client layer for OpenAI-compatible endpoints.
//!
//! The orchestrator depends on the [`ChatClient`] trait, never on the
//! concrete HTTP driver, so embedders can inject their own transport and
//! tests use the scripted mocks in [`mock`].

mod backpressure;
mod client;
mod compat;
mod error;
mod http;
pub mod mock;
pub mod sanitize;
mod sse;
mod types;

pub use backpressure::{BackpressureMonitor, RateLimiter};
pub use client::{ChatClient, EventStream};
pub use compat::{is_tool_template_failure, tool_description_block, CompatPatterns};
pub use error::ClientError;
pub use http::{HttpChatClient, HttpClientOptions};
pub use types::{
    ChatRequest, ChatResponse, FunctionCall, Message, MessageContent, RawToolCall, Role,
    StreamEvent, ToolSchema, Usage,
};
