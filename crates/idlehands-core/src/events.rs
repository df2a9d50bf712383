// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Out-of-band lifecycle events for embedders.
//!
//! A typed fanout: handlers are registered at session construction and
//! invoked synchronously in registration order.  A panicking handler is
//! logged and skipped — embedder bugs never break the ask.  Async
//! embedders subscribe through [`HookBus::channel`] and drain at their own
//! pace.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

/// Throttle interval for `ToolStream` chunks.
pub const TOOL_STREAM_THROTTLE_MS: u64 = 750;
/// Maximum characters per `ToolStream` chunk.
pub const TOOL_STREAM_CHUNK_CHARS: usize = 900;
/// Maximum characters buffered for streaming per tool call.
pub const TOOL_STREAM_BUFFER_CHARS: usize = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSeverity {
    Warning,
    Critical,
}

/// Lifecycle events, in emission order within an ask.
#[derive(Debug, Clone)]
pub enum HookEvent {
    SessionStart {
        session_id: String,
        model: String,
    },
    ModelChanged {
        old: String,
        new: String,
    },
    AskStart {
        instruction: String,
    },
    TurnStart {
        turn: u32,
    },
    /// Streamed assistant text delta.
    TextDelta(String),
    ToolCall {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// Chunked long tool output, throttled.
    ToolStream {
        call_id: String,
        chunk: String,
    },
    ToolResult {
        call_id: String,
        tool: String,
        summary: String,
        is_error: bool,
    },
    ToolLoop {
        signature: String,
        severity: LoopSeverity,
    },
    TurnEnd {
        turn: u32,
        metrics: crate::agent::TurnMetrics,
    },
    AskEnd {
        turns: u32,
        tool_calls: u32,
    },
    AskError {
        kind: String,
        message: String,
    },
    SessionEnd,
}

/// A registered event consumer.
pub trait HookHandler: Send + Sync {
    fn handle(&self, event: &HookEvent);
}

impl<F> HookHandler for F
where
    F: Fn(&HookEvent) + Send + Sync,
{
    fn handle(&self, event: &HookEvent) {
        self(event)
    }
}

/// Fanout bus.  Cheap to clone through an `Arc`; emission never fails.
#[derive(Default)]
pub struct HookBus {
    handlers: Vec<Arc<dyn HookHandler>>,
    channels: std::sync::Mutex<Vec<mpsc::UnboundedSender<HookEvent>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process handler.  Must happen before the bus is
    /// shared with the agent (registration is construction-time only).
    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        self.handlers.push(handler);
    }

    pub fn register_fn(&mut self, f: impl Fn(&HookEvent) + Send + Sync + 'static) {
        self.handlers.push(Arc::new(f));
    }

    /// Open an async subscription.  Events are cloned into the channel;
    /// a dropped receiver is pruned on the next emit.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<HookEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn emit(&self, event: HookEvent) {
        for handler in &self.handlers {
            let h = Arc::clone(handler);
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                h.handle(&event);
            }));
            if result.is_err() {
                error!("hook handler panicked; continuing");
            }
        }
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Split long tool output into stream chunks under the buffer cap.
pub fn stream_chunks(output: &str) -> Vec<String> {
    let capped: String = output.chars().take(TOOL_STREAM_BUFFER_CHARS).collect();
    let chars: Vec<char> = capped.chars().collect();
    chars
        .chunks(TOOL_STREAM_CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
