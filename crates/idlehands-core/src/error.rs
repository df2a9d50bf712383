// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use idlehands_model::ClientError;

/// Fatal orchestrator errors.  Tool failures are not here — those surface
/// as tool-result strings the model can react to.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The tool-loop recovery ladder was exhausted, malformed tool calls
    /// kept coming after the repair nudge, or a blocked command was
    /// retried past the limit.
    #[error("agent loop break: {0}")]
    AgentLoopBreak(String),

    /// The session's abort signal fired.
    #[error("ask cancelled")]
    Cancelled,

    /// Wall-clock session budget exceeded.
    #[error("session timeout after {0}s")]
    Timeout(u64),

    /// The model stopped making progress (empty or narration-only turns).
    #[error("no progress: {0}")]
    Stalled(String),

    /// Transport failure that survived retries and compaction recovery.
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Short classification used when persisting failure notes.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::AgentLoopBreak(_) => "loop_break",
            AgentError::Cancelled => "cancelled",
            AgentError::Timeout(_) => "timeout",
            AgentError::Stalled(_) => "stalled",
            AgentError::Client(_) => "client",
            AgentError::Other(_) => "other",
        }
    }
}
