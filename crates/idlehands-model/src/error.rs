// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Transport-level errors surfaced by a [`crate::ChatClient`].
///
/// All variants carry owned strings so the error is `Clone` — scripted mock
/// clients replay errors and the orchestrator inspects them after retries.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The endpoint could not be reached at all (DNS, refused, TLS).
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// A non-success HTTP response.
    #[error("HTTP {status}: {body_prefix}")]
    Http {
        status: u16,
        /// Leading bytes of the response body, for diagnostics and for the
        /// deterministic-5xx comparison.
        body_prefix: String,
        retryable: bool,
    },

    /// No SSE frame arrived within the read timeout.
    #[error("stream read timed out after {0}s")]
    ReadTimeout(u64),

    /// The request was cancelled by the session's abort signal.
    #[error("request cancelled")]
    Cancelled,

    /// Byte-level transport failure mid-stream.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            ClientError::Http { retryable, .. } => *retryable,
            ClientError::Unavailable(_) | ClientError::ReadTimeout(_) => true,
            ClientError::Cancelled => false,
            ClientError::Transport(_) => true,
        }
    }

    /// True when the server rejected the request for exceeding its context
    /// window: HTTP 413, or a body matching the known overflow phrases.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            ClientError::Http {
                status, body_prefix, ..
            } => {
                if *status == 413 {
                    return true;
                }
                let lower = body_prefix.to_lowercase();
                lower.contains("context length")
                    || lower.contains("too many tokens")
                    || lower.contains("exceed_context_size")
                    || lower.contains("maximum context")
            }
            _ => false,
        }
    }
}
