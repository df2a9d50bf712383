// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub args: Value,
}

impl ToolCall {
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(|v| v.as_str())
    }

    pub fn u64_arg(&self, name: &str) -> Option<u64> {
        self.args.get(name).and_then(|v| v.as_u64())
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when the tool failed non-fatally (the model sees the error text
    /// and may retry).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Error taxonomy for tool failures.  Every code is tagged retryable or
/// not; the rendered string (`ERROR: code=… msg=…`) is what the model sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorCode {
    InvalidArgs,
    Validation,
    Forbidden,
    CautiousDenied,
    PathEscape,
    NotFound,
    Io,
    Timeout,
    Cancelled,
    Internal,
}

impl ToolErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolErrorCode::InvalidArgs => "invalid_args",
            ToolErrorCode::Validation => "validation",
            ToolErrorCode::Forbidden => "forbidden",
            ToolErrorCode::CautiousDenied => "cautious_denied",
            ToolErrorCode::PathEscape => "path_escape",
            ToolErrorCode::NotFound => "not_found",
            ToolErrorCode::Io => "io",
            ToolErrorCode::Timeout => "timeout",
            ToolErrorCode::Cancelled => "cancelled",
            ToolErrorCode::Internal => "internal",
        }
    }

    pub fn retryable(self) -> bool {
        match self {
            // The model can fix its arguments or pick another target.
            ToolErrorCode::InvalidArgs
            | ToolErrorCode::Validation
            | ToolErrorCode::NotFound => false,
            ToolErrorCode::Forbidden | ToolErrorCode::CautiousDenied => false,
            ToolErrorCode::PathEscape => false,
            ToolErrorCode::Io | ToolErrorCode::Timeout => true,
            ToolErrorCode::Cancelled => false,
            ToolErrorCode::Internal => true,
        }
    }
}

impl std::fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured tool failure with a user-facing hint.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ERROR: code={} msg={}", .code.as_str(), .message)]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
    pub hint: Option<String>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::InvalidArgs, message)
    }

    /// Render as the tool-result string the model sees.
    pub fn render(&self) -> String {
        match &self.hint {
            Some(hint) => format!(
                "ERROR: code={} msg={}\nhint: {hint}",
                self.code.as_str(),
                self.message
            ),
            None => format!("ERROR: code={} msg={}", self.code.as_str(), self.message),
        }
    }

    pub fn output(&self, call_id: &str) -> ToolOutput {
        ToolOutput::err(call_id, self.render())
    }
}

/// Shape of a tool's text output, used for context-aware digesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Process output: preamble and the trailing error/summary both matter.
    HeadTail,
    /// Ordered match list: leading matches are the most relevant.
    MatchList,
    /// File content: keep head (imports/decls) and tail.
    FileContent,
    /// Hard-truncate at a line boundary.
    #[default]
    Generic,
}

/// Trait implemented by every built-in and external tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the argument object.  The registry validates calls
    /// against it before dispatch.
    fn parameters_schema(&self) -> Value;
    /// Read-only tools may run concurrently within a turn and are exempt
    /// from approval gating.
    fn read_only(&self) -> bool;
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool.  Failures are returned as [`ToolOutput::err`] with
    /// the structured `ERROR: code=… msg=…` rendering.
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
