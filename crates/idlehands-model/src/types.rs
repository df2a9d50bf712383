// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Fixed per-message token overhead added to the content estimate.
/// Covers role markers and wire-format framing.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, forwarded verbatim.
    pub arguments: String,
}

/// The content of a message.
///
/// - `Text` – plain text (most messages)
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the result of a tool call
///
/// Each tool call is stored as its own message internally; consecutive
/// `ToolCall` messages are coalesced into one assistant wire message when a
/// request is serialized (OpenAI's parallel-tool-call contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: arguments.into(),
                },
            },
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
        }
    }

    /// Return the plain text of this message, if it is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// The tool_call_id carried by a ToolCall or ToolResult message.
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.content {
            MessageContent::ToolCall { tool_call_id, .. }
            | MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Approximate token count: ceil(len/4) over the content plus a fixed
    /// per-message overhead.  Cheap and deterministic by design — the
    /// compactor calibrates against real usage separately.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        chars.div_ceil(4) + MESSAGE_OVERHEAD_TOKENS
    }
}

/// A tool schema exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    /// Token estimate of this schema as serialized into a request.
    pub fn approx_tokens(&self) -> usize {
        let len = self.name.len() + self.description.len() + self.parameters.to_string().len();
        len.div_ceil(4)
    }
}

/// Request sent to a chat client.  The target model is owned by the client
/// (it can change mid-session on drift detection).
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// `"none"` disables tool selection for a tools-disabled recovery turn.
    pub tool_choice: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
}

/// A tool call as returned by the wire, arguments still unparsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Final usage statistics for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A non-streaming completion result.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<RawToolCall>,
    pub usage: Option<Usage>,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// A reasoning delta (`reasoning_content` / `reasoning` fields).
    ThinkingDelta(String),
    /// A tool-call fragment.  The index routes accumulation: argument
    /// fragments for the same parallel call share an index.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// The model hit its output-token limit; pending arguments may be cut.
    MaxTokens,
    /// Usage totals — may arrive in a trailing chunk with empty `choices`.
    Usage(Usage),
    /// The stream finished normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::tool_result("id", "c").role, Role::Tool);
    }

    #[test]
    fn as_text_none_for_tool_variants() {
        assert!(Message::tool_result("id", "c").as_text().is_none());
        assert!(Message::tool_call("id", "f", "{}").as_text().is_none());
    }

    #[test]
    fn tool_call_id_accessor() {
        assert_eq!(Message::tool_call("c1", "f", "{}").tool_call_id(), Some("c1"));
        assert_eq!(Message::tool_result("c2", "x").tool_call_id(), Some("c2"));
        assert_eq!(Message::user("hi").tool_call_id(), None);
    }

    #[test]
    fn approx_tokens_is_ceil_len_over_four_plus_overhead() {
        // 8 chars → 2 tokens + 4 overhead
        assert_eq!(Message::user("12345678").approx_tokens(), 6);
        // 9 chars → ceil(9/4)=3 + 4 overhead
        assert_eq!(Message::user("123456789").approx_tokens(), 7);
    }

    #[test]
    fn approx_tokens_tool_call_counts_name_and_args() {
        let m = Message::tool_call("id", "aaaa", "bbbbbbbb"); // 12 chars
        assert_eq!(m.approx_tokens(), 3 + 4);
    }

    #[test]
    fn schema_tokens_cover_serialized_size() {
        let s = ToolSchema {
            name: "read_file".into(),
            description: "reads".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        assert!(s.approx_tokens() > 0);
    }

    #[test]
    fn message_round_trips_through_serde() {
        let m = Message::tool_call("c1", "exec", r#"{"command":"ls"}"#);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_call_id(), Some("c1"));
    }
}
