// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Outgoing-request sanitization.
//!
//! Embedders (and the content-mode prompt builder) may hand the client
//! request bodies carrying vendor-specific OpenAI fields that smaller
//! OpenAI-compatible servers reject with 400s.  [`sanitize_body`] rewrites
//! a request body in place to the least-common-denominator wire format.

use serde_json::Value;

/// Fields that only the big vendors understand; stripped before dispatch.
const VENDOR_ONLY_FIELDS: &[&str] = &["store", "reasoning_effort"];

/// Normalize a `/chat/completions` request body in place:
///
/// - `max_completion_tokens` → `max_tokens`
/// - message role `developer` → `system`
/// - vendor-only fields removed
pub fn sanitize_body(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    if let Some(v) = obj.remove("max_completion_tokens") {
        // An explicit max_tokens wins over the vendor alias.
        obj.entry("max_tokens").or_insert(v);
    }

    for field in VENDOR_ONLY_FIELDS {
        obj.remove(*field);
    }

    if let Some(messages) = obj.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in messages {
            if msg.get("role").and_then(|r| r.as_str()) == Some("developer") {
                msg["role"] = Value::String("system".into());
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn max_completion_tokens_renamed() {
        let mut body = json!({"max_completion_tokens": 512, "messages": []});
        sanitize_body(&mut body);
        assert_eq!(body["max_tokens"], json!(512));
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn explicit_max_tokens_wins_over_alias() {
        let mut body = json!({"max_tokens": 100, "max_completion_tokens": 512});
        sanitize_body(&mut body);
        assert_eq!(body["max_tokens"], json!(100));
    }

    #[test]
    fn developer_role_becomes_system() {
        let mut body = json!({"messages": [
            {"role": "developer", "content": "be terse"},
            {"role": "user", "content": "hi"}
        ]});
        sanitize_body(&mut body);
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][1]["role"], json!("user"));
    }

    #[test]
    fn vendor_only_fields_stripped() {
        let mut body = json!({"store": true, "reasoning_effort": "high", "model": "m"});
        sanitize_body(&mut body);
        assert!(body.get("store").is_none());
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(body["model"], json!("m"));
    }

    #[test]
    fn non_object_body_is_left_alone() {
        let mut body = json!("not an object");
        sanitize_body(&mut body);
        assert_eq!(body, json!("not an object"));
    }
}
