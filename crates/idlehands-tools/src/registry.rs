// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

/// A tool schema as exposed to the model layer.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Central registry holding all available tools.
///
/// External tool catalogs (MCP/LSP managers) integrate by registering
/// their own [`Tool`] implementations here.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.read_only()).unwrap_or(false)
    }

    pub fn output_category(&self, name: &str) -> crate::OutputCategory {
        self.tools
            .get(name)
            .map(|t| t.output_category())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for every registered tool, sorted by name for stable
    /// request bodies (prompt caching relies on byte-identical prefixes).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Validate a call against the target tool's schema.  Errors are
    /// non-retryable and render as structured tool results.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ToolError> {
        let tool = self.tools.get(&call.name).ok_or_else(|| {
            ToolError::new(
                ToolErrorCode::Validation,
                format!("unknown tool: {}", call.name),
            )
            .with_hint("use one of the tools listed in the schema")
        })?;
        validate_args(&tool.parameters_schema(), &call.args)
    }

    /// Validate, then execute.  Unknown tools and schema violations come
    /// back as error outputs without reaching any tool code.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        if let Err(e) = self.validate(call) {
            return e.output(&call.id);
        }
        debug!(tool = %call.name, id = %call.id, "dispatching tool");
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolError::new(
                ToolErrorCode::Validation,
                format!("unknown tool: {}", call.name),
            )
            .output(&call.id),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Argument validation against a JSON schema: required parameters present,
/// types and enumerations valid, no unknown properties.
fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let Some(args_obj) = args.as_object() else {
        return Err(ToolError::invalid_args("arguments must be a JSON object"));
    };
    let properties = schema.get("properties").and_then(|p| p.as_object());

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for req in required {
            if let Some(name) = req.as_str() {
                if !args_obj.contains_key(name) {
                    return Err(ToolError::invalid_args(format!(
                        "missing required parameter '{name}'"
                    ))
                    .with_hint("reissue the call with every required parameter set"));
                }
            }
        }
    }

    let additional_allowed = schema
        .get("additionalProperties")
        .and_then(|a| a.as_bool())
        .unwrap_or(true);

    for (key, value) in args_obj {
        let prop = properties.and_then(|p| p.get(key));
        let Some(prop) = prop else {
            if !additional_allowed {
                return Err(ToolError::invalid_args(format!(
                    "unknown parameter '{key}'"
                )));
            }
            continue;
        };

        if let Some(ty) = prop.get("type").and_then(|t| t.as_str()) {
            let ok = match ty {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(ToolError::invalid_args(format!(
                    "parameter '{key}' must be of type {ty}"
                )));
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(ToolError::invalid_args(format!(
                    "parameter '{key}' must be one of {allowed:?}"
                )));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    struct EchoTool {
        name: &'static str,
        read_only: bool,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "count": { "type": "integer" },
                    "mode": { "type": "string", "enum": ["fast", "slow"] }
                },
                "required": ["text"],
                "additionalProperties": false
            })
        }
        fn read_only(&self) -> bool {
            self.read_only
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "echo",
            read_only: true,
        });
        reg
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "echo".into(),
            args,
        }
    }

    #[tokio::test]
    async fn valid_call_executes() {
        let out = registry().execute(&call(json!({"text": "hi"}))).await;
        assert!(!out.is_error, "{}", out.content);
    }

    #[tokio::test]
    async fn missing_required_param_is_invalid_args() {
        let out = registry().execute(&call(json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.starts_with("ERROR: code=invalid_args"));
        assert!(out.content.contains("'text'"));
    }

    #[tokio::test]
    async fn wrong_type_rejected() {
        let out = registry()
            .execute(&call(json!({"text": "x", "count": "three"})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("type integer"));
    }

    #[tokio::test]
    async fn unknown_property_rejected() {
        let out = registry()
            .execute(&call(json!({"text": "x", "bogus": 1})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown parameter 'bogus'"));
    }

    #[tokio::test]
    async fn enum_violation_rejected() {
        let out = registry()
            .execute(&call(json!({"text": "x", "mode": "warp"})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("'mode'"));
    }

    #[tokio::test]
    async fn unknown_tool_is_validation_error() {
        let reg = registry();
        let out = reg
            .execute(&ToolCall {
                id: "x".into(),
                name: "missing".into(),
                args: json!({}),
            })
            .await;
        assert!(out.is_error);
        assert!(out.content.starts_with("ERROR: code=validation"));
    }

    #[test]
    fn non_object_args_rejected() {
        let reg = registry();
        let err = reg
            .validate(&ToolCall {
                id: "x".into(),
                name: "echo".into(),
                args: json!([1, 2]),
            })
            .unwrap_err();
        assert_eq!(err.code, ToolErrorCode::InvalidArgs);
    }

    #[test]
    fn schemas_sorted_by_name() {
        let mut reg = registry();
        reg.register(EchoTool {
            name: "aaa",
            read_only: false,
        });
        let names: Vec<_> = reg.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["aaa", "echo"]);
    }

    #[test]
    fn read_only_classification() {
        let mut reg = registry();
        reg.register(EchoTool {
            name: "mutator",
            read_only: false,
        });
        assert!(reg.is_read_only("echo"));
        assert!(!reg.is_read_only("mutator"));
        assert!(!reg.is_read_only("nonexistent"));
    }
}
