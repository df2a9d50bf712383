// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call compatibility fallback.
//!
//! Some model servers cannot render the `tools` array: their chat template
//! fails (Jinja errors), or their grammar-constrained tool-call parser
//! rejects the model output.  Both surface as 5xx responses with
//! recognizable body signatures.  When one is seen, the client switches the
//! session permanently to *content mode*: `tools`/`tool_choice` are
//! stripped, a tool-description block is injected into the system prompt,
//! and the orchestrator parses tool calls out of assistant text.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::RegexSet;
use tracing::debug;

use crate::ToolSchema;

/// How long a loaded pattern file stays cached before it is re-read.
const PATTERN_FILE_TTL: Duration = Duration::from_secs(30);

/// Model-name substrings that are pre-armed into content mode without
/// waiting for the first template failure round-trip.
const BUILT_IN_CONTENT_MODE_MODELS: &[&str] = &["tinyllama", "phi-2"];

/// True when a 5xx body matches a known tool-template failure signature.
pub fn is_tool_template_failure(body: &str) -> bool {
    static PATTERNS: &[&str] = &[
        r"items\..*String",
        r"parse tool call arguments",
        r"(?i)jinja",
        r"(?i)template (?:error|rendering)",
        r"(?i)unknown (?:filter|method|tag)",
        r"(?i)tools? (?:are|is) not supported",
    ];
    // The set is tiny and the call is rare (only on 5xx paths); compiling
    // per call keeps this function dependency-free of lazy statics.
    RegexSet::new(PATTERNS)
        .map(|set| set.is_match(body))
        .unwrap_or(false)
}

/// Pattern list that pre-arms content mode for known-bad model names.
///
/// Combines the built-in list with an optional user file (one substring per
/// line, `#` comments).  The file is re-read on demand with a 30s cache so
/// users can extend it without restarting the session.
pub struct CompatPatterns {
    file: Option<PathBuf>,
    cache: Mutex<Option<(Instant, Vec<String>)>>,
}

impl CompatPatterns {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            file,
            cache: Mutex::new(None),
        }
    }

    /// Should this model name start in content mode?
    pub fn prearmed(&self, model: &str) -> bool {
        let lower = model.to_lowercase();
        if BUILT_IN_CONTENT_MODE_MODELS
            .iter()
            .any(|p| lower.contains(p))
        {
            return true;
        }
        self.file_patterns()
            .iter()
            .any(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
    }

    fn file_patterns(&self) -> Vec<String> {
        let Some(path) = &self.file else {
            return Vec::new();
        };
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((loaded_at, patterns)) = cache.as_ref() {
            if loaded_at.elapsed() < PATTERN_FILE_TTL {
                return patterns.clone();
            }
        }
        let patterns: Vec<String> = std::fs::read_to_string(path)
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        debug!(count = patterns.len(), path = %path.display(), "loaded compat patterns");
        *cache = Some((Instant::now(), patterns.clone()));
        patterns
    }
}

/// Render the tool catalog as a prompt block for content mode.
///
/// The reply format taught here matches what the orchestrator's text parser
/// accepts (fenced JSON with `name` + `arguments`).
pub fn tool_description_block(tools: &[ToolSchema]) -> String {
    let mut block = String::from(
        "\n\n# Tools\n\
         Native tool calling is unavailable on this server. To call a tool,\n\
         reply with exactly one fenced JSON block and nothing else:\n\
         ```json\n{\"name\": \"<tool>\", \"arguments\": { ... }}\n```\n\
         Available tools:\n",
    );
    for t in tools {
        block.push_str(&format!(
            "\n## {}\n{}\nParameters (JSON Schema): {}\n",
            t.name, t.description, t.parameters
        ));
    }
    block
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn jinja_error_is_template_failure() {
        assert!(is_tool_template_failure(
            "jinja2.exceptions.TemplateError: unknown filter 'tojson'"
        ));
    }

    #[test]
    fn items_string_signature_matches() {
        assert!(is_tool_template_failure(
            r#"{"error": "expected items.0.String, found object"}"#
        ));
    }

    #[test]
    fn parse_tool_call_arguments_matches() {
        assert!(is_tool_template_failure(
            "failed to parse tool call arguments: unexpected token"
        ));
    }

    #[test]
    fn unrelated_500_body_does_not_match() {
        assert!(!is_tool_template_failure("internal server error"));
        assert!(!is_tool_template_failure("CUDA out of memory"));
    }

    #[test]
    fn built_in_models_are_prearmed() {
        let p = CompatPatterns::new(None);
        assert!(p.prearmed("TinyLlama-1.1B-Chat"));
        assert!(!p.prearmed("qwen2.5-coder-7b"));
    }

    #[test]
    fn file_patterns_extend_prearm_list() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# known-bad templates\nmycustom-model").unwrap();
        let p = CompatPatterns::new(Some(f.path().to_path_buf()));
        assert!(p.prearmed("MyCustom-Model-v2"));
        assert!(!p.prearmed("other-model"));
    }

    #[test]
    fn description_block_lists_every_tool() {
        let tools = vec![
            ToolSchema {
                name: "read_file".into(),
                description: "Reads a file".into(),
                parameters: serde_json::json!({"type": "object"}),
            },
            ToolSchema {
                name: "exec".into(),
                description: "Runs a command".into(),
                parameters: serde_json::json!({"type": "object"}),
            },
        ];
        let block = tool_description_block(&tools);
        assert!(block.contains("## read_file"));
        assert!(block.contains("## exec"));
        assert!(block.contains("```json"));
    }
}
