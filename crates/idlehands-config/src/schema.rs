// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub tool_loop: ToolLoopConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub sub_agents: SubAgentConfig,
}

// ─── Endpoint ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "http://localhost:8080/v1".into()
}
fn default_context_window() -> usize {
    32_768
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.2
}
fn default_response_timeout() -> u64 {
    30
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_initial_connection_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// API base that ends before `/chat/completions`, e.g.
    /// `http://localhost:8080/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model id forwarded to the endpoint.  Empty string → auto-pick the
    /// first model the server lists.
    #[serde(default)]
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in version-controlled files.
    pub api_key: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Maximum completion tokens requested per turn.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub top_p: Option<f32>,
    /// Per-SSE-frame read timeout (seconds).
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,
    /// Header-arrival timeout for every request after the first (seconds).
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Header-arrival timeout for the first request of a session (seconds).
    /// Local servers may need minutes to load a model into VRAM.
    #[serde(default = "default_initial_connection_timeout")]
    pub initial_connection_timeout: u64,
    /// When a streaming read times out before any token arrived, re-issue
    /// the request non-streaming instead of surfacing the error.
    #[serde(default = "default_true")]
    pub stream_fallback: bool,
    /// Path to a model-compatibility pattern file.  Model names matching a
    /// line in this file are pre-armed into content mode without waiting
    /// for the first template failure.  Re-read on demand (30s cache).
    pub compat_patterns_file: Option<PathBuf>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: String::new(),
            api_key_env: None,
            api_key: None,
            context_window: default_context_window(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: None,
            response_timeout: default_response_timeout(),
            connection_timeout: default_connection_timeout(),
            initial_connection_timeout: default_initial_connection_timeout(),
            stream_fallback: true,
            compat_patterns_file: None,
        }
    }
}

impl EndpointConfig {
    /// Resolve the API key: explicit value wins, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

// ─── Agent ────────────────────────────────────────────────────────────────────

/// How mutating tool calls are gated.
///
/// The order is meaningful: each mode grants strictly more autonomy than the
/// previous one.  Sub-agents may never exceed their parent's rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Intercept every mutating call and queue it as a plan step.
    Plan,
    /// Reject every mutating call outright.
    Reject,
    /// Cautious actions prompt for confirmation; the rest run.
    #[default]
    Default,
    /// File edits run without prompting; cautious exec still prompts.
    AutoEdit,
    /// Everything except forbidden actions runs without prompting.
    Yolo,
}

impl ApprovalMode {
    /// Autonomy rank used to cap sub-agent approval modes.
    pub fn rank(self) -> u8 {
        match self {
            ApprovalMode::Plan => 0,
            ApprovalMode::Reject => 1,
            ApprovalMode::Default => 2,
            ApprovalMode::AutoEdit => 3,
            ApprovalMode::Yolo => 4,
        }
    }

    /// The mode with the lower rank of the two.
    pub fn capped_at(self, parent: ApprovalMode) -> ApprovalMode {
        if self.rank() > parent.rank() {
            parent
        } else {
            self
        }
    }
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalMode::Plan => "plan",
            ApprovalMode::Reject => "reject",
            ApprovalMode::Default => "default",
            ApprovalMode::AutoEdit => "auto-edit",
            ApprovalMode::Yolo => "yolo",
        };
        write!(f, "{s}")
    }
}

fn default_max_iterations() -> u32 {
    50
}
fn default_session_timeout() -> u64 {
    1800
}
fn default_drift_probe_interval() -> u32 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Bypass all confirmation prompts (cautious actions run unprompted).
    /// Forbidden actions are still blocked — no flag overrides those.
    #[serde(default)]
    pub no_confirm: bool,
    /// Per-ask cap on model↔tool iterations.  Harness profiles may lower it.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock budget per ask, in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout: u64,
    /// How many turns between model-drift probes against `GET /models`.
    #[serde(default = "default_drift_probe_interval")]
    pub drift_probe_interval: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Default,
            no_confirm: false,
            max_iterations: default_max_iterations(),
            timeout: default_session_timeout(),
            drift_probe_interval: default_drift_probe_interval(),
        }
    }
}

// ─── Compaction ───────────────────────────────────────────────────────────────

fn default_compact_at() -> f32 {
    0.8
}
fn default_min_tail() -> usize {
    12
}
fn default_summary_max_tokens() -> u32 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Context fraction at which auto-compaction triggers (0.0–1.0).
    /// The trigger compares estimated prompt tokens + tool-schema tokens +
    /// the completion reservation against `compact_at · context_window`.
    #[serde(default = "default_compact_at")]
    pub compact_at: f32,
    /// Minimum number of recent messages preserved verbatim.
    #[serde(default = "default_min_tail")]
    pub min_tail: usize,
    /// Synthesize an LLM summary of dropped history when worthwhile.
    #[serde(default = "default_true")]
    pub summary: bool,
    /// `max_tokens` for the summary synthesis call.
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compact_at: default_compact_at(),
            min_tail: default_min_tail(),
            summary: true,
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

// ─── Tool-loop guard ──────────────────────────────────────────────────────────

fn default_read_warn() -> u32 {
    3
}
fn default_read_critical() -> u32 {
    6
}
fn default_mutate_warn() -> u32 {
    2
}
fn default_mutate_critical() -> u32 {
    3
}
fn default_cache_ttl() -> u64 {
    60
}
fn default_read_budget_warn() -> u32 {
    24
}
fn default_read_budget_max() -> u32 {
    40
}
fn default_readonly_exec_patterns() -> Vec<String> {
    [
        "grep", "rg", "ls", "cat", "stat", "head", "tail", "wc", "find", "which", "git log",
        "git show", "git status", "git diff", "git branch",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopConfig {
    /// Repeat count at which a warning is emitted for read tools and exec.
    #[serde(default = "default_read_warn")]
    pub warn_threshold: u32,
    /// Repeat count at which deterministic recovery triggers.
    #[serde(default = "default_read_critical")]
    pub critical_threshold: u32,
    /// Warning threshold for mutating tools (tighter than reads).
    #[serde(default = "default_mutate_warn")]
    pub mutate_warn_threshold: u32,
    #[serde(default = "default_mutate_critical")]
    pub mutate_critical_threshold: u32,
    /// Read-cache entry TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Cumulative read-only calls per ask before advisories are appended.
    #[serde(default = "default_read_budget_warn")]
    pub read_budget_warn: u32,
    /// Hard ceiling after which read_file returns a budget-exhausted stub.
    #[serde(default = "default_read_budget_max")]
    pub read_budget_max: u32,
    /// Command prefixes whose successful exec output is cacheable.
    /// Configuration, not a fixed enum — extend per project as needed.
    #[serde(default = "default_readonly_exec_patterns")]
    pub read_only_exec_patterns: Vec<String>,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            warn_threshold: default_read_warn(),
            critical_threshold: default_read_critical(),
            mutate_warn_threshold: default_mutate_warn(),
            mutate_critical_threshold: default_mutate_critical(),
            cache_ttl: default_cache_ttl(),
            read_budget_warn: default_read_budget_warn(),
            read_budget_max: default_read_budget_max(),
            read_only_exec_patterns: default_readonly_exec_patterns(),
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

fn default_tool_timeout() -> u64 {
    30
}
fn default_exec_timeout() -> u64 {
    120
}
fn default_backup_retention() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default timeout for non-exec tools (seconds).
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: u64,
    /// Ceiling for `exec` commands (seconds).
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout: u64,
    /// Extra roots (besides the session cwd) that mutating tools may write
    /// under while in code mode.
    #[serde(default)]
    pub allowed_write_roots: Vec<PathBuf>,
    /// Sys mode relaxes the cwd confinement for filesystem mutators.
    #[serde(default)]
    pub sys_mode: bool,
    /// Per-file backup retention (FIFO).
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    /// State directory for backups and the vault.  Defaults to
    /// `~/.local/state/idlehands` (or the platform equivalent).
    pub state_dir: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tool_timeout: default_tool_timeout(),
            exec_timeout: default_exec_timeout(),
            allowed_write_roots: Vec::new(),
            sys_mode: false,
            backup_retention: default_backup_retention(),
            state_dir: None,
        }
    }
}

impl ToolsConfig {
    /// Resolve the state directory, falling back to the platform default.
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Some(d) = &self.state_dir {
            return d.clone();
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("idlehands")
    }
}

// ─── Vault ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VaultMode {
    /// Archive tool results and notes automatically.
    #[default]
    Active,
    /// Only explicit `vault_note` / `vault_search` calls touch the store.
    Passive,
    /// The store is not opened at all.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    #[default]
    Warn,
    Block,
}

fn default_max_entries() -> usize {
    500
}
fn default_items_per_project() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: VaultMode,
    #[serde(default)]
    pub stale_policy: StalePolicy,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_items_per_project")]
    pub immutable_review_artifacts_per_project: usize,
    /// Override the store file location (defaults to `<state_dir>/vault.db`).
    pub path: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: VaultMode::Active,
            stale_policy: StalePolicy::Warn,
            max_entries: default_max_entries(),
            immutable_review_artifacts_per_project: default_items_per_project(),
            path: None,
        }
    }
}

// ─── Sub-agents ───────────────────────────────────────────────────────────────

fn default_sub_iterations() -> u32 {
    25
}
fn default_sub_timeout() -> u64 {
    300
}
fn default_result_token_cap() -> usize {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sub_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_sub_timeout")]
    pub timeout_sec: u64,
    /// Approximate token cap applied to a sub-agent's final text.
    #[serde(default = "default_result_token_cap")]
    pub result_token_cap: usize,
    /// Share the parent's vault store with sub-agents (weak reference; the
    /// sub-agent never closes it).
    #[serde(default = "default_true")]
    pub inherit_vault: bool,
    /// Inline the caller's `context_files` into the sub-agent task.  When
    /// off, the sub-agent starts from the task text alone and reads files
    /// itself.
    #[serde(default = "default_true")]
    pub inherit_context_file: bool,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: default_sub_iterations(),
            timeout_sec: default_sub_timeout(),
            result_token_cap: default_result_token_cap(),
            inherit_vault: true,
            inherit_context_file: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_documented_defaults() {
        let c = Config::default();
        assert_eq!(c.compaction.compact_at, 0.8);
        assert_eq!(c.compaction.min_tail, 12);
        assert_eq!(c.compaction.summary_max_tokens, 300);
        assert_eq!(c.vault.max_entries, 500);
        assert_eq!(c.vault.immutable_review_artifacts_per_project, 20);
        assert_eq!(c.sub_agents.result_token_cap, 4000);
        assert!(c.sub_agents.inherit_vault);
        assert!(c.sub_agents.inherit_context_file);
        assert_eq!(c.tool_loop.cache_ttl, 60);
    }

    #[test]
    fn approval_mode_rank_ordering() {
        assert!(ApprovalMode::Plan.rank() < ApprovalMode::Reject.rank());
        assert!(ApprovalMode::Reject.rank() < ApprovalMode::Default.rank());
        assert!(ApprovalMode::Default.rank() < ApprovalMode::AutoEdit.rank());
        assert!(ApprovalMode::AutoEdit.rank() < ApprovalMode::Yolo.rank());
    }

    #[test]
    fn approval_mode_capped_at_parent() {
        assert_eq!(
            ApprovalMode::Yolo.capped_at(ApprovalMode::Default),
            ApprovalMode::Default
        );
        assert_eq!(
            ApprovalMode::Plan.capped_at(ApprovalMode::Yolo),
            ApprovalMode::Plan
        );
    }

    #[test]
    fn approval_mode_deserializes_kebab_case() {
        let m: ApprovalMode = serde_yaml::from_str("auto-edit").unwrap();
        assert_eq!(m, ApprovalMode::AutoEdit);
    }

    #[test]
    fn readonly_exec_patterns_include_core_commands() {
        let p = default_readonly_exec_patterns();
        for cmd in ["grep", "rg", "ls", "cat", "stat", "git log"] {
            assert!(p.iter().any(|x| x == cmd), "missing pattern {cmd}");
        }
    }

    #[test]
    fn endpoint_api_key_explicit_wins_over_env() {
        let cfg = EndpointConfig {
            api_key: Some("explicit".into()),
            api_key_env: Some("PATH".into()),
            ..EndpointConfig::default()
        };
        assert_eq!(cfg.resolve_api_key().as_deref(), Some("explicit"));
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg: Config = serde_yaml::from_str("agent:\n  approval_mode: yolo\n").unwrap();
        assert_eq!(cfg.agent.approval_mode, ApprovalMode::Yolo);
        assert_eq!(cfg.agent.max_iterations, 50);
        assert_eq!(cfg.compaction.compact_at, 0.8);
    }
}
