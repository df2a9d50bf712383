// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The turn orchestrator: drives the model ↔ tool loop for one `ask`,
//! brokering every tool invocation through the safety policy, the loop
//! guard, and the budget-driven compactor.
//!
//! The loop is a small state machine:
//! `NormalTurn → DispatchTools → CompactIfNeeded → NormalTurn | FinalText |
//! ToollessRecovery → NormalTurn | Abort` — the recovery ladder is explicit
//! rather than hidden in `continue` branches.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use idlehands_config::{ApprovalMode, Config};
use idlehands_model::{
    ChatClient, ChatRequest, Message, RawToolCall, StreamEvent, ToolSchema, Usage,
};
use idlehands_tools::{ToolCall, ToolEnv, ToolError, ToolErrorCode, ToolOutput, ToolRegistry};
use idlehands_vault::{EntryKind, Vault, VaultError};

use crate::compact::{
    clip_objective, compaction_note, dropped_tool_results, plan_cut, plan_hard_cut,
    serialize_history, CompactionOptions, CompactionOutcome, CompactionState, SUMMARY_PROMPT,
    SUMMARY_WORTHWHILE_TOKENS,
};
use crate::digest::{digest, RESULT_TOKEN_CAP};
use crate::error::AgentError;
use crate::events::{stream_chunks, HookBus, HookEvent, LoopSeverity};
use crate::guard::{GuardDecision, GuardStats, ToolLoopGuard};
use crate::harness::Harness;
use crate::plan::{PlanQueue, PlanStep};
use crate::session::Session;
use crate::toolcalls::{
    dedupe_ghost_calls, looks_like_planning, parse_tool_calls_from_text, strip_leaked_tool_xml,
    strip_think_blocks,
};

/// Empty turns tolerated before the ask is declared stalled.
const MAX_EMPTY_TURNS: u32 = 3;
/// Malformed tool-call argument objects tolerated per ask.
const MAX_MALFORMED_JSON: u32 = 3;
/// Blocked exec attempts tolerated per ask.
const MAX_BLOCKED_EXEC: u32 = 3;
/// Context-overflow recovery attempts before the error surfaces.
const MAX_OVERFLOW_STRIKES: u32 = 2;
/// Unique files read per directory before the scan detector trips.
const DIR_SCAN_LIMIT: usize = 8;
/// Distinct files sharing one `search=` term before the advisory fires.
const SEARCH_TERM_LIMIT: usize = 3;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding agent operating on a real repository \
through tools. Read before you edit. Make the smallest change that satisfies the task, verify \
it, then answer with a short summary. When you are done, reply with plain text and no tool \
calls.";

/// Construction-time knobs not covered by the config file.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Override the default system prompt.
    pub system_prompt: Option<String>,
    /// Override the harness auto-detected from the model id.
    pub harness: Option<Harness>,
}

/// What an `ask` returns.
#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub text: String,
    pub turns: u32,
    pub tool_calls: u32,
}

/// Per-turn latency/throughput metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnMetrics {
    /// Time to first token, milliseconds.
    pub ttft_ms: u64,
    /// Time to completion, milliseconds.
    pub ttc_ms: u64,
    /// Prompt-processing tokens/second.
    pub pp_tps: f32,
    /// Generation tokens/second.
    pub tg_tps: f32,
}

/// Loop phases (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    Normal,
    ToollessRecovery,
}

/// One decoded model turn.
struct ModelTurn {
    text: String,
    calls: Vec<RawToolCall>,
    metrics: TurnMetrics,
}

pub struct Agent {
    session: Session,
    client: Arc<dyn ChatClient>,
    tools: Arc<ToolRegistry>,
    env: Arc<ToolEnv>,
    config: Arc<Config>,
    harness: Harness,
    vault: Option<Arc<Vault>>,
    guard: ToolLoopGuard,
    hooks: Arc<HookBus>,
    plan: PlanQueue,
    compact_state: Arc<Mutex<CompactionState>>,
    system_prompt: String,
    /// Objective the post-compaction hint was last injected for.
    hint_injected_for: Option<String>,
    turns_since_probe: u32,
}

impl Agent {
    pub fn new(
        client: Arc<dyn ChatClient>,
        tools: Arc<ToolRegistry>,
        env: Arc<ToolEnv>,
        config: Arc<Config>,
        vault: Option<Arc<Vault>>,
        hooks: Arc<HookBus>,
        opts: AgentOptions,
    ) -> Self {
        let harness = opts
            .harness
            .unwrap_or_else(|| Harness::for_model(&client.model()));
        let session = Session::new(
            config.endpoint.context_window,
            config.endpoint.max_tokens as usize,
        );
        hooks.emit(HookEvent::SessionStart {
            session_id: session.id.clone(),
            model: client.model(),
        });
        Self {
            session,
            client,
            tools,
            env,
            config: Arc::clone(&config),
            harness,
            vault,
            guard: ToolLoopGuard::new(config.tool_loop.clone()),
            hooks,
            plan: PlanQueue::new(),
            compact_state: Arc::new(Mutex::new(CompactionState::default())),
            system_prompt: opts
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            hint_injected_for: None,
            turns_since_probe: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    #[cfg(test)]
    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// The shared tool environment (abort signal, approval mode, cwd).
    pub fn tool_env(&self) -> Arc<ToolEnv> {
        Arc::clone(&self.env)
    }

    pub fn guard_stats(&self) -> GuardStats {
        self.guard.stats()
    }

    pub fn plan_steps(&self) -> &[PlanStep] {
        self.plan.steps()
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        self.env.approval_mode()
    }

    pub fn set_approval_mode(&self, mode: ApprovalMode) {
        self.env.set_approval_mode(mode);
    }

    /// Absolute paths mutated during the most recent ask.
    pub fn mutated_files(&self) -> Vec<PathBuf> {
        self.guard.mutated_files()
    }

    pub async fn compaction_state(&self) -> CompactionState {
        self.compact_state.lock().await.clone()
    }

    // ─── The ask loop ─────────────────────────────────────────────────────────

    /// Run one user instruction to completion.
    ///
    /// Concurrent asks on one session are impossible by construction —
    /// this takes `&mut self`.
    pub async fn ask(&mut self, instruction: &str) -> Result<AskOutcome, AgentError> {
        let started = Instant::now();
        self.hooks.emit(HookEvent::AskStart {
            instruction: instruction.to_string(),
        });

        if self.session.messages.is_empty() {
            let prompt = self.system_prompt.clone();
            self.session.push(Message::system(prompt));
        }
        self.session.push(Message::user(instruction));
        self.guard.begin_ask();

        let result = self.run_loop(instruction, started).await;
        match &result {
            Ok(outcome) => {
                self.hooks.emit(HookEvent::AskEnd {
                    turns: outcome.turns,
                    tool_calls: outcome.tool_calls,
                });
            }
            Err(e) => {
                self.persist_failure_note(e);
                self.hooks.emit(HookEvent::AskError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_loop(
        &mut self,
        instruction: &str,
        started: Instant,
    ) -> Result<AskOutcome, AgentError> {
        let mut turns: u32 = 0;
        let mut tool_calls_total: u32 = 0;
        let mut malformed_json: u32 = 0;
        let mut no_tool_turns: u32 = 0;
        let mut no_progress_turns: u32 = 0;
        let mut blocked_exec_attempts: u32 = 0;
        let mut overflow_strikes: u32 = 0;
        let mut read_only_calls: u32 = 0;
        let mut narration_nudged = false;
        let mut objective_reprompted = false;
        let mut validation_nudge_sent = false;
        let mut next_turn = TurnKind::Normal;
        // Directory-scan detector: unique files read per parent directory.
        let mut dir_reads: HashMap<PathBuf, HashSet<PathBuf>> = HashMap::new();
        // Same-search-term detector: files each `search=` term was used on.
        let mut search_files: HashMap<String, HashSet<String>> = HashMap::new();

        let max_iterations = self
            .harness
            .max_iterations_cap
            .map(|cap| cap.min(self.config.agent.max_iterations))
            .unwrap_or(self.config.agent.max_iterations);

        loop {
            // ── Pre-dispatch checks, in order, short-circuiting ───────────────
            if self.env.abort.is_aborted() {
                return Err(AgentError::Cancelled);
            }
            if started.elapsed() > Duration::from_secs(self.config.agent.timeout) {
                return Err(AgentError::Timeout(self.config.agent.timeout));
            }
            self.maybe_probe_model_drift().await;
            self.auto_compact_if_needed().await?;

            turns += 1;
            if turns > max_iterations {
                return self
                    .wrap_up_turn(turns, tool_calls_total, max_iterations)
                    .await;
            }
            self.hooks.emit(HookEvent::TurnStart { turn: turns });

            // ── Model call ────────────────────────────────────────────────────
            let toolless = next_turn == TurnKind::ToollessRecovery;
            next_turn = TurnKind::Normal;
            let req = self.build_request(toolless);

            let turn = match self.stream_one_turn(&req).await {
                Ok(t) => t,
                Err(AgentError::Client(e)) if e.is_context_overflow() => {
                    overflow_strikes += 1;
                    if overflow_strikes > MAX_OVERFLOW_STRIKES {
                        return Err(AgentError::Client(e));
                    }
                    warn!(strike = overflow_strikes, "context overflow; compacting and retrying");
                    let opts = CompactionOptions {
                        force: overflow_strikes == 1,
                        hard: overflow_strikes >= 2,
                        reason: Some("context overflow recovery".into()),
                        ..Default::default()
                    };
                    self.compact(opts).await?;
                    turns -= 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.hooks.emit(HookEvent::TurnEnd {
                turn: turns,
                metrics: turn.metrics,
            });

            // ── Decode: text + tool calls ─────────────────────────────────────
            let mut text = turn.text;
            if self.harness.strip_think_blocks {
                text = strip_think_blocks(&text);
            }

            let mut raw_calls = turn.calls;
            let parse_from_text = self.client.content_mode() || !self.harness.tool_calls_reliable;
            if raw_calls.is_empty() && parse_from_text && !text.is_empty() {
                raw_calls = parse_tool_calls_from_text(&text);
                if !raw_calls.is_empty() {
                    // The call markup is consumed, not shown.
                    text.clear();
                }
            }
            text = strip_leaked_tool_xml(&text);
            raw_calls = dedupe_ghost_calls(raw_calls);

            // ── No tool calls: nudge, stall, or final answer ──────────────────
            if raw_calls.is_empty() {
                if text.trim().is_empty() {
                    no_progress_turns += 1;
                    if no_progress_turns >= MAX_EMPTY_TURNS {
                        return Err(AgentError::Stalled(
                            "model produced empty turns repeatedly".into(),
                        ));
                    }
                    self.session.push(Message::user(
                        "[system] you produced no response or tool call; continue with your \
                         next action",
                    ));
                    continue;
                }
                if !toolless {
                    if let Some(label) = looks_like_planning(&text) {
                        no_tool_turns += 1;
                        self.session.push(Message::assistant(text.clone()));
                        if !narration_nudged {
                            narration_nudged = true;
                            debug!(label, "nudging past planning narration");
                            self.session.push(Message::user(
                                "[system] do not narrate your plan; either call a tool now or \
                                 give the final answer",
                            ));
                            continue;
                        }
                        if !objective_reprompted {
                            objective_reprompted = true;
                            self.session.push(Message::user(format!(
                                "[system] the objective is still: {}",
                                clip_objective(instruction)
                            )));
                            continue;
                        }
                        return Err(AgentError::Stalled(
                            "model keeps narrating plans without acting".into(),
                        ));
                    }
                }
                // Final answer.
                self.session.push(Message::assistant(text.clone()));
                self.persist_review_artifacts(instruction, &text);
                return Ok(AskOutcome {
                    text,
                    turns,
                    tool_calls: tool_calls_total,
                });
            }

            // ── DispatchTools ─────────────────────────────────────────────────
            if !text.is_empty() {
                self.session.push(Message::assistant(text));
            }

            let (calls, malformed) = decode_calls(raw_calls);
            malformed_json += malformed;
            if malformed_json >= MAX_MALFORMED_JSON {
                return Err(AgentError::AgentLoopBreak(
                    "malformed tool-call JSON persisted past the repair nudge".into(),
                ));
            }
            tool_calls_total += calls.len() as u32;

            // Phase 1: record every call in the conversation before any
            // result (wire-format pairing requirement).
            for call in &calls {
                self.hooks.emit(HookEvent::ToolCall {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    args: call.args.clone(),
                });
                self.session.push(Message::tool_call(
                    &call.id,
                    &call.name,
                    call.args.to_string(),
                ));
            }

            // Phase 2: pre-screen each call, then execute survivors.
            self.guard.begin_turn();
            let mut outcomes: Vec<Option<ToolOutput>> = vec![None; calls.len()];
            let mut advisories: Vec<Vec<String>> = vec![Vec::new(); calls.len()];
            let mut recovery_notice: Option<String> = None;
            let mut loop_abort: Option<String> = None;
            let mut validation_failed = false;

            for (i, call) in calls.iter().enumerate() {
                // Every call registers with the guard first — repeated
                // validation failures are loops too.
                let read_only = self.tools.is_read_only(&call.name);
                let tight_thresholds = !read_only && call.name != "exec";
                match self.guard.register(call, tight_thresholds) {
                    GuardDecision::Proceed => {}
                    GuardDecision::ProceedWithWarning(w) => {
                        self.hooks.emit(HookEvent::ToolLoop {
                            signature: crate::guard::signature(call),
                            severity: LoopSeverity::Warning,
                        });
                        advisories[i].push(w);
                    }
                    GuardDecision::Replay { canonical_id } => {
                        outcomes[i] = Some(ToolOutput::ok(
                            &call.id,
                            format!("[idlehands dedupe] replayed from {canonical_id} (identical call this turn)"),
                        ));
                        continue;
                    }
                    GuardDecision::RecoveryTurn { notice } => {
                        self.hooks.emit(HookEvent::ToolLoop {
                            signature: crate::guard::signature(call),
                            severity: LoopSeverity::Critical,
                        });
                        recovery_notice = Some(notice);
                        outcomes[i] = Some(ToolOutput::ok(
                            &call.id,
                            "[loop guard] call suppressed; answer from existing results",
                        ));
                        continue;
                    }
                    GuardDecision::Abort { reason } => {
                        loop_abort = Some(reason.clone());
                        outcomes[i] = Some(ToolOutput::ok(
                            &call.id,
                            "[loop guard] call suppressed; session is aborting",
                        ));
                        continue;
                    }
                }

                if call.args.is_null() {
                    // Arguments never parsed as JSON.
                    outcomes[i] = Some(
                        ToolError::invalid_args("tool arguments were not a JSON object")
                            .output(&call.id),
                    );
                    validation_failed = true;
                    continue;
                }
                if let Err(e) = self.tools.validate(call) {
                    outcomes[i] = Some(e.output(&call.id));
                    validation_failed = true;
                    continue;
                }

                // Approval-mode gate for mutating tools.
                if !read_only {
                    match self.env.approval_mode() {
                        ApprovalMode::Plan => {
                            let step = self.plan.record(&call.name, &call.args);
                            outcomes[i] = Some(ToolOutput::ok(
                                &call.id,
                                format!("[blocked: approval_mode=plan] recorded as plan step {step}"),
                            ));
                            continue;
                        }
                        ApprovalMode::Reject => {
                            outcomes[i] = Some(
                                ToolError::new(
                                    ToolErrorCode::CautiousDenied,
                                    "[blocked: approval_mode=reject] mutating tools are disabled",
                                )
                                .output(&call.id),
                            );
                            continue;
                        }
                        _ => {}
                    }
                }

                if read_only {
                    read_only_calls += 1;
                    if let Some(stub) = self.screen_read_call(
                        call,
                        read_only_calls,
                        &mut dir_reads,
                        &mut search_files,
                        &mut advisories[i],
                    ) {
                        outcomes[i] = Some(ToolOutput::ok(&call.id, stub));
                        continue;
                    }
                    if let Some(cached) = self.guard.check_read_cache(call, &self.env.cwd) {
                        outcomes[i] = Some(ToolOutput::ok(&call.id, cached));
                        continue;
                    }
                }

                if call.name == "exec" {
                    if let Some(cached) = self.guard.check_exec_cache(call) {
                        outcomes[i] = Some(ToolOutput::ok(&call.id, cached));
                        continue;
                    }
                }

                // Mutation-spiral lock for path mutators.
                if !read_only && call.name != "exec" {
                    if let Some(raw) = call.args.get("path").and_then(|v| v.as_str()) {
                        let path = self.env.resolve_path(raw);
                        if self.guard.is_path_blocked(&path) {
                            outcomes[i] = Some(
                                ToolError::new(
                                    ToolErrorCode::Validation,
                                    format!(
                                        "{} is locked by the mutation spiral; restore it \
                                         (git checkout/restore) before editing again",
                                        path.display()
                                    ),
                                )
                                .output(&call.id),
                            );
                            continue;
                        }
                    }
                }
            }

            self.execute_pending(&calls, &mut outcomes).await;

            // Phase 3: post-process and append results in call order.
            let mut archive_batch: Vec<(String, String, String)> = Vec::new();
            for (i, call) in calls.iter().enumerate() {
                let output = outcomes[i]
                    .take()
                    .unwrap_or_else(|| ToolOutput::err(&call.id, "ERROR: code=internal msg=tool produced no output"));

                self.note_execution_effects(call, &output, &mut blocked_exec_attempts);

                let category = self.tools.output_category(&call.name);
                let (mut digested, truncated) = digest(&output.content, category, RESULT_TOKEN_CAP);
                if truncated {
                    archive_batch.push((call.id.clone(), call.name.clone(), output.content.clone()));
                }
                for advisory in &advisories[i] {
                    digested.push_str("\n");
                    digested.push_str(advisory);
                }

                for chunk in stream_chunks(&digested).into_iter().skip(1) {
                    // The first chunk is carried by ToolResult; extras stream.
                    self.hooks.emit(HookEvent::ToolStream {
                        call_id: call.id.clone(),
                        chunk,
                    });
                }
                self.hooks.emit(HookEvent::ToolResult {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    summary: first_line(&digested),
                    is_error: output.is_error,
                });
                self.session.push(Message::tool_result(&call.id, digested));
            }
            self.archive_outputs(archive_batch);

            if let Some(reason) = loop_abort {
                return Err(AgentError::AgentLoopBreak(reason));
            }
            if blocked_exec_attempts >= MAX_BLOCKED_EXEC {
                return Err(AgentError::AgentLoopBreak(
                    "the same blocked command was attempted repeatedly".into(),
                ));
            }
            if validation_failed && !validation_nudge_sent {
                validation_nudge_sent = true;
                self.session.push(Message::user(
                    "[system] a tool call failed validation; check the schema and reissue \
                     corrected tool_calls",
                ));
            }
            if let Some(notice) = recovery_notice {
                self.session
                    .push(Message::system(format!("[system] {notice}")));
                next_turn = TurnKind::ToollessRecovery;
            }
            // CompactIfNeeded runs at the top of the next iteration.
        }
    }

    /// Read-call screening: budget ceiling, directory-scan detector, and
    /// the same-search-term detector.  Returns a stub body when the call
    /// should not execute.
    fn screen_read_call(
        &mut self,
        call: &ToolCall,
        read_only_calls: u32,
        dir_reads: &mut HashMap<PathBuf, HashSet<PathBuf>>,
        search_files: &mut HashMap<String, HashSet<String>>,
        advisories: &mut Vec<String>,
    ) -> Option<String> {
        let budget = &self.config.tool_loop;
        let is_file_read = call.name == "read_file" || call.name == "read_files";

        if read_only_calls > budget.read_budget_max && is_file_read {
            return Some(
                "[read budget exhausted] too many individual reads this ask — use \
                 search_files to locate what you need, then read only those lines"
                    .to_string(),
            );
        }
        if read_only_calls > budget.read_budget_warn {
            advisories.push(format!(
                "[advisory] {read_only_calls} read-only calls this ask; prefer search_files \
                 over further exploratory reads"
            ));
        }

        if call.name == "read_file" {
            if let Some(raw) = call.args.get("path").and_then(|v| v.as_str()) {
                let path = self.env.resolve_path(raw);
                if let Some(parent) = path.parent() {
                    let set = dir_reads.entry(parent.to_path_buf()).or_default();
                    let novel = set.insert(path.clone());
                    if novel && set.len() > DIR_SCAN_LIMIT {
                        return Some(format!(
                            "[advisory] {} files already read from {} — this looks like a \
                             directory scan; use search_files with a pattern instead",
                            set.len(),
                            parent.display()
                        ));
                    }
                }
                if let Some(term) = call.args.get("search").and_then(|v| v.as_str()) {
                    let set = search_files.entry(term.to_string()).or_default();
                    set.insert(raw.to_string());
                    if set.len() >= SEARCH_TERM_LIMIT {
                        return Some(format!(
                            "[advisory] `{term}` has been searched in {} different files — \
                             run search_files with this pattern once instead",
                            set.len()
                        ));
                    }
                }
            }
        }
        None
    }

    /// Execute the calls that survived screening: read-only concurrently
    /// (when the harness permits), mutating sequentially with fail-fast.
    async fn execute_pending(&self, calls: &[ToolCall], outcomes: &mut [Option<ToolOutput>]) {
        // Read-only batch.
        let read_idx: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(i, c)| outcomes[*i].is_none() && self.tools.is_read_only(&c.name))
            .map(|(i, _)| i)
            .collect();

        if self.harness.parallel_tool_calls && read_idx.len() > 1 {
            let mut handles = Vec::with_capacity(read_idx.len());
            for &i in &read_idx {
                let registry = Arc::clone(&self.tools);
                let call = calls[i].clone();
                handles.push((i, tokio::spawn(async move { registry.execute(&call).await })));
            }
            for (i, handle) in handles {
                outcomes[i] = Some(match handle.await {
                    Ok(out) => out,
                    Err(e) => ToolOutput::err(
                        &calls[i].id,
                        format!("ERROR: code=internal msg=tool task panicked: {e}"),
                    ),
                });
            }
        } else {
            for &i in &read_idx {
                outcomes[i] = Some(self.tools.execute(&calls[i]).await);
            }
        }

        // Mutating batch: strictly sequential, in emitted order, fail-fast.
        let mut failed = false;
        for (i, call) in calls.iter().enumerate() {
            if outcomes[i].is_some() || self.tools.is_read_only(&call.name) {
                continue;
            }
            if failed {
                outcomes[i] = Some(ToolOutput::err(
                    &call.id,
                    "ERROR: code=cancelled msg=skipped: an earlier mutating tool in this \
                     batch failed",
                ));
                continue;
            }
            let out = self.tools.execute(call).await;
            if out.is_error {
                failed = true;
            }
            outcomes[i] = Some(out);
        }
    }

    /// Post-execution bookkeeping: caches, mutation tracking, and blocked
    /// exec counting.
    fn note_execution_effects(
        &mut self,
        call: &ToolCall,
        output: &ToolOutput,
        blocked_exec_attempts: &mut u32,
    ) {
        if call.name == "exec" {
            let command = call.args.get("command").and_then(|v| v.as_str()).unwrap_or("");
            self.guard.note_checkout(command);
            if output.is_error {
                if output.content.contains("code=forbidden")
                    || output.content.contains("code=path_escape")
                    || output.content.contains("code=cautious_denied")
                {
                    *blocked_exec_attempts += 1;
                }
            } else if self.guard.is_read_only_exec(command) {
                let rc_zero = output.content.contains("\"rc\":0");
                if rc_zero && !output.content.starts_with("[") {
                    self.guard.store_exec_observation(call, &output.content);
                }
            } else {
                // Arbitrary commands may touch the filesystem.
                self.guard.bump_mutation();
            }
            return;
        }

        let read_only = self.tools.is_read_only(&call.name);
        if read_only {
            let cacheable = matches!(call.name.as_str(), "read_file" | "read_files" | "list_dir");
            if cacheable && !output.is_error && !output.content.starts_with('[') {
                self.guard.store_read(call, &self.env.cwd, &output.content);
            }
        } else if !output.is_error {
            if let Some(raw) = call.args.get("path").and_then(|v| v.as_str()) {
                let path = self.env.resolve_path(raw);
                if let Some(warning) = self.guard.note_mutation(&path) {
                    // Spiral warnings land in the conversation via the
                    // result text on the next occurrence; log now.
                    warn!(path = %path.display(), "{warning}");
                }
            } else {
                self.guard.bump_mutation();
            }
        }
    }

    // ─── Model I/O ────────────────────────────────────────────────────────────

    fn schema_tokens(&self) -> usize {
        self.tools
            .schemas()
            .iter()
            .map(|s| {
                (s.name.len() + s.description.len() + s.parameters.to_string().len()).div_ceil(4)
            })
            .sum()
    }

    fn build_request(&self, toolless: bool) -> ChatRequest {
        let tools: Vec<ToolSchema> = if toolless {
            Vec::new()
        } else {
            self.tools
                .schemas()
                .into_iter()
                .map(|s| ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect()
        };
        ChatRequest {
            messages: self.session.messages.clone(),
            tools,
            tool_choice: toolless.then(|| "none".to_string()),
            max_tokens: self.config.endpoint.max_tokens,
            temperature: self.config.endpoint.temperature,
            top_p: self.config.endpoint.top_p,
        }
    }

    /// Stream one completion, accumulating text and tool-call fragments.
    /// The abort signal is raced against every frame.
    async fn stream_one_turn(&mut self, req: &ChatRequest) -> Result<ModelTurn, AgentError> {
        let issued = Instant::now();
        let mut stream = self.client.chat_stream(req).await.map_err(AgentError::Client)?;

        let mut text = String::new();
        let mut pending: HashMap<u32, RawToolCall> = HashMap::new();
        let mut usage: Option<Usage> = None;
        let mut first_token: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.env.abort.cancelled() => return Err(AgentError::Cancelled),
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            match event.map_err(AgentError::Client)? {
                StreamEvent::TextDelta(delta) => {
                    if !delta.is_empty() {
                        first_token.get_or_insert_with(Instant::now);
                        self.hooks.emit(HookEvent::TextDelta(delta.clone()));
                        text.push_str(&delta);
                    }
                }
                StreamEvent::ThinkingDelta(_) => {
                    first_token.get_or_insert_with(Instant::now);
                }
                StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    first_token.get_or_insert_with(Instant::now);
                    let entry = pending.entry(index).or_insert_with(|| RawToolCall {
                        id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                    });
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.arguments.push_str(&arguments);
                }
                StreamEvent::MaxTokens => {
                    warn!("completion hit max_tokens; trailing tool arguments may be cut");
                }
                StreamEvent::Usage(u) => usage = Some(u),
                StreamEvent::Done => break,
            }
        }

        // Order parallel calls by stream index; drop undispatchable ones
        // and synthesize ids the server failed to provide.
        let mut ordered: Vec<(u32, RawToolCall)> = pending.into_iter().collect();
        ordered.sort_by_key(|(i, _)| *i);
        let mut calls = Vec::with_capacity(ordered.len());
        for (n, (_, mut call)) in ordered.into_iter().enumerate() {
            if call.name.is_empty() {
                warn!("dropping tool call with no name");
                continue;
            }
            if call.id.is_empty() {
                call.id = format!("synthetic_{n}");
            }
            calls.push(call);
        }

        let ttc = issued.elapsed();
        let ttft = first_token.map(|t| t - issued).unwrap_or(ttc);
        let metrics = TurnMetrics {
            ttft_ms: ttft.as_millis() as u64,
            ttc_ms: ttc.as_millis() as u64,
            pp_tps: usage
                .map(|u| u.prompt_tokens as f32 / ttft.as_secs_f32().max(0.001))
                .unwrap_or(0.0),
            tg_tps: usage
                .map(|u| {
                    u.completion_tokens as f32
                        / (ttc - ttft).as_secs_f32().max(0.001)
                })
                .unwrap_or(0.0),
        };

        Ok(ModelTurn {
            text,
            calls,
            metrics,
        })
    }

    /// Final wrap-up when the iteration cap is hit: one tools-disabled
    /// turn so the model can summarise progress instead of dying mid-task.
    async fn wrap_up_turn(
        &mut self,
        turns: u32,
        tool_calls: u32,
        max_iterations: u32,
    ) -> Result<AskOutcome, AgentError> {
        self.session.push(Message::user(format!(
            "You have reached the tool-call budget ({max_iterations} rounds). Do not call \
             any more tools. Summarise what was completed, what remains, and how to continue."
        )));
        let req = self.build_request(true);
        let turn = self.stream_one_turn(&req).await?;
        let text = strip_think_blocks(&turn.text);
        if !text.is_empty() {
            self.session.push(Message::assistant(text.clone()));
        }
        Ok(AskOutcome {
            text,
            turns,
            tool_calls,
        })
    }

    /// Model drift probe: every N turns, check the served model list and
    /// switch (with a visible notice) when the current model vanished.
    async fn maybe_probe_model_drift(&mut self) {
        self.turns_since_probe += 1;
        if self.turns_since_probe < self.config.agent.drift_probe_interval {
            return;
        }
        self.turns_since_probe = 0;
        let Ok(models) = self.client.models().await else {
            return; // best-effort
        };
        if models.is_empty() {
            return;
        }
        let current = self.client.model();
        if models.iter().any(|m| *m == current) {
            return;
        }
        let new = models[0].clone();
        warn!(old = %current, new = %new, "model drift detected; switching");
        self.client.set_model(&new);
        self.harness = Harness::for_model(&new);
        self.hooks.emit(HookEvent::ModelChanged {
            old: current.clone(),
            new: new.clone(),
        });
        self.session.push(Message::system(format!(
            "[model changed: {current} is no longer served; continuing with {new}]"
        )));
    }

    // ─── Compaction ───────────────────────────────────────────────────────────

    async fn auto_compact_if_needed(&mut self) -> Result<(), AgentError> {
        let schema_tokens = self.schema_tokens();
        if !self
            .session
            .over_budget(schema_tokens, self.config.compaction.compact_at)
        {
            return Ok(());
        }
        self.compact(CompactionOptions {
            reason: Some("auto: over budget".into()),
            ..Default::default()
        })
        .await
        .map(|_| ())
    }

    /// Manual/automatic compaction entry point.  The state lock serializes
    /// every run; callers queue behind the previous completion.
    pub async fn compact(
        &mut self,
        opts: CompactionOptions,
    ) -> Result<CompactionOutcome, AgentError> {
        let state = Arc::clone(&self.compact_state);
        let mut st = state.lock().await;
        st.in_progress = true;
        st.last_reason = opts.reason.clone();
        let result = self.run_compaction(&opts).await;
        st.in_progress = false;
        match &result {
            Ok(CompactionOutcome::Compacted { .. }) => st.runs += 1,
            Ok(_) => {}
            Err(e) => {
                st.failed_runs += 1;
                st.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn run_compaction(
        &mut self,
        opts: &CompactionOptions,
    ) -> Result<CompactionOutcome, AgentError> {
        let compact_at = if opts.force {
            0.5
        } else {
            self.config.compaction.compact_at
        };
        let min_tail = if opts.force {
            2
        } else {
            self.config.compaction.min_tail
        };
        let extra = self.schema_tokens() + self.session.max_completion_tokens;
        let target = (compact_at * self.session.context_window as f32) as usize;

        let cut = if opts.hard {
            plan_hard_cut(&self.session.messages)
        } else {
            plan_cut(&self.session.messages, min_tail, target, extra)
        };
        if cut <= 1 {
            return Ok(CompactionOutcome::NotNeeded);
        }

        let dropped: Vec<Message> = self.session.messages[1..cut].to_vec();
        let tokens_freed: usize = dropped.iter().map(|m| m.approx_tokens()).sum();
        if opts.dry {
            return Ok(CompactionOutcome::Dry {
                messages_dropped: dropped.len(),
                tokens_freed,
            });
        }

        let tokens_before = self.session.token_count;

        // Archive before dropping: every dropped tool result is recoverable.
        if let Some(vault) = self.active_vault() {
            let batch = dropped_tool_results(&dropped);
            if let Err(e) = vault.archive_tool_messages(&batch) {
                warn!(error = %e, "vault archival failed; compaction continues");
            }
            if let Some(obj) = self.session.last_user_objective() {
                let _ = vault.upsert_note("current_task", obj, EntryKind::Note);
            }
        }

        // Summary synthesis (serialized behind the compaction lock; never
        // concurrent with the main turn's request).
        let mut summarized = false;
        let replacement = if self.config.compaction.summary
            && !opts.hard
            && tokens_freed > SUMMARY_WORTHWHILE_TOKENS
        {
            match self.synthesize_summary(&dropped, opts.topic.as_deref()).await {
                Some(summary) => {
                    summarized = true;
                    Message::system(format!("[context summary]\n{summary}"))
                }
                None => compaction_note(dropped.len()),
            }
        } else {
            compaction_note(dropped.len())
        };

        let mut rebuilt = Vec::with_capacity(self.session.messages.len() - cut + 2);
        rebuilt.push(self.session.messages[0].clone());
        rebuilt.push(replacement);
        rebuilt.extend_from_slice(&self.session.messages[cut..]);
        self.session.replace_messages(rebuilt);

        // Post-compaction hint, deduplicated per objective.
        if let Some(obj) = self.session.last_user_objective().map(str::to_string) {
            if self.hint_injected_for.as_deref() != Some(obj.as_str()) {
                let clipped = clip_objective(&obj);
                self.session.push(Message::user(format!(
                    "[context was compacted mid-task; the current objective is: {clipped}]"
                )));
                self.hint_injected_for = Some(obj);
            }
        }

        debug!(
            dropped = dropped.len(),
            tokens_before,
            tokens_after = self.session.token_count,
            summarized,
            "compaction complete"
        );
        Ok(CompactionOutcome::Compacted {
            messages_dropped: dropped.len(),
            tokens_before,
            tokens_after: self.session.token_count,
            summarized,
        })
    }

    async fn synthesize_summary(
        &self,
        dropped: &[Message],
        topic: Option<&str>,
    ) -> Option<String> {
        let mut prompt = SUMMARY_PROMPT.to_string();
        if let Some(t) = topic {
            prompt.push_str(&format!("\nFocus especially on: {t}"));
        }
        let req = ChatRequest {
            messages: vec![
                Message::system(prompt),
                Message::user(serialize_history(dropped)),
            ],
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: self.config.compaction.summary_max_tokens,
            temperature: 0.2,
            top_p: None,
        };
        match self.client.chat(&req).await {
            Ok(resp) if !resp.text.trim().is_empty() => Some(resp.text),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "summary synthesis failed; using fallback note");
                None
            }
        }
    }

    // ─── Plan mode ────────────────────────────────────────────────────────────

    /// Execute queued plan steps: the given index, or all pending steps in
    /// order.  Returns one line per executed step.
    pub async fn execute_plan_step(&mut self, index: Option<usize>) -> String {
        let selected = self.plan.select(index);
        if selected.is_empty() {
            return "no pending plan steps".to_string();
        }
        let mut lines = Vec::with_capacity(selected.len());
        for idx in selected {
            let step = self.plan.steps()[idx].clone();
            let call = ToolCall {
                id: format!("plan_{idx}"),
                name: step.tool.clone(),
                args: step.args.clone(),
            };
            let out = self.tools.execute(&call).await;
            self.plan.mark_executed(idx);
            lines.push(format!(
                "step {idx}: {} — {}",
                step.summary,
                first_line(&out.content)
            ));
        }
        lines.join("\n")
    }

    // ─── Vault integration ────────────────────────────────────────────────────

    fn active_vault(&self) -> Option<&Arc<Vault>> {
        match self.config.vault.mode {
            idlehands_config::VaultMode::Active => self.vault.as_ref(),
            _ => None,
        }
    }

    fn archive_outputs(&self, batch: Vec<(String, String, String)>) {
        if batch.is_empty() {
            return;
        }
        if let Some(vault) = self.active_vault() {
            if let Err(e) = vault.archive_tool_messages(&batch) {
                warn!(error = %e, "tool output archival failed");
            }
        }
    }

    /// Persist review output so later sessions can recall it.  The latest
    /// artifact per project is protected from pruning; item history is
    /// capped per project by the vault's retention rules.
    fn persist_review_artifacts(&self, instruction: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let looks_like_review = {
            let lower = instruction.to_lowercase();
            lower.contains("review") || lower.contains("audit")
        };
        if !looks_like_review {
            return;
        }
        let Some(vault) = self.active_vault() else {
            return;
        };
        let project = project_key(&self.env.cwd);
        let latest = format!("artifact:review:latest:{project}");
        let item = format!(
            "artifact:review:item:{project}:{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        );
        let _ = vault.upsert_note(&latest, text, EntryKind::Note);
        let _ = vault.note(&item, text);
    }

    fn persist_failure_note(&self, error: &AgentError) {
        let Some(vault) = self.active_vault() else {
            return;
        };
        let cwd = self.env.cwd.display().to_string();
        let redacted = error.to_string().replace(&cwd, "~");
        let result: Result<i64, VaultError> =
            vault.note(&format!("agent failure:{}", error.kind()), &redacted);
        if let Err(e) = result {
            warn!(error = %e, "failed to persist failure note");
        }
    }
}

// ─── Free helpers ─────────────────────────────────────────────────────────────

/// Decode raw calls into dispatchable calls.  Unparseable argument JSON
/// becomes a `Null`-argument call (rejected at validation) and counts
/// toward the malformed budget.
fn decode_calls(raw: Vec<RawToolCall>) -> (Vec<ToolCall>, u32) {
    let mut malformed = 0u32;
    let calls = raw
        .into_iter()
        .map(|r| {
            let args: Value = if r.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&r.arguments) {
                    Ok(v @ Value::Object(_)) => v,
                    Ok(_) | Err(_) => {
                        malformed += 1;
                        Value::Null
                    }
                }
            };
            ToolCall {
                id: r.id,
                name: r.name,
                args,
            }
        })
        .collect();
    (calls, malformed)
}

fn first_line(s: &str) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.len() > 160 {
        let mut end = 160;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &line[..end])
    } else {
        line.to_string()
    }
}

/// Sanitize the cwd into a key segment (vault keys are `:`-delimited).
fn project_key(cwd: &std::path::Path) -> String {
    cwd.display()
        .to_string()
        .replace(['/', '\\', ':'], "-")
        .trim_matches('-')
        .to_string()
}
