// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The tool-loop guard: repetition detection, the read-cache, exec
//! observation caching, and the per-file mutation spiral.
//!
//! Three pathologies wreck long sessions — re-reading the same file
//! forever, re-running the same command, and ping-ponging between two
//! tools.  Every tool call is registered here before dispatch; the guard
//! answers with a [`GuardDecision`] the orchestrator must honor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use idlehands_config::ToolLoopConfig;
use idlehands_tools::ToolCall;

/// Banner prefixed to replayed cached reads.
pub const DEDUPE_BANNER: &str = "[idlehands dedupe]";
/// Marker prefixed to replayed exec observations.
pub const CACHED_OBSERVATION: &str = "[cached_observation]";

/// Window inspected for A→B→A→B alternation.
const PING_PONG_WINDOW: usize = 16;
/// File-mutation count that triggers a warning.
const MUTATION_WARN_AT: u32 = 4;
/// File-mutation count after which the path is locked.
const MUTATION_BLOCK_AT: u32 = 8;

/// What the orchestrator must do with a registered call.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Proceed,
    /// Execute, but append this advisory to the result.
    ProceedWithWarning(String),
    /// Identical signature already executed this turn — answer with a
    /// replay stub instead of re-executing.
    Replay { canonical_id: String },
    /// First critical strike: suppress the call, inject the notice, and
    /// force one tools-disabled turn.
    RecoveryTurn { notice: String },
    /// Criticality recurred after the recovery turn.
    Abort { reason: String },
}

/// Cumulative telemetry, exposed through session stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardStats {
    pub calls_registered: u64,
    pub deduped_replays: u64,
    pub read_cache_lookups: u64,
    pub read_cache_hits: u64,
    pub warnings: u64,
    pub criticals: u64,
    pub recovery_recommended: u64,
}

impl GuardStats {
    pub fn hit_rate(&self) -> f64 {
        if self.read_cache_lookups == 0 {
            0.0
        } else {
            self.read_cache_hits as f64 / self.read_cache_lookups as f64
        }
    }

    pub fn dedupe_rate(&self) -> f64 {
        if self.calls_registered == 0 {
            0.0
        } else {
            self.deduped_replays as f64 / self.calls_registered as f64
        }
    }
}

struct ReadCacheEntry {
    content: String,
    /// Observed mtime per input path; `None` when the path did not exist.
    mtimes: Vec<(PathBuf, Option<SystemTime>)>,
    stored_at: Instant,
}

pub struct ToolLoopGuard {
    cfg: ToolLoopConfig,
    /// Signature occurrence counts across turns, within one ask.
    counts: HashMap<String, u32>,
    /// Recent signatures for alternation detection.
    recent: VecDeque<String>,
    /// First call id per signature within the current turn.
    turn_first_ids: HashMap<String, String>,
    read_cache: HashMap<String, ReadCacheEntry>,
    /// Read-only exec output keyed by signature, tagged with the mutation
    /// version it was observed at.
    exec_cache: HashMap<String, (String, u64)>,
    /// Monotonic tick bumped by any file-mutating tool.
    mutation_version: u64,
    file_mutations: HashMap<PathBuf, u32>,
    blocked_paths: HashSet<PathBuf>,
    recovery_used: bool,
    stats: GuardStats,
}

impl ToolLoopGuard {
    pub fn new(cfg: ToolLoopConfig) -> Self {
        Self {
            cfg,
            counts: HashMap::new(),
            recent: VecDeque::new(),
            turn_first_ids: HashMap::new(),
            read_cache: HashMap::new(),
            exec_cache: HashMap::new(),
            mutation_version: 0,
            file_mutations: HashMap::new(),
            blocked_paths: HashSet::new(),
            recovery_used: false,
            stats: GuardStats::default(),
        }
    }

    pub fn stats(&self) -> GuardStats {
        self.stats
    }

    pub fn mutation_version(&self) -> u64 {
        self.mutation_version
    }

    /// Bump the mutation version for a filesystem-touching call with no
    /// single tracked path (e.g. an arbitrary `exec` command), invalidating
    /// exec-cache observations without per-path spiral tracking.
    pub fn bump_mutation(&mut self) {
        self.mutation_version += 1;
    }

    /// Absolute paths mutated during the current ask.
    pub fn mutated_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.file_mutations.keys().cloned().collect();
        files.sort();
        files
    }

    /// Reset per-ask detection state.  Caches survive — they are guarded
    /// by TTL, mtimes, and the mutation version instead.
    pub fn begin_ask(&mut self) {
        self.counts.clear();
        self.recent.clear();
        self.turn_first_ids.clear();
        self.file_mutations.clear();
        self.blocked_paths.clear();
        self.recovery_used = false;
    }

    /// Reset the within-turn dedupe set.
    pub fn begin_turn(&mut self) {
        self.turn_first_ids.clear();
    }

    /// Register a call and decide its fate.  `mutating` selects the
    /// tighter threshold pair.
    pub fn register(&mut self, call: &ToolCall, mutating: bool) -> GuardDecision {
        self.stats.calls_registered += 1;
        let sig = signature(call);

        // Within-turn dedupe: answer duplicates with a replay stub.
        if let Some(first_id) = self.turn_first_ids.get(&sig) {
            self.stats.deduped_replays += 1;
            return GuardDecision::Replay {
                canonical_id: first_id.clone(),
            };
        }
        self.turn_first_ids.insert(sig.clone(), call.id.clone());

        let count = {
            let c = self.counts.entry(sig.clone()).or_insert(0);
            *c += 1;
            *c
        };

        self.recent.push_back(sig.clone());
        if self.recent.len() > PING_PONG_WINDOW {
            self.recent.pop_front();
        }

        let (warn_at, critical_at) = if mutating {
            (self.cfg.mutate_warn_threshold, self.cfg.mutate_critical_threshold)
        } else {
            (self.cfg.warn_threshold, self.cfg.critical_threshold)
        };

        let ping_pong = self.ping_pong_run_len();
        let critical = count >= critical_at || ping_pong >= critical_at;
        if critical {
            self.stats.criticals += 1;
            warn!(signature = %sig, count, ping_pong, "tool loop critical");
            if !self.recovery_used {
                self.recovery_used = true;
                self.stats.recovery_recommended += 1;
                return GuardDecision::RecoveryTurn {
                    notice: format!(
                        "tool loop detected ({sig} repeated); answer from the results you \
                         already have instead of calling more tools"
                    ),
                };
            }
            return GuardDecision::Abort {
                reason: format!("tool loop persisted after recovery ({sig})"),
            };
        }

        if count >= warn_at || ping_pong >= warn_at {
            self.stats.warnings += 1;
            debug!(signature = %sig, count, "tool loop warning");
            return GuardDecision::ProceedWithWarning(format!(
                "[loop guard] this exact call has run {count} time(s) already; \
                 the result will not change unless a file changes"
            ));
        }

        GuardDecision::Proceed
    }

    /// Length of the trailing A→B→A→B alternation, measured in whole
    /// A-B pairs matched (0 when the tail does not alternate).
    fn ping_pong_run_len(&self) -> u32 {
        let n = self.recent.len();
        if n < 4 {
            return 0;
        }
        let sigs: Vec<&String> = self.recent.iter().collect();
        let a = sigs[n - 2];
        let b = sigs[n - 1];
        if a == b {
            return 0;
        }
        let mut pairs = 0u32;
        let mut i = n;
        while i >= 2 && sigs[i - 2] == a && sigs[i - 1] == b {
            pairs += 1;
            i -= 2;
        }
        if pairs >= 2 {
            pairs
        } else {
            0
        }
    }

    // ── Read cache ────────────────────────────────────────────────────────────

    /// Look up a cached read.  A hit requires every recorded input mtime to
    /// be unchanged and the entry to be within TTL; the cached body comes
    /// back behind a visible dedupe banner.
    pub fn check_read_cache(&mut self, call: &ToolCall, cwd: &Path) -> Option<String> {
        self.stats.read_cache_lookups += 1;
        let key = cache_key(call, cwd);
        let ttl = Duration::from_secs(self.cfg.cache_ttl);

        let fresh = {
            let entry = self.read_cache.get(&key)?;
            entry.stored_at.elapsed() <= ttl
                && entry
                    .mtimes
                    .iter()
                    .all(|(path, recorded)| mtime_of(path) == *recorded)
        };
        if !fresh {
            self.read_cache.remove(&key);
            return None;
        }
        self.stats.read_cache_hits += 1;
        let entry = self.read_cache.get(&key)?;
        Some(format!(
            "{DEDUPE_BANNER} replayed cached result (inputs unchanged)\n{}",
            entry.content
        ))
    }

    /// Store a read result, recording the current mtime of every input.
    pub fn store_read(&mut self, call: &ToolCall, cwd: &Path, content: &str) {
        let key = cache_key(call, cwd);
        let mtimes = input_paths(call, cwd)
            .into_iter()
            .map(|p| {
                let m = mtime_of(&p);
                (p, m)
            })
            .collect();
        self.read_cache.insert(
            key,
            ReadCacheEntry {
                content: content.to_string(),
                mtimes,
                stored_at: Instant::now(),
            },
        );
    }

    // ── Exec observation cache ────────────────────────────────────────────────

    /// Whether a shell command matches the configured read-only pattern
    /// list (prefix match on the normalized command).
    pub fn is_read_only_exec(&self, command: &str) -> bool {
        let normalized = normalize_command(command);
        self.cfg
            .read_only_exec_patterns
            .iter()
            .any(|p| normalized.starts_with(p.as_str()))
    }

    /// Replay a cached read-only exec observation when the identical call
    /// repeats and no file mutation happened since it was stored.
    pub fn check_exec_cache(&mut self, call: &ToolCall) -> Option<String> {
        let sig = signature(call);
        // Only replay genuine repeats — the first occurrence always runs.
        if self.counts.get(&sig).copied().unwrap_or(0) < 2 {
            return None;
        }
        let (output, version) = self.exec_cache.get(&sig)?;
        if *version != self.mutation_version {
            return None;
        }
        Some(format!("{CACHED_OBSERVATION} unchanged since last run\n{output}"))
    }

    /// Store a successful read-only exec observation.
    pub fn store_exec_observation(&mut self, call: &ToolCall, output: &str) {
        self.exec_cache
            .insert(signature(call), (output.to_string(), self.mutation_version));
    }

    // ── Mutation tracking ─────────────────────────────────────────────────────

    /// True when the mutation spiral has locked this path.
    pub fn is_path_blocked(&self, path: &Path) -> bool {
        self.blocked_paths.contains(path)
    }

    /// Record a successful mutation of `path`.  Bumps the mutation version
    /// (invalidating exec observations) and returns a spiral warning when
    /// the per-path count crosses the thresholds.
    pub fn note_mutation(&mut self, path: &Path) -> Option<String> {
        self.mutation_version += 1;
        let count = {
            let c = self.file_mutations.entry(path.to_path_buf()).or_insert(0);
            *c += 1;
            *c
        };
        if count >= MUTATION_BLOCK_AT {
            self.blocked_paths.insert(path.to_path_buf());
            return Some(format!(
                "[loop guard] {} has been mutated {count} times; further edits are \
                 blocked until the file is restored (git checkout/restore)",
                path.display()
            ));
        }
        if count >= MUTATION_WARN_AT {
            return Some(format!(
                "[loop guard] {} has now been mutated {count} times this ask; \
                 consider re-reading it and rethinking the approach",
                path.display()
            ));
        }
        None
    }

    /// Observe an exec command; a `git checkout`/`git restore` of a locked
    /// path resets its spiral counter.
    pub fn note_checkout(&mut self, command: &str) {
        if !command.contains("git checkout") && !command.contains("git restore") {
            return;
        }
        let unblocked: Vec<PathBuf> = self
            .blocked_paths
            .iter()
            .filter(|p| {
                p.file_name()
                    .map(|n| command.contains(&*n.to_string_lossy()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for p in unblocked {
            debug!(path = %p.display(), "mutation spiral reset by checkout");
            self.blocked_paths.remove(&p);
            self.file_mutations.remove(&p);
        }
    }
}

// ─── Signatures & cache keys ─────────────────────────────────────────────────

/// Canonical signature `tool|k1=v1|k2=v2|…` with keys sorted.  Exec
/// commands are normalized (whitespace collapsed, leading `cd X && `
/// stripped) so cosmetic differences do not defeat detection.
pub fn signature(call: &ToolCall) -> String {
    let mut parts = vec![call.name.clone()];
    if let Some(obj) = call.args.as_object() {
        let mut keys: Vec<&String> = obj.keys().collect();
        keys.sort();
        for k in keys {
            let value = &obj[k];
            let rendered = if call.name == "exec" && k == "command" {
                normalize_command(value.as_str().unwrap_or_default())
            } else {
                value.to_string()
            };
            parts.push(format!("{k}={rendered}"));
        }
    }
    parts.join("|")
}

fn cache_key(call: &ToolCall, cwd: &Path) -> String {
    format!("{}|cwd={}", signature(call), cwd.display())
}

/// Collapse whitespace and strip a leading `cd <dir> && ` prefix.
pub fn normalize_command(command: &str) -> String {
    let collapsed = command.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(rest) = collapsed.strip_prefix("cd ") {
        if let Some(pos) = rest.find("&& ") {
            return rest[pos + 3..].to_string();
        }
    }
    collapsed
}

/// Input paths referenced by a read call (`path` or `paths` arguments),
/// resolved against the cwd for mtime checks.
fn input_paths(call: &ToolCall, cwd: &Path) -> Vec<PathBuf> {
    let resolve = |raw: &str| -> PathBuf {
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            cwd.join(p)
        }
    };
    let mut paths = Vec::new();
    if let Some(p) = call.args.get("path").and_then(|v| v.as_str()) {
        paths.push(resolve(p));
    }
    if let Some(list) = call.args.get("paths").and_then(|v| v.as_array()) {
        paths.extend(list.iter().filter_map(|v| v.as_str()).map(resolve));
    }
    paths
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard() -> ToolLoopGuard {
        ToolLoopGuard::new(ToolLoopConfig::default())
    }

    fn read_call(id: &str, path: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "read_file".into(),
            args: json!({"path": path, "limit": 200}),
        }
    }

    fn exec_call(id: &str, cmd: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "exec".into(),
            args: json!({"command": cmd}),
        }
    }

    // ── signatures ───────────────────────────────────────────────────────────

    #[test]
    fn signature_sorts_keys() {
        let a = ToolCall {
            id: "1".into(),
            name: "t".into(),
            args: json!({"b": 2, "a": 1}),
        };
        let b = ToolCall {
            id: "2".into(),
            name: "t".into(),
            args: json!({"a": 1, "b": 2}),
        };
        assert_eq!(signature(&a), signature(&b));
        assert_eq!(signature(&a), "t|a=1|b=2");
    }

    #[test]
    fn exec_signature_normalizes_command() {
        let a = exec_call("1", "cd /proj &&   git   status");
        let b = exec_call("2", "git status");
        assert_eq!(signature(&a), signature(&b));
    }

    // ── within-turn dedupe ───────────────────────────────────────────────────

    #[test]
    fn duplicate_in_same_turn_is_replayed() {
        let mut g = guard();
        g.begin_turn();
        assert_eq!(g.register(&read_call("c1", "a.txt"), false), GuardDecision::Proceed);
        match g.register(&read_call("c2", "a.txt"), false) {
            GuardDecision::Replay { canonical_id } => assert_eq!(canonical_id, "c1"),
            other => panic!("expected replay, got {other:?}"),
        }
        assert_eq!(g.stats().deduped_replays, 1);
    }

    #[test]
    fn same_call_next_turn_is_not_replay() {
        let mut g = guard();
        g.begin_turn();
        g.register(&read_call("c1", "a.txt"), false);
        g.begin_turn();
        assert_eq!(g.register(&read_call("c2", "a.txt"), false), GuardDecision::Proceed);
    }

    // ── escalation ladder ────────────────────────────────────────────────────

    #[test]
    fn warning_at_threshold_then_recovery_then_abort() {
        let mut g = guard();
        let mut decisions = Vec::new();
        for i in 0..8 {
            g.begin_turn();
            decisions.push(g.register(&read_call(&format!("c{i}"), "a.txt"), false));
        }
        // Defaults: warn=3, critical=6.
        assert_eq!(decisions[0], GuardDecision::Proceed);
        assert_eq!(decisions[1], GuardDecision::Proceed);
        assert!(matches!(decisions[2], GuardDecision::ProceedWithWarning(_)));
        assert!(matches!(decisions[5], GuardDecision::RecoveryTurn { .. }));
        assert!(matches!(decisions[6], GuardDecision::Abort { .. }));
        assert_eq!(g.stats().recovery_recommended, 1);
    }

    #[test]
    fn mutating_thresholds_are_tighter() {
        let mut g = guard();
        let call = |i: u32| ToolCall {
            id: format!("c{i}"),
            name: "write_file".into(),
            args: json!({"path": "a.txt", "content": "x"}),
        };
        g.begin_turn();
        assert_eq!(g.register(&call(0), true), GuardDecision::Proceed);
        g.begin_turn();
        assert!(matches!(g.register(&call(1), true), GuardDecision::ProceedWithWarning(_)));
        g.begin_turn();
        assert!(matches!(g.register(&call(2), true), GuardDecision::RecoveryTurn { .. }));
    }

    #[test]
    fn ping_pong_alternation_detected() {
        let mut g = guard();
        let a = || read_call("x", "a.txt");
        let b = || exec_call("y", "ls");
        // A B A B A B → alternation pairs reach the warning threshold.
        let mut warned = false;
        for _ in 0..3 {
            g.begin_turn();
            if matches!(g.register(&a(), false), GuardDecision::ProceedWithWarning(_)) {
                warned = true;
            }
            g.begin_turn();
            if matches!(g.register(&b(), false), GuardDecision::ProceedWithWarning(_)) {
                warned = true;
            }
        }
        assert!(warned, "alternation must at least warn");
    }

    #[test]
    fn begin_ask_resets_counts_but_keeps_stats() {
        let mut g = guard();
        for i in 0..4 {
            g.begin_turn();
            g.register(&read_call(&format!("c{i}"), "a.txt"), false);
        }
        let warnings_before = g.stats().warnings;
        assert!(warnings_before > 0);
        g.begin_ask();
        g.begin_turn();
        assert_eq!(g.register(&read_call("n", "a.txt"), false), GuardDecision::Proceed);
        assert_eq!(g.stats().warnings, warnings_before, "stats are cumulative");
    }

    // ── read cache ───────────────────────────────────────────────────────────

    #[test]
    fn read_cache_hit_when_mtime_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "body").unwrap();
        let mut g = guard();
        let call = read_call("c1", "a.txt");
        assert!(g.check_read_cache(&call, tmp.path()).is_none());
        g.store_read(&call, tmp.path(), "L1:body");
        let hit = g.check_read_cache(&call, tmp.path()).unwrap();
        assert!(hit.starts_with(DEDUPE_BANNER));
        assert!(hit.contains("L1:body"));
        assert_eq!(g.stats().read_cache_hits, 1);
    }

    #[test]
    fn read_cache_invalidated_by_mtime_change() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "v1").unwrap();
        let mut g = guard();
        let call = read_call("c1", "a.txt");
        g.store_read(&call, tmp.path(), "L1:v1");
        // Rewrite with a clearly different mtime.
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&file, "v2").unwrap();
        let mtime_now = std::fs::metadata(&file).unwrap().modified().unwrap();
        // Guard against filesystems with coarse timestamps: only assert
        // when the mtime actually moved.
        if g.read_cache.values().next().unwrap().mtimes[0].1 != Some(mtime_now) {
            assert!(g.check_read_cache(&call, tmp.path()).is_none());
        }
    }

    #[test]
    fn read_cache_keyed_by_args() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "body").unwrap();
        let mut g = guard();
        g.store_read(&read_call("c1", "a.txt"), tmp.path(), "cached");
        let other = ToolCall {
            id: "c2".into(),
            name: "read_file".into(),
            args: json!({"path": "a.txt", "limit": 50}),
        };
        assert!(g.check_read_cache(&other, tmp.path()).is_none());
    }

    // ── exec observation cache ───────────────────────────────────────────────

    #[test]
    fn read_only_exec_patterns_match_prefix() {
        let g = guard();
        assert!(g.is_read_only_exec("git status --short"));
        assert!(g.is_read_only_exec("cd /x && git status"));
        assert!(g.is_read_only_exec("rg TODO src/"));
        assert!(!g.is_read_only_exec("cargo build"));
        assert!(!g.is_read_only_exec("rm -rf target"));
    }

    #[test]
    fn exec_cache_replays_repeat_without_mutation() {
        let mut g = guard();
        let call = exec_call("c1", "git status");
        g.begin_turn();
        g.register(&call, false);
        g.store_exec_observation(&call, "clean tree");
        assert!(g.check_exec_cache(&call).is_none(), "first repeat not yet counted");
        g.begin_turn();
        g.register(&exec_call("c2", "git status"), false);
        let hit = g.check_exec_cache(&call).unwrap();
        assert!(hit.starts_with(CACHED_OBSERVATION));
        assert!(hit.contains("clean tree"));
    }

    #[test]
    fn exec_cache_invalidated_by_mutation() {
        let mut g = guard();
        let call = exec_call("c1", "git status");
        g.begin_turn();
        g.register(&call, false);
        g.store_exec_observation(&call, "clean tree");
        g.begin_turn();
        g.register(&exec_call("c2", "git status"), false);
        g.note_mutation(Path::new("/p/a.txt"));
        assert!(g.check_exec_cache(&call).is_none());
    }

    // ── mutation spiral ──────────────────────────────────────────────────────

    #[test]
    fn mutation_spiral_warns_then_blocks() {
        let mut g = guard();
        let path = Path::new("/p/src/main.rs");
        for i in 1..=3 {
            assert!(g.note_mutation(path).is_none(), "mutation {i} should be quiet");
        }
        assert!(g.note_mutation(path).unwrap().contains("4 times"));
        for _ in 5..8 {
            let _ = g.note_mutation(path);
        }
        let last = g.note_mutation(path).unwrap();
        assert!(last.contains("blocked"));
        assert!(g.is_path_blocked(path));
    }

    #[test]
    fn checkout_resets_spiral() {
        let mut g = guard();
        let path = Path::new("/p/src/main.rs");
        for _ in 0..8 {
            let _ = g.note_mutation(path);
        }
        assert!(g.is_path_blocked(path));
        g.note_checkout("git checkout -- src/main.rs");
        assert!(!g.is_path_blocked(path));
        assert!(g.note_mutation(path).is_none(), "counter reset");
    }

    #[test]
    fn unrelated_command_does_not_unblock() {
        let mut g = guard();
        let path = Path::new("/p/src/main.rs");
        for _ in 0..8 {
            let _ = g.note_mutation(path);
        }
        g.note_checkout("git checkout -- other.rs");
        assert!(g.is_path_blocked(path));
    }
}
