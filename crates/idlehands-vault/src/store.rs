// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::{EntryKind, VaultEntry, VaultError};

/// Protected keys: never pruned under any pressure.
const PROTECTED_PREFIX: &str = "artifact:review:latest:";
/// Capped immutable items: pruned per project beyond the configured cap.
const ITEM_PREFIX: &str = "artifact:review:item:";
/// Snippet length stored alongside archived tool output.
const SNIPPET_LEN: usize = 160;

#[derive(Debug, Clone)]
pub struct VaultOptions {
    /// Project directory stamped onto new entries and used for search
    /// tiering.
    pub project_dir: Option<String>,
    /// LRU ceiling for unprotected entries.
    pub max_entries: usize,
    /// Per-project cap for `artifact:review:item:<project>:*` keys.
    pub items_per_project: usize,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            project_dir: None,
            max_entries: 500,
            items_per_project: 20,
        }
    }
}

/// The durable memory store.  Single-writer: every operation serializes on
/// the connection mutex; pruning and inserts share one transaction.
pub struct Vault {
    conn: Mutex<Connection>,
    opts: VaultOptions,
    fts: bool,
}

impl Vault {
    /// Open (or create) the store at `path`.
    ///
    /// A corrupt database file is renamed to `<path>.corrupt-<timestamp>`
    /// and a fresh store is created in its place.
    pub fn open(path: &Path, opts: VaultOptions) -> Result<Self, VaultError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match Self::try_open(path, &opts) {
            Ok(v) => Ok(v),
            Err(e) => {
                let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
                let quarantine = path.with_extension(format!("corrupt-{stamp}"));
                warn!(
                    path = %path.display(),
                    quarantine = %quarantine.display(),
                    error = %e,
                    "vault open failed; quarantining store file and recreating"
                );
                std::fs::rename(path, &quarantine)?;
                Self::try_open(path, &opts)
            }
        }
    }

    /// In-memory store for tests.
    pub fn open_in_memory(opts: VaultOptions) -> Result<Self, VaultError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, opts)
    }

    fn try_open(path: &Path, opts: &VaultOptions) -> Result<Self, VaultError> {
        let conn = Connection::open(path).map_err(|e| VaultError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::init(conn, opts.clone())
    }

    fn init(conn: Connection, opts: VaultOptions) -> Result<Self, VaultError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vault_entries (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                kind         TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                key          TEXT,
                value        TEXT,
                tool         TEXT,
                tool_call_id TEXT,
                content      TEXT,
                snippet      TEXT,
                project_dir  TEXT,
                search_text  TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_vault_updated ON vault_entries(updated_at);
            CREATE INDEX IF NOT EXISTS idx_vault_call    ON vault_entries(tool_call_id);
            CREATE INDEX IF NOT EXISTS idx_vault_project ON vault_entries(project_dir);",
        )?;

        // FTS5 availability depends on how SQLite was built; fall back to
        // substring scoring when the virtual table cannot be created.
        let fts = conn
            .execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS vault_fts
                    USING fts5(search_text, content='vault_entries', content_rowid='id');",
            )
            .is_ok();
        if !fts {
            warn!("FTS5 unavailable; vault search will use substring scoring");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            opts,
            fts,
        })
    }

    // ── Write operations ──────────────────────────────────────────────────────

    /// Append a note.
    pub fn note(&self, key: &str, value: &str) -> Result<i64, VaultError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let id = insert_entry(
            &tx,
            self.fts,
            &NewEntry {
                kind: EntryKind::Note,
                key: Some(key),
                value: Some(value),
                tool: None,
                tool_call_id: None,
                content: None,
                snippet: None,
                project_dir: self.opts.project_dir.as_deref(),
            },
        )?;
        self.apply_retention(&tx)?;
        tx.commit()?;
        Ok(id)
    }

    /// Append or replace the newest entry with this key.
    pub fn upsert_note(&self, key: &str, value: &str, kind: EntryKind) -> Result<i64, VaultError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, search_text FROM vault_entries
                 WHERE key = ?1 ORDER BY updated_at DESC, id DESC LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(ignore_no_rows)?;

        let id = if let Some((id, old_search)) = existing {
            let now = now_rfc3339();
            let search = format!("{key} {value}");
            tx.execute(
                "UPDATE vault_entries SET value = ?1, kind = ?2, updated_at = ?3,
                 search_text = ?4 WHERE id = ?5",
                params![value, kind.as_str(), now, search, id],
            )?;
            if self.fts {
                fts_delete(&tx, id, &old_search)?;
                fts_insert(&tx, id, &search)?;
            }
            id
        } else {
            insert_entry(
                &tx,
                self.fts,
                &NewEntry {
                    kind,
                    key: Some(key),
                    value: Some(value),
                    tool: None,
                    tool_call_id: None,
                    content: None,
                    snippet: None,
                    project_dir: self.opts.project_dir.as_deref(),
                },
            )?
        };
        self.apply_retention(&tx)?;
        tx.commit()?;
        Ok(id)
    }

    /// Archive one tool result.  Idempotent on `tool_call_id`: re-archiving
    /// the same call inserts nothing and returns `false`.
    pub fn archive_tool_message(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        content: &str,
    ) -> Result<bool, VaultError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let inserted = archive_one(&tx, self.fts, &self.opts, tool_call_id, tool_name, content)?;
        if inserted {
            self.apply_retention(&tx)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Archive a batch of tool results in one transaction.
    /// Returns the number of rows actually inserted.
    pub fn archive_tool_messages(
        &self,
        batch: &[(String, String, String)],
    ) -> Result<usize, VaultError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for (call_id, tool, content) in batch {
            if archive_one(&tx, self.fts, &self.opts, call_id, tool, content)? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.apply_retention(&tx)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Delete every entry whose key starts with `prefix`.
    pub fn delete_by_key_prefix(&self, prefix: &str) -> Result<usize, VaultError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, search_text FROM vault_entries WHERE key LIKE ?1 || '%'",
            )?;
            let mapped = stmt.query_map(params![prefix], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };
        for (id, search) in &rows {
            if self.fts {
                fts_delete(&tx, *id, search)?;
            }
            tx.execute("DELETE FROM vault_entries WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    // ── Read operations ───────────────────────────────────────────────────────

    /// Newest entry with the given key (optionally restricted by kind).
    pub fn latest_by_key(
        &self,
        key: &str,
        kind: Option<EntryKind>,
    ) -> Result<Option<VaultEntry>, VaultError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let (sql, use_kind) = match kind {
            Some(_) => (
                "SELECT id, kind, created_at, updated_at, key, value, tool, tool_call_id,
                        content, snippet, project_dir
                 FROM vault_entries WHERE key = ?1 AND kind = ?2
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                true,
            ),
            None => (
                "SELECT id, kind, created_at, updated_at, key, value, tool, tool_call_id,
                        content, snippet, project_dir
                 FROM vault_entries WHERE key = ?1
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                false,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let result = if use_kind {
            stmt.query_row(params![key, kind.unwrap().as_str()], row_to_entry)
        } else {
            stmt.query_row(params![key], row_to_entry)
        };
        result.map(Some).or_else(ignore_no_rows).map_err(Into::into)
    }

    pub fn count(&self) -> Result<usize, VaultError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM vault_entries", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Scored, project-scoped search.
    ///
    /// Ranking tiers: same-project first (entry dir equals or is a prefix
    /// of the session project dir), unscoped second, other-project last.
    /// Within a tier: FTS rank (BM25) when available, query-term overlap
    /// otherwise, then `updated_at` descending.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<VaultEntry>, VaultError> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.chars().any(char::is_alphanumeric))
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = if self.fts {
            match self.fts_candidates(&terms) {
                Ok(rows) => rows,
                Err(e) => {
                    debug!(error = %e, "FTS query failed; falling back to substring scan");
                    self.scan_candidates(&terms)?
                }
            }
        } else {
            self.scan_candidates(&terms)?
        };

        let project = self.opts.project_dir.as_deref();
        scored.sort_by(|(ea, sa), (eb, sb)| {
            tier(ea, project)
                .cmp(&tier(eb, project))
                .then(sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal))
                .then(eb.updated_at.cmp(&ea.updated_at))
        });
        Ok(scored.into_iter().map(|(e, _)| e).take(limit).collect())
    }

    /// FTS path: MATCH terms OR-joined, score = -bm25 rank (higher better).
    fn fts_candidates(&self, terms: &[String]) -> Result<Vec<(VaultEntry, f64)>, VaultError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let match_expr = terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut stmt = conn.prepare(
            "SELECT e.id, e.kind, e.created_at, e.updated_at, e.key, e.value, e.tool,
                    e.tool_call_id, e.content, e.snippet, e.project_dir, rank
             FROM vault_fts f JOIN vault_entries e ON e.id = f.rowid
             WHERE vault_fts MATCH ?1
             ORDER BY rank LIMIT 256",
        )?;
        let rows = stmt.query_map(params![match_expr], |row| {
            let entry = row_to_entry(row)?;
            let rank: f64 = row.get(11)?;
            Ok((entry, -rank))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Fallback path: full scan with query-term overlap scoring.
    fn scan_candidates(&self, terms: &[String]) -> Result<Vec<(VaultEntry, f64)>, VaultError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, kind, created_at, updated_at, key, value, tool, tool_call_id,
                    content, snippet, project_dir
             FROM vault_entries",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut out = Vec::new();
        for entry in rows {
            let entry = entry?;
            let text = entry.search_text().to_lowercase();
            let matched = terms.iter().filter(|t| text.contains(t.as_str())).count();
            if matched > 0 {
                out.push((entry, matched as f64 / terms.len() as f64));
            }
        }
        Ok(out)
    }

    // ── Retention ─────────────────────────────────────────────────────────────

    /// Enforce the retention rules inside the caller's transaction:
    /// per-project item caps first, then the global LRU ceiling over
    /// unprotected entries.  Protected review artifacts are never touched.
    fn apply_retention(&self, tx: &rusqlite::Transaction<'_>) -> Result<(), VaultError> {
        // 1. Cap artifact:review:item:<project>:* per project.
        let items: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, key, search_text FROM vault_entries
                 WHERE key LIKE ?1 || '%' ORDER BY id ASC",
            )?;
            let mapped = stmt.query_map(params![ITEM_PREFIX], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };
        let mut per_project: HashMap<String, Vec<(i64, String)>> = HashMap::new();
        for (id, key, search) in items {
            let project = key[ITEM_PREFIX.len()..]
                .split(':')
                .next()
                .unwrap_or("")
                .to_string();
            per_project.entry(project).or_default().push((id, search));
        }
        for (_, ids) in per_project {
            if ids.len() > self.opts.items_per_project {
                let excess = ids.len() - self.opts.items_per_project;
                for (id, search) in ids.into_iter().take(excess) {
                    if self.fts {
                        fts_delete(tx, id, &search)?;
                    }
                    tx.execute("DELETE FROM vault_entries WHERE id = ?1", params![id])?;
                }
            }
        }

        // 2. Global LRU ceiling: prune oldest unprotected entries only.
        let total: i64 = tx.query_row("SELECT COUNT(*) FROM vault_entries", [], |r| r.get(0))?;
        let excess = (total as usize).saturating_sub(self.opts.max_entries);
        if excess > 0 {
            let victims: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, search_text FROM vault_entries
                     WHERE key IS NULL
                        OR (key NOT LIKE ?1 || '%' AND key NOT LIKE ?2 || '%')
                     ORDER BY updated_at ASC, id ASC LIMIT ?3",
                )?;
                let mapped = stmt.query_map(
                    params![PROTECTED_PREFIX, ITEM_PREFIX, excess as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                mapped.collect::<Result<_, _>>()?
            };
            for (id, search) in victims {
                if self.fts {
                    fts_delete(tx, id, &search)?;
                }
                tx.execute("DELETE FROM vault_entries WHERE id = ?1", params![id])?;
            }
        }
        Ok(())
    }
}

// ─── Row plumbing ─────────────────────────────────────────────────────────────

struct NewEntry<'a> {
    kind: EntryKind,
    key: Option<&'a str>,
    value: Option<&'a str>,
    tool: Option<&'a str>,
    tool_call_id: Option<&'a str>,
    content: Option<&'a str>,
    snippet: Option<&'a str>,
    project_dir: Option<&'a str>,
}

fn insert_entry(
    tx: &rusqlite::Transaction<'_>,
    fts: bool,
    e: &NewEntry<'_>,
) -> Result<i64, VaultError> {
    let now = now_rfc3339();
    let search: String = [e.key, e.value, e.tool, e.content, e.snippet]
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    tx.execute(
        "INSERT INTO vault_entries
            (kind, created_at, updated_at, key, value, tool, tool_call_id,
             content, snippet, project_dir, search_text)
         VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            e.kind.as_str(),
            now,
            e.key,
            e.value,
            e.tool,
            e.tool_call_id,
            e.content,
            e.snippet,
            e.project_dir,
            search,
        ],
    )?;
    let id = tx.last_insert_rowid();
    if fts {
        fts_insert(tx, id, &search)?;
    }
    Ok(id)
}

fn archive_one(
    tx: &rusqlite::Transaction<'_>,
    fts: bool,
    opts: &VaultOptions,
    tool_call_id: &str,
    tool_name: &str,
    content: &str,
) -> Result<bool, VaultError> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT id FROM vault_entries WHERE tool_call_id = ?1 LIMIT 1",
            params![tool_call_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(ignore_no_rows)?;
    if exists.is_some() {
        return Ok(false);
    }
    let snippet: String = content
        .lines()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SNIPPET_LEN)
        .collect();
    insert_entry(
        tx,
        fts,
        &NewEntry {
            kind: EntryKind::Tool,
            key: Some(tool_name),
            value: None,
            tool: Some(tool_name),
            tool_call_id: Some(tool_call_id),
            content: Some(content),
            snippet: Some(&snippet),
            project_dir: opts.project_dir.as_deref(),
        },
    )?;
    Ok(true)
}

fn fts_insert(conn: &Connection, id: i64, search: &str) -> Result<(), VaultError> {
    conn.execute(
        "INSERT INTO vault_fts(rowid, search_text) VALUES (?1, ?2)",
        params![id, search],
    )?;
    Ok(())
}

fn fts_delete(conn: &Connection, id: i64, search: &str) -> Result<(), VaultError> {
    conn.execute(
        "INSERT INTO vault_fts(vault_fts, rowid, search_text) VALUES ('delete', ?1, ?2)",
        params![id, search],
    )?;
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<VaultEntry> {
    let kind_str: String = row.get(1)?;
    Ok(VaultEntry {
        id: row.get(0)?,
        kind: EntryKind::parse(&kind_str).unwrap_or(EntryKind::Note),
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        key: row.get(4)?,
        value: row.get(5)?,
        tool: row.get(6)?,
        tool_call_id: row.get(7)?,
        content: row.get(8)?,
        snippet: row.get(9)?,
        project_dir: row.get(10)?,
    })
}

fn ignore_no_rows<T>(e: rusqlite::Error) -> Result<Option<T>, rusqlite::Error> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Entry ranking tier: 0 same-project, 1 unscoped, 2 other-project.
fn tier(entry: &VaultEntry, session_project: Option<&str>) -> u8 {
    match (&entry.project_dir, session_project) {
        (Some(dir), Some(cwd)) if cwd == dir || cwd.starts_with(dir.as_str()) => 0,
        (None, _) => 1,
        (Some(_), None) => 2,
        (Some(_), Some(_)) => 2,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::open_in_memory(VaultOptions {
            project_dir: Some("/work/proj".into()),
            ..VaultOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn note_then_latest_round_trip() {
        let v = vault();
        v.note("current_task", "fix the parser").unwrap();
        let e = v.latest_by_key("current_task", None).unwrap().unwrap();
        assert_eq!(e.value.as_deref(), Some("fix the parser"));
        assert_eq!(e.kind, EntryKind::Note);
        assert_eq!(e.project_dir.as_deref(), Some("/work/proj"));
    }

    #[test]
    fn upsert_replaces_newest_value() {
        let v = vault();
        v.upsert_note("k", "v1", EntryKind::Note).unwrap();
        v.upsert_note("k", "v2", EntryKind::Note).unwrap();
        let e = v.latest_by_key("k", None).unwrap().unwrap();
        assert_eq!(e.value.as_deref(), Some("v2"));
        assert_eq!(v.count().unwrap(), 1, "upsert must not grow the table");
    }

    #[test]
    fn archive_is_idempotent_on_call_id() {
        let v = vault();
        assert!(v.archive_tool_message("call-1", "read_file", "body").unwrap());
        assert!(!v.archive_tool_message("call-1", "read_file", "body").unwrap());
        assert_eq!(v.count().unwrap(), 1);
    }

    #[test]
    fn archive_batch_single_transaction_skips_duplicates() {
        let v = vault();
        v.archive_tool_message("a", "exec", "x").unwrap();
        let batch = vec![
            ("a".to_string(), "exec".to_string(), "x".to_string()),
            ("b".to_string(), "exec".to_string(), "y".to_string()),
            ("c".to_string(), "read_file".to_string(), "z".to_string()),
        ];
        assert_eq!(v.archive_tool_messages(&batch).unwrap(), 2);
        assert_eq!(v.count().unwrap(), 3);
    }

    #[test]
    fn archived_entry_gets_snippet() {
        let v = vault();
        let long = "line one\n".repeat(100);
        v.archive_tool_message("c1", "exec", &long).unwrap();
        let found = v.search("line", 5).unwrap();
        assert!(!found.is_empty());
        let snippet = found[0].snippet.as_deref().unwrap();
        assert!(snippet.len() <= SNIPPET_LEN);
        assert!(!snippet.contains('\n'));
    }

    #[test]
    fn delete_by_key_prefix_counts() {
        let v = vault();
        v.note("task:1", "a").unwrap();
        v.note("task:2", "b").unwrap();
        v.note("other", "c").unwrap();
        assert_eq!(v.delete_by_key_prefix("task:").unwrap(), 2);
        assert_eq!(v.count().unwrap(), 1);
    }

    #[test]
    fn search_finds_archived_content() {
        let v = vault();
        v.archive_tool_message("c1", "search_files", "fn parse_header in src/http.rs")
            .unwrap();
        v.note("unrelated", "nothing here").unwrap();
        let hits = v.search("parse_header", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool.as_deref(), Some("search_files"));
    }

    #[test]
    fn search_ranks_same_project_first() {
        let v = Vault::open_in_memory(VaultOptions {
            project_dir: Some("/work/proj".into()),
            ..VaultOptions::default()
        })
        .unwrap();
        // Other-project entry inserted directly.
        {
            let mut conn = v.conn.lock().unwrap();
            let tx = conn.transaction().unwrap();
            insert_entry(
                &tx,
                v.fts,
                &NewEntry {
                    kind: EntryKind::Note,
                    key: Some("elsewhere"),
                    value: Some("shared search token"),
                    tool: None,
                    tool_call_id: None,
                    content: None,
                    snippet: None,
                    project_dir: Some("/other/place"),
                },
            )
            .unwrap();
            tx.commit().unwrap();
        }
        v.note("local", "shared search token").unwrap();
        let hits = v.search("shared token", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].project_dir.as_deref(), Some("/work/proj"));
        assert_eq!(hits[1].project_dir.as_deref(), Some("/other/place"));
    }

    #[test]
    fn empty_query_returns_nothing() {
        let v = vault();
        v.note("k", "v").unwrap();
        assert!(v.search("   ", 10).unwrap().is_empty());
    }

    // ── Retention (spec scenario 6) ──────────────────────────────────────────

    #[test]
    fn item_entries_capped_per_project_oldest_dropped() {
        let v = Vault::open_in_memory(VaultOptions {
            project_dir: Some("/p".into()),
            max_entries: 500,
            items_per_project: 20,
        })
        .unwrap();
        for i in 0..25 {
            v.note(&format!("artifact:review:item:proj:{i:03}"), "review item")
                .unwrap();
        }
        let remaining: Vec<_> = (0..25)
            .filter_map(|i| {
                v.latest_by_key(&format!("artifact:review:item:proj:{i:03}"), None)
                    .unwrap()
            })
            .collect();
        assert_eq!(remaining.len(), 20, "oldest 5 item entries must be pruned");
        // The oldest five are gone; the newest survive.
        assert!(v
            .latest_by_key("artifact:review:item:proj:000", None)
            .unwrap()
            .is_none());
        assert!(v
            .latest_by_key("artifact:review:item:proj:024", None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn lru_prunes_notes_never_artifacts() {
        let v = Vault::open_in_memory(VaultOptions {
            project_dir: Some("/p".into()),
            max_entries: 500,
            items_per_project: 20,
        })
        .unwrap();
        v.note("artifact:review:latest:proj", "protected").unwrap();
        for i in 0..25 {
            v.note(&format!("artifact:review:item:proj:{i:03}"), "item")
                .unwrap();
        }
        for i in 0..600 {
            v.note(&format!("note:{i}"), "filler").unwrap();
        }
        assert!(v.count().unwrap() <= 500);
        assert!(
            v.latest_by_key("artifact:review:latest:proj", None)
                .unwrap()
                .is_some(),
            "protected latest artifact must survive"
        );
        // All 20 retained item entries survive the LRU pass.
        let items: Vec<_> = (5..25)
            .filter_map(|i| {
                v.latest_by_key(&format!("artifact:review:item:proj:{i:03}"), None)
                    .unwrap()
            })
            .collect();
        assert_eq!(items.len(), 20);
    }

    #[test]
    fn corrupt_store_is_quarantined_and_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        std::fs::write(&path, b"definitely not a sqlite file, padded to look real enough")
            .unwrap();
        let v = Vault::open(&path, VaultOptions::default()).unwrap();
        v.note("k", "v").unwrap();
        assert_eq!(v.count().unwrap(), 1);
        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt-"));
        assert!(quarantined, "corrupt file must be renamed, not deleted");
    }
}
