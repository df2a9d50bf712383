// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Pre-mutation backups and atomic writes.
//!
//! Layout: `<state_dir>/backups/<sha256(abs_path)>/<ISO-timestamp>.bak`
//! with a `.meta.json` sidecar recording the original path, size, and
//! content hash.  Retention is FIFO per file.  A `.gitignore` containing
//! `*` is created in the backups root so stray repos never pick them up.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::tool::{ToolError, ToolErrorCode};

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupMeta {
    pub original_path: String,
    pub timestamp: String,
    pub size: u64,
    pub sha256_before: String,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    retain: usize,
}

impl BackupManager {
    pub fn new(root: PathBuf, retain: usize) -> Self {
        Self { root, retain }
    }

    /// Directory holding all backups of one file.
    fn dir_for(&self, abs_path: &Path) -> PathBuf {
        let digest = Sha256::digest(abs_path.to_string_lossy().as_bytes());
        self.root.join(hex::encode(digest))
    }

    /// Snapshot `path` before a mutation.  Missing files produce no backup
    /// (there is nothing to restore).  Returns the backup file path.
    pub fn backup(&self, path: &Path) -> Result<Option<PathBuf>, ToolError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ToolError::new(
                    ToolErrorCode::Io,
                    format!("backup read failed for {}: {e}", path.display()),
                ))
            }
        };

        self.ensure_root()?;
        let dir = self.dir_for(path);
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string();
        let bak = dir.join(format!("{stamp}.bak"));
        std::fs::write(&bak, &bytes).map_err(io_err)?;

        let meta = BackupMeta {
            original_path: path.to_string_lossy().into_owned(),
            timestamp: stamp.clone(),
            size: bytes.len() as u64,
            sha256_before: hex::encode(Sha256::digest(&bytes)),
        };
        let sidecar = dir.join(format!("{stamp}.meta.json"));
        std::fs::write(
            &sidecar,
            serde_json::to_vec_pretty(&meta).map_err(|e| {
                ToolError::new(ToolErrorCode::Internal, format!("meta encode: {e}"))
            })?,
        )
        .map_err(io_err)?;

        self.prune(&dir)?;
        debug!(path = %path.display(), backup = %bak.display(), "backup written");
        Ok(Some(bak))
    }

    /// FIFO retention: keep the newest `retain` backups of a file.
    /// Timestamped names sort chronologically, so lexical order suffices.
    fn prune(&self, dir: &Path) -> Result<(), ToolError> {
        let mut baks: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "bak"))
            .collect();
        baks.sort();
        if baks.len() > self.retain {
            let excess = baks.len() - self.retain;
            for bak in baks.into_iter().take(excess) {
                let _ = std::fs::remove_file(&bak);
                let _ = std::fs::remove_file(bak.with_extension("meta.json"));
            }
        }
        Ok(())
    }

    fn ensure_root(&self) -> Result<(), ToolError> {
        std::fs::create_dir_all(&self.root).map_err(io_err)?;
        let gitignore = self.root.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n").map_err(io_err)?;
        }
        Ok(())
    }
}

/// Write `contents` to `path` atomically: write to a temp file in the same
/// directory, copy the original permissions, then rename over the target.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), ToolError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let original_perms = std::fs::metadata(path).ok().map(|m| m.permissions());

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into()),
        std::process::id()
    ));
    std::fs::write(&tmp, contents).map_err(io_err)?;
    if let Some(perms) = original_perms {
        let _ = std::fs::set_permissions(&tmp, perms);
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        io_err(e)
    })?;
    Ok(())
}

fn io_err(e: std::io::Error) -> ToolError {
    ToolError::new(ToolErrorCode::Io, e.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
