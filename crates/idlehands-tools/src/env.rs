// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use idlehands_config::ApprovalMode;
use idlehands_vault::Vault;

use crate::backups::BackupManager;
use crate::tool::{ToolError, ToolErrorCode};

/// Cooperative cancellation token plumbed through every suspension point.
///
/// Cloning is cheap; all clones observe the same signal.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolve when the signal fires.  Already-fired signals resolve
    /// immediately.
    pub async fn cancelled(&self) {
        while !self.is_aborted() {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                break;
            }
            notified.await;
        }
    }
}

/// Confirmation provider for cautious actions.
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Return `true` to let the action run.
    async fn confirm(&self, action: &str, reason: &str) -> bool;
}

/// Denies every cautious action — the safe default for headless runs.
pub struct DenyAll;

#[async_trait]
impl Confirmer for DenyAll {
    async fn confirm(&self, _action: &str, _reason: &str) -> bool {
        false
    }
}

/// Approves every cautious action — for tests and yolo embedders.
pub struct AllowAll;

#[async_trait]
impl Confirmer for AllowAll {
    async fn confirm(&self, _action: &str, _reason: &str) -> bool {
        true
    }
}

/// Shared per-session environment handed to every tool.
pub struct ToolEnv {
    pub cwd: PathBuf,
    pub allowed_write_roots: Vec<PathBuf>,
    /// Sys mode relaxes the cwd confinement for filesystem mutators.
    pub sys_mode: bool,
    approval_mode: Mutex<ApprovalMode>,
    pub no_confirm: bool,
    pub confirmer: Arc<dyn Confirmer>,
    pub backups: BackupManager,
    pub abort: AbortSignal,
    /// Shared memory store; `None` when the vault is disabled.
    pub vault: Option<Arc<Vault>>,
    pub exec_timeout: u64,
}

impl ToolEnv {
    pub fn new(cwd: PathBuf, backups: BackupManager) -> Self {
        Self {
            cwd,
            allowed_write_roots: Vec::new(),
            sys_mode: false,
            approval_mode: Mutex::new(ApprovalMode::Default),
            no_confirm: false,
            confirmer: Arc::new(DenyAll),
            backups,
            abort: AbortSignal::new(),
            vault: None,
            exec_timeout: 120,
        }
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        *self
            .approval_mode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_approval_mode(&self, mode: ApprovalMode) {
        *self
            .approval_mode
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// Resolve a tool-supplied path against the session cwd and enforce the
    /// write scope: in code mode the resolved path must live under the cwd
    /// or one of the allowed write roots; sys mode skips the confinement.
    pub fn resolve_write_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let resolved = self.resolve_path(raw);
        if self.sys_mode {
            return Ok(resolved);
        }
        let in_scope = resolved.starts_with(&self.cwd)
            || self
                .allowed_write_roots
                .iter()
                .any(|root| resolved.starts_with(root));
        if !in_scope {
            return Err(ToolError::new(
                ToolErrorCode::PathEscape,
                format!("{} is outside the session working directory", resolved.display()),
            )
            .with_hint("mutations are confined to the project; use a path under the cwd"));
        }
        Ok(resolved)
    }

    /// Resolve a path for reading: absolute paths pass through, relative
    /// paths join the cwd, `~` expands, and `.`/`..` are normalized
    /// lexically (the target may not exist yet).
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = shellexpand::tilde(raw).into_owned();
        let p = Path::new(&expanded);
        let joined = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        };
        normalize(&joined)
    }
}

/// Lexical normalization: resolve `.` and `..` without touching the
/// filesystem, so paths to not-yet-created files still normalize.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn env_at(cwd: &str) -> ToolEnv {
        let backups = BackupManager::new(PathBuf::from("/tmp/idlehands-test-backups"), 5);
        ToolEnv::new(PathBuf::from(cwd), backups)
    }

    #[test]
    fn relative_path_joins_cwd() {
        let env = env_at("/work/proj");
        assert_eq!(env.resolve_path("src/main.rs"), PathBuf::from("/work/proj/src/main.rs"));
    }

    #[test]
    fn dotdot_normalized_lexically() {
        let env = env_at("/work/proj");
        assert_eq!(env.resolve_path("src/../a.txt"), PathBuf::from("/work/proj/a.txt"));
    }

    #[test]
    fn write_outside_cwd_is_path_escape() {
        let env = env_at("/work/proj");
        let err = env.resolve_write_path("/etc/passwd").unwrap_err();
        assert_eq!(err.code, ToolErrorCode::PathEscape);
    }

    #[test]
    fn dotdot_escape_is_caught() {
        let env = env_at("/work/proj");
        let err = env.resolve_write_path("../../etc/shadow").unwrap_err();
        assert_eq!(err.code, ToolErrorCode::PathEscape);
    }

    #[test]
    fn allowed_write_root_permits_write() {
        let mut env = env_at("/work/proj");
        env.allowed_write_roots.push(PathBuf::from("/var/shared"));
        assert!(env.resolve_write_path("/var/shared/out.txt").is_ok());
    }

    #[test]
    fn sys_mode_skips_confinement() {
        let mut env = env_at("/work/proj");
        env.sys_mode = true;
        assert!(env.resolve_write_path("/etc/motd").is_ok());
    }

    #[tokio::test]
    async fn abort_signal_resolves_after_fire() {
        let sig = AbortSignal::new();
        let waiter = sig.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        sig.abort();
        assert!(handle.await.unwrap());
        assert!(sig.is_aborted());
    }

    #[tokio::test]
    async fn already_aborted_signal_resolves_immediately() {
        let sig = AbortSignal::new();
        sig.abort();
        sig.cancelled().await; // must not hang
    }
}
