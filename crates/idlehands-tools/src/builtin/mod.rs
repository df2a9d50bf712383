// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
pub mod apply_patch;
pub mod edit;
pub mod exec;
pub mod list_dir;
pub mod read_file;
pub mod search_files;
pub mod sys_context;
pub mod vault_tools;
pub mod write_file;

use std::path::Path;

use idlehands_config::ApprovalMode;

use crate::env::ToolEnv;
use crate::safety::{screen_path, SafetyVerdict};
use crate::tool::{ToolError, ToolErrorCode};

/// Gate a filesystem mutation on the path safety tier.
///
/// Forbidden paths never run.  Cautious paths prompt through the session's
/// confirmation provider unless `no_confirm` is set or the approval mode
/// already grants edit autonomy (auto-edit / yolo).
pub(crate) async fn gate_path_mutation(
    env: &ToolEnv,
    action: &str,
    path: &Path,
) -> Result<(), ToolError> {
    match screen_path(path) {
        SafetyVerdict::Ok => Ok(()),
        SafetyVerdict::Forbidden { reason } => Err(ToolError::new(
            ToolErrorCode::Forbidden,
            format!("{action} blocked: {reason}"),
        )),
        SafetyVerdict::Cautious { reason } => {
            let mode = env.approval_mode();
            if env.no_confirm
                || matches!(mode, ApprovalMode::AutoEdit | ApprovalMode::Yolo)
            {
                return Ok(());
            }
            if env.confirmer.confirm(action, &reason).await {
                Ok(())
            } else {
                Err(ToolError::new(
                    ToolErrorCode::CautiousDenied,
                    format!("{action} denied by user: {reason}"),
                )
                .with_hint("explain why the change is needed, or choose a safer target"))
            }
        }
    }
}
