// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool registry, argument validation, safety screening, backups, and the
//! built-in tool set.
//!
//! Tools are self-contained: each holds an [`Arc<ToolEnv>`] carrying the
//! session's working directory, write scope, confirmation provider, backup
//! manager, and abort signal.  The registry validates arguments against
//! each tool's JSON schema before dispatch.

pub mod backups;
pub mod builtin;
mod env;
mod registry;
pub mod safety;
mod tool;

pub use backups::BackupManager;
pub use env::{AbortSignal, AllowAll, Confirmer, DenyAll, ToolEnv};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

pub use builtin::apply_patch::ApplyPatchTool;
pub use builtin::edit::{EditFileTool, EditRangeTool, InsertFileTool};
pub use builtin::exec::ExecTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::{ReadFileTool, ReadFilesTool};
pub use builtin::search_files::SearchFilesTool;
pub use builtin::sys_context::SysContextTool;
pub use builtin::vault_tools::{VaultNoteTool, VaultSearchTool};
pub use builtin::write_file::WriteFileTool;

use std::sync::Arc;

/// Register the full built-in tool set against one shared environment.
pub fn register_builtins(registry: &mut ToolRegistry, env: Arc<ToolEnv>) {
    registry.register(ReadFileTool::new(env.clone()));
    registry.register(ReadFilesTool::new(env.clone()));
    registry.register(ListDirTool::new(env.clone()));
    registry.register(SearchFilesTool::new(env.clone()));
    registry.register(SysContextTool::new(env.clone()));
    registry.register(WriteFileTool::new(env.clone()));
    registry.register(EditFileTool::new(env.clone()));
    registry.register(EditRangeTool::new(env.clone()));
    registry.register(InsertFileTool::new(env.clone()));
    registry.register(ApplyPatchTool::new(env.clone()));
    registry.register(ExecTool::new(env.clone()));
    registry.register(VaultNoteTool::new(env.clone()));
    registry.register(VaultSearchTool::new(env));
}
