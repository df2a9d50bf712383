// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    AgentConfig, ApprovalMode, CompactionConfig, Config, EndpointConfig, StalePolicy,
    SubAgentConfig, ToolLoopConfig, ToolsConfig, VaultConfig, VaultMode,
};
