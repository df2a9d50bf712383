// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The turn orchestrator and its supporting machinery: conversation state,
//! budget-driven compaction, the tool-loop guard, the hook bus, plan mode,
//! and the serialized sub-agent queue.

mod agent;
mod compact;
mod digest;
mod error;
mod events;
mod guard;
mod harness;
mod plan;
mod session;
mod subagent;
mod toolcalls;

pub use agent::{Agent, AgentOptions, AskOutcome, TurnMetrics};
pub use compact::{CompactionOptions, CompactionOutcome, CompactionState};
pub use error::AgentError;
pub use events::{HookBus, HookEvent, HookHandler, LoopSeverity};
pub use guard::{GuardDecision, GuardStats, ToolLoopGuard};
pub use harness::Harness;
pub use plan::{PlanQueue, PlanStep};
pub use session::Session;
pub use subagent::{SpawnTaskTool, SubAgentQueue};
