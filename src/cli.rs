// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "idlehands",
    about = "A coding-agent runtime for OpenAI-compatible endpoints",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG controls the filter; default info)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Endpoint base URL override, e.g. http://localhost:8080/v1
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Model id override (empty → auto-pick the first served model)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Approval mode: plan | reject | default | auto-edit | yolo
    #[arg(long)]
    pub approval_mode: Option<String>,

    /// Bypass all confirmation prompts
    #[arg(long)]
    pub no_confirm: bool,

    /// Working directory for the session (default: current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// The instruction to run.  Reads stdin when omitted.
    pub instruction: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the merged configuration and exit
    ShowConfig,
    /// List the models the endpoint currently serves
    ListModels,
}

impl Cli {
    pub fn instruction_text(&self) -> Option<String> {
        if self.instruction.is_empty() {
            None
        } else {
            Some(self.instruction.join(" "))
        }
    }
}
