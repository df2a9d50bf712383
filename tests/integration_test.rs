// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Full-stack wiring tests: config, vault, tool registry, and the agent
//! loop assembled the way the binary assembles them, driven by a scripted
//! client.

use std::sync::Arc;

use idlehands_config::{ApprovalMode, Config};
use idlehands_core::{Agent, AgentOptions, HookBus};
use idlehands_model::mock::{ScriptedClient, ScriptedTurn};
use idlehands_model::ChatClient;
use idlehands_tools::{register_builtins, BackupManager, ToolEnv, ToolRegistry};
use idlehands_vault::{Vault, VaultOptions};

fn assemble(
    dir: &std::path::Path,
    scripts: Vec<ScriptedTurn>,
    vault: Option<Arc<Vault>>,
) -> Agent {
    let mut config = Config::default();
    config.endpoint.context_window = 200_000;
    config.tools.state_dir = Some(dir.join(".state"));
    let config = Arc::new(config);

    let client = Arc::new(ScriptedClient::new(scripts));
    let mut env = ToolEnv::new(
        dir.to_path_buf(),
        BackupManager::new(dir.join(".state/backups"), 5),
    );
    env.set_approval_mode(ApprovalMode::Default);
    env.vault = vault.clone();
    let env = Arc::new(env);

    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry, Arc::clone(&env));

    Agent::new(
        client as Arc<dyn ChatClient>,
        Arc::new(registry),
        env,
        config,
        vault,
        Arc::new(HookBus::new()),
        AgentOptions::default(),
    )
}

#[tokio::test]
async fn write_then_verify_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = vec![
        ScriptedTurn::tool_call(
            "c1",
            "write_file",
            r#"{"path":"greeting.txt","content":"hello from the agent\n"}"#,
        ),
        ScriptedTurn::tool_call("c2", "read_file", r#"{"path":"greeting.txt"}"#),
        ScriptedTurn::text("Wrote and verified greeting.txt."),
    ];
    let mut agent = assemble(tmp.path(), scripts, None);
    let outcome = agent.ask("create greeting.txt").await.unwrap();

    assert_eq!(outcome.tool_calls, 2);
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("greeting.txt")).unwrap(),
        "hello from the agent\n"
    );
    assert!(agent.session().unanswered_tool_calls().is_empty());
}

#[tokio::test]
async fn review_instruction_persists_vault_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let vault = Arc::new(
        Vault::open_in_memory(VaultOptions {
            project_dir: Some(tmp.path().display().to_string()),
            ..VaultOptions::default()
        })
        .unwrap(),
    );
    let scripts = vec![ScriptedTurn::text(
        "Review complete: the error handling in parse() ignores io::ErrorKind.",
    )];
    let mut agent = assemble(tmp.path(), scripts, Some(Arc::clone(&vault)));
    agent.ask("review the parser module").await.unwrap();

    let hits = vault.search("error handling parse", 5).unwrap();
    assert!(!hits.is_empty(), "review text must be recoverable");
    let latest = hits.iter().find(|e| {
        e.key
            .as_deref()
            .is_some_and(|k| k.starts_with("artifact:review:latest:"))
    });
    assert!(latest.is_some(), "protected latest artifact must exist");
}

#[tokio::test]
async fn oversized_tool_output_archived_in_full() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("big.txt"), "data line\n".repeat(4000)).unwrap();
    let vault = Arc::new(
        Vault::open_in_memory(VaultOptions {
            project_dir: Some(tmp.path().display().to_string()),
            ..VaultOptions::default()
        })
        .unwrap(),
    );
    let scripts = vec![
        ScriptedTurn::tool_call("c1", "read_file", r#"{"path":"big.txt","limit":4000}"#),
        ScriptedTurn::text("big.txt holds repeated data lines"),
    ];
    let mut agent = assemble(tmp.path(), scripts, Some(Arc::clone(&vault)));
    agent.ask("summarize big.txt").await.unwrap();

    // The oversized read was digested into the conversation and archived
    // in full to the vault.
    let hits = vault.search("data line", 5).unwrap();
    assert!(!hits.is_empty(), "full tool output must be archived");
    assert_eq!(hits[0].tool.as_deref(), Some("read_file"));
}

#[test]
fn default_config_is_usable_without_any_files() {
    let config = Config::default();
    assert!(config.compaction.compact_at > 0.0 && config.compaction.compact_at < 1.0);
    assert!(config.vault.enabled);
    assert!(config.sub_agents.enabled);
    assert_eq!(config.agent.approval_mode, ApprovalMode::Default);
}
