// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use idlehands_config::{ApprovalMode, Config};
use idlehands_core::{Agent, AgentOptions, HookBus, HookEvent, SpawnTaskTool, SubAgentQueue};
use idlehands_model::{ChatClient, HttpChatClient, HttpClientOptions};
use idlehands_tools::{register_builtins, AllowAll, BackupManager, DenyAll, ToolEnv, ToolRegistry};
use idlehands_vault::{Vault, VaultOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = idlehands_config::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli)?;
    let config = Arc::new(config);

    let client = build_client(&config);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml_string(&config));
                return Ok(());
            }
            Commands::ListModels => {
                for model in client.models().await.context("listing models")? {
                    println!("{model}");
                }
                return Ok(());
            }
        }
    }

    // Auto-pick the first served model when none is configured.
    if client.model().is_empty() {
        let models = client
            .models()
            .await
            .context("no model configured and the endpoint did not list any")?;
        let first = models
            .first()
            .context("no model configured and the endpoint serves none")?;
        tracing::info!(model = %first, "auto-picked model");
        client.set_model(first);
    }

    let instruction = match cli.instruction_text() {
        Some(t) => t,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading instruction from stdin")?;
            buf.trim().to_string()
        }
    };
    anyhow::ensure!(!instruction.is_empty(), "no instruction given");

    let mut agent = build_agent(client, Arc::clone(&config), &cli)?;
    let outcome = agent.ask(&instruction).await?;
    // Deltas were already streamed by the stdout hook; close the line.
    println!();
    tracing::info!(
        turns = outcome.turns,
        tool_calls = outcome.tool_calls,
        "ask complete"
    );
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn apply_overrides(config: &mut Config, cli: &Cli) -> anyhow::Result<()> {
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint.base_url = endpoint.clone();
    }
    if let Some(model) = &cli.model {
        config.endpoint.model = model.clone();
    }
    if let Some(mode) = &cli.approval_mode {
        config.agent.approval_mode = match mode.as_str() {
            "plan" => ApprovalMode::Plan,
            "reject" => ApprovalMode::Reject,
            "default" => ApprovalMode::Default,
            "auto-edit" => ApprovalMode::AutoEdit,
            "yolo" => ApprovalMode::Yolo,
            other => anyhow::bail!("unknown approval mode: {other}"),
        };
    }
    if cli.no_confirm {
        config.agent.no_confirm = true;
    }
    Ok(())
}

fn build_client(config: &Config) -> Arc<HttpChatClient> {
    Arc::new(HttpChatClient::new(HttpClientOptions {
        base_url: config.endpoint.base_url.clone(),
        model: config.endpoint.model.clone(),
        api_key: config.endpoint.resolve_api_key(),
        connection_timeout: Duration::from_secs(config.endpoint.connection_timeout),
        initial_connection_timeout: Duration::from_secs(config.endpoint.initial_connection_timeout),
        read_timeout: Duration::from_secs(config.endpoint.response_timeout),
        stream_fallback: config.endpoint.stream_fallback,
        compat_patterns_file: config.endpoint.compat_patterns_file.clone(),
    }))
}

fn build_agent(
    client: Arc<HttpChatClient>,
    config: Arc<Config>,
    cli: &Cli,
) -> anyhow::Result<Agent> {
    let cwd = match &cli.cwd {
        Some(d) => d.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let state_dir = config.tools.resolve_state_dir();

    let vault = if config.vault.enabled && config.vault.mode != idlehands_config::VaultMode::Off {
        let path = config
            .vault
            .path
            .clone()
            .unwrap_or_else(|| state_dir.join("vault.db"));
        let vault = Vault::open(
            &path,
            VaultOptions {
                project_dir: Some(cwd.display().to_string()),
                max_entries: config.vault.max_entries,
                items_per_project: config.vault.immutable_review_artifacts_per_project,
            },
        )
        .context("opening the vault")?;
        Some(Arc::new(vault))
    } else {
        None
    };

    let mut env = ToolEnv::new(
        cwd,
        BackupManager::new(state_dir.join("backups"), config.tools.backup_retention),
    );
    env.allowed_write_roots = config.tools.allowed_write_roots.clone();
    env.sys_mode = config.tools.sys_mode;
    env.no_confirm = config.agent.no_confirm;
    // Headless runs have no confirmation UI: cautious actions are denied
    // unless --no-confirm (or yolo) says otherwise.
    env.confirmer = if config.agent.no_confirm {
        Arc::new(AllowAll)
    } else {
        Arc::new(DenyAll)
    };
    env.exec_timeout = config.tools.exec_timeout;
    env.vault = vault.clone();
    env.set_approval_mode(config.agent.approval_mode);
    let env = Arc::new(env);

    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry, Arc::clone(&env));
    if config.sub_agents.enabled {
        registry.register(SpawnTaskTool::new(
            client.clone() as Arc<dyn ChatClient>,
            Arc::clone(&config),
            Arc::clone(&env),
            vault.clone(),
            Arc::new(SubAgentQueue::new()),
        ));
    }

    let mut hooks = HookBus::new();
    hooks.register_fn(|event| {
        if let HookEvent::TextDelta(delta) = event {
            use std::io::Write;
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    });

    Ok(Agent::new(
        client as Arc<dyn ChatClient>,
        Arc::new(registry),
        env,
        config,
        vault,
        Arc::new(hooks),
        AgentOptions::default(),
    ))
}

fn serde_yaml_string(config: &Config) -> String {
    serde_yaml::to_string(config).unwrap_or_default()
}
