use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ember_core::{
    resolve_ember_paths, ConfigStore, EmberPaths, EngineError, PermissionDecision, WorkflowStage,
    DEFAULT_DAEMON_HOST, DEFAULT_DAEMON_PORT,
};
use ember_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use ember_server::{build_state, serve, AppState};
use ember_types::ToolResult;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "emberd")]
#[command(about = "Ember local agent daemon")]
struct Cli {
    /// Project-level JSON config layered over the global one.
    #[arg(long, global = true, env = "EMBER_CONFIG")]
    config: Option<PathBuf>,
    /// State root for backups, logs and conversation history.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    text_url: Option<String>,
    #[arg(long, global = true)]
    vision_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP daemon until interrupted.
    Serve {
        #[arg(long, alias = "hostname")]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Handle one request in the foreground and print the outcome.
    Run {
        message: String,
        #[arg(long = "attach")]
        attached_files: Vec<PathBuf>,
        /// Approve the plan if it asks for confirmation.
        #[arg(long, short = 'y', default_value_t = false)]
        yes: bool,
    },
    /// Execute a single tool, either `--name` with `--args` or a full
    /// `{"tool": ..., "args": {...}}` document via `--json` (inline, `@file` or `-`).
    Tool {
        #[arg(long, conflicts_with = "json")]
        name: Option<String>,
        #[arg(long, requires = "name")]
        args: Option<String>,
        #[arg(long)]
        json: Option<String>,
        #[arg(long, short = 'y', default_value_t = false)]
        yes: bool,
    },
    /// Probe both model backends and print their state.
    Status,
    /// Print the effective config. `--set` merges a JSON patch into the
    /// project file given by `--config`.
    Config {
        #[arg(long)]
        set: Option<String>,
    },
    /// List snapshots persisted under the backup directory, or restore one
    /// by id.
    Snapshots {
        #[arg(long)]
        restore: Option<String>,
    },
    /// Remove backups older than the retention window.
    Cleanup {
        #[arg(long)]
        days: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths(cli.state_dir.clone())?;
    let process = match cli.command {
        Command::Serve { .. } => ProcessKind::Daemon,
        _ => ProcessKind::Cli,
    };
    let logs_dir = canonical_logs_dir_from_root(&paths.root);
    let (_log_guard, log_info) = init_process_logging(process, &logs_dir, 14)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("logging initialized: {:?}", log_info);
    let overrides = cli_overrides(&cli);

    match cli.command {
        Command::Serve { host, port } => {
            let overrides = build_cli_overrides(
                host.as_deref(),
                port,
                cli.text_url.as_deref(),
                cli.vision_url.as_deref(),
            );
            let config = ConfigStore::new(cli.config, overrides).await?;
            let state = build_state(config, &paths).await?;
            let addr: SocketAddr = format!(
                "{}:{}",
                state.settings.daemon.host, state.settings.daemon.port
            )
            .parse()
            .context("invalid host or port")?;
            log_startup_paths(&paths, &addr, &state);
            state.router.probe_all().await;
            serve(addr, state).await?;
        }
        Command::Run {
            message,
            attached_files,
            yes,
        } => {
            let state = cli_state(&overrides, cli.config, &paths).await?;
            if !state.router.probe_all().await {
                tracing::warn!("no model backend answered the startup probe");
            }
            let mut outcome = state
                .orchestrator
                .process_request(&message, &attached_files)
                .await?;
            if outcome.status == WorkflowStage::AwaitingConfirmation {
                eprintln!(
                    "confirmation required: {}",
                    outcome.plan.confirmation_message
                );
                outcome = state
                    .orchestrator
                    .confirm_and_execute(&outcome.task_id, yes)
                    .await?;
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Tool {
            name,
            args,
            json,
            yes,
        } => {
            let state = cli_state(&overrides, cli.config, &paths).await?;
            let payload = match (name, json) {
                (Some(name), _) => {
                    let args = match args {
                        Some(raw) => read_json_arg(&raw)?,
                        None => json!({}),
                    };
                    json!({"tool": name, "args": args})
                }
                (None, Some(raw)) => read_json_arg(&raw)?,
                (None, None) => anyhow::bail!("pass --name or --json"),
            };
            let tool = payload
                .get("tool")
                .or_else(|| payload.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                anyhow::bail!("tool is required in input json");
            }
            let args = payload.get("args").cloned().unwrap_or_else(|| json!({}));
            let result = run_tool(&state, &tool, args, yes).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Status => {
            let state = cli_state(&overrides, cli.config, &paths).await?;
            state.router.probe_all().await;
            let status = state.orchestrator.get_status().await;
            let output = json!({
                "status": status,
                "backends": state.router.backend_stats().await,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Config { set } => {
            let config = ConfigStore::new(cli.config, overrides).await?;
            if let Some(raw) = set {
                let patch = read_json_arg(&raw)?;
                if !patch.is_object() {
                    anyhow::bail!("config patch must be a JSON object");
                }
                config.patch_project(patch).await?;
            }
            let output = json!({
                "effective": config.get_effective_value().await,
                "layers": config.get_layers_value().await,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Snapshots { restore } => {
            let state = cli_state(&overrides, cli.config, &paths).await?;
            let output = match restore {
                Some(id) => {
                    let snapshot = state.tasks().restore_persisted_snapshot(&id).await?;
                    json!({"status": "restored", "snapshot": snapshot})
                }
                None => json!({"snapshots": state.tasks().list_persisted_snapshots().await?}),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Cleanup { days } => {
            let state = cli_state(&overrides, cli.config, &paths).await?;
            let days = days.unwrap_or(state.settings.daemon.backup_retention_days);
            let removed = state.tasks().cleanup_old_backups(days).await?;
            println!("removed {removed} backup(s) older than {days} day(s)");
        }
    }
    Ok(())
}

fn cli_overrides(cli: &Cli) -> Option<Value> {
    build_cli_overrides(
        None,
        None,
        cli.text_url.as_deref(),
        cli.vision_url.as_deref(),
    )
}

async fn cli_state(
    overrides: &Option<Value>,
    config_path: Option<PathBuf>,
    paths: &EmberPaths,
) -> anyhow::Result<AppState> {
    let config = ConfigStore::new(config_path, overrides.clone()).await?;
    build_state(config, paths).await
}

/// Same gate as the HTTP tool route: permissions first, then confirmation.
async fn run_tool(
    state: &AppState,
    tool: &str,
    args: Value,
    confirmed: bool,
) -> anyhow::Result<ToolResult> {
    let manifest = state
        .registry()
        .manifest(tool)
        .await
        .ok_or_else(|| EngineError::from(ember_tools::CapabilityError::UnknownTool(tool.to_string())))?;
    let permissions = state.orchestrator.permissions();
    if let PermissionDecision::Deny { reason } = permissions.check(&manifest, &args) {
        return Err(EngineError::PermissionDenied(reason).into());
    }
    if !confirmed && permissions.requires_confirmation(&manifest, &args) {
        anyhow::bail!(
            "{} (pass --yes to proceed)",
            permissions.confirmation_message(&manifest, &args)
        );
    }
    let started = Instant::now();
    let elapsed = || started.elapsed().as_millis() as u64;
    Ok(match state.registry().execute(tool, args).await {
        Ok(value) => ember_tools::payload_result(tool, value, elapsed()),
        Err(err) => ToolResult::failed(tool, err.kind(), err.to_string(), elapsed()),
    })
}

fn build_cli_overrides(
    host: Option<&str>,
    port: Option<u16>,
    text_url: Option<&str>,
    vision_url: Option<&str>,
) -> Option<Value> {
    let mut root = Map::new();
    let mut daemon = Map::new();
    if let Some(host) = host {
        daemon.insert("host".to_string(), json!(host));
    }
    if let Some(port) = port {
        daemon.insert("port".to_string(), json!(port));
    }
    if !daemon.is_empty() {
        root.insert("daemon".to_string(), Value::Object(daemon));
    }
    let mut backends = Map::new();
    if let Some(url) = text_url {
        backends.insert("text_url".to_string(), json!(url));
    }
    if let Some(url) = vision_url {
        backends.insert("vision_url".to_string(), json!(url));
    }
    if !backends.is_empty() {
        root.insert("backends".to_string(), Value::Object(backends));
    }
    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

fn resolve_paths(flag: Option<PathBuf>) -> anyhow::Result<EmberPaths> {
    match flag {
        Some(dir) => Ok(EmberPaths::under(&dir)),
        None => resolve_ember_paths(),
    }
}

fn read_json_arg(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn log_startup_paths(paths: &EmberPaths, addr: &SocketAddr, state: &AppState) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting emberd on http://{addr}");
    info!(
        "startup paths: cwd={} state_dir={} backups={} global_config={}",
        cwd.display(),
        paths.root.display(),
        paths.backups_dir.display(),
        state.config.global_path().display()
    );
    if state.settings.daemon.host != DEFAULT_DAEMON_HOST
        || state.settings.daemon.port != DEFAULT_DAEMON_PORT
    {
        info!(
            "listening on non-default address (default {}:{})",
            DEFAULT_DAEMON_HOST, DEFAULT_DAEMON_PORT
        );
    }
}
