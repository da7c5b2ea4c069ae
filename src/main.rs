use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use unity_mcp_bridge::bridge_messages::LIST_TOOLS_METHOD;
use unity_mcp_bridge::builtin_tools::builtin_dispatcher;
use unity_mcp_bridge::config::{ENV_PORT, ENV_PROJECT_PATH};
use unity_mcp_bridge::logging::{init_logging, init_stderr_logging};
use unity_mcp_bridge::mcp_server::UnityBridgeMcpServer;
use unity_mcp_bridge::unity_project_manager::is_process_alive;
use unity_mcp_bridge::{
    BridgeServer, ClientConfig, DiscoveryClient, DiscoveryTarget, LockCoordinator, LockMarker,
    PortPolicy, ServerConfig, UnityProjectManager,
};
use unity_mcp_bridge::{info_log, warn_log};

/// Bridge between tool-calling assistants and a running Unity Editor
#[derive(Parser, Debug)]
#[command(name = "unity-mcp-bridge")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Connect to this port on 127.0.0.1 instead of looking it up
    #[arg(long, global = true, conflicts_with = "project_path")]
    port: Option<u16>,

    /// Unity project to talk to, resolved like `cd` (defaults to UNITY_PROJECT_PATH, then the
    /// current directory)
    #[arg(long, global = true)]
    project_path: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MCP server on stdio
    Mcp,

    /// Call a single editor tool and print its result
    Call {
        /// Tool name
        method: String,

        /// Parameters as a JSON value
        #[arg(long)]
        params: Option<String>,

        /// Timeout in seconds, covering the wait for the editor
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List the tools the editor exposes
    Tools,

    /// Show the port record and lock markers of a project
    Status,

    /// Remove stale lock markers left behind by a killed editor
    ClearLocks {
        /// Remove every marker, stale or not
        #[arg(long)]
        all: bool,
    },

    /// Host a bridge server with the built-in tools (ping, echo)
    ServeBridge {
        /// Listen on exactly this port instead of an ephemeral one
        #[arg(long)]
        listen_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        // stdout belongs to the MCP protocol
        Commands::Mcp => init_logging(),
        _ => init_stderr_logging(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        }),
    }

    match &cli.command {
        Commands::Mcp => run_mcp(&cli).await,
        Commands::Call {
            method,
            params,
            timeout,
        } => run_call(&cli, method, params.as_deref(), *timeout).await,
        Commands::Tools => run_call(&cli, LIST_TOOLS_METHOD, None, None).await,
        Commands::Status => run_status(&cli),
        Commands::ClearLocks { all } => run_clear_locks(&cli, *all),
        Commands::ServeBridge { listen_port } => run_serve_bridge(&cli, *listen_port).await,
    }
}

/// Works out what to connect to from the flags, then the environment, then the working directory
fn resolve_target(cli: &Cli) -> Result<DiscoveryTarget> {
    if let Some(port) = cli.port {
        return Ok(DiscoveryTarget::Port(port));
    }
    if cli.project_path.is_some() || std::env::var_os(ENV_PROJECT_PATH).is_some() {
        let project = resolve_project(cli)?;
        return Ok(DiscoveryTarget::ProjectPath(project.project_path().to_path_buf()));
    }
    if let Some(port) = std::env::var(ENV_PORT).ok().and_then(|value| value.trim().parse().ok()) {
        return Ok(DiscoveryTarget::Port(port));
    }
    let project = resolve_project(cli)?;
    Ok(DiscoveryTarget::ProjectPath(project.project_path().to_path_buf()))
}

fn resolve_project(cli: &Cli) -> Result<UnityProjectManager> {
    let argument = match &cli.project_path {
        Some(path) => path.clone(),
        None => std::env::var_os(ENV_PROJECT_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let project = UnityProjectManager::from_argument(&argument)
        .with_context(|| format!("Failed to resolve project path '{}'", argument.display()))?;
    if !project.is_unity_project() {
        bail!("Not a Unity project: {}", project.project_path().display());
    }
    Ok(project)
}

async fn run_mcp(cli: &Cli) -> Result<()> {
    let target = resolve_target(cli)?;
    info_log!("Starting MCP server v{} for {}", env!("CARGO_PKG_VERSION"), target);

    let client = Arc::new(DiscoveryClient::start(target, ClientConfig::from_env()));
    let server = UnityBridgeMcpServer::new(Arc::clone(&client));

    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    client.shutdown().await;
    info_log!("MCP server shutting down");
    Ok(())
}

async fn run_call(cli: &Cli, method: &str, params: Option<&str>, timeout: Option<u64>) -> Result<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(raw).context("--params is not valid JSON")?,
        None => Value::Null,
    };

    let client = DiscoveryClient::start(resolve_target(cli)?, ClientConfig::from_env());
    let result = client
        .call(method, params, timeout.map(Duration::from_secs))
        .await;
    client.shutdown().await;

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(error) => {
            eprintln!("{}", serde_json::to_string_pretty(&error)?);
            Err(anyhow!(error))
        }
    }
}

fn run_status(cli: &Cli) -> Result<()> {
    let project = resolve_project(cli)?;
    println!("Project: {}", project.project_path().display());

    match project.read_port_record() {
        Ok(record) => {
            let alive = if is_process_alive(record.process_id) {
                "running"
            } else {
                "not running"
            };
            println!(
                "Port record: port {} written by process {} ({}) at {}",
                record.port, record.process_id, alive, record.timestamp
            );
        }
        Err(e) => println!("Port record: {}", e),
    }

    let locks = LockCoordinator::for_project(&project);
    let markers = locks.active_markers();
    if markers.is_empty() {
        println!("Lock markers: none");
    }
    for info in markers {
        println!(
            "Lock marker: {:?} owned by {:?}, {}s old{}",
            info.marker,
            info.owner_pid,
            info.age.as_secs(),
            if locks.is_stale(&info) { " (stale)" } else { "" }
        );
    }
    Ok(())
}

fn run_clear_locks(cli: &Cli, all: bool) -> Result<()> {
    let project = resolve_project(cli)?;
    let locks = LockCoordinator::for_project(&project);

    let cleared = if all {
        let active: Vec<LockMarker> = locks.active_markers().into_iter().map(|info| info.marker).collect();
        for marker in &active {
            locks.release(*marker)?;
        }
        active
    } else {
        locks.clear_stale()?
    };

    if cleared.is_empty() {
        println!("No lock markers removed");
    }
    for marker in cleared {
        println!("Removed {}", marker.file_name());
    }
    Ok(())
}

async fn run_serve_bridge(cli: &Cli, listen_port: Option<u16>) -> Result<()> {
    let project = resolve_project(cli)?;
    let mut config = ServerConfig::from_env(project.project_path());
    if let Some(port) = listen_port {
        config = config.with_port(PortPolicy::Fixed(port));
    }

    let mut server = BridgeServer::new(config, builtin_dispatcher()?);
    let port = server.start().await?;
    println!("Bridge listening on 127.0.0.1:{} for {}", port, project.project_path().display());

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    info_log!("Ctrl-C received, stopping bridge server");
    if let Err(e) = server.stop().await {
        warn_log!("Bridge server did not stop cleanly: {}", e);
    }
    Ok(())
}
