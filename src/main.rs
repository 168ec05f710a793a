//! mcphub - MCP server registry CLI.
//!
//! Connects every configured server, runs one command against the registry,
//! prints the result as JSON, and shuts everything down.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use mcphub::mcp_client::config::load_config_file;
use mcphub::{Registry, RegistryOptions};

/// mcphub CLI.
#[derive(Parser)]
#[command(name = "mcphub")]
#[command(about = "Connect to MCP servers and inspect or call their tools")]
#[command(version)]
struct Cli {
    /// Explicit server configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working directory used for discovery and relative paths
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Skip project and user config discovery
    #[arg(long, global = true)]
    no_discovery: bool,

    /// Reconnect even if the configuration is unchanged
    #[arg(long, global = true)]
    force: bool,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected servers
    Servers,

    /// List every tool across all servers
    Tools,

    /// List every prompt across all servers
    Prompts,

    /// Probe all servers and print their health
    Health,

    /// Show configuration, health and identity of one server
    Info {
        /// Server name
        server: String,
    },

    /// Call a tool by id (`<server>_<tool>`)
    Call {
        /// Tool id
        tool_id: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Cancel the call after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_options(cli: &Cli) -> anyhow::Result<RegistryOptions> {
    let mut options = RegistryOptions {
        discovery: !cli.no_discovery,
        ..RegistryOptions::default()
    };
    if let Some(cwd) = &cli.cwd {
        options.cwd = cwd.clone();
    }
    if let Some(path) = &cli.config {
        options.explicit = load_config_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    Ok(options)
}

async fn run(cli: Cli, registry: &Registry) -> anyhow::Result<()> {
    registry.initialize(cli.force).await?;

    match cli.command {
        Commands::Servers => print_json(&registry.list_servers().await),
        Commands::Tools => print_json(&registry.list_tools().await),
        Commands::Prompts => print_json(&registry.list_prompts().await),
        Commands::Health => print_json(&registry.probe_health().await?),
        Commands::Info { server } => print_json(&registry.server_info(&server).await?),
        Commands::Call {
            tool_id,
            args,
            timeout_ms,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            anyhow::ensure!(arguments.is_object(), "--args must be a JSON object");

            // Without --timeout-ms the server's own request timeout applies.
            let token = CancellationToken::new();
            let deadline = timeout_ms.map(|ms| {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    token.cancel();
                })
            });

            let cancel = deadline.is_some().then_some(&token);
            let result = registry.call_tool(&tool_id, arguments, cancel).await;
            if let Some(handle) = deadline {
                handle.abort();
            }
            print_json(&result?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mcphub::init_tracing(cli.log_stderr).context("failed to initialize logging")?;

    let registry = Registry::new(build_options(&cli)?);
    let result = run(cli, &registry).await;
    registry.shutdown().await;
    result
}
