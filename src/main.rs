use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quant_mcp::{McpClientManager, ServerRegistryConfig};
use serde_json::{Map, Value};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Connects to MCP market-data servers and lists or calls their tools.
#[derive(Parser, Debug)]
#[command(name = "quant-gateway", version, about)]
struct Cli {
    /// Server registry (YAML, or JSON with a `.json` extension)
    #[arg(short, long, env = "QUANT_GATEWAY_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every enabled server and print the connected ids
    Servers,
    /// Print the namespaced tools of every connected server
    Tools {
        /// Print function-calling definitions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call one namespaced tool
    Call {
        /// Local tool name, e.g. mcp_qstock_fetch_price
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn parse_args(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--args is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {}", other),
    }
}

async fn run(cli: &Cli, manager: &McpClientManager) -> Result<()> {
    match &cli.command {
        Command::Servers => {
            for summary in manager.server_summaries() {
                println!(
                    "{}\t{}\t{}\t{} tools",
                    summary.server_id, summary.transport, summary.state, summary.tool_count
                );
            }
        }
        Command::Tools { json } => {
            if *json {
                let specs = manager.function_specs();
                println!("{}", serde_json::to_string_pretty(&specs)?);
            } else {
                for tool in manager.list_tools().await {
                    println!("{}\t{}", tool.local_name, tool.description());
                }
            }
        }
        Command::Call { tool, args } => {
            let args = parse_args(args)?;
            let result = manager.execute(tool, args).await?;
            println!("{}", result);
            if !result.success {
                bail!("tool '{}' failed", tool);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = ServerRegistryConfig::from_file(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?
        .with_env_proxy();

    let manager = McpClientManager::new(config.manager_config());
    let report = manager.connect_from_config(&config).await;
    for (server_id, err) in &report.failed {
        error!("Server '{}' unavailable: {}", server_id, err);
    }
    info!("{} server(s) connected", report.connected.len());

    let outcome = run(&cli, &manager).await;
    manager.disconnect_all().await;
    outcome
}
