//! Subcommand implementations

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use puppeteer::{BrokerConfig, Client, CoordinatorConfig, Server};
use puppeteer_agent::{AgentConfig, AgentRuntime, ExecutionPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// Print the live puppets
pub async fn cmd_list(client: &Client, json: bool) -> Result<()> {
    let agents = client
        .list_agents()
        .await
        .context("Failed to list puppets")?;
    if json {
        println!("{}", format_agents_json(&agents)?);
    } else {
        println!("{}", format_agents_table(&agents));
    }
    Ok(())
}

/// Run a command on a puppet and print what it produced
pub async fn cmd_run(client: &Client, puppet: &str, command: &str) -> Result<()> {
    let output = client
        .run_command(puppet, command)
        .await
        .with_context(|| format!("Failed to run command on {}", puppet))?;
    print!("{}", output);
    Ok(())
}

/// Send a local file to a puppet
pub async fn cmd_copy(client: &Client, file: &Path, puppet: &str) -> Result<()> {
    let file_name = base_name(file)?;
    let contents = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let size = contents.len();
    client
        .copy_file(puppet, &file_name, Bytes::from(contents))
        .await
        .with_context(|| format!("Failed to copy {} to {}", file.display(), puppet))?;
    println!("Queued {} ({} bytes) for {}", file_name, size, puppet);
    Ok(())
}

/// Evict a puppet
pub async fn cmd_evict(client: &Client, puppet: &str) -> Result<()> {
    let was_registered = client
        .evict(puppet)
        .await
        .with_context(|| format!("Failed to evict {}", puppet))?;
    if was_registered {
        println!("Evicted {}", puppet);
    } else {
        println!("{} was not registered", puppet);
    }
    Ok(())
}

/// Serve as the puppetmaster until interrupted
pub async fn cmd_start_puppetmaster(
    bind: String,
    port: u16,
    broker: &str,
    wait_timeout: Duration,
    heartbeat_interval: Duration,
) -> Result<()> {
    if heartbeat_interval.is_zero() {
        bail!("heartbeat interval must be positive");
    }
    let broker_config: BrokerConfig = broker.parse()?;
    let broker = broker_config
        .connect()
        .await
        .context("Failed to connect to the broker")?;

    let config = CoordinatorConfig::default()
        .with_bind_address(bind)
        .with_port(port)
        .with_wait_timeout(wait_timeout)
        .with_heartbeat_interval(heartbeat_interval);
    let server = Server::bind(config, broker).await?;
    info!("Puppetmaster listening on {}", server.local_addr()?);

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Interrupted, shutting down");
        })
        .await?;
    Ok(())
}

/// Run as a puppet until interrupted or a channel fails
pub async fn cmd_start_puppet(
    name: String,
    server_address: String,
    workdir: PathBuf,
    fail_fast: bool,
    command_timeout: Option<Duration>,
) -> Result<()> {
    let policy = if fail_fast {
        ExecutionPolicy::FailChannel
    } else {
        ExecutionPolicy::ReportFailures
    };
    let config = AgentConfig::new(name, server_address)
        .with_workdir(workdir)
        .with_policy(policy)
        .with_command_timeout(command_timeout);

    let handle = AgentRuntime::new(config).spawn()?;
    let shutdown = handle.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });
    handle.wait().await
}

fn base_name(file: &Path) -> Result<String> {
    let Some(name) = file.file_name() else {
        bail!("{} does not name a file", file.display());
    };
    Ok(name.to_string_lossy().into_owned())
}

fn format_agents_table(agents: &[String]) -> String {
    if agents.is_empty() {
        return "No puppets connected".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Puppet"]);
    for (i, agent) in agents.iter().enumerate() {
        table.add_row(vec![(i + 1).to_string(), agent.clone()]);
    }
    table.to_string()
}

fn format_agents_json(agents: &[String]) -> Result<String> {
    let value = serde_json::json!({ "agents": agents });
    Ok(serde_json::to_string_pretty(&value)?)
}
