//! Puppeteer Agent Binary
//!
//! Connects to a puppetmaster under a name and serves commands and files
//! until one of its channels fails or it is interrupted.

use anyhow::Result;
use clap::Parser;
use puppeteer_agent::{AgentConfig, AgentRuntime, ExecutionPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Remote agent for a Puppeteer coordinator
#[derive(Parser, Debug)]
#[command(name = "puppeteer-agent", version, about)]
struct Args {
    /// Name to register under
    #[arg(short, long, env = "PUPPET_NAME")]
    name: String,

    /// Coordinator address
    #[arg(short = 'a', long = "server-address", alias = "addr", env = "PUPPETEER_SERVER", default_value = "localhost:50051")]
    server_address: String,

    /// Directory to store received files and run commands in
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Exit on the first failed command instead of reporting it
    #[arg(long)]
    fail_fast: bool,

    /// Kill commands running longer than this many seconds
    #[arg(long)]
    command_timeout_secs: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let policy = if args.fail_fast {
        ExecutionPolicy::FailChannel
    } else {
        ExecutionPolicy::ReportFailures
    };
    let config = AgentConfig::new(args.name, args.server_address)
        .with_workdir(args.workdir)
        .with_policy(policy)
        .with_command_timeout(args.command_timeout_secs.map(Duration::from_secs));

    let handle = AgentRuntime::new(config).spawn()?;
    let shutdown = handle.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    if let Err(e) = handle.wait().await {
        error!("Puppet failed: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
