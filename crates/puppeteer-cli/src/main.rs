//! Puppeteer CLI
//!
//! Front end for listing puppets, running commands and copying files, and
//! for starting the puppetmaster and puppet processes.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command, Role};
use puppeteer::Client;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    debug!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let client = Client::new(cli.server_address.clone());
    match cli.command {
        Command::List { json } => commands::cmd_list(&client, json).await,
        Command::Run { puppet, command } => commands::cmd_run(&client, &puppet, &command).await,
        Command::Copy { file, puppet } => commands::cmd_copy(&client, &file, &puppet).await,
        Command::Evict { puppet } => commands::cmd_evict(&client, &puppet).await,
        Command::Start { role } => match role {
            Role::Puppetmaster {
                port,
                bind,
                broker,
                wait_timeout_secs,
                heartbeat_secs,
            } => {
                commands::cmd_start_puppetmaster(
                    bind,
                    port,
                    &broker,
                    Duration::from_secs(wait_timeout_secs),
                    Duration::from_secs(heartbeat_secs),
                )
                .await
            }
            Role::Puppet {
                name,
                workdir,
                fail_fast,
                command_timeout_secs,
            } => {
                commands::cmd_start_puppet(
                    name,
                    cli.server_address,
                    workdir,
                    fail_fast,
                    command_timeout_secs.map(Duration::from_secs),
                )
                .await
            }
        },
    }
}
