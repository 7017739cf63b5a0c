//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Puppeteer - send commands and files to remote puppets
#[derive(Parser, Debug)]
#[command(
    name = "puppeteer",
    about = "Control plane for running commands and copying files on remote agents",
    version
)]
pub struct Cli {
    /// Puppetmaster address
    #[arg(
        short = 'a',
        long = "server-address",
        visible_alias = "addr",
        global = true,
        env = "PUPPETEER_SERVER",
        default_value = "localhost:50051"
    )]
    pub server_address: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List live puppets
    #[command(visible_alias = "ls")]
    List {
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a shell command on a puppet and print its output
    Run {
        /// Target puppet
        #[arg(short, long)]
        puppet: String,

        /// Command text, passed to the puppet's shell
        #[arg(short, long)]
        command: String,
    },

    /// Copy a local file to a puppet
    #[command(visible_alias = "cp")]
    Copy {
        /// File to send; the puppet stores it under its base name
        #[arg(short, long)]
        file: PathBuf,

        /// Target puppet
        #[arg(short, long)]
        puppet: String,
    },

    /// Drop a puppet from the registry and close its streams
    Evict {
        /// Puppet to evict
        #[arg(short, long)]
        puppet: String,
    },

    /// Start a puppetmaster or a puppet
    Start {
        /// Which process to start
        #[command(subcommand)]
        role: Role,
    },
}

/// Long-running processes
#[derive(Subcommand, Debug)]
pub enum Role {
    /// Run the coordinator
    #[command(visible_alias = "pm")]
    Puppetmaster {
        /// Port to listen on
        #[arg(short, long, default_value_t = puppeteer::config::DEFAULT_PORT)]
        port: u16,

        /// Interface to listen on
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        /// Queue broker: "memory" or redis://host:port
        #[arg(long, env = "PUPPETEER_BROKER", default_value = "memory")]
        broker: String,

        /// Ceiling on command, file and result waits
        #[arg(long, default_value_t = 7200)]
        wait_timeout_secs: u64,

        /// Seconds between heartbeat pings
        #[arg(long, default_value_t = 10)]
        heartbeat_secs: u64,
    },

    /// Run an agent
    Puppet {
        /// Name to register under
        #[arg(short, long, env = "PUPPET_NAME")]
        name: String,

        /// Directory to store received files and run commands in
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,

        /// Exit on the first failed command instead of reporting it
        #[arg(long)]
        fail_fast: bool,

        /// Kill commands running longer than this many seconds
        #[arg(long)]
        command_timeout_secs: Option<u64>,
    },
}
