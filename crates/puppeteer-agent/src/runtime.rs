//! Three-channel agent task group
//!
//! The command, file and heartbeat channels run as independent tasks. The
//! group is healthy only while all three are: the first channel to end, for
//! whatever reason, ends the whole agent.

use crate::handlers::{CommandExecutor, DirectorySink, ExecutionPolicy, FileSink, ShellExecutor};
use anyhow::{anyhow, bail, Context, Result};
use puppeteer::{Client, ClientConfig};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity the agent registers under
    pub name: String,
    /// Coordinator address, `host:port`
    pub server_address: String,
    /// Directory received files are written to and commands run from
    pub workdir: PathBuf,
    /// Reaction to failed commands
    pub policy: ExecutionPolicy,
    /// Kill commands running longer than this
    pub command_timeout: Option<Duration>,
    /// Timeout for connecting to the coordinator
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// Configuration with defaults for everything but identity and address
    pub fn new(name: impl Into<String>, server_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_address: server_address.into(),
            workdir: PathBuf::from("."),
            policy: ExecutionPolicy::default(),
            command_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the working directory
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Set the execution policy
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the per-command timeout
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Which of the three streams a task serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Command stream
    Commands,
    /// File stream
    Files,
    /// Heartbeat stream
    Heartbeat,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Commands => "command",
            Self::Files => "file",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// An agent ready to connect
pub struct AgentRuntime {
    config: AgentConfig,
    client: Client,
    executor: Arc<dyn CommandExecutor>,
    sink: Arc<dyn FileSink>,
}

impl AgentRuntime {
    /// Runtime with a shell executor and a directory sink rooted at the workdir
    pub fn new(config: AgentConfig) -> Self {
        let client = Client::with_config(
            ClientConfig::new(config.server_address.clone()).with_connect_timeout(config.connect_timeout),
        );
        let executor = ShellExecutor::new()
            .with_working_dir(config.workdir.clone())
            .with_timeout(config.command_timeout);
        let sink = DirectorySink::new(config.workdir.clone());
        Self {
            config,
            client,
            executor: Arc::new(executor),
            sink: Arc::new(sink),
        }
    }

    /// Replace the command executor
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replace the file sink
    pub fn with_file_sink(mut self, sink: Arc<dyn FileSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Start all three channels
    pub fn spawn(self) -> Result<RuntimeHandle> {
        if self.config.name.trim().is_empty() {
            bail!("agent name must not be empty");
        }
        info!(
            "Starting puppet {} against {}",
            self.config.name, self.config.server_address
        );

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let name = self.config.name.clone();

        {
            let client = self.client.clone();
            let name = name.clone();
            let executor = self.executor.clone();
            let policy = self.config.policy;
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let outcome = run_commands(client, name, executor, policy, shutdown).await;
                (ChannelKind::Commands, outcome)
            });
        }
        {
            let client = self.client.clone();
            let name = name.clone();
            let sink = self.sink.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let outcome = run_files(client, name, sink, shutdown).await;
                (ChannelKind::Files, outcome)
            });
        }
        {
            let client = self.client;
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let outcome = run_heartbeat(client, name, shutdown).await;
                (ChannelKind::Heartbeat, outcome)
            });
        }

        Ok(RuntimeHandle { tasks, shutdown })
    }

    /// Start the channels and wait for the group to end
    pub async fn run(self) -> Result<()> {
        self.spawn()?.wait().await
    }
}

/// Joinable handle over a running agent
pub struct RuntimeHandle {
    tasks: JoinSet<(ChannelKind, Result<()>)>,
    shutdown: CancellationToken,
}

impl RuntimeHandle {
    /// Token that stops every channel when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask every channel to stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the first channel ends, then stop the rest
    ///
    /// Returns `Ok` only when the end was requested through
    /// [`shutdown`](Self::shutdown).
    pub async fn wait(mut self) -> Result<()> {
        let first = self.tasks.join_next().await;
        let requested = self.shutdown.is_cancelled();
        self.shutdown.cancel();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        let (kind, outcome) = match first {
            None => return Ok(()),
            Some(Ok(finished)) => finished,
            Some(Err(e)) => return Err(anyhow!("agent channel task failed: {}", e)),
        };

        if requested {
            info!("Puppet stopped");
            return Ok(());
        }
        match outcome {
            Ok(()) => Err(anyhow!("{} channel ended", kind)),
            Err(e) => {
                error!("{} channel failed: {:#}", kind, e);
                Err(e.context(format!("{} channel failed", kind)))
            }
        }
    }
}

async fn run_commands(
    client: Client,
    name: String,
    executor: Arc<dyn CommandExecutor>,
    policy: ExecutionPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut commands = client
        .commands(&name)
        .await
        .context("failed to open command stream")?;
    info!("Command channel open");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = commands.next() => next.context("command stream failed")?,
        };
        let Some(command) = next else {
            bail!("coordinator closed the command stream");
        };

        debug!("Running command {}: {:?}", command.correlation_id, command.command);
        let output = policy.run(executor.as_ref(), &command.command).await?;
        client
            .send_result(command.correlation_id, &output)
            .await
            .with_context(|| format!("failed to report result {}", command.correlation_id))?;
    }
}

async fn run_files(
    client: Client,
    name: String,
    sink: Arc<dyn FileSink>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut files = client
        .files(&name)
        .await
        .context("failed to open file stream")?;
    info!("File channel open");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = files.next() => next.context("file stream failed")?,
        };
        let Some(file) = next else {
            bail!("coordinator closed the file stream");
        };

        let path = sink.store(&file).await?;
        info!("Received {} ({} bytes)", path.display(), file.contents.len());
    }
}

async fn run_heartbeat(client: Client, name: String, shutdown: CancellationToken) -> Result<()> {
    let mut pings = client
        .heartbeat(&name)
        .await
        .context("failed to open heartbeat stream")?;
    info!("Heartbeat channel open");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = pings.next() => next.context("heartbeat stream failed")?,
        };
        let Some(ping) = next else {
            bail!("coordinator closed the heartbeat stream");
        };
        debug!("Heartbeat from coordinator at {}", ping.timestamp);
    }
}
