//! Command execution and file storage

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use puppeteer::proto::FileTransfer;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

/// What a command produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Captured stdout and stderr, interleaved in the order they were written
    pub output: String,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Whether the process was killed for running too long
    pub timed_out: bool,
}

impl ExecutionOutcome {
    /// Whether the command ran to completion with exit code zero
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs command text on the agent's host
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run one command; `Err` means it could not be started at all
    async fn execute(&self, command: &str) -> Result<ExecutionOutcome>;
}

/// How the agent reacts to a failed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    /// Report the failure as the command's result and keep running
    #[default]
    ReportFailures,
    /// End the command channel, and so the agent, on the first failure
    FailChannel,
}

impl FromStr for ExecutionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "report" | "report-failures" => Ok(Self::ReportFailures),
            "fail" | "fail-channel" => Ok(Self::FailChannel),
            other => bail!("unknown execution policy {:?}", other),
        }
    }
}

impl ExecutionPolicy {
    /// Run a command and turn its outcome into result text under this policy
    pub async fn run(&self, executor: &dyn CommandExecutor, command: &str) -> Result<String> {
        let outcome = match executor.execute(command).await {
            Ok(outcome) => outcome,
            Err(e) if *self == Self::ReportFailures => {
                warn!("Command could not be started: {:#}", e);
                return Ok(format!("failed to run command: {:#}", e));
            }
            Err(e) => return Err(e),
        };

        if outcome.success() {
            return Ok(outcome.output);
        }

        let reason = match (outcome.timed_out, outcome.exit_code) {
            (true, _) => "timed out".to_string(),
            (false, Some(code)) => format!("exited with status {}", code),
            (false, None) => "was killed by a signal".to_string(),
        };
        match self {
            Self::ReportFailures => {
                debug!("Command {} ({:?}), reporting output", reason, command);
                Ok(outcome.output)
            }
            Self::FailChannel => bail!("command {:?} {}", command, reason),
        }
    }
}

/// Runs commands through a shell, `sh -c <text>` by default
///
/// The script's stderr is redirected into its stdout so both land in one
/// pipe and keep their relative order.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            working_dir: None,
            timeout: None,
        }
    }
}

impl ShellExecutor {
    /// Executor using `/bin/sh`
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different shell; it must accept `-c <text>`
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run commands from this directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kill commands that run longer than this
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str) -> Result<ExecutionOutcome> {
        debug!("Executing {:?}", command);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(combined_script(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.shell.display()))?;

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output.context("failed to wait for command")?,
                Err(_) => {
                    // Dropping the wait future kills the child
                    return Ok(ExecutionOutcome {
                        output: format!("command timed out after {:?}", limit),
                        exit_code: None,
                        timed_out: true,
                    });
                }
            },
            None => child.wait_with_output().await.context("failed to wait for command")?,
        };

        // Only the shell's own start-up errors can still reach stderr
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecutionOutcome {
            output: text,
            exit_code: output.status.code(),
            timed_out: false,
        })
    }
}

/// Prefix a script so everything it writes to stderr goes to stdout
fn combined_script(command: &str) -> String {
    format!("exec 2>&1\n{}", command)
}

/// Stores files delivered to the agent
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Store one file, replacing any earlier file of the same name
    async fn store(&self, file: &FileTransfer) -> Result<PathBuf>;
}

/// Writes delivered files into one directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Sink writing into `root`; the directory is created on first use
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory files are written into
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a file name to a path inside the root
    ///
    /// Only a single plain path component is accepted, so a sender cannot
    /// write outside the directory.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => bail!("refusing to store file under {:?}", file_name),
        }
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn store(&self, file: &FileTransfer) -> Result<PathBuf> {
        let path = self.resolve(&file.file_name)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        fs::write(&path, &file.contents)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!("Stored {} ({} bytes)", path.display(), file.contents.len());
        Ok(path)
    }
}
