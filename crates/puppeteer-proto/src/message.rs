//! Work items and RPC envelopes

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A shell command addressed to one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Token linking this dispatch to its eventual result
    pub correlation_id: Uuid,
    /// Text handed to the agent's shell
    pub command: String,
}

impl Command {
    /// Create a command with a freshly minted correlation id
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            command: command.into(),
        }
    }
}

/// Output of one executed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Correlation id of the command this answers
    pub correlation_id: Uuid,
    /// Captured output
    pub output: String,
}

impl CommandResult {
    /// Create a result for the given correlation id
    pub fn new(correlation_id: Uuid, output: impl Into<String>) -> Self {
        Self {
            correlation_id,
            output: output.into(),
        }
    }
}

/// A file pushed to one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Agent that should receive the file
    pub target_agent: String,
    /// Name to store the file under
    pub file_name: String,
    /// File contents
    pub contents: Bytes,
}

impl FileTransfer {
    /// Create a file transfer for an agent
    pub fn new(target_agent: impl Into<String>, file_name: impl Into<String>, contents: Bytes) -> Self {
        Self {
            target_agent: target_agent.into(),
            file_name: file_name.into(),
            contents,
        }
    }
}

/// Liveness ping sent by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Seconds since the Unix epoch when the ping was sent
    pub timestamp: u64,
}

impl Ping {
    /// Ping stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// Top-level message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Response message
    Response(Response),
}

impl Message {
    /// Create a request message
    pub fn request(req: Request) -> Self {
        Self::Request(req)
    }

    /// Create a response message
    pub fn response(resp: Response) -> Self {
        Self::Response(resp)
    }
}

/// Calls a client can open against the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// List live agents
    ListAgents,

    /// Run a command on an agent and wait for its output
    RunCommand {
        /// Target agent
        agent: String,
        /// Shell command text
        command: String,
    },

    /// Queue a file for an agent
    CopyFile {
        /// Target agent
        agent: String,
        /// Name the agent stores the file under
        file_name: String,
        /// File contents
        contents: Bytes,
    },

    /// Open the command stream for an agent
    GetCommands {
        /// Requesting agent
        agent: String,
    },

    /// Open the file stream for an agent
    GetFiles {
        /// Requesting agent
        agent: String,
    },

    /// Open the heartbeat stream for an agent
    Heartbeat {
        /// Requesting agent
        agent: String,
    },

    /// Report a command's output
    SendResult {
        /// Correlation id of the executed command
        correlation_id: Uuid,
        /// Captured output
        result: String,
    },

    /// Tear down every stream of an agent and drop it from the registry
    Evict {
        /// Agent to evict
        agent: String,
    },
}

impl Request {
    /// Short name used in logs and error context
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListAgents => "list_agents",
            Self::RunCommand { .. } => "run_command",
            Self::CopyFile { .. } => "copy_file",
            Self::GetCommands { .. } => "get_commands",
            Self::GetFiles { .. } => "get_files",
            Self::Heartbeat { .. } => "heartbeat",
            Self::SendResult { .. } => "send_result",
            Self::Evict { .. } => "evict",
        }
    }

    /// Whether the coordinator answers with a stream rather than one reply
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::GetCommands { .. } | Self::GetFiles { .. } | Self::Heartbeat { .. }
        )
    }
}

/// Replies and stream items sent by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Live agents
    Agents {
        /// Agent identities
        agents: Vec<String>,
    },

    /// Output of a finished command
    CommandOutput {
        /// Captured output
        result: String,
    },

    /// File accepted for delivery
    Copied,

    /// Item of a command stream
    Command(Command),

    /// Item of a file stream
    File(FileTransfer),

    /// Item of a heartbeat stream
    Ping(Ping),

    /// Result accepted
    ResultAccepted,

    /// Agent evicted
    Evicted {
        /// Whether the agent was in the registry
        was_registered: bool,
    },
}

impl Response {
    /// Short name used in logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Agents { .. } => "agents",
            Self::CommandOutput { .. } => "command_output",
            Self::Copied => "copied",
            Self::Command(_) => "command",
            Self::File(_) => "file",
            Self::Ping(_) => "ping",
            Self::ResultAccepted => "result_accepted",
            Self::Evicted { .. } => "evicted",
        }
    }
}

/// Error details carried by an error frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context data
    pub context: HashMap<String, String>,
}

/// Error codes for different types of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed or unexpected request
    InvalidRequest,
    /// Queue substrate could not be reached
    BrokerUnavailable,
    /// Nothing arrived within the wait ceiling
    Timeout,
    /// Connection to the peer broke
    TransportFailure,
    /// Internal server error
    InternalError,
    /// Peer used the protocol in a way the receiver does not support
    Unsupported,
}

impl ErrorDetails {
    /// Create a new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
