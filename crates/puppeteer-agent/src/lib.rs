//! # Puppeteer Agent
//!
//! The agent ("puppet") side: opens its command, file and heartbeat streams
//! against a coordinator, runs the commands it receives and stores the
//! files it is sent.

/// Command execution and file storage
pub mod handlers;

/// Three-channel agent task group
pub mod runtime;

pub use handlers::{
    CommandExecutor, DirectorySink, ExecutionOutcome, ExecutionPolicy, FileSink, ShellExecutor,
};
pub use runtime::{AgentConfig, AgentRuntime, RuntimeHandle};
