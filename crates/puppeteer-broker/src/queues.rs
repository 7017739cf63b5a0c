//! Per-agent and per-correlation work queues
//!
//! Commands and files are queued under the target agent's name; results are
//! queued under the correlation id of the command that produced them. Items
//! are stored MessagePack-encoded and consumed at most once.

use crate::{BrokerError, SharedBroker};
use bytes::Bytes;
use puppeteer_proto::{Command, CommandResult, FileTransfer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

/// Queue key for commands addressed to an agent
pub fn command_key(agent: &str) -> String {
    format!("{}-commands", agent)
}

/// Queue key for files addressed to an agent
pub fn file_key(agent: &str) -> String {
    format!("{}-files", agent)
}

/// Queue key for the result of one command
pub fn result_key(correlation_id: &Uuid) -> String {
    format!("{}-command-response", correlation_id)
}

/// Typed view over the broker's queues
#[derive(Clone)]
pub struct WorkQueues {
    broker: SharedBroker,
}

impl WorkQueues {
    /// Create work queues over a broker
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }

    async fn push<T: Serialize>(&self, key: &str, item: &T) -> Result<(), BrokerError> {
        let encoded = rmp_serde::to_vec_named(item)?;
        self.broker.push_right(key, Bytes::from(encoded)).await?;
        trace!("Enqueued item on {}", key);
        Ok(())
    }

    async fn pop<T: DeserializeOwned>(&self, key: &str, timeout: Duration) -> Result<T, BrokerError> {
        let (_, encoded) = self.broker.blocking_pop_left(key, timeout).await?;
        Ok(rmp_serde::from_slice(&encoded)?)
    }

    /// Queue a command for an agent
    pub async fn enqueue_command(&self, agent: &str, command: &Command) -> Result<(), BrokerError> {
        self.push(&command_key(agent), command).await
    }

    /// Wait for the next command addressed to an agent
    pub async fn await_command(&self, agent: &str, timeout: Duration) -> Result<Command, BrokerError> {
        self.pop(&command_key(agent), timeout).await
    }

    /// Queue the result of a command under its correlation id
    pub async fn enqueue_result(&self, result: &CommandResult) -> Result<(), BrokerError> {
        self.push(&result_key(&result.correlation_id), result).await
    }

    /// Wait for the result of one command
    pub async fn await_result(
        &self,
        correlation_id: &Uuid,
        timeout: Duration,
    ) -> Result<CommandResult, BrokerError> {
        self.pop(&result_key(correlation_id), timeout).await
    }

    /// Queue a file for its target agent
    pub async fn enqueue_file(&self, file: &FileTransfer) -> Result<(), BrokerError> {
        self.push(&file_key(&file.target_agent), file).await
    }

    /// Wait for the next file addressed to an agent
    pub async fn await_file(&self, agent: &str, timeout: Duration) -> Result<FileTransfer, BrokerError> {
        self.pop(&file_key(agent), timeout).await
    }
}
