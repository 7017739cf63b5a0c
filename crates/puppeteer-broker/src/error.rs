//! Broker error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by queue broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The substrate cannot be reached or has been shut down
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Nothing arrived on a queue within the wait ceiling
    #[error("Timed out after {duration:?} waiting on {key}")]
    Timeout {
        /// Queue key that was waited on
        key: String,
        /// Wait ceiling that elapsed
        duration: Duration,
    },

    /// A command was sent but the broker did not answer in time; it may or
    /// may not have been applied, so it is never resent
    #[error("No reply from broker within {duration:?}")]
    NoReply {
        /// Reply timeout that elapsed
        duration: Duration,
    },

    /// A queue item could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The broker answered with an error or something unparseable
    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether this is a bounded wait that elapsed rather than a failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<io::Error> for BrokerError {
    fn from(err: io::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}
