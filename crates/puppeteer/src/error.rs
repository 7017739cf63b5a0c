//! Error types for the coordinator and client

use puppeteer_broker::BrokerError;
use puppeteer_proto::{ErrorCode, ErrorDetails, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while serving a call
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The queue substrate cannot be reached
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// No result arrived within the wait ceiling
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// The connection to the remote peer broke
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request was malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A queue item could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The call was torn down by disconnect, eviction or shutdown
    #[error("Call cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BrokerError> for CoordinatorError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) | BrokerError::Protocol(msg) => Self::BrokerUnavailable(msg),
            BrokerError::Timeout { duration, .. } => Self::Timeout { duration },
            BrokerError::Serialization(msg) => Self::Serialization(msg),
            err @ BrokerError::NoReply { .. } => Self::BrokerUnavailable(err.to_string()),
        }
    }
}

impl From<ProtocolError> for CoordinatorError {
    fn from(err: ProtocolError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<CoordinatorError> for ErrorDetails {
    fn from(err: CoordinatorError) -> Self {
        let code = match &err {
            CoordinatorError::BrokerUnavailable(_) => ErrorCode::BrokerUnavailable,
            CoordinatorError::Timeout { .. } => ErrorCode::Timeout,
            CoordinatorError::Transport(_) | CoordinatorError::Cancelled => ErrorCode::TransportFailure,
            CoordinatorError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            CoordinatorError::Serialization(_) | CoordinatorError::Io(_) => ErrorCode::InternalError,
        };
        ErrorDetails::new(code, err.to_string())
    }
}

/// Errors seen by callers of the coordinator
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the coordinator
    #[error("Failed to connect to {address}: {reason}")]
    Connect {
        /// Coordinator address
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// The coordinator answered the call with an error
    #[error("{}", .0.message)]
    Remote(ErrorDetails),

    /// The connection failed mid-call
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    /// The coordinator answered with something that does not fit the call
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Error code reported by the coordinator, if it reported one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote(details) => Some(details.code),
            _ => None,
        }
    }

    /// Whether the coordinator gave up waiting for a result
    pub fn is_timeout(&self) -> bool {
        self.code() == Some(ErrorCode::Timeout)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Remote(details) => Self::Remote(details),
            other => Self::Protocol(other),
        }
    }
}
