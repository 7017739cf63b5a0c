//! Error types for protocol operations

use crate::message::{ErrorCode, ErrorDetails};
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O failure on the connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Frame arrived with an unexpected sequence number
    #[error("Out of order frame: expected sequence {expected}, got {actual}")]
    OutOfOrder {
        /// Sequence number the receiver expected
        expected: u32,
        /// Sequence number carried by the frame
        actual: u32,
    },

    /// Connection closed in the middle of a frame
    #[error("Connection closed mid-frame")]
    TruncatedFrame,

    /// Channel already finished; nothing more may be sent
    #[error("Channel closed")]
    ChannelClosed,

    /// Peer answered with an error frame
    #[error("Remote error ({:?}): {}", .0.code, .0.message)]
    Remote(ErrorDetails),

    /// Peer sent a message that does not fit the call
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

impl ProtocolError {
    /// Whether this error means the connection itself is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::TruncatedFrame | Self::ChannelClosed
        )
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}

impl From<ProtocolError> for ErrorDetails {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Remote(details) => details,
            ProtocolError::Serialization(msg) => ErrorDetails::new(ErrorCode::InvalidRequest, msg),
            ProtocolError::UnexpectedMessage(msg) => {
                ErrorDetails::new(ErrorCode::Unsupported, format!("Unexpected message: {}", msg))
            }
            ProtocolError::OutOfOrder { expected, actual } => ErrorDetails::new(
                ErrorCode::InvalidRequest,
                format!("Out of order frame: expected {}, got {}", expected, actual),
            ),
            ProtocolError::FrameTooLarge { size, max } => ErrorDetails::new(
                ErrorCode::InvalidRequest,
                format!("Frame too large: {} bytes (max: {})", size, max),
            ),
            other @ (ProtocolError::Io(_)
            | ProtocolError::TruncatedFrame
            | ProtocolError::ChannelClosed) => {
                ErrorDetails::new(ErrorCode::TransportFailure, other.to_string())
            }
        }
    }
}
