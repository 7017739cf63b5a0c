//! Frame structure and flags

use crate::{Message, ProtocolError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// Plain data frame
    pub const NONE: Self = Self(0);
    /// Sender has nothing more to say on this call
    pub const END_STREAM: Self = Self(1);
    /// Payload is an encoded `ErrorDetails`; the call is over
    pub const ERROR: Self = Self(2);

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }
}

/// Unit of transmission on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Per-direction sequence number, starting at 0
    pub sequence: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Encoded message, error details, or nothing
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(sequence: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            sequence,
            flags,
            payload,
        }
    }

    /// Create a data frame carrying an encoded message
    pub fn message(sequence: u32, message: &Message) -> Result<Self, ProtocolError> {
        let payload = rmp_serde::to_vec(message)?;
        Ok(Self::new(sequence, FrameFlags::NONE, Bytes::from(payload)))
    }

    /// Create an end-of-stream frame
    pub fn end_stream(sequence: u32) -> Self {
        Self::new(sequence, FrameFlags::END_STREAM, Bytes::new())
    }

    /// Create an error frame
    pub fn error(sequence: u32, payload: Bytes) -> Self {
        Self::new(sequence, FrameFlags::ERROR, payload)
    }

    /// Decode the payload of a data frame
    pub fn decode_message(&self) -> Result<Message, ProtocolError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    /// Check if this is an end-of-stream frame
    pub fn is_end_stream(&self) -> bool {
        self.flags.has_flag(FrameFlags::END_STREAM)
    }

    /// Check if this is an error frame
    pub fn is_error(&self) -> bool {
        self.flags.has_flag(FrameFlags::ERROR)
    }
}
