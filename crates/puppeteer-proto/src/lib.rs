//! # Puppeteer Protocol
//!
//! Data model, request/response envelopes and the framed transport shared by
//! the coordinator, its clients and the agents.

#![warn(missing_docs)]

/// Frame structure and flags
pub mod frame;

/// Work items and RPC envelopes
pub mod message;

/// Length-prefixed frame codec
pub mod codec;

/// Framed request/response channel over an async byte stream
pub mod channel;

/// Error types for protocol operations
pub mod error;

pub use channel::{Channel, ChannelReceiver, ChannelSender};
pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags};
pub use message::{
    Command, CommandResult, ErrorCode, ErrorDetails, FileTransfer, Message, Ping, Request, Response,
};
