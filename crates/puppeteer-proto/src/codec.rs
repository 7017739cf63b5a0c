//! Length-prefixed frame codec

use crate::{Frame, ProtocolError};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Encodes frames as a big-endian `u32` length followed by MessagePack bytes
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum encoded frame size allowed in either direction
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Maximum encoded frame size
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_bytes = rmp_serde::to_vec(&frame)?;

        if frame_bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_bytes.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX + frame_bytes.len());
        dst.put_u32(frame_bytes.len() as u32);
        dst.put_slice(&frame_bytes);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek the length without consuming it
        let frame_len = (&src[..LENGTH_PREFIX]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if src.len() < LENGTH_PREFIX + frame_len {
            src.reserve(LENGTH_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let frame_data = src.split_to(frame_len);
        Ok(Some(rmp_serde::from_slice(&frame_data)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedFrame),
        }
    }
}
