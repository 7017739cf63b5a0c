//! Framed request/response channel over an async byte stream
//!
//! One channel carries one call. The caller sends a single request frame;
//! the callee answers with zero or more data frames and then either an
//! END_STREAM frame or an ERROR frame. Each direction numbers its frames
//! from zero and the receiving side rejects gaps or reordering.

use crate::{ErrorDetails, Frame, FrameCodec, Message, ProtocolError};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Bidirectional framed channel
pub struct Channel<S> {
    sender: ChannelSender<S>,
    receiver: ChannelReceiver<S>,
}

/// Sending half of a channel
pub struct ChannelSender<S> {
    sink: SplitSink<Framed<S, FrameCodec>, Frame>,
    next_sequence: u32,
    finished: bool,
}

/// Receiving half of a channel
pub struct ChannelReceiver<S> {
    stream: SplitStream<Framed<S, FrameCodec>>,
    next_sequence: u32,
    finished: bool,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a byte stream with the default codec
    pub fn new(io: S) -> Self {
        Self::with_codec(io, FrameCodec::new())
    }

    /// Wrap a byte stream with a custom codec
    pub fn with_codec(io: S, codec: FrameCodec) -> Self {
        let (sink, stream) = Framed::new(io, codec).split();
        Self {
            sender: ChannelSender {
                sink,
                next_sequence: 0,
                finished: false,
            },
            receiver: ChannelReceiver {
                stream,
                next_sequence: 0,
                finished: false,
            },
        }
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        self.sender.send(message).await
    }

    /// Send an end-of-stream marker
    pub async fn finish(&mut self) -> Result<(), ProtocolError> {
        self.sender.finish().await
    }

    /// Send a terminal error
    pub async fn send_error(&mut self, details: ErrorDetails) -> Result<(), ProtocolError> {
        self.sender.send_error(details).await
    }

    /// Receive the next message
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        self.receiver.recv().await
    }

    /// Split into independently owned halves
    pub fn split(self) -> (ChannelSender<S>, ChannelReceiver<S>) {
        (self.sender, self.receiver)
    }
}

impl<S> ChannelSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn next_sequence(&mut self) -> Result<u32, ProtocolError> {
        if self.finished {
            return Err(ProtocolError::ChannelClosed);
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(sequence)
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let sequence = self.next_sequence()?;
        let frame = Frame::message(sequence, message)?;
        self.sink.send(frame).await
    }

    /// Send an end-of-stream marker; nothing may be sent afterwards
    pub async fn finish(&mut self) -> Result<(), ProtocolError> {
        let sequence = self.next_sequence()?;
        self.finished = true;
        self.sink.send(Frame::end_stream(sequence)).await
    }

    /// Send a terminal error; nothing may be sent afterwards
    pub async fn send_error(&mut self, details: ErrorDetails) -> Result<(), ProtocolError> {
        let sequence = self.next_sequence()?;
        self.finished = true;
        let payload = rmp_serde::to_vec(&details)?;
        self.sink.send(Frame::error(sequence, Bytes::from(payload))).await
    }

    /// Flush and shut down the write side of the connection
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.finished = true;
        self.sink.close().await
    }

    /// Whether END_STREAM or an error has been sent
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<S> ChannelReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next message
    ///
    /// Returns `Ok(None)` once the peer sent END_STREAM or closed the
    /// connection cleanly, and `Err(ProtocolError::Remote)` for an error frame.
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.finished {
            return Ok(None);
        }

        let frame = match self.stream.next().await {
            Some(frame) => frame?,
            None => {
                self.finished = true;
                return Ok(None);
            }
        };

        if frame.sequence != self.next_sequence {
            return Err(ProtocolError::OutOfOrder {
                expected: self.next_sequence,
                actual: frame.sequence,
            });
        }
        self.next_sequence = self.next_sequence.wrapping_add(1);

        if frame.is_error() {
            self.finished = true;
            let details: ErrorDetails = rmp_serde::from_slice(&frame.payload)?;
            return Err(ProtocolError::Remote(details));
        }

        if frame.is_end_stream() {
            self.finished = true;
            return Ok(None);
        }

        frame.decode_message().map(Some)
    }

    /// Resolve once the peer goes away
    ///
    /// Anything the peer sends in the meantime is discarded.
    pub async fn closed(mut self) {
        loop {
            match self.stream.next().await {
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return,
            }
        }
    }

    /// Whether END_STREAM, an error, or EOF has been seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
