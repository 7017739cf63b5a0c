//! RESP2 wire format and single connections
//!
//! Only the subset needed by the broker adapter is supported: commands are
//! sent as arrays of bulk strings and any RESP2 reply type can be read back.

use crate::BrokerError;
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on a single bulk string accepted from the server
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// A decoded RESP2 reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`
    Simple(String),
    /// `-ERR ...`
    Error(String),
    /// `:1`
    Integer(i64),
    /// `$n`, `None` for the nil bulk string
    Bulk(Option<Bytes>),
    /// `*n`, `None` for the nil array
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Interpret an integer reply
    pub fn into_integer(self) -> Result<i64, BrokerError> {
        match self {
            Self::Integer(value) => Ok(value),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Interpret a non-nil bulk string reply
    pub fn into_bytes(self) -> Result<Bytes, BrokerError> {
        match self {
            Self::Bulk(Some(bytes)) => Ok(bytes),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Interpret a non-nil bulk string reply as UTF-8
    pub fn into_string(self) -> Result<String, BrokerError> {
        let bytes = self.into_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BrokerError::Protocol(format!("non UTF-8 string reply: {}", e)))
    }
}

fn unexpected(expected: &str, actual: &RespValue) -> BrokerError {
    BrokerError::Protocol(format!("expected {} reply, got {:?}", expected, actual))
}

/// Encode a command as an array of bulk strings
pub fn encode_command(args: &[&[u8]]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

async fn read_line<R>(reader: &mut R) -> Result<String, BrokerError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(BrokerError::Unavailable("connection closed by broker".to_string()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(BrokerError::Protocol("reply line not terminated by CRLF".to_string()));
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).map_err(|e| BrokerError::Protocol(format!("non UTF-8 reply line: {}", e)))
}

fn parse_length(text: &str) -> Result<i64, BrokerError> {
    text.parse::<i64>()
        .map_err(|_| BrokerError::Protocol(format!("invalid length: {:?}", text)))
}

/// Read one complete reply
pub fn read_value<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<RespValue, BrokerError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        let Some(kind) = line.chars().next() else {
            return Err(BrokerError::Protocol("empty reply line".to_string()));
        };
        let body = &line[kind.len_utf8()..];

        match kind {
            '+' => Ok(RespValue::Simple(body.to_string())),
            '-' => Ok(RespValue::Error(body.to_string())),
            ':' => Ok(RespValue::Integer(parse_length(body)?)),
            '$' => {
                let len = parse_length(body)?;
                if len < 0 {
                    return Ok(RespValue::Bulk(None));
                }
                let len = len as usize;
                if len > MAX_BULK_LEN {
                    return Err(BrokerError::Protocol(format!("bulk string of {} bytes", len)));
                }
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data).await?;
                if &data[len..] != b"\r\n" {
                    return Err(BrokerError::Protocol("bulk string not terminated by CRLF".to_string()));
                }
                data.truncate(len);
                Ok(RespValue::Bulk(Some(Bytes::from(data))))
            }
            '*' => {
                let len = parse_length(body)?;
                if len < 0 {
                    return Ok(RespValue::Array(None));
                }
                let mut items = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    items.push(read_value(reader).await?);
                }
                Ok(RespValue::Array(Some(items)))
            }
            other => Err(BrokerError::Protocol(format!("unknown reply type {:?}", other))),
        }
    })
}

/// One connection to a RESP server
pub struct RespConnection<S = TcpStream> {
    stream: BufStream<S>,
}

impl RespConnection<TcpStream> {
    /// Open a TCP connection with a connect timeout
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self, BrokerError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                BrokerError::Unavailable(format!(
                    "connecting to {} timed out after {:?}",
                    address, connect_timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!("Connected to broker at {}", address);
        Ok(Self::new(stream))
    }
}

impl<S> RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream
    pub fn new(io: S) -> Self {
        Self {
            stream: BufStream::new(io),
        }
    }

    /// Send one command and read its reply
    ///
    /// Error replies are returned as [`RespValue::Error`]; the connection is
    /// still usable afterwards. Any `Err` leaves it in an unknown state.
    pub async fn execute(&mut self, args: &[&[u8]]) -> Result<RespValue, BrokerError> {
        self.send(args).await?;
        self.read_reply().await
    }

    /// Write one command without waiting for its reply
    pub async fn send(&mut self, args: &[&[u8]]) -> io::Result<()> {
        let command = encode_command(args);
        self.stream.write_all(&command).await?;
        self.stream.flush().await
    }

    /// Wait until reply bytes arrive; `false` means the server closed the
    /// connection without answering
    pub async fn reply_started(&mut self) -> io::Result<bool> {
        Ok(!self.stream.fill_buf().await?.is_empty())
    }

    /// Read one reply
    pub async fn read_reply(&mut self) -> Result<RespValue, BrokerError> {
        read_value(&mut self.stream).await
    }
}
