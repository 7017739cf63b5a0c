//! Pooled broker adapter for a Redis-compatible server

use crate::resp::{RespConnection, RespValue};
use crate::{BrokerError, QueueBroker};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

/// RESP broker configuration
#[derive(Debug, Clone)]
pub struct RespConfig {
    /// Server address, `host:port`
    pub address: String,
    /// Maximum number of idle connections kept for reuse
    pub max_idle: usize,
    /// Maximum idle time before a pooled connection is dropped
    pub max_idle_time: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Reply timeout for non-blocking commands
    pub command_timeout: Duration,
    /// Number of connection attempts before giving up
    pub max_retries: u32,
    /// Delay between connection attempts
    pub retry_delay: Duration,
}

impl Default for RespConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            max_idle: 16,
            max_idle_time: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl RespConfig {
    /// Create a configuration for the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the number of connection attempts
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Set the reply timeout for non-blocking commands
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the idle pool size
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// Why a single attempt at a command failed
enum AttemptError {
    /// The server never saw the command, so sending it again is safe
    NotDelivered(BrokerError),
    /// The server may have applied the command
    Failed(BrokerError),
}

impl AttemptError {
    fn into_inner(self) -> BrokerError {
        match self {
            Self::NotDelivered(err) | Self::Failed(err) => err,
        }
    }
}

struct PoolEntry {
    connection: RespConnection,
    last_used: Instant,
}

/// Broker adapter speaking RESP2 to a Redis-compatible server
///
/// Every command checks out a connection, so blocking pops on different
/// queues never hold each other up. Connections that fail mid-command are
/// discarded instead of being returned to the pool.
///
/// A command is resent only when a pooled connection turns out to be dead
/// before any of the reply arrived. A reply that is late is an error, never a
/// reason to send the command again.
///
/// A blocking pop abandoned by its caller after the server has already
/// removed an item loses that item; the connection is dropped along with it.
pub struct RespBroker {
    config: RespConfig,
    idle: Mutex<Vec<PoolEntry>>,
}

impl RespBroker {
    /// Create a broker; connections are opened lazily
    pub fn new(config: RespConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Create a broker and verify the server answers
    pub async fn connect(config: RespConfig) -> Result<Self, BrokerError> {
        let broker = Self::new(config);
        broker.ping().await?;
        Ok(broker)
    }

    /// Broker configuration
    pub fn config(&self) -> &RespConfig {
        &self.config
    }

    /// Number of idle pooled connections
    pub async fn idle_connections(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn checkout(&self) -> Result<(RespConnection, bool), BrokerError> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(entry) = idle.pop() {
                if entry.last_used.elapsed() <= self.config.max_idle_time {
                    return Ok((entry.connection, true));
                }
                debug!("Dropping idle broker connection");
            }
        }
        Ok((self.connect_with_retries().await?, false))
    }

    async fn checkin(&self, connection: RespConnection) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.max_idle {
            idle.push(PoolEntry {
                connection,
                last_used: Instant::now(),
            });
        }
    }

    async fn connect_with_retries(&self) -> Result<RespConnection, BrokerError> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match RespConnection::connect(&self.config.address, self.config.connect_timeout).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!("Broker connection attempt {} of {} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                sleep(self.config.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BrokerError::Unavailable(format!("could not connect to {}", self.config.address))
        }))
    }

    /// Run one command, retrying once on a fresh connection if a pooled one
    /// turns out to be stale
    async fn execute(&self, args: &[&[u8]], reply_timeout: Duration) -> Result<RespValue, BrokerError> {
        let (mut connection, reused) = self.checkout().await?;

        let reply = match self.execute_on(&mut connection, args, reply_timeout).await {
            Ok(reply) => reply,
            Err(AttemptError::NotDelivered(reason)) if reused => {
                debug!("Pooled broker connection was stale ({}), reconnecting", reason);
                connection = self.connect_with_retries().await?;
                self.execute_on(&mut connection, args, reply_timeout)
                    .await
                    .map_err(AttemptError::into_inner)?
            }
            Err(e) => return Err(e.into_inner()),
        };

        self.checkin(connection).await;
        match reply {
            RespValue::Error(message) => Err(BrokerError::Protocol(message)),
            reply => Ok(reply),
        }
    }

    async fn execute_on(
        &self,
        connection: &mut RespConnection,
        args: &[&[u8]],
        reply_timeout: Duration,
    ) -> Result<RespValue, AttemptError> {
        connection
            .send(args)
            .await
            .map_err(|e| AttemptError::NotDelivered(e.into()))?;

        let reply = async {
            match connection.reply_started().await {
                Ok(true) => connection.read_reply().await.map_err(AttemptError::Failed),
                Ok(false) => Err(AttemptError::NotDelivered(BrokerError::Unavailable(
                    "connection closed before the reply".to_string(),
                ))),
                Err(e) if is_reset(&e) => Err(AttemptError::NotDelivered(e.into())),
                Err(e) => Err(AttemptError::Failed(e.into())),
            }
        };
        match tokio::time::timeout(reply_timeout, reply).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Failed(BrokerError::NoReply {
                duration: reply_timeout,
            })),
        }
    }
}

fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

/// BLPOP takes whole seconds and treats zero as "forever"
fn blpop_seconds(timeout: Duration) -> u64 {
    let mut seconds = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        seconds += 1;
    }
    seconds.max(1)
}

#[async_trait]
impl QueueBroker for RespBroker {
    async fn add_member(&self, set_key: &str, value: &str) -> Result<bool, BrokerError> {
        let reply = self
            .execute(&[b"SADD", set_key.as_bytes(), value.as_bytes()], self.config.command_timeout)
            .await?;
        Ok(reply.into_integer()? > 0)
    }

    async fn remove_member(&self, set_key: &str, value: &str) -> Result<bool, BrokerError> {
        let reply = self
            .execute(&[b"SREM", set_key.as_bytes(), value.as_bytes()], self.config.command_timeout)
            .await?;
        Ok(reply.into_integer()? > 0)
    }

    async fn list_members(&self, set_key: &str) -> Result<Vec<String>, BrokerError> {
        let reply = self
            .execute(&[b"SMEMBERS", set_key.as_bytes()], self.config.command_timeout)
            .await?;
        let items = match reply {
            RespValue::Array(Some(items)) => items,
            RespValue::Array(None) => Vec::new(),
            other => {
                return Err(BrokerError::Protocol(format!("expected array reply, got {:?}", other)))
            }
        };
        let mut members = items
            .into_iter()
            .map(RespValue::into_string)
            .collect::<Result<Vec<_>, _>>()?;
        members.sort();
        Ok(members)
    }

    async fn push_right(&self, queue_key: &str, item: Bytes) -> Result<(), BrokerError> {
        self.execute(&[b"RPUSH", queue_key.as_bytes(), &item[..]], self.config.command_timeout)
            .await?
            .into_integer()?;
        Ok(())
    }

    async fn blocking_pop_left(
        &self,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<(String, Bytes), BrokerError> {
        let seconds = blpop_seconds(timeout);
        let reply_timeout = Duration::from_secs(seconds) + self.config.command_timeout;
        let reply = self
            .execute(
                &[b"BLPOP", queue_key.as_bytes(), seconds.to_string().as_bytes()],
                reply_timeout,
            )
            .await?;

        match reply {
            RespValue::Array(None) | RespValue::Bulk(None) => Err(BrokerError::Timeout {
                key: queue_key.to_string(),
                duration: timeout,
            }),
            RespValue::Array(Some(items)) if items.len() == 2 => {
                let mut items = items.into_iter();
                let (Some(key), Some(item)) = (items.next(), items.next()) else {
                    return Err(BrokerError::Protocol("short BLPOP reply".to_string()));
                };
                Ok((key.into_string()?, item.into_bytes()?))
            }
            other => Err(BrokerError::Protocol(format!("unexpected BLPOP reply {:?}", other))),
        }
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        match self.execute(&[b"PING"], self.config.command_timeout).await? {
            RespValue::Simple(_) | RespValue::Bulk(Some(_)) => Ok(()),
            other => Err(BrokerError::Protocol(format!("unexpected PING reply {:?}", other))),
        }
    }
}
