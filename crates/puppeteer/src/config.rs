//! Coordinator, server and client configuration

use crate::CoordinatorError;
use puppeteer_broker::{MemoryBroker, RespBroker, RespConfig, SharedBroker};
use puppeteer_proto::codec::MAX_FRAME_SIZE;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default coordinator port
pub const DEFAULT_PORT: u16 = 50051;

/// Default ceiling on every blocking queue wait (two hours)
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Default interval between heartbeat pings
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default client connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interface to listen on
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Ceiling on result, command and file waits
    pub wait_timeout: Duration,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl CoordinatorConfig {
    /// Set the listen interface
    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Set the listen port; 0 picks a free port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the wait ceiling
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Set the largest accepted frame
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// `host:port` to bind
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Which queue substrate the coordinator uses
#[derive(Debug, Clone, Default)]
pub enum BrokerConfig {
    /// In-process broker; state dies with the coordinator
    #[default]
    Memory,
    /// Redis-compatible server
    Resp(RespConfig),
}

impl FromStr for BrokerConfig {
    type Err = CoordinatorError;

    /// Accepts `memory` or `redis://host[:port]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("memory") {
            return Ok(Self::Memory);
        }
        let Some(address) = s.strip_prefix("redis://") else {
            return Err(CoordinatorError::InvalidRequest(format!(
                "unknown broker {:?}, expected \"memory\" or redis://host:port",
                s
            )));
        };
        let address = address.trim_end_matches('/');
        if address.is_empty() {
            return Err(CoordinatorError::InvalidRequest("redis URL without a host".to_string()));
        }
        let address = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:6379", address)
        };
        Ok(Self::Resp(RespConfig::new(address)))
    }
}

impl BrokerConfig {
    /// Open the broker and check that it answers
    pub async fn connect(&self) -> Result<SharedBroker, CoordinatorError> {
        match self {
            Self::Memory => {
                info!("Using in-memory broker");
                Ok(Arc::new(MemoryBroker::new()))
            }
            Self::Resp(config) => {
                info!("Connecting to broker at {}", config.address);
                Ok(Arc::new(RespBroker::connect(config.clone()).await?))
            }
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator address, `host:port`
    pub address: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Largest frame accepted from the coordinator
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("localhost:{}", DEFAULT_PORT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for a coordinator address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the largest accepted frame
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}
