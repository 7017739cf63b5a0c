//! Client for requesters and agents
//!
//! Each call opens its own connection. The write side is left open for the
//! whole call: the coordinator treats end-of-input as the caller going away.

use crate::{ClientConfig, ClientError};
use bytes::Bytes;
use futures::stream::{self, Stream};
use puppeteer_proto::{Channel, Command, FileTransfer, FrameCodec, Message, Ping, Request, Response};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

/// Result type alias for client calls
pub type Result<T> = std::result::Result<T, ClientError>;

/// Handle for talking to a coordinator
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
}

/// Lazy sequence of items from a streaming call
///
/// Ends for good after the coordinator finishes the stream or fails it.
pub struct Subscription<T> {
    channel: Channel<TcpStream>,
    extract: fn(Response) -> std::result::Result<T, Response>,
    done: bool,
}

impl<T> Subscription<T> {
    /// Next item, or `None` once the stream has ended
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.done {
            return Ok(None);
        }
        let message = match self.channel.recv().await {
            Ok(message) => message,
            Err(e) => {
                self.done = true;
                return Err(e.into());
            }
        };
        match message {
            Some(Message::Response(response)) => match (self.extract)(response) {
                Ok(item) => Ok(Some(item)),
                Err(other) => {
                    self.done = true;
                    Err(ClientError::UnexpectedResponse(other.kind().to_string()))
                }
            },
            Some(Message::Request(request)) => {
                self.done = true;
                Err(ClientError::UnexpectedResponse(request.kind().to_string()))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Whether the stream has ended
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Adapt into a [`Stream`]; an error is yielded once and ends it
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        stream::unfold(self, |mut subscription| async move {
            match subscription.next().await {
                Ok(Some(item)) => Some((Ok(item), subscription)),
                Ok(None) => None,
                Err(e) => Some((Err(e), subscription)),
            }
        })
    }
}

impl Client {
    /// Create a client for a coordinator address
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(address))
    }

    /// Create a client from a full configuration
    pub fn with_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Coordinator address
    pub fn address(&self) -> &str {
        &self.config.address
    }

    async fn open(&self, request: Request) -> Result<Channel<TcpStream>> {
        let address = &self.config.address;
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Connect {
                address: address.clone(),
                reason: format!("timed out after {:?}", self.config.connect_timeout),
            })?
            .map_err(|e| ClientError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        let codec = FrameCodec::with_max_frame_size(self.config.max_frame_size);
        let mut channel = Channel::with_codec(stream, codec);
        debug!("Opening {} against {}", request.kind(), address);
        channel.send(&Message::request(request)).await?;
        Ok(channel)
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let mut channel = self.open(request).await?;
        let response = match channel.recv().await? {
            Some(Message::Response(response)) => response,
            Some(Message::Request(request)) => {
                return Err(ClientError::UnexpectedResponse(request.kind().to_string()))
            }
            None => {
                return Err(ClientError::UnexpectedResponse(
                    "call ended without a reply".to_string(),
                ))
            }
        };
        // Drain the end-of-stream marker
        while channel.recv().await?.is_some() {}
        Ok(response)
    }

    async fn subscribe<T>(
        &self,
        request: Request,
        extract: fn(Response) -> std::result::Result<T, Response>,
    ) -> Result<Subscription<T>> {
        Ok(Subscription {
            channel: self.open(request).await?,
            extract,
            done: false,
        })
    }

    /// Live agents
    pub async fn list_agents(&self) -> Result<Vec<String>> {
        match self.call(Request::ListAgents).await? {
            Response::Agents { agents } => Ok(agents),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// Run a command on an agent and wait for its output
    pub async fn run_command(&self, agent: &str, command: &str) -> Result<String> {
        let request = Request::RunCommand {
            agent: agent.to_string(),
            command: command.to_string(),
        };
        match self.call(request).await? {
            Response::CommandOutput { result } => Ok(result),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// Queue a file for an agent
    pub async fn copy_file(&self, agent: &str, file_name: &str, contents: Bytes) -> Result<()> {
        let request = Request::CopyFile {
            agent: agent.to_string(),
            file_name: file_name.to_string(),
            contents,
        };
        match self.call(request).await? {
            Response::Copied => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// Report a command's output
    pub async fn send_result(&self, correlation_id: Uuid, result: &str) -> Result<()> {
        let request = Request::SendResult {
            correlation_id,
            result: result.to_string(),
        };
        match self.call(request).await? {
            Response::ResultAccepted => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// Tear down an agent's streams; returns whether it was registered
    pub async fn evict(&self, agent: &str) -> Result<bool> {
        let request = Request::Evict {
            agent: agent.to_string(),
        };
        match self.call(request).await? {
            Response::Evicted { was_registered } => Ok(was_registered),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// Register as `agent` and receive its commands
    pub async fn commands(&self, agent: &str) -> Result<Subscription<Command>> {
        let request = Request::GetCommands {
            agent: agent.to_string(),
        };
        self.subscribe(request, |response| match response {
            Response::Command(command) => Ok(command),
            other => Err(other),
        })
        .await
    }

    /// Receive files addressed to `agent`
    pub async fn files(&self, agent: &str) -> Result<Subscription<FileTransfer>> {
        let request = Request::GetFiles {
            agent: agent.to_string(),
        };
        self.subscribe(request, |response| match response {
            Response::File(file) => Ok(file),
            other => Err(other),
        })
        .await
    }

    /// Receive heartbeat pings for `agent`
    pub async fn heartbeat(&self, agent: &str) -> Result<Subscription<Ping>> {
        let request = Request::Heartbeat {
            agent: agent.to_string(),
        };
        self.subscribe(request, |response| match response {
            Response::Ping(ping) => Ok(ping),
            other => Err(other),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoordinatorConfig, Server};
    use futures::StreamExt;
    use puppeteer_broker::MemoryBroker;
    use puppeteer_proto::ErrorCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start(config: CoordinatorConfig) -> Client {
        let config = config.with_bind_address("127.0.0.1").with_port(0);
        let server = Server::bind(config, Arc::new(MemoryBroker::new())).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        Client::new(addr.to_string())
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(addr.to_string());
        assert!(matches!(
            client.list_agents().await,
            Err(ClientError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_unary_calls() {
        let client = start(CoordinatorConfig::default()).await;

        assert!(client.list_agents().await.unwrap().is_empty());
        client
            .copy_file("alpis", "a.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        client.send_result(Uuid::new_v4(), "stray").await.unwrap();
        assert!(!client.evict("alpis").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_command_timeout_is_remote_error() {
        let client = start(CoordinatorConfig::default().with_wait_timeout(Duration::from_millis(50))).await;

        let err = client.run_command("alpis", "uptime").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.code(), Some(ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn test_subscription_ends_after_eviction() {
        let client = start(CoordinatorConfig::default()).await;
        let mut commands = client.commands("alpis").await.unwrap();

        timeout(Duration::from_secs(2), async {
            while client.list_agents().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(client.evict("alpis").await.unwrap());
        let err = timeout(Duration::from_secs(1), commands.next())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::TransportFailure));
        assert!(commands.is_done());
        assert!(commands.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_into_stream() {
        let client = start(CoordinatorConfig::default().with_heartbeat_interval(Duration::from_millis(10))).await;
        let pings = client.heartbeat("alpis").await.unwrap().into_stream();

        let received: Vec<_> = timeout(Duration::from_secs(1), pings.take(3).collect())
            .await
            .unwrap();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|ping| ping.is_ok()));
    }
}
