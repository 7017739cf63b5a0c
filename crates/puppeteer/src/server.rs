//! TCP server exposing the coordinator
//!
//! One connection carries one call. The server reads the request, splits the
//! channel, and watches the read half for the peer going away while the
//! coordinator writes replies to the write half.

use crate::{Coordinator, CoordinatorConfig, CoordinatorError, Result};
use puppeteer_broker::SharedBroker;
use puppeteer_proto::{Channel, ErrorDetails, FrameCodec, Message, ProtocolError};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coordinator bound to a listening socket
pub struct Server {
    coordinator: Coordinator,
    listener: TcpListener,
}

impl Server {
    /// Check the broker, then bind the configured address
    pub async fn bind(config: CoordinatorConfig, broker: SharedBroker) -> Result<Self> {
        broker.ping().await?;
        let listener = TcpListener::bind(config.listen_address()).await?;
        info!("Puppetmaster listening on {}", listener.local_addr()?);
        Ok(Self {
            coordinator: Coordinator::new(broker, config),
            listener,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handler shared by every connection
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Token that stops the server and every call when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.shutdown_token()
    }

    /// Stop accepting connections and cancel every open call
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }

    /// Accept connections until shut down
    pub async fn serve(self) -> Result<()> {
        let shutdown = self.coordinator.shutdown_token();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        handle_connection(coordinator, stream, peer).await;
                    });
                }
                Err(e) => {
                    // Accept errors are usually transient (e.g. fd exhaustion)
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        info!("Puppetmaster stopped");
        Ok(())
    }

    /// Accept connections until `signal` completes, then cancel every call
    pub async fn serve_until<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let coordinator = self.coordinator.clone();
        let serve = self.serve();
        tokio::pin!(serve);
        tokio::select! {
            result = &mut serve => return result,
            _ = signal => coordinator.shutdown(),
        }
        serve.await
    }
}

async fn handle_connection(coordinator: Coordinator, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }
    let codec = FrameCodec::with_max_frame_size(coordinator.config().max_frame_size);
    let mut channel = Channel::with_codec(stream, codec);

    let request = match channel.recv().await {
        Ok(Some(Message::Request(request))) => request,
        Ok(Some(Message::Response(response))) => {
            warn!("Peer {} opened a call with a {} response", peer, response.kind());
            let rejection = ProtocolError::UnexpectedMessage(format!(
                "{} response where a request was expected",
                response.kind()
            ));
            if let Err(e) = channel.send_error(ErrorDetails::from(rejection)).await {
                debug!("Could not reject call from {}: {}", peer, e);
            }
            return;
        }
        Ok(None) => {
            debug!("Peer {} closed before sending a request", peer);
            return;
        }
        Err(e) if e.is_disconnect() => {
            debug!("Peer {} went away before sending a request: {}", peer, e);
            return;
        }
        Err(e) => {
            warn!("Failed to read request from {}: {}", peer, e);
            return;
        }
    };

    let kind = request.kind();
    if request.is_streaming() {
        info!("Opening {} stream for {}", kind, peer);
    } else {
        debug!("Call {} from {}", kind, peer);
    }

    let (mut sender, receiver) = channel.split();
    let call = coordinator.shutdown_token().child_token();
    let watcher = {
        let call = call.clone();
        tokio::spawn(async move {
            receiver.closed().await;
            call.cancel();
        })
    };

    let outcome = coordinator.dispatch(request, &mut sender, call.clone()).await;
    watcher.abort();

    let delivered = match outcome {
        Ok(()) => sender.finish().await,
        Err(e) => {
            if !matches!(e, CoordinatorError::Cancelled) || !call.is_cancelled() {
                warn!("Call {} from {} failed: {}", kind, peer, e);
            }
            sender.send_error(ErrorDetails::from(e).with_context("call", kind)).await
        }
    };
    match delivered {
        Ok(()) => {}
        Err(e) if e.is_disconnect() => debug!("Peer {} left before call {} completed: {}", peer, kind, e),
        Err(e) => warn!("Could not complete call {} for {}: {}", kind, peer, e),
    }
    if let Err(e) = sender.close().await {
        debug!("Error closing connection to {}: {}", peer, e);
    }
}
