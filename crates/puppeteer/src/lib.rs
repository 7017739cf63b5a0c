//! # Puppeteer
//!
//! A coordinator ("puppetmaster") that brokers shell commands and file
//! transfers to named remote agents ("puppets") through a shared queue
//! broker, plus the TCP server that exposes it and a client for callers and
//! agents.
//!
//! Requesters talk to the coordinator, never to agents directly. Every
//! hand-off between a requester and an agent goes through a broker queue, so
//! the coordinator itself keeps no per-request state beyond open streams.

#![warn(missing_docs)]

pub use puppeteer_broker as broker;
pub use puppeteer_proto as proto;

/// Error types for the coordinator and client
pub mod error;

/// Coordinator, server and client configuration
pub mod config;

/// Coordinator protocol handler
pub mod coordinator;

/// TCP server exposing the coordinator
pub mod server;

/// Client for requesters and agents
pub mod client;

pub use client::{Client, Subscription};
pub use config::{BrokerConfig, ClientConfig, CoordinatorConfig};
pub use coordinator::{Coordinator, PeerSink};
pub use error::{ClientError, CoordinatorError};
pub use server::Server;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
