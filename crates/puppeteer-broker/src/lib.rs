//! # Puppeteer Broker
//!
//! The queue substrate behind the coordinator: a capability trait for a
//! blocking-queue/set broker, its adapters, and the two logical components
//! built on top of it (per-agent work queues and the live agent registry).

#![warn(missing_docs)]

/// Broker capability trait
pub mod broker;

/// In-process broker adapter
pub mod memory;

/// RESP wire format and connections
pub mod resp;

/// Pooled RESP broker adapter
pub mod pool;

/// Per-agent and per-correlation work queues
pub mod queues;

/// Live agent registry
pub mod registry;

/// Broker error types
pub mod error;

pub use broker::{QueueBroker, SharedBroker};
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use pool::{RespBroker, RespConfig};
pub use queues::WorkQueues;
pub use registry::AgentRegistry;
