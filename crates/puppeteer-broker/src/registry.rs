//! Live agent registry
//!
//! A plain set of agent names. Membership is advisory: an agent appears when
//! it opens its command stream and disappears when its heartbeat or command
//! stream fails, or when an operator evicts it.

use crate::{BrokerError, SharedBroker};
use tracing::{debug, info};

/// Set key holding the live agent names
pub const REGISTRY_KEY: &str = "puppets";

/// Set of agents currently believed to be connected
#[derive(Clone)]
pub struct AgentRegistry {
    broker: SharedBroker,
    key: String,
}

impl AgentRegistry {
    /// Create a registry over a broker using the default set key
    pub fn new(broker: SharedBroker) -> Self {
        Self::with_key(broker, REGISTRY_KEY)
    }

    /// Create a registry stored under a custom set key
    pub fn with_key(broker: SharedBroker, key: impl Into<String>) -> Self {
        Self {
            broker,
            key: key.into(),
        }
    }

    /// Mark an agent live; returns whether it was not already registered
    pub async fn register(&self, agent: &str) -> Result<bool, BrokerError> {
        let added = self.broker.add_member(&self.key, agent).await?;
        if added {
            info!("Agent {} registered", agent);
        } else {
            debug!("Agent {} already registered", agent);
        }
        Ok(added)
    }

    /// Remove an agent; returns whether it was registered
    pub async fn deregister(&self, agent: &str) -> Result<bool, BrokerError> {
        let removed = self.broker.remove_member(&self.key, agent).await?;
        if removed {
            info!("Agent {} deregistered", agent);
        }
        Ok(removed)
    }

    /// Snapshot of live agent names, sorted
    pub async fn list_live(&self) -> Result<Vec<String>, BrokerError> {
        self.broker.list_members(&self.key).await
    }
}
