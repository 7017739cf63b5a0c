//! Broker capability trait

use crate::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Key-addressed blocking-queue and set substrate
///
/// Every operation is atomic at the broker, so one handle may be shared by
/// any number of concurrent tasks without extra locking.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Add a member to a set; returns whether it was newly added
    async fn add_member(&self, set_key: &str, value: &str) -> Result<bool, BrokerError>;

    /// Remove a member from a set; removing an unknown member is not an error
    async fn remove_member(&self, set_key: &str, value: &str) -> Result<bool, BrokerError>;

    /// Snapshot of a set's members, sorted
    async fn list_members(&self, set_key: &str) -> Result<Vec<String>, BrokerError>;

    /// Append an item to a queue without blocking
    async fn push_right(&self, queue_key: &str, item: Bytes) -> Result<(), BrokerError>;

    /// Remove and return the head of a queue, waiting up to `timeout` for one
    ///
    /// Fails with [`BrokerError::Timeout`] when the wait elapses.
    async fn blocking_pop_left(
        &self,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<(String, Bytes), BrokerError>;

    /// Check that the broker is reachable
    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Broker handle injected into every component
pub type SharedBroker = Arc<dyn QueueBroker>;
