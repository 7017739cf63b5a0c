//! In-process broker adapter
//!
//! Keeps sets and queues in memory behind a single lock. Blocked poppers
//! register interest while still holding the lock, so a push can never slip
//! between the emptiness check and the wait.

use crate::{BrokerError, QueueBroker};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Default)]
struct State {
    closed: bool,
    sets: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, VecDeque<Bytes>>,
    waiters: HashMap<String, Weak<Notify>>,
}

impl State {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Unavailable("memory broker closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn pop(&mut self, key: &str) -> Option<Bytes> {
        let queue = self.queues.get_mut(key)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        item
    }

    /// Shared wake-up handle for a key, created on first use
    fn waiter(&mut self, key: &str) -> Arc<Notify> {
        self.waiters.retain(|_, weak| weak.strong_count() > 0);
        if let Some(notify) = self.waiters.get(key).and_then(Weak::upgrade) {
            return notify;
        }
        let notify = Arc::new(Notify::new());
        self.waiters.insert(key.to_string(), Arc::downgrade(&notify));
        notify
    }

    fn wake_one(&mut self, key: &str) {
        match self.waiters.get(key).and_then(Weak::upgrade) {
            Some(notify) => notify.notify_one(),
            None => {
                self.waiters.remove(key);
            }
        }
    }
}

/// Broker backed by process memory
///
/// Suitable for a single coordinator process and for tests. Contents do not
/// survive a restart.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently queued under a key
    pub async fn queue_len(&self, queue_key: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue_key).map_or(0, VecDeque::len)
    }

    /// Shut the broker down; every pending and future operation fails
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        for notify in state.waiters.values().filter_map(Weak::upgrade) {
            notify.notify_waiters();
        }
        debug!("Memory broker closed");
    }

    /// Whether [`close`](Self::close) has been called
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn add_member(&self, set_key: &str, value: &str) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state
            .sets
            .entry(set_key.to_string())
            .or_default()
            .insert(value.to_string()))
    }

    async fn remove_member(&self, set_key: &str, value: &str) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let Some(set) = state.sets.get_mut(set_key) else {
            return Ok(false);
        };
        let removed = set.remove(value);
        if set.is_empty() {
            state.sets.remove(set_key);
        }
        Ok(removed)
    }

    async fn list_members(&self, set_key: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state
            .sets
            .get(set_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn push_right(&self, queue_key: &str, item: Bytes) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state
            .queues
            .entry(queue_key.to_string())
            .or_default()
            .push_back(item);
        state.wake_one(queue_key);
        trace!("Pushed item onto {}", queue_key);
        Ok(())
    }

    async fn blocking_pop_left(
        &self,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<(String, Bytes), BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            if let Some(item) = state.pop(queue_key) {
                return Ok((queue_key.to_string(), item));
            }

            let notify = state.waiter(queue_key);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last look: a push may have landed right at the deadline
                let mut state = self.state.lock().await;
                state.ensure_open()?;
                return match state.pop(queue_key) {
                    Some(item) => Ok((queue_key.to_string(), item)),
                    None => Err(BrokerError::Timeout {
                        key: queue_key.to_string(),
                        duration: timeout,
                    }),
                };
            }
        }
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.state.lock().await.ensure_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_set_membership() {
        let broker = MemoryBroker::new();

        assert!(broker.add_member("puppets", "alpis").await.unwrap());
        assert!(!broker.add_member("puppets", "alpis").await.unwrap());
        broker.add_member("puppets", "bravo").await.unwrap();

        assert_eq!(
            broker.list_members("puppets").await.unwrap(),
            vec!["alpis".to_string(), "bravo".to_string()]
        );

        assert!(broker.remove_member("puppets", "alpis").await.unwrap());
        assert!(!broker.remove_member("puppets", "alpis").await.unwrap());
        assert!(!broker.remove_member("nothing", "alpis").await.unwrap());
        assert_eq!(broker.list_members("puppets").await.unwrap(), vec!["bravo"]);
    }

    #[tokio::test]
    async fn test_pop_returns_queued_item() {
        let broker = MemoryBroker::new();
        broker.push_right("q", Bytes::from("one")).await.unwrap();

        let (key, item) = broker
            .blocking_pop_left("q", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(key, "q");
        assert_eq!(item, Bytes::from("one"));
        assert_eq!(broker.queue_len("q").await, 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let broker = Arc::new(MemoryBroker::new());

        let popper = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.blocking_pop_left("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push_right("q", Bytes::from("late")).await.unwrap();

        let (_, item) = popper.await.unwrap().unwrap();
        assert_eq!(item, Bytes::from("late"));
    }

    #[tokio::test]
    async fn test_pop_times_out() {
        let broker = MemoryBroker::new();
        let result = broker.blocking_pop_left("q", Duration::from_millis(30)).await;

        match result {
            Err(BrokerError::Timeout { key, duration }) => {
                assert_eq!(key, "q");
                assert_eq!(duration, Duration::from_millis(30));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_each_item_delivered_once() {
        let broker = Arc::new(MemoryBroker::new());
        let mut poppers = Vec::new();
        for _ in 0..4 {
            let broker = broker.clone();
            poppers.push(tokio::spawn(async move {
                broker.blocking_pop_left("q", Duration::from_secs(5)).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..4u8 {
            broker.push_right("q", Bytes::from(vec![i])).await.unwrap();
        }

        let mut seen = Vec::new();
        for popper in poppers {
            let (_, item) = popper.await.unwrap().unwrap();
            seen.push(item[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_pop_does_not_lose_items() {
        let broker = Arc::new(MemoryBroker::new());

        // Start a pop and abandon it
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            broker.blocking_pop_left("q", Duration::from_secs(5)),
        )
        .await;
        assert!(abandoned.is_err());

        broker.push_right("q", Bytes::from("kept")).await.unwrap();
        assert_eq!(broker.queue_len("q").await, 1);

        let (_, item) = broker
            .blocking_pop_left("q", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(item, Bytes::from("kept"));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let broker = Arc::new(MemoryBroker::new());

        let popper = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.blocking_pop_left("q", Duration::from_secs(60)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("popper should wake on close")
            .unwrap();
        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
        assert!(broker.is_closed().await);
        assert!(matches!(broker.ping().await, Err(BrokerError::Unavailable(_))));
        assert!(broker.push_right("q", Bytes::new()).await.is_err());
    }

    proptest! {
        #[test]
        fn test_fifo_order_preserved(items in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..32)) {
            let popped = tokio_test::block_on(async {
                let broker = MemoryBroker::new();
                for item in &items {
                    broker.push_right("q", Bytes::from(item.clone())).await.unwrap();
                }
                let mut popped = Vec::new();
                for _ in 0..items.len() {
                    let (_, item) = broker
                        .blocking_pop_left("q", Duration::from_secs(1))
                        .await
                        .unwrap();
                    popped.push(item.to_vec());
                }
                popped
            });

            prop_assert_eq!(popped, items);
        }
    }
}
