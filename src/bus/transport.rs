//! Broker transport seam.
//!
//! Produces and polls raw keyed records. Implementations must confirm
//! a send synchronously (the caller treats return as broker ack) and
//! must preserve the relative order of records sharing a key.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::BusError;

/// One keyed record on a topic.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    /// Partition key; commands use the target agent id, broadcasts none.
    pub key: Option<String>,
    pub value: serde_json::Value,
}

/// Minimal produce/consume contract against the broker.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publishes a record, returning once the broker confirmed it.
    async fn send(&self, record: Record) -> Result<(), BusError>;

    /// Takes up to `max_records` from a topic, waiting at most
    /// `max_wait` for the first one. An empty result is not an error.
    async fn poll(
        &self,
        topic: &str,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<Record>, BusError>;
}

/// Channel-backed broker living inside the controller process.
///
/// A single FIFO per topic: records are observed in publish order,
/// which trivially preserves per-key ordering.
#[derive(Default)]
pub struct InProcessBroker {
    topics: Mutex<HashMap<String, VecDeque<Record>>>,
    arrived: Notify,
}

impl InProcessBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records currently queued on a topic, without consuming them.
    #[must_use]
    pub fn queued(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("broker mutex poisoned")
            .get(topic)
            .map_or(0, VecDeque::len)
    }

    fn drain(&self, topic: &str, max_records: usize) -> Vec<Record> {
        let mut topics = self.topics.lock().expect("broker mutex poisoned");
        let Some(queue) = topics.get_mut(topic) else {
            return Vec::new();
        };
        let take = queue.len().min(max_records);
        queue.drain(..take).collect()
    }
}

#[async_trait]
impl BusTransport for InProcessBroker {
    async fn send(&self, record: Record) -> Result<(), BusError> {
        {
            let mut topics = self.topics.lock().expect("broker mutex poisoned");
            topics
                .entry(record.topic.clone())
                .or_default()
                .push_back(record);
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn poll(
        &self,
        topic: &str,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<Record>, BusError> {
        let records = self.drain(topic, max_records);
        if !records.is_empty() {
            return Ok(records);
        }

        // Wait for the next publish, then try once more; an empty poll
        // after the wait simply yields nothing.
        let _ = timeout(max_wait, self.arrived.notified()).await;
        Ok(self.drain(topic, max_records))
    }
}
