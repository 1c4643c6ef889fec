//! Publish/subscribe transport between replicas.
//!
//! The coordinator only needs two things from a transport: publish bytes to
//! a topic, and pull the bytes published to a topic. Delivery is expected to
//! be at-least-once with no ordering promise across publishers, and the
//! coordinator tolerates both.
//!
//! [`MemoryBroker`] is an in-process implementation for tests and the demo
//! binary. It can be switched offline and told to deliver everything twice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;

/// Stream of raw messages for one topic. `None` from `recv` means the
/// subscription was dropped by the broker and must be renewed.
pub type Subscription = mpsc::UnboundedReceiver<Vec<u8>>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

#[derive(Default)]
struct Topics {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    offline: bool,
    duplicate: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Topics>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        return MemoryBroker::default();
    }

    /// While offline every publish and subscribe fails with
    /// [`Error::BrokerUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.lock().offline = !available;
    }

    /// Deliver every message twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.inner.lock().duplicate = duplicate;
    }

    /// End every subscription, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.inner.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.lock();
        return topics.subscribers.get(topic).map_or(0, |subs| subs.len());
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut topics = self.inner.lock();
        if topics.offline {
            return Err(Error::BrokerUnavailable(format!("publish to {topic}")));
        }
        let copies = if topics.duplicate { 2 } else { 1 };
        if let Some(subs) = topics.subscribers.get_mut(topic) {
            subs.retain(|tx| !tx.is_closed());
            for tx in subs.iter() {
                for _ in 0..copies {
                    let _ = tx.send(payload.clone());
                }
            }
            debug!(topic, subscribers = subs.len(), bytes = payload.len(), "published");
        }
        return Ok(());
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut topics = self.inner.lock();
        if topics.offline {
            return Err(Error::BrokerUnavailable(format!("subscribe to {topic}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        topics.subscribers.entry(topic.to_string()).or_default().push(tx);
        return Ok(rx);
    }
}
