//! Document key to coordinator mapping.
//!
//! A coordinator is created the first time its document is opened and torn
//! down by [`Registry::reap_idle`] once it has had no connected clients for
//! the configured idle timeout. Each coordinator gets a freshly generated
//! replica key, so a document reopened after reaping joins as a new replica
//! and catches up from its peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use crate::broker::Broker;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::coordinator::CoordinatorHandle;
use crate::key::ReplicaKey;

struct Entry {
    handle: CoordinatorHandle,
    idle_since: Option<Instant>,
}

#[derive(Clone)]
pub struct Registry {
    broker: Arc<dyn Broker>,
    config: Config,
    documents: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Registry {
    pub fn new(broker: Arc<dyn Broker>, config: Config) -> Registry {
        return Registry {
            broker,
            config,
            documents: Arc::new(Mutex::new(HashMap::new())),
        };
    }

    fn idle_timeout(&self) -> Duration {
        return self.config.registry.idle_timeout();
    }

    /// The coordinator for `document`, started if it is not running.
    pub async fn open(&self, document: &str) -> CoordinatorHandle {
        let mut documents = self.documents.lock().await;
        if let Some(entry) = documents.get(document) {
            if !entry.handle.is_closed() {
                return entry.handle.clone();
            }
        }

        let handle = Coordinator::spawn(
            document,
            ReplicaKey::generate(),
            self.broker.clone(),
            &self.config,
        )
        .await;
        info!(document, replica = ?handle.replica(), "document opened");
        documents.insert(
            document.to_string(),
            Entry { handle: handle.clone(), idle_since: None },
        );
        return handle;
    }

    /// The running coordinator for `document`, if any.
    pub async fn get(&self, document: &str) -> Option<CoordinatorHandle> {
        let documents = self.documents.lock().await;
        return documents.get(document).map(|entry| entry.handle.clone());
    }

    /// Keys of the running documents, sorted.
    pub async fn documents(&self) -> Vec<String> {
        let documents = self.documents.lock().await;
        let mut keys: Vec<String> = documents.keys().cloned().collect();
        keys.sort();
        return keys;
    }

    /// Shut down coordinators that have been without clients for longer
    /// than the idle timeout. Returns the keys that were removed.
    pub async fn reap_idle(&self, now: Instant) -> Vec<String> {
        let timeout = self.idle_timeout();
        let mut documents = self.documents.lock().await;
        let mut reaped = Vec::new();

        for (key, entry) in documents.iter_mut() {
            let clients = match entry.handle.status().await {
                Ok(status) => status.clients,
                Err(e) => {
                    warn!(document = %key, %e, "coordinator gone");
                    reaped.push(key.clone());
                    continue;
                }
            };
            if clients > 0 {
                entry.idle_since = None;
                continue;
            }
            let since = *entry.idle_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= timeout {
                reaped.push(key.clone());
            }
        }

        for key in &reaped {
            if let Some(entry) = documents.remove(key) {
                let _ = entry.handle.shutdown().await;
                info!(document = %key, "idle document closed");
            }
        }
        reaped.sort();
        return reaped;
    }

    /// Shut down every coordinator.
    pub async fn close_all(&self) {
        let mut documents = self.documents.lock().await;
        for (key, entry) in documents.drain() {
            let _ = entry.handle.shutdown().await;
            info!(document = %key, "document closed");
        }
    }
}
