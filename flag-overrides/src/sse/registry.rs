use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::errors::DeliveryError;
use crate::metrics_consts::CONNECTIONS_GAUGE;
use crate::metrics_utils::gauge;
use crate::sse::types::FlagChangeEvent;

/// One live subscriber. `send` must not block forever on a stalled peer; the broadcaster
/// bounds every call with a timeout regardless.
#[async_trait]
pub trait ConnectionHandle {
    async fn send(&self, event: &FlagChangeEvent) -> Result<(), DeliveryError>;
}

pub type SharedConnection = Arc<dyn ConnectionHandle + Send + Sync>;

/// Connection backed by a bounded channel; the SSE response drains the other end.
pub struct ChannelConnection {
    tx: mpsc::Sender<FlagChangeEvent>,
}

impl ChannelConnection {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<FlagChangeEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConnectionHandle for ChannelConnection {
    async fn send(&self, event: &FlagChangeEvent) -> Result<(), DeliveryError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| DeliveryError::Closed)
    }
}

/// Live subscriber connections, keyed by connection id.
///
/// Readers take a snapshot and release the lock before doing any I/O, so a slow
/// subscriber never holds up registration or removal.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, SharedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a connection. An existing entry under the same id is replaced.
    pub fn add(&self, connection_id: impl Into<String>, connection: SharedConnection) {
        let connection_id = connection_id.into();
        let count = {
            let mut connections = self.lock();
            if connections
                .insert(connection_id.clone(), connection)
                .is_some()
            {
                tracing::debug!(connection_id = %connection_id, "Replaced existing connection");
            }
            connections.len()
        };
        gauge(CONNECTIONS_GAUGE, &[], count as f64);
    }

    /// Returns whether anything was removed. Removing an unknown id is a no-op.
    pub fn remove(&self, connection_id: &str) -> bool {
        let (removed, count) = {
            let mut connections = self.lock();
            let removed = connections.remove(connection_id).is_some();
            (removed, connections.len())
        };
        if removed {
            gauge(CONNECTIONS_GAUGE, &[], count as f64);
        }
        removed
    }

    /// Removes `connection_id` only while it still maps to `connection`, so a replacement
    /// registered under the same id survives.
    pub fn evict(&self, connection_id: &str, connection: &SharedConnection) -> bool {
        let (removed, count) = {
            let mut connections = self.lock();
            let removed = match connections.get(connection_id) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    connections.remove(connection_id);
                    true
                }
                _ => false,
            };
            (removed, connections.len())
        };
        if removed {
            gauge(CONNECTIONS_GAUGE, &[], count as f64);
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<SharedConnection> {
        self.lock().get(connection_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> Vec<(String, SharedConnection)> {
        self.lock()
            .iter()
            .map(|(id, connection)| (id.clone(), connection.clone()))
            .collect()
    }

    /// Visits every connection registered at call time. Registrations made while the
    /// visit is running are not seen.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &SharedConnection),
    {
        for (id, connection) in self.snapshot() {
            visit(&id, &connection);
        }
    }
}
