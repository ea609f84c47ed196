//! Bind address to active forward

use crate::users::ForwardInfo;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portmesh_common::{Result, TunnelError};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One listener opened on behalf of a peer
#[derive(Debug)]
pub struct ForwardEntry {
    /// `host:port` as requested, with the bound port
    pub key: String,
    pub bound_addr: SocketAddr,
    /// Connection that requested the forward
    pub connection_id: u64,
    pub info: ForwardInfo,
    /// Cancelling stops the accept loop, which closes the listener
    pub shutdown: CancellationToken,
    /// Pending create callback; the delete callback waits for it
    pub create_callback: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardEntry {
    /// Remember the task running the create callback
    pub fn set_create_callback(&self, task: JoinHandle<()>) {
        *self.create_callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Take the create callback task, leaving nothing to wait for
    pub fn take_create_callback(&self) -> Option<JoinHandle<()>> {
        self.create_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Thread-safe forward registry
///
/// At most one entry exists per key. Removal is keyed by the owning
/// connection so a peer cannot cancel another peer's forward.
#[derive(Debug, Clone, Default)]
pub struct ForwardRegistry {
    entries: Arc<DashMap<String, Arc<ForwardEntry>>>,
}

impl ForwardRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry key of a forward: `host:port`
    pub fn key(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    /// Add `entry`, refusing a key that is already taken
    pub fn insert(&self, entry: Arc<ForwardEntry>) -> Result<()> {
        match self.entries.entry(entry.key.clone()) {
            Entry::Occupied(existing) => Err(TunnelError::InvalidState(format!(
                "forward {} already owned by connection {}",
                existing.key(),
                existing.get().connection_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Entry registered under `key`
    pub fn get(&self, key: &str) -> Option<Arc<ForwardEntry>> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    /// Whether a forward is registered under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove `key` if it belongs to `connection_id`
    pub fn remove_owned(&self, key: &str, connection_id: u64) -> Option<Arc<ForwardEntry>> {
        self.entries
            .remove_if(key, |_, entry| entry.connection_id == connection_id)
            .map(|(_, entry)| entry)
    }

    /// Remove and return every entry owned by `connection_id`
    pub fn drain_connection(&self, connection_id: u64) -> Vec<Arc<ForwardEntry>> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.connection_id == connection_id)
            .map(|r| r.key().clone())
            .collect();

        keys.iter()
            .filter_map(|key| self.remove_owned(key, connection_id))
            .collect()
    }

    /// Number of open forwards
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
