// src/store.rs
//! Persisted registry state.
//! One record per entity address holding the confirmed connection set.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state serialization failed for '{address}': {source}")]
    Serialization {
        address: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("state backend error: {0}")]
    Backend(String),
}

/// The durable part of a registry: its confirmed members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    pub connections: HashSet<String>,
}

impl RegistryState {
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Storage seam for registry state. `clear` removes the record entirely;
/// an absent record and an empty one are distinct.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, address: &str) -> Result<Option<RegistryState>, StoreError>;

    async fn write(&self, address: &str, state: &RegistryState) -> Result<(), StoreError>;

    async fn clear(&self, address: &str) -> Result<(), StoreError>;
}

/// Write/clear counters, per store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub clears: u64,
}

/// Process-local store. Records are kept serialized so that reads always
/// observe exactly what was persisted, never a shared in-memory set.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: DashMap<String, Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
    clears: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record exists for `address` (regardless of its contents).
    pub fn contains(&self, address: &str) -> bool {
        self.records.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            clears: self.clears.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read(&self, address: &str) -> Result<Option<RegistryState>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let Some(raw) = self.records.get(address) else {
            return Ok(None);
        };
        serde_json::from_slice(raw.value())
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                address: address.to_string(),
                source,
            })
    }

    async fn write(&self, address: &str, state: &RegistryState) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(state).map_err(|source| StoreError::Serialization {
            address: address.to_string(),
            source,
        })?;
        self.records.insert(address.to_string(), raw);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, address: &str) -> Result<(), StoreError> {
        self.records.remove(address);
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_and_empty_records_are_distinct() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.read("chat::group::a").await.unwrap(), None);

        store
            .write("chat::group::a", &RegistryState::default())
            .await
            .unwrap();
        assert_eq!(
            store.read("chat::group::a").await.unwrap(),
            Some(RegistryState::default())
        );

        store.clear("chat::group::a").await.unwrap();
        assert!(!store.contains("chat::group::a"));
        assert_eq!(store.stats().writes, 1);
        assert_eq!(store.stats().clears, 1);
    }

    #[tokio::test]
    async fn write_replaces_previous_members() {
        let store = InMemoryStateStore::new();
        let mut state = RegistryState::default();
        state.connections.insert("c1".into());
        store.write("k", &state).await.unwrap();
        state.connections.insert("c2".into());
        store.write("k", &state).await.unwrap();

        let loaded = store.read("k").await.unwrap().expect("record");
        assert_eq!(loaded.connections.len(), 2);
        assert_eq!(store.len(), 1);
    }
}
