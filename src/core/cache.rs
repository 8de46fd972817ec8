use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::polyfills::KeyValueStore;
use crate::types::{FeaturePayload, RepositoryKey};

/// One cached feature source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Most recent server payload.
    pub data: FeaturePayload,
    /// Version stamp from the payload, empty when the server sent none.
    pub version: String,
    /// Absolute deadline after which the entry is stale. Serialized as an
    /// ISO-8601 timestamp and rehydrated as a real timestamp.
    pub stale_at: DateTime<Utc>,
    /// Whether the server has ever advertised streaming for this key.
    pub sse: bool,
}

impl CacheEntry {
    /// Stale entries are still served, but trigger a background refresh.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.stale_at
    }
}

/// Process-wide cache of feature sources with a persistent-store mirror.
///
/// Entries iterate in insertion order. Hydration from the store happens
/// lazily, exactly once per process; every mutation mirrors the whole map
/// back out. Storage failures in either direction are swallowed: an
/// unusable store just means memory-only operation.
pub(crate) struct FeatureCache {
    entries: RwLock<IndexMap<RepositoryKey, CacheEntry>>,
    // Async mutex so concurrent first reads wait for one hydration instead
    // of racing the store.
    initialized: AsyncMutex<bool>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
            initialized: AsyncMutex::new(false),
        }
    }

    pub fn get(&self, key: &RepositoryKey) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn keys(&self) -> Vec<RepositoryKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Install or refresh an entry. Returns true when subscribers should be
    /// notified: a same-version payload only extends the staleness deadline.
    pub fn upsert(
        &self,
        key: RepositoryKey,
        payload: &FeaturePayload,
        stale_at: DateTime<Utc>,
        sse: bool,
    ) -> bool {
        let mut entries = self.entries.write();
        let version = payload.version();

        if let Some(existing) = entries.get_mut(&key) {
            if !version.is_empty() && existing.version == version {
                existing.stale_at = stale_at;
                return false;
            }
        }

        entries.insert(
            key,
            CacheEntry {
                data: payload.clone(),
                version,
                stale_at,
                sse,
            },
        );
        true
    }

    /// Drop every entry and require a fresh hydration on next use.
    pub async fn clear(&self) {
        self.entries.write().clear();
        *self.initialized.lock().await = false;
    }

    /// Load the persisted map once per process. Re-entry, an absent store,
    /// a read error, or invalid JSON all leave the in-memory map untouched;
    /// the flag is set regardless so there is one load attempt per process.
    pub async fn hydrate(&self, store: Option<Arc<dyn KeyValueStore>>, cache_key: &str) {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return;
        }
        *initialized = true;

        let Some(store) = store else { return };

        let raw = match store.get_item(cache_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "persistent cache read failed");
                return;
            }
        };

        match serde_json::from_str::<Vec<(String, CacheEntry)>>(&raw) {
            Ok(persisted) => {
                let mut entries = self.entries.write();
                for (key, entry) in persisted {
                    entries.insert(RepositoryKey::from(key), entry);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "persistent cache contained invalid data");
            }
        }
    }

    /// Serialize the whole map as `[[key, entry], …]` in insertion order.
    pub fn serialize(&self) -> String {
        let entries = self.entries.read();
        let pairs: Vec<(&str, &CacheEntry)> = entries
            .iter()
            .map(|(key, entry)| (key.as_str(), entry))
            .collect();
        serde_json::to_string(&pairs).unwrap_or_else(|_| "[]".to_string())
    }

    /// Fire-and-forget mirror write. The snapshot is taken synchronously so
    /// the write reflects the mutation that triggered it; delivery order
    /// between writes is unspecified and last-write-wins.
    pub fn persist_background(&self, store: Option<Arc<dyn KeyValueStore>>, cache_key: &str) {
        let Some(store) = store else { return };
        let snapshot = self.serialize();
        let cache_key = cache_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.set_item(&cache_key, &snapshot).await {
                tracing::debug!(error = %e, "persistent cache write failed");
            }
        });
    }

    /// Awaited mirror write, used where callers need the store settled
    /// before returning (cache clearing).
    pub async fn persist_now(&self, store: Option<Arc<dyn KeyValueStore>>, cache_key: &str) {
        let Some(store) = store else { return };
        let snapshot = self.serialize();
        if let Err(e) = store.set_item(cache_key, &snapshot).await {
            tracing::debug!(error = %e, "persistent cache write failed");
        }
    }
}
