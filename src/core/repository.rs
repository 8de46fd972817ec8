use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::core::cache::FeatureCache;
use crate::core::streaming::{PayloadCallback, RefetchCallback, StreamingManager};
use crate::error::{ErrorCode, RepoError, Result};
use crate::instance::{same_instance, SharedInstance};
use crate::polyfills::{FetchRequest, Polyfills, PolyfillsUpdate};
use crate::types::{
    CacheSettings, CacheSettingsUpdate, FeaturePayload, RefreshOptions, RepositoryKey,
};

/// A coalesced fetch: everyone waiting on the same key polls a clone of
/// the same shared future.
type SharedFetch = Shared<BoxFuture<'static, FeaturePayload>>;

/// Shared feature repository.
///
/// One repository serves every SDK instance in the process: it caches
/// payloads per repository key, collapses concurrent refreshes into a
/// single request, mirrors the cache into a persistent store, listens for
/// server-pushed updates over one event stream per key, and fans new
/// payloads out to every subscribed instance.
///
/// Most embedders use the module-scoped singleton through the free
/// functions at the crate root; constructing separate repositories is
/// mainly for tests and unusual isolation needs.
pub struct FeatureRepository {
    inner: Arc<RepoInner>,
}

pub(crate) struct RepoInner {
    settings: RwLock<CacheSettings>,
    polyfills: RwLock<Polyfills>,
    cache: FeatureCache,
    in_flight: Mutex<IndexMap<RepositoryKey, SharedFetch>>,
    subscribers: Mutex<IndexMap<RepositoryKey, Vec<SharedInstance>>>,
    streaming: StreamingManager,
}

impl FeatureRepository {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RepoInner {
                settings: RwLock::new(CacheSettings::default()),
                polyfills: RwLock::new(Polyfills::default()),
                cache: FeatureCache::new(),
                in_flight: Mutex::new(IndexMap::new()),
                subscribers: Mutex::new(IndexMap::new()),
                streaming: StreamingManager::new(),
            }),
        }
    }

    /// Obtain the current payload for the instance's feature source.
    ///
    /// Serves from cache when possible, fetching in the background if the
    /// entry went stale; otherwise issues (or joins) the single in-flight
    /// fetch for the key. Returns `Ok(None)` when `options.timeout`
    /// elapses first — the fetch keeps running and still populates the
    /// cache. Decryption failures while applying the payload to this
    /// instance are the only errors surfaced.
    pub async fn refresh_features(
        &self,
        instance: &SharedInstance,
        options: &RefreshOptions,
    ) -> Result<Option<FeaturePayload>> {
        if options.background_sync == Some(false) {
            // One-way latch: opting out disables streaming process-wide
            // until reconfigured.
            self.inner.settings.write().background_sync = false;
        }

        let data = RepoInner::fetch_with_cache(&self.inner, instance, options).await;

        if options.update_instance {
            if let Some(payload) = &data {
                self.inner.refresh_instance(instance, payload).await?;
            }
        }

        Ok(data)
    }

    /// Register an instance for payload fan-out on its current key.
    pub fn subscribe(&self, instance: &SharedInstance) {
        let key = RepositoryKey::for_instance(instance.as_ref());
        let mut subscribers = self.inner.subscribers.lock();
        let set = subscribers.entry(key).or_insert_with(Vec::new);
        if !set.iter().any(|existing| same_instance(existing, instance)) {
            set.push(Arc::clone(instance));
        }
    }

    /// Remove an instance from every key's set. The instance's key may
    /// have changed since it subscribed, so all sets are scanned.
    pub fn unsubscribe(&self, instance: &SharedInstance) {
        let mut subscribers = self.inner.subscribers.lock();
        for (_, set) in subscribers.iter_mut() {
            set.retain(|existing| !same_instance(existing, instance));
        }
    }

    /// Drop all shared state: cache, in-flight fetches, streaming channels
    /// and support set, subscriptions, and the hydration flag. The empty
    /// cache is written through to the persistent store before returning.
    pub async fn clear_cache(&self) {
        self.inner.clear_auto_refresh();
        self.inner.cache.clear().await;
        self.inner.in_flight.lock().clear();

        let (store, cache_key) = self.inner.store_and_key();
        self.inner.cache.persist_now(store, &cache_key).await;
    }

    /// Merge settings overrides. Turning background sync off tears down
    /// every streaming channel.
    pub fn configure_cache(&self, update: CacheSettingsUpdate) {
        let background_sync = {
            let mut settings = self.inner.settings.write();
            settings.apply(update);
            settings.background_sync
        };
        if !background_sync {
            self.inner.clear_auto_refresh();
        }
    }

    /// Merge environment-shim overrides. Consumers read shims at call
    /// time, so late overrides take effect.
    pub fn set_polyfills(&self, update: PolyfillsUpdate) {
        self.inner.polyfills.write().apply(update);
    }

    // Introspection, mainly for embedders' diagnostics and tests.

    pub fn cached_entry_count(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn subscriber_count(&self, key: &RepositoryKey) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(key)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn stream_channel_count(&self) -> usize {
        self.inner.streaming.channel_count()
    }

    pub fn supports_streaming(&self, key: &RepositoryKey) -> bool {
        self.inner.streaming.supports(key)
    }
}

impl Default for FeatureRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl RepoInner {
    fn store_and_key(&self) -> (Option<Arc<dyn crate::polyfills::KeyValueStore>>, String) {
        let store = self.polyfills.read().store.clone();
        let cache_key = self.settings.read().cache_key.clone();
        (store, cache_key)
    }

    /// Serve from cache when the entry is usable, otherwise fetch. Stale
    /// entries served under `allow_stale` trigger a background refresh.
    async fn fetch_with_cache(
        inner: &Arc<Self>,
        instance: &SharedInstance,
        options: &RefreshOptions,
    ) -> Option<FeaturePayload> {
        let key = RepositoryKey::for_instance(instance.as_ref());
        let (store, cache_key) = inner.store_and_key();
        inner.cache.hydrate(store, &cache_key).await;

        let now = Utc::now();
        if let Some(entry) = inner.cache.get(&key) {
            if !options.skip_cache && (options.allow_stale || !entry.is_stale(now)) {
                if entry.sse {
                    inner.streaming.mark_supported(key.clone());
                }
                if entry.is_stale(now) {
                    // Refresh behind the caller's back; the spawned shared
                    // future needs no awaiting here.
                    let _ = Self::fetch_features(inner, instance);
                } else {
                    Self::start_auto_refresh(inner, &key, instance);
                }
                return Some(entry.data);
            }
        }

        let fetch = Self::fetch_features(inner, instance);
        match options.timeout {
            None => Some(fetch.await),
            Some(timeout) => tokio::time::timeout(timeout, fetch).await.ok(),
        }
    }

    /// The in-flight registry is the only deduplication mechanism: the
    /// shared future is registered under the lock, before any await point
    /// a second caller could interleave with, and spawned so it completes
    /// even if every caller times out.
    fn fetch_features(inner: &Arc<Self>, instance: &SharedInstance) -> SharedFetch {
        let key = RepositoryKey::for_instance(instance.as_ref());

        let mut in_flight = inner.in_flight.lock();
        if let Some(existing) = in_flight.get(&key) {
            return existing.clone();
        }

        let fetch = {
            let inner = Arc::clone(inner);
            let instance = Arc::clone(instance);
            let key = key.clone();
            async move { inner.fetch_and_settle(key, instance).await }
                .boxed()
                .shared()
        };
        in_flight.insert(key, fetch.clone());
        tokio::spawn(fetch.clone());
        fetch
    }

    /// Never rejects: failure resolves with an empty payload so every
    /// coalesced waiter completes.
    async fn fetch_and_settle(
        self: Arc<Self>,
        key: RepositoryKey,
        instance: SharedInstance,
    ) -> FeaturePayload {
        let result = Self::fetch_and_ingest(&self, &key, &instance).await;
        self.in_flight.lock().shift_remove(&key);

        match result {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "feature fetch failed");
                if cfg!(debug_assertions) {
                    instance.log(
                        "Error fetching features",
                        &serde_json::json!({ "error": e.to_string() }),
                    );
                }
                FeaturePayload::default()
            }
        }
    }

    async fn fetch_and_ingest(
        inner: &Arc<Self>,
        key: &RepositoryKey,
        instance: &SharedInstance,
    ) -> Result<FeaturePayload> {
        let http = inner
            .polyfills
            .read()
            .http
            .clone()
            .ok_or_else(|| RepoError::network("no http transport configured"))?;

        let hosts = instance.api_hosts();
        let client_key = instance.client_key();
        let request = if instance.is_remote_eval() {
            let body = serde_json::json!({ "attributes": instance.attributes() });
            FetchRequest::post(
                format!(
                    "{}{}/{}",
                    hosts.remote_eval_host, hosts.remote_eval_path, client_key
                ),
                body.to_string(),
            )
            .header("Content-Type", "application/json")
            .headers(hosts.api_request_headers)
        } else {
            FetchRequest::get(format!(
                "{}{}/{}",
                hosts.api_host, hosts.features_path, client_key
            ))
            .headers(hosts.api_request_headers)
        };

        let response = http.fetch(request).await?;
        if response.supports_sse() {
            inner.streaming.mark_supported(key.clone());
        }

        let payload: FeaturePayload = serde_json::from_str(&response.body).map_err(|e| {
            RepoError::with_source(ErrorCode::InvalidResponse, "invalid features payload", e)
        })?;

        inner.ingest(key.clone(), &payload).await;
        Self::start_auto_refresh(inner, key, instance);
        Ok(payload)
    }

    /// Install a payload: version-compare, update cache, mirror to the
    /// store, and fan out to subscribers. A payload whose non-empty
    /// version matches the cached one only extends the staleness deadline
    /// and notifies nobody. Side effects only: a subscriber that fails to
    /// apply the payload is logged and skipped, and the remaining
    /// subscribers are still refreshed in order.
    pub(crate) async fn ingest(&self, key: RepositoryKey, payload: &FeaturePayload) {
        let stale_ttl = self.settings.read().stale_ttl;
        let stale_at = Utc::now()
            + chrono::Duration::from_std(stale_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let sse = self.streaming.supports(&key);

        let notify = self.cache.upsert(key.clone(), payload, stale_at, sse);

        let (store, cache_key) = self.store_and_key();
        self.cache.persist_background(store, &cache_key);

        if notify {
            // Snapshot so a subscriber mutating the registry mid-refresh
            // cannot invalidate the iteration.
            let subscribers: Vec<SharedInstance> = self
                .subscribers
                .lock()
                .get(&key)
                .cloned()
                .unwrap_or_default();
            for instance in subscribers {
                if let Err(e) = self.refresh_instance(&instance, payload).await {
                    tracing::debug!(key = %key, error = %e, "subscriber refresh failed");
                    if cfg!(debug_assertions) {
                        instance.log(
                            "Error refreshing instance",
                            &serde_json::json!({ "error": e.to_string() }),
                        );
                    }
                }
            }
        }
    }

    /// Apply a payload to one instance: experiments first, then features;
    /// encrypted variants go through the decryptor shim. Fields absent
    /// from the payload leave the instance's state untouched.
    async fn refresh_instance(
        &self,
        instance: &SharedInstance,
        payload: &FeaturePayload,
    ) -> Result<()> {
        let decryptor = self.polyfills.read().decryptor.clone();

        if let Some(ciphertext) = &payload.encrypted_experiments {
            instance
                .set_encrypted_experiments(ciphertext, decryptor.clone())
                .await?;
        } else if let Some(experiments) = &payload.experiments {
            instance.set_experiments(experiments.clone());
        }

        if let Some(ciphertext) = &payload.encrypted_features {
            instance
                .set_encrypted_features(ciphertext, decryptor)
                .await?;
        } else if let Some(features) = &payload.features {
            instance.set_features(features.clone());
        }

        Ok(())
    }

    /// Open the streaming channel for a key when everything lines up:
    /// background sync on, server support seen, shim present, no channel
    /// yet.
    fn start_auto_refresh(inner: &Arc<Self>, key: &RepositoryKey, instance: &SharedInstance) {
        if !inner.settings.read().background_sync {
            return;
        }
        if !inner.streaming.supports(key) {
            return;
        }
        let Some(factory) = inner.polyfills.read().event_source.clone() else {
            return;
        };

        let hosts = instance.api_hosts();
        let url = format!(
            "{}{}/{}",
            hosts.streaming_host,
            hosts.streaming_path,
            instance.client_key()
        );

        let on_payload: PayloadCallback = {
            let weak = Arc::downgrade(inner);
            let key = key.clone();
            Arc::new(move |data: String| {
                let weak = weak.clone();
                let key = key.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(());
                    };
                    let payload: FeaturePayload =
                        serde_json::from_str(&data).map_err(|_| ())?;
                    inner.ingest(key, &payload).await;
                    Ok(())
                })
            })
        };

        let on_refetch: RefetchCallback = {
            let weak = Arc::downgrade(inner);
            let instance = Arc::clone(instance);
            Arc::new(move || {
                let weak = weak.clone();
                let instance = Arc::clone(&instance);
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        let _ = RepoInner::fetch_features(&inner, &instance).await;
                    }
                })
            })
        };

        inner.streaming.start_channel(
            key.clone(),
            url,
            hosts.api_request_headers,
            factory,
            on_payload,
            on_refetch,
        );
    }

    /// Stop tracking server pushes entirely: every channel, the support
    /// set, and all subscriptions go away.
    fn clear_auto_refresh(&self) {
        self.streaming.close_all();
        self.streaming.clear_supported();
        self.subscribers.lock().clear();
    }
}
