//! Shared feature repository for feature-flag SDK instances.
//!
//! Many SDK instances in one process point at the same feature source;
//! fetching per instance wastes network and drifts state. This crate keeps
//! one process-wide repository that caches payloads per source, collapses
//! concurrent refreshes into a single request, mirrors the cache into a
//! persistent store, tracks server-pushed updates over at most one event
//! stream per source, and fans every new payload out to each subscribed
//! instance.
//!
//! # Quick Start
//!
//! ```no_run
//! use flagpool::{refresh_features, subscribe, RefreshOptions, SharedInstance};
//!
//! # async fn example(instance: SharedInstance) -> flagpool::Result<()> {
//! // Keep this instance updated whenever a new payload arrives
//! subscribe(&instance);
//!
//! // Fetch (or serve from cache) and apply the payload to the instance
//! let payload = refresh_features(
//!     &instance,
//!     &RefreshOptions::new().update_instance(true),
//! )
//! .await?;
//!
//! if let Some(payload) = payload {
//!     println!("features as of {:?}", payload.date_updated);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Environment primitives (HTTP transport, event source, persistent store,
//! decryptor) are replaceable at runtime via [`set_polyfills`]; see the
//! [`polyfills`] module.

pub mod core;
pub mod error;
pub mod instance;
pub mod polyfills;
pub mod types;

pub use crate::core::{CacheEntry, FeatureRepository};
pub use error::{ErrorCode, RepoError, Result};
pub use instance::{ApiHosts, SdkInstance, SharedInstance};
pub use polyfills::{
    AesGcmDecryptor, Decryptor, EventSource, EventSourceFactory, FetchRequest, FetchResponse,
    FileStore, HttpMethod, HttpTransport, KeyValueStore, MemoryStore, Polyfills, PolyfillsUpdate,
    ReadyState, ReqwestTransport, SseEventSource, SseEventSourceFactory, StreamEvent,
};
pub use types::{
    CacheSettings, CacheSettingsUpdate, FeaturePayload, RefreshOptions, RepositoryKey,
    DEFAULT_CACHE_KEY, DEFAULT_STALE_TTL,
};

use once_cell::sync::Lazy;

static REPOSITORY: Lazy<FeatureRepository> = Lazy::new(FeatureRepository::new);

/// The module-scoped repository every SDK instance in the process shares.
/// Deduplication only works because there is one of these.
pub fn repository() -> &'static FeatureRepository {
    &REPOSITORY
}

/// Obtain the current payload for the instance's feature source, serving
/// from the shared cache when possible. See
/// [`FeatureRepository::refresh_features`].
pub async fn refresh_features(
    instance: &SharedInstance,
    options: &RefreshOptions,
) -> Result<Option<FeaturePayload>> {
    REPOSITORY.refresh_features(instance, options).await
}

/// Register an instance for payload fan-out on its current key.
pub fn subscribe(instance: &SharedInstance) {
    REPOSITORY.subscribe(instance);
}

/// Remove an instance from every key's subscription set.
pub fn unsubscribe(instance: &SharedInstance) {
    REPOSITORY.unsubscribe(instance);
}

/// Drop all shared state and write the empty cache through to the
/// persistent store.
pub async fn clear_cache() {
    REPOSITORY.clear_cache().await;
}

/// Merge cache-behavior overrides into the shared settings.
pub fn configure_cache(update: CacheSettingsUpdate) {
    REPOSITORY.configure_cache(update);
}

/// Merge environment-shim overrides into the shared polyfills.
pub fn set_polyfills(update: PolyfillsUpdate) {
    REPOSITORY.set_polyfills(update);
}
