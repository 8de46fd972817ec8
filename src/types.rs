use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::instance::SdkInstance;

/// Default time before a cache entry is considered stale.
pub const DEFAULT_STALE_TTL: Duration = Duration::from_secs(60);

/// Default record name in the persistent key-value store.
pub const DEFAULT_CACHE_KEY: &str = "gbFeaturesCache";

/// Separator reserved for repository key composition. Hosts and client keys
/// never contain it.
pub const KEY_SEPARATOR: &str = "||";

/// Payload returned by the features endpoint.
///
/// The repository treats it as opaque: every field is optional, unknown
/// fields are dropped on parse, and `date_updated` is used only for change
/// detection. An all-`None` payload doubles as the "fetch failed" value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeaturePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiments: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_features: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_experiments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_updated: Option<String>,
}

impl FeaturePayload {
    /// Version stamp used for change detection. Empty when the server sent
    /// no `dateUpdated`.
    pub fn version(&self) -> String {
        self.date_updated.clone().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Canonical identity of a feature source from the viewpoint of one
/// instance. Two instances producing the same key are interchangeable
/// consumers: they share cache entries, coalesced fetches, and streaming
/// channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryKey(String);

impl RepositoryKey {
    /// Remote-eval instances are additionally partitioned by user id, since
    /// the server evaluates against that user's attributes.
    pub fn for_instance(instance: &dyn SdkInstance) -> Self {
        let (api_host, client_key) = instance.api_info();
        if instance.is_remote_eval() {
            Self(format!(
                "{api_host}{KEY_SEPARATOR}{client_key}{KEY_SEPARATOR}{}",
                instance.user_id()
            ))
        } else {
            Self(format!("{api_host}{KEY_SEPARATOR}{client_key}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepositoryKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RepositoryKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-call options for [`refresh_features`](crate::refresh_features).
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// Give up waiting after this long. The fetch itself keeps running and
    /// still populates the cache.
    pub timeout: Option<Duration>,
    /// Always hit the network, even with a fresh cache entry.
    pub skip_cache: bool,
    /// Serve a stale entry instantly and refresh in the background.
    pub allow_stale: bool,
    /// Apply the returned payload to the calling instance.
    pub update_instance: bool,
    /// `Some(false)` turns background sync off for the whole process.
    pub background_sync: Option<bool>,
}

impl RefreshOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.allow_stale = allow;
        self
    }

    pub fn update_instance(mut self, update: bool) -> Self {
        self.update_instance = update;
        self
    }

    pub fn background_sync(mut self, enabled: bool) -> Self {
        self.background_sync = Some(enabled);
        self
    }
}

/// Process-wide cache behavior.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// How long a freshly ingested entry stays fresh.
    pub stale_ttl: Duration,
    /// Record name in the persistent key-value store.
    pub cache_key: String,
    /// Whether streaming channels may be created. When false, none exist.
    pub background_sync: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stale_ttl: DEFAULT_STALE_TTL,
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            background_sync: true,
        }
    }
}

/// Partial update merged into [`CacheSettings`] by
/// [`configure_cache`](crate::configure_cache).
#[derive(Debug, Clone, Default)]
pub struct CacheSettingsUpdate {
    pub stale_ttl: Option<Duration>,
    pub cache_key: Option<String>,
    pub background_sync: Option<bool>,
}

impl CacheSettingsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale_ttl(mut self, ttl: Duration) -> Self {
        self.stale_ttl = Some(ttl);
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn background_sync(mut self, enabled: bool) -> Self {
        self.background_sync = Some(enabled);
        self
    }
}

impl CacheSettings {
    pub fn apply(&mut self, update: CacheSettingsUpdate) {
        if let Some(ttl) = update.stale_ttl {
            self.stale_ttl = ttl;
        }
        if let Some(key) = update.cache_key {
            self.cache_key = key;
        }
        if let Some(enabled) = update.background_sync {
            self.background_sync = enabled;
        }
    }
}
