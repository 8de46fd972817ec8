//! Replaceable environment primitives.
//!
//! The repository talks to its environment through four shims: an HTTP
//! transport, an event-source constructor, a persistent key-value store,
//! and a decryption primitive. Defaults are resolved from what the crate
//! ships with; any of them can be swapped at runtime with
//! [`set_polyfills`](crate::set_polyfills), and late overrides take effect
//! because every consumer reads the current value at call time.

mod crypto;
mod event_source;
mod http;
mod store;

pub use crypto::{AesGcmDecryptor, Decryptor};
pub use event_source::{
    EventSource, EventSourceFactory, ReadyState, SseEventSource, SseEventSourceFactory,
    StreamEvent,
};
pub use http::{
    FetchRequest, FetchResponse, HttpMethod, HttpTransport, ReqwestTransport, SSE_SUPPORT_HEADER,
};
pub use store::{FileStore, KeyValueStore, MemoryStore};

use std::sync::Arc;

/// Current set of environment primitives. Each slot is optional: an absent
/// shim disables the feature it powers (no store ⇒ memory-only, no event
/// source ⇒ no streaming) rather than failing.
#[derive(Clone)]
pub struct Polyfills {
    pub http: Option<Arc<dyn HttpTransport>>,
    pub event_source: Option<Arc<dyn EventSourceFactory>>,
    pub store: Option<Arc<dyn KeyValueStore>>,
    pub decryptor: Option<Arc<dyn Decryptor>>,
}

impl Default for Polyfills {
    fn default() -> Self {
        Self {
            http: Some(Arc::new(ReqwestTransport::new())),
            event_source: Some(Arc::new(SseEventSourceFactory)),
            // No portable default for durable storage; embedders install a
            // FileStore (or their own) to persist across restarts.
            store: None,
            decryptor: Some(Arc::new(AesGcmDecryptor)),
        }
    }
}

/// Partial override merged into [`Polyfills`]. `Some(slot)` replaces that
/// slot; `None` leaves it alone. To clear a slot, pass
/// `Some(PolyfillSlot::Absent)`.
#[derive(Clone, Default)]
pub struct PolyfillsUpdate {
    pub http: Option<PolyfillSlot<Arc<dyn HttpTransport>>>,
    pub event_source: Option<PolyfillSlot<Arc<dyn EventSourceFactory>>>,
    pub store: Option<PolyfillSlot<Arc<dyn KeyValueStore>>>,
    pub decryptor: Option<PolyfillSlot<Arc<dyn Decryptor>>>,
}

/// A slot value in a polyfills update: install a shim or remove one.
#[derive(Clone)]
pub enum PolyfillSlot<T> {
    Set(T),
    Absent,
}

impl<T> PolyfillSlot<T> {
    fn into_option(self) -> Option<T> {
        match self {
            PolyfillSlot::Set(v) => Some(v),
            PolyfillSlot::Absent => None,
        }
    }
}

impl PolyfillsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn http(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.http = Some(PolyfillSlot::Set(transport));
        self
    }

    pub fn event_source(mut self, factory: Arc<dyn EventSourceFactory>) -> Self {
        self.event_source = Some(PolyfillSlot::Set(factory));
        self
    }

    pub fn no_event_source(mut self) -> Self {
        self.event_source = Some(PolyfillSlot::Absent);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(PolyfillSlot::Set(store));
        self
    }

    pub fn no_store(mut self) -> Self {
        self.store = Some(PolyfillSlot::Absent);
        self
    }

    pub fn decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(PolyfillSlot::Set(decryptor));
        self
    }
}

impl Polyfills {
    pub fn apply(&mut self, update: PolyfillsUpdate) {
        if let Some(slot) = update.http {
            self.http = slot.into_option();
        }
        if let Some(slot) = update.event_source {
            self.event_source = slot.into_option();
        }
        if let Some(slot) = update.store {
            self.store = slot.into_option();
        }
        if let Some(slot) = update.decryptor {
            self.decryptor = slot.into_option();
        }
    }
}
