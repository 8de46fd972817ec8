use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::polyfills::{EventSource, EventSourceFactory, ReadyState, StreamEvent};
use crate::types::RepositoryKey;

/// Named event carrying a full payload document.
const EVENT_FEATURES: &str = "features";
/// Named event signalling that a refetch is needed.
const EVENT_FEATURES_UPDATED: &str = "features-updated";

/// Errors tolerated before a channel is torn down and reopened with
/// backoff. Transient single-message failures stay under this threshold
/// and never interrupt the stream.
const FREE_ERRORS: u32 = 3;

/// Handles a `features` payload document. `Err` counts as a stream error.
pub(crate) type PayloadCallback =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(), ()>> + Send>> + Send + Sync>;

/// Triggers a refetch on `features-updated`.
pub(crate) type RefetchCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Channel {
    shutdown: oneshot::Sender<()>,
}

/// Owns the streaming-support set and the live channels, at most one per
/// key. Channels are tokio tasks driving one event source each; the
/// manager only tracks and tears them down.
pub(crate) struct StreamingManager {
    supported: Mutex<IndexSet<RepositoryKey>>,
    channels: Mutex<IndexMap<RepositoryKey, Channel>>,
}

impl StreamingManager {
    pub fn new() -> Self {
        Self {
            supported: Mutex::new(IndexSet::new()),
            channels: Mutex::new(IndexMap::new()),
        }
    }

    /// Record that the server advertised streaming for this key.
    pub fn mark_supported(&self, key: RepositoryKey) {
        self.supported.lock().insert(key);
    }

    pub fn supports(&self, key: &RepositoryKey) -> bool {
        self.supported.lock().contains(key)
    }

    pub fn clear_supported(&self) {
        self.supported.lock().clear();
    }

    pub fn has_channel(&self, key: &RepositoryKey) -> bool {
        self.channels.lock().contains_key(key)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Open a channel for the key unless one already exists. The task runs
    /// until shut down, reconnecting with jittered exponential backoff
    /// after repeated errors.
    pub fn start_channel(
        &self,
        key: RepositoryKey,
        url: String,
        headers: HashMap<String, String>,
        factory: Arc<dyn EventSourceFactory>,
        on_payload: PayloadCallback,
        on_refetch: RefetchCallback,
    ) {
        let mut channels = self.channels.lock();
        if channels.contains_key(&key) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_key = key.clone();
        let log_key = task_key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx => {
                    tracing::debug!(key = %log_key, "stream channel shut down");
                }
                _ = run_channel(task_key, url, headers, factory, on_payload, on_refetch) => {}
            }
        });

        channels.insert(key, Channel { shutdown: shutdown_tx });
    }

    /// Tear down every channel. Dropping the shutdown sender ends each
    /// task's `select!`, which drops and thereby closes its source.
    pub fn close_all(&self) {
        let mut channels = self.channels.lock();
        for (key, channel) in channels.drain(..) {
            let _ = channel.shutdown.send(());
            tracing::debug!(key = %key, "stream channel closed");
        }
    }
}

/// Reopen delay after the error counter reaches `errors`:
/// `min(3^(errors-3) * (1000 + rand * 1000), 300_000)` milliseconds.
/// No backoff fires until the fourth error; a closed source reconnects
/// sooner via the negative exponent.
pub(crate) fn reconnect_delay(errors: u32) -> Duration {
    let multiplier = 3f64.powi(errors as i32 - 3);
    let jitter = 1000.0 + rand::random::<f64>() * 1000.0;
    Duration::from_millis((multiplier * jitter).min(300_000.0) as u64)
}

enum Outcome {
    /// Keep reading; the source handles its own retries.
    Continue,
    /// Close and reopen after the given delay.
    Reopen(Duration),
}

fn on_stream_error(errors: &mut u32, state: ReadyState) -> Outcome {
    *errors += 1;
    if *errors > FREE_ERRORS || state == ReadyState::Closed {
        Outcome::Reopen(reconnect_delay(*errors))
    } else {
        Outcome::Continue
    }
}

async fn run_channel(
    key: RepositoryKey,
    url: String,
    headers: HashMap<String, String>,
    factory: Arc<dyn EventSourceFactory>,
    on_payload: PayloadCallback,
    on_refetch: RefetchCallback,
) {
    let mut errors: u32 = 0;

    'reconnect: loop {
        let mut src = match connect(&*factory, &url, &headers) {
            Ok(src) => src,
            Err(e) => {
                errors += 1;
                tracing::debug!(key = %key, error = %e, "stream connect failed");
                tokio::time::sleep(reconnect_delay(errors)).await;
                continue;
            }
        };

        loop {
            let event = src.next_event().await;
            match event {
                Some(StreamEvent::Open) => {
                    errors = 0;
                    tracing::debug!(key = %key, "stream open");
                }
                Some(StreamEvent::Message { event, data }) => match event.as_str() {
                    EVENT_FEATURES => match on_payload(data).await {
                        Ok(()) => errors = 0,
                        Err(()) => {
                            if let Outcome::Reopen(delay) =
                                on_stream_error(&mut errors, src.ready_state())
                            {
                                src.close();
                                tokio::time::sleep(delay).await;
                                continue 'reconnect;
                            }
                        }
                    },
                    EVENT_FEATURES_UPDATED => {
                        on_refetch().await;
                        errors = 0;
                    }
                    _ => {}
                },
                Some(StreamEvent::Error) => {
                    if let Outcome::Reopen(delay) = on_stream_error(&mut errors, src.ready_state())
                    {
                        src.close();
                        tracing::debug!(key = %key, errors, delay_ms = delay.as_millis() as u64, "stream backing off");
                        tokio::time::sleep(delay).await;
                        continue 'reconnect;
                    }
                }
                None => {
                    // Source exhausted: always reopen.
                    errors += 1;
                    let delay = reconnect_delay(errors);
                    src.close();
                    tokio::time::sleep(delay).await;
                    continue 'reconnect;
                }
            }
        }
    }
}

/// Connect with request headers; shims that reject the headers form get a
/// second chance without them.
fn connect(
    factory: &dyn EventSourceFactory,
    url: &str,
    headers: &HashMap<String, String>,
) -> crate::error::Result<Box<dyn EventSource>> {
    match factory.connect(url, Some(headers)) {
        Ok(src) => Ok(src),
        Err(_) => factory.connect(url, None),
    }
}
