use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;

use crate::error::{ErrorCode, RepoError, Result};

/// Fixed delay before the default source re-dials a dropped connection.
/// Matches the conventional EventSource retry interval.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

/// What a stream hands back, one call at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Connection established (or re-established).
    Open,
    /// A named event with its data payload.
    Message { event: String, data: String },
    /// The connection failed or dropped. The source keeps retrying
    /// internally until closed; the caller decides when to tear it down.
    Error,
}

/// One live server-sent-event connection.
///
/// `next_event` drives the connection: the default implementation dials
/// lazily on the first call and re-dials after errors until `close` is
/// called, mimicking how a browser EventSource auto-retries.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Option<StreamEvent>;

    fn ready_state(&self) -> ReadyState;

    fn close(&mut self);
}

/// Replaceable constructor for event sources.
///
/// `connect` may reject the headers form (a shim that cannot attach
/// headers); callers retry with `headers: None`.
pub trait EventSourceFactory: Send + Sync {
    fn connect(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<Box<dyn EventSource>>;
}

/// Incremental parser for the SSE line protocol. Feed it raw chunks;
/// complete events come out as `(event, data)` pairs on blank lines.
#[derive(Debug, Default)]
pub(crate) struct SseLineParser {
    line_buffer: String,
    event_type: Option<String>,
    data_buffer: String,
}

impl SseLineParser {
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<(String, String)> {
        let mut events = Vec::new();
        self.line_buffer.push_str(chunk);

        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline_pos).collect();
            let line = line.trim();

            // Empty line = end of event. Named events flush even with no
            // data; `features-updated` carries none.
            if line.is_empty() {
                if let Some(event) = self.event_type.take() {
                    events.push((event, std::mem::take(&mut self.data_buffer)));
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.event_type = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_buffer.push_str(rest.trim());
            }
        }

        events
    }
}

type ByteStream = futures::stream::BoxStream<'static, std::result::Result<bytes::Bytes, reqwest::Error>>;

/// Default source: a reqwest GET with `Accept: text/event-stream`, parsed
/// incrementally. Buffered events from one chunk drain before the next
/// read.
pub struct SseEventSource {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    state: ReadyState,
    stream: Option<ByteStream>,
    parser: SseLineParser,
    pending: std::collections::VecDeque<StreamEvent>,
    connected_once: bool,
}

impl SseEventSource {
    fn new(url: &str, headers: Option<&HashMap<String, String>>) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
            headers: headers.cloned().unwrap_or_default(),
            state: ReadyState::Connecting,
            stream: None,
            parser: SseLineParser::default(),
            pending: std::collections::VecDeque::new(),
            connected_once: false,
        }
    }

    async fn dial(&mut self) -> Result<()> {
        let mut builder = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            RepoError::with_source(ErrorCode::StreamConnect, "event stream connect failed", e)
        })?;

        if !response.status().is_success() {
            return Err(RepoError::stream(
                ErrorCode::StreamConnect,
                format!("event stream returned {}", response.status()),
            ));
        }

        self.stream = Some(response.bytes_stream().boxed());
        self.state = ReadyState::Open;
        self.parser = SseLineParser::default();
        Ok(())
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if self.state == ReadyState::Closed {
                return None;
            }

            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            if self.stream.is_none() {
                if self.connected_once {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    if self.state == ReadyState::Closed {
                        return None;
                    }
                }
                match self.dial().await {
                    Ok(()) => {
                        self.connected_once = true;
                        return Some(StreamEvent::Open);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, url = %self.url, "event stream dial failed");
                        self.state = ReadyState::Connecting;
                        self.connected_once = true;
                        return Some(StreamEvent::Error);
                    }
                }
            }

            let chunk = self.stream.as_mut().unwrap().next().await;
            match chunk {
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for (event, data) in self.parser.push(&text) {
                        self.pending.push_back(StreamEvent::Message { event, data });
                    }
                }
                Some(Err(_)) | None => {
                    // Dropped mid-stream; surface the error and re-dial on
                    // the next call.
                    self.stream = None;
                    self.state = ReadyState::Connecting;
                    return Some(StreamEvent::Error);
                }
            }
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    fn close(&mut self) {
        self.stream = None;
        self.state = ReadyState::Closed;
    }
}

/// Default factory producing [`SseEventSource`] connections.
pub struct SseEventSourceFactory;

impl EventSourceFactory for SseEventSourceFactory {
    fn connect(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<Box<dyn EventSource>> {
        Ok(Box::new(SseEventSource::new(url, headers)))
    }
}
