#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use flagpool::{
    ApiHosts, Decryptor, ErrorCode, EventSource, EventSourceFactory, FetchRequest, FetchResponse,
    HttpTransport, ReadyState, RepoError, SdkInstance, SharedInstance, StreamEvent,
};

// === Test instance ===

/// Minimal SDK instance: enough state to observe what the repository
/// pushes into it. Host and user id are mutable so tests can change an
/// instance's key mid-life.
pub struct TestInstance {
    api_host: Mutex<String>,
    client_key: String,
    remote_eval: bool,
    user_id: Mutex<String>,
    attributes: serde_json::Value,
    decryption_key: Option<String>,
    features: Mutex<serde_json::Value>,
    experiments: Mutex<serde_json::Value>,
    pub features_set_count: Mutex<u32>,
    /// Shared across instances to observe fan-out order.
    refresh_log: Option<(String, Arc<Mutex<Vec<String>>>)>,
}

impl TestInstance {
    pub fn new(api_host: &str, client_key: &str) -> Self {
        Self {
            api_host: Mutex::new(api_host.to_string()),
            client_key: client_key.to_string(),
            remote_eval: false,
            user_id: Mutex::new(String::new()),
            attributes: serde_json::json!({}),
            decryption_key: None,
            features: Mutex::new(serde_json::Value::Null),
            experiments: Mutex::new(serde_json::Value::Null),
            features_set_count: Mutex::new(0),
            refresh_log: None,
        }
    }

    pub fn remote_eval(mut self, user_id: &str, attributes: serde_json::Value) -> Self {
        self.remote_eval = true;
        self.user_id = Mutex::new(user_id.to_string());
        self.attributes = attributes;
        self
    }

    pub fn decryption_key(mut self, key: &str) -> Self {
        self.decryption_key = Some(key.to_string());
        self
    }

    pub fn refresh_log(mut self, name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.refresh_log = Some((name.to_string(), log));
        self
    }

    pub fn shared(self) -> SharedInstance {
        Arc::new(self)
    }

    pub fn set_api_host(&self, host: &str) {
        *self.api_host.lock() = host.to_string();
    }

    pub fn current_features(&self) -> serde_json::Value {
        self.features.lock().clone()
    }

    pub fn current_experiments(&self) -> serde_json::Value {
        self.experiments.lock().clone()
    }

    fn record_features(&self, features: serde_json::Value) {
        *self.features.lock() = features;
        *self.features_set_count.lock() += 1;
        if let Some((name, log)) = &self.refresh_log {
            log.lock().push(name.clone());
        }
    }
}

#[async_trait]
impl SdkInstance for TestInstance {
    fn api_info(&self) -> (String, String) {
        (self.api_host.lock().clone(), self.client_key.clone())
    }

    fn api_hosts(&self) -> ApiHosts {
        let host = self.api_host.lock().clone();
        ApiHosts {
            api_host: host.clone(),
            remote_eval_host: host.clone(),
            streaming_host: host,
            ..Default::default()
        }
    }

    fn is_remote_eval(&self) -> bool {
        self.remote_eval
    }

    fn user_id(&self) -> String {
        self.user_id.lock().clone()
    }

    fn attributes(&self) -> serde_json::Value {
        self.attributes.clone()
    }

    fn features(&self) -> serde_json::Value {
        self.current_features()
    }

    fn set_features(&self, features: serde_json::Value) {
        self.record_features(features);
    }

    async fn set_encrypted_features(
        &self,
        ciphertext: &str,
        decryptor: Option<Arc<dyn Decryptor>>,
    ) -> flagpool::Result<()> {
        let decryptor =
            decryptor.ok_or_else(|| RepoError::decrypt("no decryptor configured"))?;
        let key = self
            .decryption_key
            .as_deref()
            .ok_or_else(|| RepoError::decrypt("instance has no decryption key"))?;
        let plaintext = decryptor.decrypt(ciphertext, key).await?;
        let features = serde_json::from_str(&plaintext).map_err(|e| {
            RepoError::with_source(ErrorCode::DecryptFailed, "decrypted features not json", e)
        })?;
        self.record_features(features);
        Ok(())
    }

    fn experiments(&self) -> serde_json::Value {
        self.current_experiments()
    }

    fn set_experiments(&self, experiments: serde_json::Value) {
        *self.experiments.lock() = experiments;
    }

    async fn set_encrypted_experiments(
        &self,
        ciphertext: &str,
        decryptor: Option<Arc<dyn Decryptor>>,
    ) -> flagpool::Result<()> {
        let decryptor =
            decryptor.ok_or_else(|| RepoError::decrypt("no decryptor configured"))?;
        let key = self
            .decryption_key
            .as_deref()
            .ok_or_else(|| RepoError::decrypt("instance has no decryption key"))?;
        let plaintext = decryptor.decrypt(ciphertext, key).await?;
        let experiments = serde_json::from_str(&plaintext).map_err(|e| {
            RepoError::with_source(ErrorCode::DecryptFailed, "decrypted experiments not json", e)
        })?;
        *self.experiments.lock() = experiments;
        Ok(())
    }
}

// === Scripted HTTP transport ===

#[derive(Clone)]
pub struct CannedResponse {
    pub body: String,
    pub sse: bool,
    pub delay: Option<Duration>,
    pub fail: bool,
}

impl CannedResponse {
    pub fn json(body: &str) -> Self {
        Self {
            body: body.to_string(),
            sse: false,
            delay: None,
            fail: false,
        }
    }

    pub fn sse(mut self) -> Self {
        self.sse = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            body: String::new(),
            sse: false,
            delay: None,
            fail: true,
        }
    }
}

/// Transport that replays canned responses in order, then repeats the last
/// one. Records every request for assertions.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<CannedResponse>>,
    last: Mutex<Option<CannedResponse>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, response: CannedResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn fetch(&self, request: FetchRequest) -> flagpool::Result<FetchResponse> {
        self.requests.lock().push(request);

        let canned = {
            let mut responses = self.responses.lock();
            match responses.pop_front() {
                Some(response) => {
                    *self.last.lock() = Some(response.clone());
                    response
                }
                None => self
                    .last
                    .lock()
                    .clone()
                    .unwrap_or_else(|| CannedResponse::failing()),
            }
        };

        if let Some(delay) = canned.delay {
            tokio::time::sleep(delay).await;
        }
        if canned.fail {
            return Err(RepoError::network("scripted network failure"));
        }

        let mut headers = HashMap::new();
        if canned.sse {
            headers.insert("x-sse-support".to_string(), "enabled".to_string());
        }
        Ok(FetchResponse {
            status: 200,
            headers,
            body: canned.body,
        })
    }
}

// === Scripted event sources ===

/// Yields a fixed script of events, then parks forever (an idle open
/// stream). `close` unblocks pending reads with `None`.
pub struct ScriptedEventSource {
    events: VecDeque<StreamEvent>,
    state: ReadyState,
}

#[async_trait]
impl EventSource for ScriptedEventSource {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.state == ReadyState::Closed {
            return None;
        }
        match self.events.pop_front() {
            Some(event) => {
                if event == StreamEvent::Open {
                    self.state = ReadyState::Open;
                }
                Some(event)
            }
            None => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    fn close(&mut self) {
        self.state = ReadyState::Closed;
    }
}

/// Hands out one script per connection attempt and records how each
/// attempt was made.
pub struct ScriptedEventSourceFactory {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    reject_headers: bool,
    /// Whether each successful connect carried headers.
    pub connects: Mutex<Vec<bool>>,
}

impl ScriptedEventSourceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            reject_headers: false,
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting_headers() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            reject_headers: true,
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn push_script(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().push_back(events);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }
}

impl EventSourceFactory for ScriptedEventSourceFactory {
    fn connect(
        &self,
        _url: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> flagpool::Result<Box<dyn EventSource>> {
        if self.reject_headers && headers.is_some() {
            return Err(RepoError::stream(
                ErrorCode::StreamConnect,
                "headers not supported",
            ));
        }
        let events = self.scripts.lock().pop_front().unwrap_or_default();
        self.connects.lock().push(headers.is_some());
        Ok(Box::new(ScriptedEventSource {
            events: events.into(),
            state: ReadyState::Connecting,
        }))
    }
}

// === Payload helpers ===

pub fn payload_json(version: &str, marker: u32) -> String {
    serde_json::json!({
        "features": { "flag": { "defaultValue": marker } },
        "dateUpdated": version,
    })
    .to_string()
}

pub fn features_message(version: &str, marker: u32) -> StreamEvent {
    StreamEvent::Message {
        event: "features".to_string(),
        data: payload_json(version, marker),
    }
}

pub const TEST_KEY_BYTES: [u8; 32] = [7u8; 32];

/// AES-256-GCM encrypt in the shape the default decryptor expects:
/// base64( nonce ∥ ciphertext ∥ tag ).
pub fn encrypt_for_tests(plaintext: &str) -> (String, String) {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    let cipher = Aes256Gcm::new_from_slice(&TEST_KEY_BYTES).unwrap();
    let nonce_bytes: [u8; 12] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).unwrap();

    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend(ciphertext);
    (BASE64.encode(out), BASE64.encode(TEST_KEY_BYTES))
}
