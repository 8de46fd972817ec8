use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::polyfills::Decryptor;

/// Hosts, paths, and request headers an instance uses to reach its feature
/// source. Paths are joined onto hosts verbatim.
#[derive(Debug, Clone)]
pub struct ApiHosts {
    pub api_host: String,
    pub features_path: String,
    pub remote_eval_host: String,
    pub remote_eval_path: String,
    pub streaming_host: String,
    pub streaming_path: String,
    pub api_request_headers: HashMap<String, String>,
}

impl Default for ApiHosts {
    fn default() -> Self {
        Self {
            api_host: String::new(),
            features_path: "/api/features".to_string(),
            remote_eval_host: String::new(),
            remote_eval_path: "/api/eval".to_string(),
            streaming_host: String::new(),
            streaming_path: "/sub".to_string(),
            api_request_headers: HashMap::new(),
        }
    }
}

/// The capability set the repository consumes from an SDK instance.
///
/// The repository never constructs instances; it receives them as handles,
/// identifies them by `Arc` pointer identity in the subscription registry,
/// and pushes payloads into them through the setters below. Evaluation,
/// attribute storage, and decryption keys all live behind this trait.
///
/// The encrypted setters are async because decryption suspends; they
/// receive the repository's current decryptor shim, while the decryption
/// key itself belongs to the instance.
#[async_trait]
pub trait SdkInstance: Send + Sync {
    /// `(api_host, client_key)` — the two identity components every
    /// instance has.
    fn api_info(&self) -> (String, String);

    fn api_hosts(&self) -> ApiHosts;

    fn client_key(&self) -> String {
        self.api_info().1
    }

    /// Remote-eval instances POST user attributes and are cache-partitioned
    /// by user id.
    fn is_remote_eval(&self) -> bool {
        false
    }

    fn user_id(&self) -> String {
        String::new()
    }

    /// Attributes sent in the remote-eval request body.
    fn attributes(&self) -> serde_json::Value {
        serde_json::Value::Object(Default::default())
    }

    fn features(&self) -> serde_json::Value;

    fn set_features(&self, features: serde_json::Value);

    async fn set_encrypted_features(
        &self,
        ciphertext: &str,
        decryptor: Option<Arc<dyn Decryptor>>,
    ) -> Result<()>;

    fn experiments(&self) -> serde_json::Value;

    fn set_experiments(&self, experiments: serde_json::Value);

    async fn set_encrypted_experiments(
        &self,
        ciphertext: &str,
        decryptor: Option<Arc<dyn Decryptor>>,
    ) -> Result<()>;

    /// Diagnostic sink. Only called in debug builds.
    fn log(&self, msg: &str, ctx: &serde_json::Value) {
        let _ = (msg, ctx);
    }
}

/// How the repository holds instances. Pointer identity is instance
/// identity: subscribing the same `Arc` twice is a no-op, and `unsubscribe`
/// matches by pointer.
pub type SharedInstance = Arc<dyn SdkInstance>;

pub(crate) fn same_instance(a: &SharedInstance, b: &SharedInstance) -> bool {
    Arc::ptr_eq(a, b)
}
