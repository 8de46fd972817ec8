use thiserror::Error;

/// Machine-readable codes for everything that can go wrong inside the
/// repository. Most of these never reach a caller: the fetch path resolves
/// with an empty payload, the persistence mirror swallows storage failures,
/// and the streaming engine absorbs stream errors into its backoff machine.
/// Decryption failures are the exception and propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Network / fetch errors
    NetworkError,
    NetworkTimeout,
    InvalidResponse,

    // Persistent store errors
    StorageRead,
    StorageWrite,
    StorageInvalidData,

    // Streaming errors
    StreamConnect,
    StreamClosed,

    // Payload decryption errors
    DecryptFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::StorageRead => "STORAGE_READ",
            ErrorCode::StorageWrite => "STORAGE_WRITE",
            ErrorCode::StorageInvalidData => "STORAGE_INVALID_DATA",
            ErrorCode::StreamConnect => "STREAM_CONNECT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::DecryptFailed => "DECRYPT_FAILED",
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::NetworkTimeout
                | ErrorCode::StreamConnect
                | ErrorCode::StreamClosed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("[{code}] {message}")]
pub struct RepoError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RepoError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn storage(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn stream(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn decrypt(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DecryptFailed, message)
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;
