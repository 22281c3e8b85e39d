use thiserror::Error;

/// Strata error types.
///
/// Every failure mode carries structured fields rather than a bare message;
/// recovery decisions (retry, cache repair, credential fallback) key off the
/// variant, never off string matching.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Image reference failed to parse
    #[error("invalid image reference '{reference}' at offset {position}: {message}")]
    InvalidImageReference {
        reference: String,
        position: usize,
        message: String,
    },

    /// 401 after the auth flow was exhausted
    #[error("unauthorized for {registry}/{repository}")]
    Unauthorized {
        registry: String,
        repository: String,
        /// The final `WWW-Authenticate` challenge, when the server sent one.
        challenge: Option<String>,
    },

    /// 403 from the registry
    #[error("forbidden for {registry}/{repository}")]
    Forbidden {
        registry: String,
        repository: String,
    },

    /// 404 on a manifest endpoint
    #[error("manifest not found: {reference}")]
    ManifestNotFound { reference: String },

    /// 404 on a blob endpoint
    #[error("blob {digest} not found in {registry}/{repository}")]
    BlobNotFound {
        registry: String,
        repository: String,
        digest: String,
    },

    /// Manifest layer count does not match the config diff_ids
    #[error("base image is inconsistent: manifest has {layers} layers but config lists {diff_ids} diff_ids")]
    LayerCountMismatch { layers: usize, diff_ids: usize },

    /// Container config JSON missing required fields or wrong types
    #[error("bad container config: {message}")]
    BadContainerConfig { message: String },

    /// A digest string is not `sha256:` + 64 hex characters
    #[error("invalid digest '{value}'")]
    InvalidDigest { value: String },

    /// Locally computed digest differs from the advertised one
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A cache entry is partially written or internally inconsistent.
    /// Recoverable: the engine invalidates the entry and recomputes.
    #[error("cache corrupted: {message}")]
    CacheCorrupted { message: String },

    /// Timeout, connection reset, 5xx, 429 - retried with backoff
    #[error("transient registry failure: {message}")]
    Transient { message: String },

    /// Offline mode is on and the resource is not cached
    #[error("'{resource}' is not cached; enable network access and run again")]
    OfflineMiss { resource: String },

    /// The docker daemon rejected the loaded image
    #[error("docker load exited with status {status}")]
    DockerLoad { status: i32 },

    /// The build was cancelled before this step completed
    #[error("build cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

impl StrataError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StrataError::Transient { .. })
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
