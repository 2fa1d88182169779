//! Error types for the dispatch engine.
//!
//! Admission denial is deliberately absent here: it is a control signal
//! ([`crate::AdmissionDecision::Denied`]), not an error.

use thiserror::Error;

/// Backend registry failures. Unknown names are a caller error and are never
/// silently substituted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown profile: {0}")]
    NotFound(String),

    #[error("duplicate profile title: {0}")]
    Duplicate(String),

    #[error("registry has no President profile")]
    MissingPresident,

    #[error("registry has more than one President: {0} and {1}")]
    MultiplePresidents(String, String),
}

/// Failures while forming the cabinet or convening it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CabinetError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("embedder version mismatch: cabinet formed with {formed}, query used {query}")]
    EmbedderVersionMismatch { formed: String, query: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("cabinet has no ministers to convene")]
    Empty,
}

/// Errors surfaced by an inference backend implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {0}")]
    Malformed(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors from one dispatch round-trip (primary call, audit call, or assist).
/// Every variant is a hard failure at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{call} timed out after {timeout_ms}ms")]
    Timeout { call: &'static str, timeout_ms: u64 },

    #[error("cancelled during {0}")]
    Cancelled(&'static str),

    #[error("no live node for backend {0}")]
    NoLiveNode(String),
}

impl DispatchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures while assembling an [`crate::Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cabinet(#[from] CabinetError),
}
