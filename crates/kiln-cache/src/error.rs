use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the compilation cache.
///
/// Configurations the cache cannot reason about are not errors; they surface
/// as [`LocateOutcome::CacheNotSupported`](crate::LocateOutcome).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} on {path} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("json error in {context}: {message}")]
    Json {
        context: String,
        message: String,
    },

    #[error("zip error in {path}: {message}")]
    Zip { path: PathBuf, message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("unknown compiler property `{name}`")]
    UnknownProperty { name: String },

    #[error("compiler property `{name}` is given more than once")]
    DuplicateProperty { name: String },

    #[error("output `{name}` is declared as both {first} and {second}")]
    ConflictingOutput {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("cannot read assembly metadata from {path}: {source}")]
    MalformedAssembly {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{path} changed while it was being read (hashed as {expected}, read as {found})")]
    FileChanged {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("cache entry {key} is corrupt: {reason}")]
    Corruption { key: String, reason: String },

    #[error(
        "inputs of {key} changed after a cache hit was used \
         (locate fingerprint {expected}, populate fingerprint {found})"
    )]
    InputsChangedAfterHit {
        key: String,
        expected: String,
        found: String,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, err: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn corruption(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::Corruption {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
