use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Exit code used for configuration failures detected before any test runs.
pub const EXIT_CONFIGURATION: i32 = 2;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("required path does not exist: {path}")]
    MissingPath { path: PathBuf },

    #[error("violation store configured twice: pass either a store URL or a store config file")]
    ConflictingStoreConfig,

    #[error("cannot use an in-memory database as violation store: {url}")]
    EphemeralStore { url: String },

    #[error("unsupported violation store backend: {url}")]
    UnsupportedBackend { url: String },

    #[error("violation collection requires a tracer, none is available")]
    MissingTracer,

    #[error("violation collection requires a tracer with {capability} support")]
    TracerCapability { capability: &'static str },

    #[error("attribution record is {size} bytes, limit is {limit}")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("attribution channel is full, record of {size} bytes not published")]
    ChannelFull { size: usize },
}

/// Coarse classification that decides how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal, raised before any test executes.
    Configuration,
    /// Store write failures; logged and dropped.
    Persistence,
    /// Channel encode/decode failures; treated as "no new data".
    Attribution,
    Other,
}

impl LedgerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Yaml(_)
            | Self::InvalidArgument { .. }
            | Self::MissingPath { .. }
            | Self::ConflictingStoreConfig
            | Self::EphemeralStore { .. }
            | Self::UnsupportedBackend { .. }
            | Self::MissingTracer
            | Self::TracerCapability { .. } => ErrorKind::Configuration,
            Self::Store(_) => ErrorKind::Persistence,
            Self::RecordTooLarge { .. } | Self::ChannelFull { .. } => ErrorKind::Attribution,
            Self::Io(_) | Self::Json(_) => ErrorKind::Other,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.kind() == ErrorKind::Configuration {
            EXIT_CONFIGURATION
        } else {
            1
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
