//! Error types shared by the discovery, fan-out and addon layers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Unknown peer id, addon id, asset or script.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    /// Malformed addon manifest. The addon is skipped, the scan goes on.
    #[error("invalid addon '{addon}': {reason}")]
    Validation { addon: String, reason: String },

    #[error("invalid value for setting '{setting}': {reason}")]
    InvalidSetting { setting: String, reason: String },

    #[error("addon '{addon}' {hook} hook failed: {message}")]
    Lifecycle {
        addon: String,
        hook: &'static str,
        message: String,
    },

    /// Write failures on stdio/sockets while the host is going down.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] std::io::Error),

    #[error("fan-out requires at least one target")]
    EmptyTargets,

    #[error("failed to bind discovery socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Failures of the persisted config blob.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("config store I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config store contains invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config save task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Error kinds that show up when stdio or a socket is torn down under us.
pub fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}
