use thiserror::Error;

/// Unified error type for tree synchronization operations
#[derive(Debug, Error)]
pub enum TreeSyncError {
    // Addressing errors
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    // Command errors
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Cannot {0}: the document root is fixed")]
    InvariantViolation(String),

    // Observation errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    // Replication engine errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// Result type alias for tree synchronization operations
pub type Result<T> = std::result::Result<T, TreeSyncError>;

impl TreeSyncError {
    /// Shorthand for a [`TreeSyncError::TypeMismatch`].
    pub(crate) fn type_mismatch(expected: &'static str, found: impl Into<String>) -> Self {
        TreeSyncError::TypeMismatch {
            expected,
            found: found.into(),
        }
    }
}
