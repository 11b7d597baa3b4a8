//! Error types for autofailover

use crate::common::fsm::NodeState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // === FSM Errors ===
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: NodeState, to: NodeState },

    #[error("Operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("Giving up after {failures} consecutive failures of {from} -> {to}: {last_error}")]
    RetryCeilingExceeded {
        from: NodeState,
        to: NodeState,
        failures: u32,
        last_error: String,
    },

    // === Registry Errors ===
    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    #[error("Formation not found: {0}")]
    FormationNotFound(String),

    #[error("Formation already exists: {0}")]
    FormationExists(String),

    #[error("Formation {0} still has registered nodes")]
    FormationNotEmpty(String),

    #[error("Group not found: {formation}/{group_id}")]
    GroupNotFound { formation: String, group_id: u32 },

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("No eligible promotion candidate in {formation}/{group_id}")]
    NoCandidate { formation: String, group_id: u32 },

    #[error("Switchover rejected: {0}")]
    SwitchoverRejected(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Registry corrupted: {0}")]
    RegistryCorrupted(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::Http(_)
                | Error::OperationFailed { .. }
        )
    }

    /// Errors that must stop the keeper control loop and require an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IllegalTransition { .. }
                | Error::RetryCeilingExceeded { .. }
                | Error::InvalidConfig(_)
                | Error::Corrupted(_)
                | Error::ChecksumMismatch { .. }
        )
    }

    /// Stable machine-readable name used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Corrupted(_) | Error::ChecksumMismatch { .. } => "corrupted",
            Error::IllegalTransition { .. } => "illegal_transition",
            Error::OperationFailed { .. } => "operation_failed",
            Error::RetryCeilingExceeded { .. } => "retry_ceiling_exceeded",
            Error::NodeNotFound(_) => "node_not_found",
            Error::FormationNotFound(_) => "formation_not_found",
            Error::FormationExists(_) => "formation_exists",
            Error::FormationNotEmpty(_) => "formation_not_empty",
            Error::GroupNotFound { .. } => "group_not_found",
            Error::InvalidSetting(_) => "invalid_setting",
            Error::NoCandidate { .. } => "no_candidate",
            Error::SwitchoverRejected(_) => "switchover_rejected",
            Error::RocksDb(_) | Error::RegistryCorrupted(_) => "registry",
            Error::Http(_) => "http",
            Error::ConnectionFailed(_) => "connection_failed",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Internal(_) => "internal",
            Error::Timeout(_) => "timeout",
            Error::Other(_) => "other",
        }
    }

    /// Rebuild an error from its wire form. Variants carrying structured
    /// fields that do not survive the trip degrade to their message.
    pub fn from_wire(code: &str, message: String, node_id: Option<u64>) -> Self {
        match (code, node_id) {
            ("node_not_found", Some(id)) => Error::NodeNotFound(id),
            ("formation_not_found", _) => Error::FormationNotFound(message),
            ("formation_exists", _) => Error::FormationExists(message),
            ("formation_not_empty", _) => Error::FormationNotEmpty(message),
            ("invalid_setting", _) => Error::InvalidSetting(message),
            ("switchover_rejected", _) => Error::SwitchoverRejected(message),
            ("invalid_config", _) => Error::InvalidConfig(message),
            ("timeout", _) => Error::Timeout(message),
            ("group_not_found", _) | ("no_candidate", _) => Error::Other(message),
            _ => Error::Http(message),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NodeNotFound(_)
            | Error::FormationNotFound(_)
            | Error::GroupNotFound { .. } => StatusCode::NOT_FOUND,
            Error::FormationExists(_)
            | Error::FormationNotEmpty(_)
            | Error::SwitchoverRejected(_)
            | Error::NoCandidate { .. } => StatusCode::CONFLICT,
            Error::InvalidSetting(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::IllegalTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
