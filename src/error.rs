/// Unified error handling for tablero
///
/// This module provides the error type system shared by the routing engine,
/// the backend session pools and configuration loading.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for tablero operations
#[derive(Debug, Error)]
pub enum TableroError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Routing errors caused by the statement being routed
    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    /// Backend pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// No pool is available for a backend group
    #[error("Backend group unavailable: {group}")]
    GroupUnavailable { group: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Route inheritance error: {0}")]
    Inheritance(String),
}

/// Errors raised while mapping route key values to shards
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("value '{value}' is not valid for algorithm {algorithm}")]
    InvalidValue { algorithm: String, value: String },

    #[error("node index {index} out of bounds (node count {count})")]
    NodeIndexOutOfBounds { index: i64, count: usize },

    #[error("invalid range: {start} > {end}")]
    InvalidRange { start: String, end: String },

    #[error("no value for route key '{key}' on table {table}")]
    MissingRouteKey { table: String, key: String },

    #[error("unknown route rule: {0}")]
    UnknownRule(String),

    #[error("unknown routing algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("route rule {0} has no data nodes")]
    NoDataNodes(String),

    #[error("route key values of table {table} select no common shard")]
    ConflictingRouteKeys { table: String },
}

/// Backend session pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session available from {endpoint} after {waited:?}")]
    Exhausted { endpoint: String, waited: Duration },

    #[error("pool service {0} is not running")]
    NotRunning(String),

    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("session {0} already has a bound callback")]
    CallbackAlreadyBound(String),

    #[error("session {0} has no transport")]
    TransportClosed(String),
}

/// Result type alias for tablero operations
pub type TableroResult<T> = Result<T, TableroError>;

/// Result type alias for routing computations
pub type RouteResult<T> = Result<T, RouteError>;

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Convenience methods for creating specific error types
impl TableroError {
    /// Create a group unavailable error
    pub fn group_unavailable<S: Into<String>>(group: S) -> Self {
        TableroError::GroupUnavailable {
            group: group.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        TableroError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (can retry against another backend)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TableroError::Network(_) => true,
            TableroError::GroupUnavailable { .. } => true,
            TableroError::Pool(PoolError::Exhausted { .. }) => true,
            TableroError::Pool(PoolError::Connect { .. }) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TableroError::Config(_) => ErrorSeverity::Critical,
            TableroError::Internal { .. } => ErrorSeverity::Critical,
            TableroError::Network(_) => ErrorSeverity::Warning,
            TableroError::Pool(_) => ErrorSeverity::Warning,
            TableroError::GroupUnavailable { .. } => ErrorSeverity::Warning,
            TableroError::Route(_) => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about statement-level failures
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

impl RouteError {
    pub fn invalid_value<A: Into<String>, V: Into<String>>(algorithm: A, value: V) -> Self {
        RouteError::InvalidValue {
            algorithm: algorithm.into(),
            value: value.into(),
        }
    }

    pub fn out_of_bounds(index: i64, count: usize) -> Self {
        RouteError::NodeIndexOutOfBounds { index, count }
    }

    pub fn invalid_range<S: Into<String>>(start: S, end: S) -> Self {
        RouteError::InvalidRange {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn conflicting_keys<S: Into<String>>(table: S) -> Self {
        RouteError::ConflictingRouteKeys {
            table: table.into(),
        }
    }

    pub fn missing_key<S: Into<String>>(table: S, key: S) -> Self {
        RouteError::MissingRouteKey {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl PoolError {
    pub fn connect<E: Into<String>, M: fmt::Display>(endpoint: E, message: M) -> Self {
        PoolError::Connect {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }
}
