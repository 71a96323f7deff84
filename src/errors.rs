//! Translation Runtime Error Hierarchy
//!
//! Errors are grouped by the layer that raised them so every response can carry an
//! [`ErrorSource`] tag next to the error itself:
//! - [`ProtocolError`]: the request itself is unroutable (bad or unregistered path)
//! - [`AppError`]: reported by a handler's translate/process logic
//! - [`BackendError`]: the key-value store is unreachable or rejected the transaction
//!
//! Configuration and fatal errors belong to the runtime itself and report
//! [`ErrorSource::Runtime`].

use config::ConfigError;

use crate::api::BulkResponse;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request routing and registration failures
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Handler-reported failures
    #[error(transparent)]
    App(#[from] AppError),

    /// Key-value store failures, including commit conflicts
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Runtime configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Which layer an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    Protocol,
    App,
    Backend,
    /// Startup configuration or an unrecoverable runtime fault
    Runtime,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// No registered prefix matches and no catch-all handler exists
    #[error("No handler registered for path {path}")]
    NoHandlerForPath { path: String },

    /// A handler is already registered under this prefix
    #[error("Handler prefix {prefix} is already registered")]
    DuplicateRegistration { prefix: String },

    /// The registration names a handler type with no known constructor
    #[error("Handler type {handler_type} has no registered factory")]
    TypeMismatch { handler_type: String },

    /// Malformed request path
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("User {user} is not authorized for {operation}")]
    Unauthorized { user: String, operation: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Store connection could not be established or was lost
    #[error("Store unreachable: {0}")]
    Unreachable(String),

    /// A watched key or table changed between watch and commit
    #[error("Transaction conflict on {0}")]
    TxConflict(String),

    /// Transaction primitive invoked in the wrong state
    #[error("Invalid transaction state: {0}")]
    TxState(&'static str),

    /// Mutation attempted through a read-only connection
    #[error("Connection to {0} is read-only")]
    ReadOnly(String),

    /// Key-space subscription could not be opened or failed
    #[error("Key-space subscription failed: {0}")]
    Subscription(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Tag reported alongside this error in every response.
    pub fn error_source(&self) -> ErrorSource {
        match self {
            Error::Protocol(_) => ErrorSource::Protocol,
            Error::App(_) => ErrorSource::App,
            Error::Backend(_) => ErrorSource::Backend,
            Error::Config(_) | Error::Fatal(_) => ErrorSource::Runtime,
        }
    }

    /// True when the error is an optimistic-concurrency violation at commit.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Backend(BackendError::TxConflict(_)))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::App(AppError::NotFound(_)))
    }
}

// ============== Conversion Implementations ============== //
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Backend(BackendError::Serialization(e.to_string()))
    }
}

/// A bulk request that failed part-way.
///
/// The store has been rolled back; `response` still records which item failed and what the
/// items before it reported.
#[derive(Debug, thiserror::Error)]
#[error("Bulk request failed: {error}")]
pub struct BulkError {
    pub response: BulkResponse,
    #[source]
    pub error: Error,
}
