//! Error types for pooling and listener dispatch.
//!
//! Errors are categorized to tell callers whether retrying makes sense:
//! - **Transient**: saturation or a broker hiccup, the same call may succeed later
//! - **Permanent**: programmer or configuration error, retrying will not help

use std::fmt;
use thiserror::Error;

/// Boxed error returned by application callbacks and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience alias used throughout the crate.
pub type Result<T, E = JmsError> = std::result::Result<T, E>;

/// Category of error for deciding retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - the caller may retry.
    Transient,
    /// Unrecoverable failure - surface it.
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors raised by pools, listeners and the protocol layer.
#[derive(Debug, Error)]
pub enum JmsError {
    /// Every resource of the pool is checked out.
    #[error("pool '{pool}' exhausted: {active} of {max_size} resources active")]
    PoolExhausted {
        pool: String,
        active: usize,
        max_size: usize,
    },

    /// A resource was released that the pool does not consider checked out.
    #[error("resource {id} is not active in pool '{pool}'")]
    NotActive { pool: String, id: u64 },

    /// The broker client failed to create a connection, session or producer.
    #[error("failed to create {resource}: {source}")]
    ResourceCreationFailed {
        resource: &'static str,
        #[source]
        source: Box<JmsError>,
    },

    /// Session or consumer setup failed while starting a listener.
    #[error("failed to register listener on '{destination}': {source}")]
    ListenerRegistrationFailed {
        destination: String,
        #[source]
        source: Box<JmsError>,
    },

    /// The application callback returned an error.
    #[error("listener callback failed: {0}")]
    CallbackFailed(#[source] BoxError),

    /// The message was processed but the acknowledgement did not reach the broker.
    #[error("failed to acknowledge message {message_id}; it may be redelivered: {reason}")]
    AcknowledgementFailed { message_id: String, reason: String },

    /// Committing the session failed.
    #[error("failed to commit session: {0}")]
    CommitFailed(String),

    /// Rolling back the session failed.
    #[error("failed to roll back session: {0}")]
    RollbackFailed(String),

    /// The operation is not supported by this component.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The dispatch executor is saturated and refused the task.
    #[error("dispatch rejected for '{listener}': {active_workers} workers busy and queue full")]
    DispatchRejected {
        listener: String,
        active_workers: usize,
    },

    /// Body conversion failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A message selector could not be parsed.
    #[error("invalid message selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// A concurrency range did not match `min-max`.
    #[error("invalid concurrency '{0}': expected 'min-max' with 1 <= min <= max")]
    InvalidConcurrency(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The resource has been closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Error reported by the underlying broker client.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl JmsError {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        JmsError::Protocol(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        JmsError::Serialization(message.into())
    }

    /// Wrap an underlying failure as a resource creation failure.
    pub fn creation(resource: &'static str, source: JmsError) -> Self {
        JmsError::ResourceCreationFailed {
            resource,
            source: Box::new(source),
        }
    }

    /// Wrap an underlying failure as a listener registration failure.
    pub fn registration(destination: impl Into<String>, source: JmsError) -> Self {
        JmsError::ListenerRegistrationFailed {
            destination: destination.into(),
            source: Box::new(source),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            JmsError::PoolExhausted { .. } => ErrorCategory::Transient,
            JmsError::DispatchRejected { .. } => ErrorCategory::Transient,
            JmsError::Protocol(_) => ErrorCategory::Transient,
            JmsError::ResourceCreationFailed { source, .. } => source.category(),
            JmsError::ListenerRegistrationFailed { source, .. } => source.category(),
            JmsError::AcknowledgementFailed { .. } => ErrorCategory::Transient,
            JmsError::CommitFailed(_) => ErrorCategory::Transient,
            JmsError::RollbackFailed(_) => ErrorCategory::Transient,
            JmsError::NotActive { .. }
            | JmsError::CallbackFailed(_)
            | JmsError::UnsupportedOperation(_)
            | JmsError::Serialization(_)
            | JmsError::InvalidSelector { .. }
            | JmsError::InvalidConcurrency(_)
            | JmsError::Config(_)
            | JmsError::Closed(_) => ErrorCategory::Permanent,
        }
    }

    /// Check whether the failed call may succeed when retried.
    pub fn is_retriable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            JmsError::PoolExhausted { .. } => "pool_exhausted",
            JmsError::NotActive { .. } => "not_active",
            JmsError::ResourceCreationFailed { .. } => "resource_creation_failed",
            JmsError::ListenerRegistrationFailed { .. } => "listener_registration_failed",
            JmsError::CallbackFailed(_) => "callback_failed",
            JmsError::AcknowledgementFailed { .. } => "acknowledgement_failed",
            JmsError::CommitFailed(_) => "commit_failed",
            JmsError::RollbackFailed(_) => "rollback_failed",
            JmsError::UnsupportedOperation(_) => "unsupported_operation",
            JmsError::DispatchRejected { .. } => "dispatch_rejected",
            JmsError::Serialization(_) => "serialization",
            JmsError::InvalidSelector { .. } => "invalid_selector",
            JmsError::InvalidConcurrency(_) => "invalid_concurrency",
            JmsError::Config(_) => "config",
            JmsError::Closed(_) => "closed",
            JmsError::Protocol(_) => "protocol",
        }
    }
}

impl From<serde_json::Error> for JmsError {
    fn from(err: serde_json::Error) -> Self {
        JmsError::Serialization(err.to_string())
    }
}

impl From<core_config::ConfigError> for JmsError {
    fn from(err: core_config::ConfigError) -> Self {
        JmsError::Config(err.to_string())
    }
}
