//! # Error Types for the IoT Device Agent
//!
//! Every fallible operation of the agent returns [`AgentResult`]. Errors
//! carry the lifecycle phase that failed (registration, authentication,
//! session, serialization, storage) plus the underlying cause.

use thiserror::Error;

/// Why a credential exchange with the platform failed.
///
/// Registration and login share the same failure shape so callers can
/// tell a network problem from a malformed body or a business rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialFailure {
    /// The request never produced a response body
    #[error("request failed: {0}")]
    Transport(String),

    /// The response body could not be decoded
    #[error("response could not be decoded: {0}")]
    Decode(String),

    /// The platform answered with a non-OK status inside the body
    #[error("platform rejected the request with status {status}: {message}")]
    Rejected { status: i32, message: String },

    /// The issued access token is not valid hex
    #[error("access token is not valid hex: {0}")]
    InvalidToken(String),

    /// The identity lacks a field the exchange needs
    #[error("identity is missing {0}")]
    MissingField(&'static str),
}

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    // =========================================================================
    // CREDENTIAL ERRORS
    // =========================================================================

    /// Device registration failed
    #[error("Device registration failed: {0}")]
    RegistrationError(CredentialFailure),

    /// Device login failed
    #[error("Device login failed: {0}")]
    LoginError(CredentialFailure),

    // =========================================================================
    // SESSION ERRORS
    // =========================================================================

    /// Transport session open, publish or subscribe failed
    #[error("Session error during {operation}: {reason}")]
    SessionError {
        operation: &'static str,
        reason: String,
    },

    /// A request descriptor could not be formatted for the transport
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Raw HTTP exchange failed
    #[error("HTTP request to '{url}' failed: {reason}")]
    HttpError { url: String, reason: String },

    // =========================================================================
    // PAYLOAD ERRORS
    // =========================================================================

    /// Payload encode/decode failure
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // =========================================================================
    // STORAGE ERRORS
    // =========================================================================

    /// Persistence read/write failure
    #[error("Storage error: {0}")]
    StorageError(String),

    // =========================================================================
    // LIFECYCLE ERRORS
    // =========================================================================

    /// Automatic initialisation failed while serving another operation
    #[error("Automatic initialisation failed: {0}")]
    AutoInitFailed(#[source] Box<AgentError>),

    /// A retry loop was cancelled by its caller
    #[error("Operation cancelled during {0}")]
    Cancelled(&'static str),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type alias using AgentError
pub type AgentResult<T> = Result<T, AgentError>;

// =============================================================================
// ERROR CONVERSIONS
// =============================================================================

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::StorageError(err.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        AgentError::ConfigurationError(err.to_string())
    }
}

impl From<hex::FromHexError> for AgentError {
    fn from(err: hex::FromHexError) -> Self {
        AgentError::SerializationError(err.to_string())
    }
}

// =============================================================================
// ERROR CATEGORIES (for logging)
// =============================================================================

impl AgentError {
    /// Build a session error for the given transport operation
    pub fn session(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        AgentError::SessionError {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::RegistrationError(_) => "registration",
            AgentError::LoginError(_) => "authentication",

            AgentError::SessionError { .. }
            | AgentError::InvalidRequest(_)
            | AgentError::HttpError { .. } => "session",

            AgentError::SerializationError(_) => "serialization",
            AgentError::StorageError(_) => "storage",

            AgentError::AutoInitFailed(inner) => inner.category(),
            AgentError::Cancelled(_) => "lifecycle",

            AgentError::ConfigurationError(_) => "config",
        }
    }

    /// Check if the error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::RegistrationError(failure) | AgentError::LoginError(failure) => {
                matches!(failure, CredentialFailure::Transport(_))
            }
            AgentError::SessionError { .. } | AgentError::HttpError { .. } => true,
            AgentError::AutoInitFailed(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}
