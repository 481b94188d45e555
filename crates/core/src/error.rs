//! Beacon Error Types
//!
//! This module defines a layered error hierarchy:
//! - `DomainError`: presence/protocol failures (config, auth, correlation, malformed payloads)
//! - `InfraError`: infrastructure failures (IO, serialization, Redis, broker, sockets)
//! - `BeaconError`: top-level error that wraps both categories

use thiserror::Error;

/// Domain-level errors representing business logic failures
#[derive(Debug, Error)]
pub enum DomainError {
    /// Configuration file not found at the specified path
    #[error("Config not found: {path}")]
    ConfigNotFound { path: String },
    /// Configuration validation failed
    #[error("Config invalid [{field}]: {reason}")]
    ConfigInvalid { field: String, reason: String },
    /// Configuration parsing failed
    #[error("Config parse error: {message}")]
    ConfigParse { message: String },
    /// Access token missing, malformed or expired
    #[error("Authentication failed: {reason}")]
    AuthFailure { reason: String },
    /// No response arrived for a correlated request within the bound
    #[error("Request {request_id} ({event_name}) timed out after {timeout_ms}ms")]
    CorrelationTimeout {
        request_id: String,
        event_name: String,
        timeout_ms: u64,
    },
    /// Payload on the bus, broker or socket could not be understood
    #[error("Malformed message on {channel}: {reason}")]
    MalformedMessage { channel: String, reason: String },
}

/// Infrastructure-level errors representing external system failures
#[derive(Debug, Error)]
pub enum InfraError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// YAML serialization/deserialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),
    /// Shared store command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// Publish or subscribe could not reach the broker
    #[error("Broker unavailable [{channel}]: {reason}")]
    BrokerUnavailable { channel: String, reason: String },
    /// Transport-level socket failure
    #[error("Socket error: {0}")]
    Socket(String),
}

/// Top-level error type for Beacon
///
/// Wraps both domain and infrastructure errors so library code can return a
/// single type while callers still match on the category they care about.
#[derive(Debug, Error)]
pub enum BeaconError {
    /// Business logic error
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Infrastructure/external system error
    #[error(transparent)]
    Infra(#[from] InfraError),
    /// Generic error for edge cases
    #[error("Error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BeaconError>;

// Convenience conversions from infrastructure error sources
impl From<std::io::Error> for BeaconError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infra(InfraError::Json(err))
    }
}

impl From<serde_yml::Error> for BeaconError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Infra(InfraError::Yaml(err))
    }
}

impl From<redis::RedisError> for BeaconError {
    fn from(err: redis::RedisError) -> Self {
        Self::Infra(InfraError::Redis(err))
    }
}

impl BeaconError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigNotFound { path: path.into() })
    }

    pub fn config_parse_error(message: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigParse {
            message: message.into(),
        })
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        })
    }

    pub fn auth_failure(reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::AuthFailure {
            reason: reason.into(),
        })
    }

    pub fn malformed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::MalformedMessage {
            channel: channel.into(),
            reason: reason.into(),
        })
    }

    pub fn broker_unavailable(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Infra(InfraError::BrokerUnavailable {
            channel: channel.into(),
            reason: reason.into(),
        })
    }

    pub fn socket(reason: impl Into<String>) -> Self {
        Self::Infra(InfraError::Socket(reason.into()))
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Infra(InfraError::Redis(_))
                | Self::Infra(InfraError::BrokerUnavailable { .. })
                | Self::Infra(InfraError::Socket(_))
                | Self::Infra(InfraError::Io(_))
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Domain(DomainError::CorrelationTimeout { .. }))
    }
}
