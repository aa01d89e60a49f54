//! Error taxonomy for the broker core.
//!
//! Every fallible operation in this crate returns [`BrokerError`]. Handlers
//! translate low-level errors (SDK failures, I/O, parse errors) into one of
//! these kinds at the boundary between the provider/repository layer and the
//! core (see spec §7). The bus itself never transforms errors.

use thiserror::Error;

/// The broker's error taxonomy (spec §7).
///
/// `kind`, not type name: the match arms below are what callers branch on,
/// not the specific provider or repository that produced the failure.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {entity_type} {entity_id}")]
    NotFound {
        entity_type: &'static str,
        entity_id: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider transient error ({provider}): {message}")]
    ProviderTransient {
        provider: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("provider permanent error ({provider}): {message}")]
    ProviderPermanent {
        provider: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("circuit breaker open for {service}")]
    CircuitBreakerOpen { service: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no provider strategy available for operation {operation}")]
    NoProviderAvailable { operation: String },

    #[error("handler not registered for {0}")]
    HandlerNotFound(&'static str),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Field-level validation failures, aggregated onto [`BrokerError::Validation`].
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("{field} must be >= {min}, got {actual}")]
    BelowMinimum {
        field: String,
        min: i64,
        actual: i64,
    },

    #[error("{field} must be <= {max}, got {actual}")]
    AboveMaximum {
        field: String,
        max: i64,
        actual: i64,
    },

    #[error("{0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Governs whether [`crate::resilience::retry`] retries an error.
///
/// Only `ProviderTransient` and `Timeout` are retryable by default; everything
/// else fails the operation immediately (spec §4.7, §7).
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for BrokerError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::ProviderTransient { .. } | BrokerError::Timeout(_)
        )
    }
}

impl BrokerError {
    pub fn not_found(entity_type: &'static str, entity_id: impl Into<String>) -> Self {
        BrokerError::NotFound {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn provider_transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::ProviderTransient {
            provider: provider.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn provider_permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::ProviderPermanent {
            provider: provider.into(),
            message: message.into(),
            source: None,
        }
    }
}
