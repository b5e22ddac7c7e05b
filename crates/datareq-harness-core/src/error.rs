//! Typed errors for request execution.
//!
//! Every connector failure is one of four kinds. The kind decides what the
//! runner does with it: configuration problems fail only the request,
//! transient and data-quality problems are eligible for a degrade path,
//! and invariant violations abort the whole run.

use thiserror::Error;

use crate::geometry::GeometryError;

/// Classification of an [`EngineError`], used for runner policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    TransientSource,
    DataQuality,
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::TransientSource => "TransientSourceError",
            ErrorKind::DataQuality => "DataQualityError",
            ErrorKind::InvariantViolation => "InvariantViolation",
        }
    }
}

/// Errors raised while planning or executing data requests.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or missing parameters, credentials, or site configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure, timeout, rate limit, or 5xx from a source.
    #[error("transient source error: {0}")]
    TransientSource(String),

    /// The source answered but the content is unusable.
    #[error("data quality error: {0}")]
    DataQuality(String),

    /// Catalog corruption or an internal consistency check failed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::TransientSource(msg.into())
    }

    pub fn data_quality(msg: impl Into<String>) -> Self {
        EngineError::DataQuality(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::InvariantViolation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::TransientSource(_) => ErrorKind::TransientSource,
            EngineError::DataQuality(_) => ErrorKind::DataQuality,
            EngineError::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            EngineError::Configuration(m)
            | EngineError::TransientSource(m)
            | EngineError::DataQuality(m)
            | EngineError::InvariantViolation(m) => m,
        }
    }

    /// Whether a connector's degrade path may run for this failure.
    pub fn allows_degrade(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientSource | ErrorKind::DataQuality
        )
    }

    /// Whether the failure must stop the whole run.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::InvariantViolation
    }
}

impl From<GeometryError> for EngineError {
    fn from(err: GeometryError) -> Self {
        match err {
            GeometryError::SizeMismatch { .. } => EngineError::InvariantViolation(err.to_string()),
            _ => EngineError::Configuration(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::DataQuality(err.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
