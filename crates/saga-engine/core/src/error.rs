//!
//! # Error Types
//!
//! Central error type returned by saga handlers, plus configuration errors.
//! Component-specific errors live next to their component
//! (see [`crate::aggregate::IncompatibleAggregateError`],
//! [`crate::deadline::DeadlineError`], [`crate::retry::SchedulingError`]).
//!

pub mod classification;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;
use thiserror::Error;

/// Error raised by saga event and deadline handlers.
#[derive(Debug)]
pub struct Error {
    /// Error message
    message: String,
    /// Error kind for classification
    kind: ErrorKind,
    /// Source error if any
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Timestamp when error occurred
    timestamp: SystemTime,
    /// Additional context attributes
    context: HashMap<String, String>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

impl Error {
    /// Create a new error with message
    pub fn new(message: String, kind: ErrorKind) -> Self {
        Self {
            message,
            kind,
            source: None,
            timestamp: SystemTime::now(),
            context: HashMap::new(),
        }
    }

    /// Create from another error
    pub fn from_source<E: std::error::Error + Send + Sync + 'static>(
        message: String,
        kind: ErrorKind,
        source: E,
    ) -> Self {
        Self {
            message,
            kind,
            source: Some(Box::new(source)),
            timestamp: SystemTime::now(),
            context: HashMap::new(),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }

    /// Add context attribute
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Get context value
    pub fn get_context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(|s| s.as_str())
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Convert to structured format
    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            message: self.message.clone(),
            kind: self.kind.clone(),
            timestamp: chrono::DateTime::from(self.timestamp),
            context: self.context.clone(),
            source: self.source.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Structured error for serialization and broadcasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub message: String,
    pub kind: ErrorKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: HashMap<String, String>,
    pub source: Option<String>,
}

/// Kinds of errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A saga event or deadline handler failed
    #[serde(rename = "handler")]
    Handler,
    /// Scheduling work on the execution facility failed
    #[serde(rename = "scheduling")]
    Scheduling,
    /// Configuration errors
    #[serde(rename = "configuration")]
    Configuration,
    /// Unknown errors
    #[serde(rename = "unknown")]
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Handler => write!(f, "handler"),
            ErrorKind::Scheduling => write!(f, "scheduling"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result type with saga-engine error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Helper functions for common error scenarios
impl Error {
    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(message.into(), ErrorKind::Handler)
    }

    /// Handler error for a caught panic.
    pub(crate) fn handler_panic(panic: &(dyn std::any::Any + Send)) -> Self {
        Self::handler(format!("Saga handler panicked: {}", panic_message(panic)))
    }
}

impl From<crate::deadline::DeadlineError> for Error {
    fn from(err: crate::deadline::DeadlineError) -> Self {
        Error::from_source(err.to_string(), ErrorKind::Scheduling, err)
    }
}

/// Message carried by a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Errors raised while building components from configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting was not provided
    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },

    /// A setting has an invalid value
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Cross-field validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, value: impl ToString) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
        }
    }
}
