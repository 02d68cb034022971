//! # Telemetry Module
//!
//! Tracing integration for the saga engine: subscriber initialization and
//! the spans deadline firing and retry redelivery run in.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use saga_engine_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! // Initialize telemetry at application startup
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```

use crate::deadline::Deadline;
use crate::port::command_bus::CommandMessage;
use tracing::{Level, Span, span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Registry};

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for tracing
    pub service_name: String,
    /// Log level filter, in `EnvFilter` syntax
    pub log_level: String,
    /// Include span targets in log lines
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "saga-engine".to_string(),
            log_level: "info".to_string(),
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }
}

/// Telemetry guard - keep alive for as long as tracing is needed
#[derive(Debug)]
pub struct TelemetryGuard {
    service_name: String,
}

impl TelemetryGuard {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Shutdown telemetry
    pub fn shutdown(self) {
        tracing::debug!(service = %self.service_name, "Telemetry shut down");
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.log_level` when set. Fails if a
/// global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
        .try_init()?;

    Ok(TelemetryGuard {
        service_name: config.service_name.clone(),
    })
}

/// Span for firing one deadline.
pub fn deadline_span(deadline: &Deadline) -> Span {
    span!(
        Level::INFO,
        "saga.deadline",
        saga.type_name = %deadline.saga_type,
        saga.id = %deadline.saga_id,
        deadline.name = %deadline.name,
        deadline.token = %deadline.token,
    )
}

/// Span for redelivering one command.
pub fn retry_span(command: &CommandMessage, attempt: usize) -> Span {
    span!(
        Level::INFO,
        "saga.retry",
        command.name = %command.command_name,
        command.id = %command.identifier,
        retry.attempt = attempt,
    )
}
