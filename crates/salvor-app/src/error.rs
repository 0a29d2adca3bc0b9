//! # Design
//!
//! - Centralize runtime bootstrap errors.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration operations failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: salvor_config::ConfigError,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: salvor_telemetry::TelemetryError,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: salvor_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: salvor_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_errors_keep_their_source() {
        let err = AppError::config(
            "config.load",
            salvor_config::ConfigError::InvalidField {
                section: "recovery".into(),
                field: "SALVOR_BACKOFF_BASE_MS".into(),
                value: Some("soon".into()),
                reason: "expected milliseconds as an unsigned integer",
            },
        );
        assert_eq!(err.to_string(), "configuration operation failed");
        assert!(matches!(
            err,
            AppError::Config {
                operation: "config.load",
                ..
            }
        ));
        assert!(err.source().is_some());
    }
}
