//! # ShellKit Common
//!
//! Shared error type, logging configuration and retry helpers used by the
//! ShellKit request interceptor and its tooling.
//!
//! ## Features
//!
//! - Error type with backtrace support for internal failures
//! - `tracing` subscriber setup (pretty, compact, JSON)
//! - Retry with exponential backoff and timeout wrappers

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for ShellKit tooling.
#[derive(Error, Debug)]
pub enum ShellKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config { message: String },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl ShellKitError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }
}

/// Result type alias for ShellKit operations.
pub type Result<T> = std::result::Result<T, ShellKitError>;

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ShellKitError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ShellKitError::config("unknown log format 'xml'").to_string(),
            "Config error: unknown log format 'xml'"
        );
        assert!(ShellKitError::Timeout(Duration::from_secs(1))
            .to_string()
            .contains("1s"));
    }

    #[test]
    fn test_internal_captures_backtrace() {
        match ShellKitError::internal("subscriber already set") {
            ShellKitError::Internal { message, backtrace } => {
                assert_eq!(message, "subscriber already set");
                assert!(backtrace.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("test"),
            Err(ShellKitError::NotFound(_))
        ));
    }
}
