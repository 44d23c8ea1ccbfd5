//! Error types for the Turnstile rate limiter.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors (bad limits, windows, keys or tables)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name that is not present in the policy table
    #[error("Configuration error: unknown rate limit policy '{0}'")]
    UnknownPolicy(String),

    /// The caller is over quota; carries what a 429 response needs
    #[error("rate limit exceeded for {scope}")]
    RateLimited {
        scope: String,
        retry_after_ms: u64,
        remaining: u64,
    },

    /// Layered settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error stems from misconfiguration rather than traffic.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TurnstileError::Config(_) | TurnstileError::UnknownPolicy(_) | TurnstileError::Settings(_)
        )
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
