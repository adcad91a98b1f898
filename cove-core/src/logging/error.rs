//! Logging setup failures

use thiserror::Error;

/// Why the tracing subscriber could not be wired up
#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    /// Subscriber installation failed, typically because a global
    /// subscriber is already set for this process
    #[error("could not install tracing subscriber: {0}")]
    InitializationFailed(String),

    /// The requested settings do not describe a usable subscriber
    #[error("unusable logging settings: {0}")]
    InvalidConfiguration(String),
}
