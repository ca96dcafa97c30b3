//! Error types for mailflow

use thiserror::Error;

/// Main error type for mailflow
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailflow
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Configuration and validation failures are terminal: retrying a send
    /// with no active SMTP config or a webhook with no secret produces the
    /// same failure every time. Transport-level failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Config(_) => false,
            Error::Validation(_) => false,
            Error::NotFound(_) => false,
            Error::Crypto(_) => false,
            Error::RateLimited => true,
            Error::Database(_) => true,
            Error::Smtp(_) => true,
            Error::Webhook(_) => true,
            Error::Queue(_) => true,
            Error::Internal(_) => true,
            Error::Other(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(!Error::Config("no active smtp config".into()).is_transient());
        assert!(!Error::Validation("at least 2 variants required".into()).is_transient());
        assert!(Error::Smtp("451 try again later".into()).is_transient());
        assert!(Error::RateLimited.is_transient());
    }
}
