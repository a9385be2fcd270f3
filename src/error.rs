//! Error types for Shelfpost
//!
//! Every stage of the outbox pipeline reports failures as `AppError`.
//! Render, build and sign failures abort the whole publish; network
//! failures stay scoped to a single recipient.

use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Unknown activity type, unusable signing key, or invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Content object is missing a field its variant requires
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection failure or timeout while delivering to one inbox
    #[error("Network error: {0}")]
    Network(String),

    /// Remote inbox answered with a non-success status
    #[error("Inbox {inbox} rejected activity: HTTP {status}")]
    Rejected { inbox: String, status: u16 },

    /// Envelope signature did not verify
    #[error("Invalid signature")]
    InvalidSignature,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether this error aborts a publish before anything is dispatched.
    pub fn is_fatal_to_publish(&self) -> bool {
        matches!(
            self,
            AppError::Configuration(_)
                | AppError::Serialization(_)
                | AppError::InvalidSignature
                | AppError::Internal(_)
        )
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "configuration",
            AppError::Serialization(_) => "serialization",
            AppError::Network(_) => "network",
            AppError::Rejected { .. } => "rejected",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Internal(_) => "internal",
        }
    }

    /// HTTP status code if the remote answered at all
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_are_fatal_and_delivery_errors_are_not() {
        assert!(AppError::Configuration("no key".into()).is_fatal_to_publish());
        assert!(AppError::Serialization("no title".into()).is_fatal_to_publish());
        assert!(!AppError::Network("timeout".into()).is_fatal_to_publish());
        assert!(
            !AppError::Rejected {
                inbox: "https://a.example/inbox".into(),
                status: 500,
            }
            .is_fatal_to_publish()
        );
    }

    #[test]
    fn rejected_exposes_status_code() {
        let error = AppError::Rejected {
            inbox: "https://a.example/inbox".into(),
            status: 410,
        };
        assert_eq!(error.status_code(), Some(410));
        assert_eq!(error.kind(), "rejected");
        assert!(error.to_string().contains("HTTP 410"));
    }
}
