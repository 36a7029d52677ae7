//! Error types for the revvault service.

use reqwest::StatusCode;
use thiserror::Error;

/// A specialized Result type for revvault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for revvault operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level HTTP failures (connect, timeout, body stream)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with an unexpected status
    #[error("Store returned {status} for {url}: {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },

    /// A versioned write lost a race against another writer
    #[error("Update conflict on {0}")]
    Conflict(String),

    /// The backup store could not be created
    #[error("Failed to create backup store '{store}': {reason}")]
    TargetCreation { store: String, reason: String },

    /// The bootstrap application could not be deployed
    #[error("Failed to deploy bootstrap app to '{store}': {reason}")]
    Bootstrap { store: String, reason: String },

    /// The change feed could not be read
    #[error("Failed to read changes for '{dataset}': {reason}")]
    ChangeFeed { dataset: String, reason: String },

    /// The dataset catalog could not be listed
    #[error("Failed to enumerate datasets: {0}")]
    Enumeration(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid data errors
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(msg: S) -> Self {
        Error::InvalidData(msg.into())
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Conflict(_) => true,
            Error::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> Error {
        Error::Status {
            status: StatusCode::from_u16(code).unwrap(),
            url: "http://localhost:5984/db".to_string(),
            body: String::new(),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(Error::Conflict("meta".into()).is_retryable());
        assert!(!Error::config("missing").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::TargetCreation {
            store: "alpha-backup".into(),
            reason: "forbidden".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to create backup store 'alpha-backup': forbidden"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let err: Error = config::ConfigError::NotFound("store.root_url".into()).into();
        assert!(matches!(err, Error::Config(_)));
    }
}
