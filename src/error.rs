//! Error types for the pages gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, PagesError>;

/// Error kinds that can occur while resolving and serving a page request
#[derive(Error, Debug)]
pub enum PagesError {
    /// The host did not resolve, or a repository / branch / file is missing.
    /// This is a first-class error kind: the filter chain bottoms out with it
    /// and the server reports it as 404.
    #[error("not found")]
    NotFound,

    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed `.pages.yaml`, unknown filter type, invalid glob or invalid
    /// hostname alias. Surfaced as HTTP 500 with the message intact.
    #[error("{0}")]
    Validation(String),

    /// Upstream I/O failure or 5xx from the git host. Never cached.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("cache error: {0}")]
    Cache(String),

    /// Filter-internal failure, including recovered panics.
    #[error("filter error: {0}")]
    Filter(String),

    /// The request context ended before the operation completed.
    #[error("request cancelled")]
    Cancelled,

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PagesError {
    /// Whether this error is the NotFound kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PagesError::NotFound)
    }

    /// Convert the error into the HTTP status code reported to the client
    /// when the filter chain did not produce a response of its own.
    pub fn to_http_status(&self) -> u16 {
        match self {
            PagesError::NotFound => 404,

            // Validation errors are a property of the site, not the client,
            // and are reported as server errors with the message intact.
            PagesError::Validation(_) => 500,
            PagesError::Config(_) => 500,

            PagesError::Backend(_) => 500,
            PagesError::Cache(_) => 500,
            PagesError::Filter(_) => 500,
            PagesError::Io(_) => 500,

            // Client went away; nginx-style non-standard code, only logged.
            PagesError::Cancelled => 499,
            PagesError::Timeout(_) => 504,
        }
    }

    /// Create a Validation error from anything displayable.
    pub fn validation(msg: impl Into<String>) -> Self {
        PagesError::Validation(msg.into())
    }

    /// Create a Backend error from anything displayable.
    pub fn backend(msg: impl std::fmt::Display) -> Self {
        PagesError::Backend(msg.to_string())
    }
}

impl From<reqwest::Error> for PagesError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PagesError::Timeout(err.to_string())
        } else {
            PagesError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PagesError {
    fn from(err: serde_json::Error) -> Self {
        PagesError::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_status() {
        assert_eq!(PagesError::NotFound.to_http_status(), 404);
        assert!(PagesError::NotFound.is_not_found());
    }

    #[test]
    fn test_validation_status() {
        let err = PagesError::validation("parse .pages.yaml failed");
        assert_eq!(err.to_http_status(), 500);
        assert_eq!(err.to_string(), "parse .pages.yaml failed");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_cancellation_status() {
        assert_eq!(PagesError::Cancelled.to_http_status(), 499);
        assert_eq!(PagesError::Timeout("script".into()).to_http_status(), 504);
    }
}
