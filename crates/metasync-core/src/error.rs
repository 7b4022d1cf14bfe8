//! Error types for the metasync system
//!
//! Every failure the engine can observe maps onto one variant here. Errors
//! are item-scoped: the engine records them on the failing source or target
//! status and never lets one terminate the process.

use thiserror::Error;

/// Result type alias for metasync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the metasync system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A CIDR string did not parse as a network prefix
    #[error("invalid CIDR '{cidr}': {reason}")]
    InvalidRange {
        /// The rejected input
        cidr: String,
        /// Parser message
        reason: String,
    },

    /// A referenced configuration record could not be resolved
    #[error("configuration resolution failed: {0}")]
    ConfigResolution(String),

    /// A credential could not be read from the secret store
    #[error("secret read failed: {0}")]
    SecretRead(String),

    /// A source or target rejected its configuration
    #[error("initialization failed: {0}")]
    Init(String),

    /// A source could not produce ranges
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A target's currently-applied state could not be read
    #[error("read failed: {0}")]
    Read(String),

    /// A target write failed
    #[error("apply failed: {0}")]
    Apply(String),

    /// The cycle was cancelled while an external call was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// The cycle deadline elapsed while an external call was in flight
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Local I/O errors (file store, secret directory)
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid range error
    pub fn invalid_range(cidr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            cidr: cidr.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration resolution error
    pub fn config_resolution(msg: impl Into<String>) -> Self {
        Self::ConfigResolution(msg.into())
    }

    /// Create a secret read error
    pub fn secret_read(msg: impl Into<String>) -> Self {
        Self::SecretRead(msg.into())
    }

    /// Create an initialization error
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    /// Create a fetch error
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create a read error
    pub fn read(msg: impl Into<String>) -> Self {
        Self::Read(msg.into())
    }

    /// Create an apply error
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Machine-readable reason, used for ready-condition reasons
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidRange { .. } => "InvalidRange",
            Error::ConfigResolution(_) => "ConfigResolutionFailed",
            Error::SecretRead(_) => "SecretReadFailed",
            Error::Init(_) => "InitFailed",
            Error::Fetch(_) => "FetchFailed",
            Error::Read(_) => "ReadFailed",
            Error::Apply(_) => "ApplyFailed",
            Error::Cancelled => "Cancelled",
            Error::DeadlineExceeded => "DeadlineExceeded",
            Error::NotFound(_) => "NotFound",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Http(_) => "HttpError",
            Error::Other(_) => "Error",
        }
    }

    /// Whether the error came from cancellation rather than the external system
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_stable() {
        assert_eq!(Error::fetch("x").reason(), "FetchFailed");
        assert_eq!(Error::apply("x").reason(), "ApplyFailed");
        assert_eq!(Error::invalid_range("bad", "nope").reason(), "InvalidRange");
        assert!(Error::DeadlineExceeded.is_cancellation());
        assert!(!Error::read("x").is_cancellation());
    }

    #[test]
    fn invalid_range_message_names_input() {
        let err = Error::invalid_range("10.0.0.0/33", "invalid IP address syntax");
        assert!(err.to_string().contains("10.0.0.0/33"));
    }
}
