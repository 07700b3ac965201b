//! Error types for backend requests.

use thiserror::Error;

/// Error type for all backend request failures.
///
/// Transport problems and malformed payloads are kept distinguishable so
/// callers can log them differently; neither is retried at this layer.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure from reqwest (connect, timeout, TLS).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The backend answered with a non-success HTTP status.
    #[error("backend error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, as returned by the backend.
        message: String,
    },

    /// The response body did not match the expected payload shape.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Convenience Result alias for backend requests.
pub type RemoteResult<T> = Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display() {
        let err = RemoteError::Api {
            status: 503,
            message: "maintenance".to_string(),
        };
        assert_eq!(format!("{}", err), "backend error: 503 - maintenance");
    }

    #[test]
    fn decode_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{{{").unwrap_err();
        let err: RemoteError = serde_err.into();
        assert!(format!("{}", err).starts_with("malformed payload:"));
    }
}
