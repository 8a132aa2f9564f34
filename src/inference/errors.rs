//! Errors raised by the model endpoint client and by configuration loading.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    /// The endpoint refused or dropped the connection.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// A streamed event could not be read or decoded.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// `parley.yaml` is missing, unreadable, or inconsistent.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Connection or timeout failures: no model output can be expected.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. } | InferenceError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        let refused = InferenceError::ConnectionFailed {
            endpoint: "http://localhost:8080/v1".into(),
            reason: "connection refused".into(),
        };
        assert!(refused.is_unreachable());
        assert!(InferenceError::Timeout { duration_secs: 60 }.is_unreachable());

        let server_side = InferenceError::HttpError {
            status: 503,
            body: "loading model".into(),
        };
        assert!(!server_side.is_unreachable());
    }

    #[test]
    fn test_config_error_message() {
        let err = InferenceError::ConfigError {
            reason: "persona 'default' is required".into(),
        };
        assert_eq!(err.to_string(), "config error: persona 'default' is required");
    }
}
