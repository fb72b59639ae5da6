use serde::Serialize;

pub const CODE_NOT_CONNECTED: &str = "NOT_CONNECTED";
pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_VALIDATION: &str = "VALIDATION_ERROR";
pub const CODE_HTTP: &str = "HTTP_ERROR";
pub const CODE_TRANSPORT: &str = "TRANSPORT_ERROR";
pub const CODE_DECODE: &str = "DECODE_ERROR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Error surfaced to callers of user-initiated actions (send, mark read, history load).
///
/// Background synchronization never returns one of these; it logs and moves on.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ClientError {
    /// HTTP status of the collaborator response, when there was one.
    pub status: Option<u16>,
    pub code: String,
    pub message: String,
    pub details: Option<Vec<FieldError>>,
}

impl ClientError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    /// The live channel is not connected. Retryable once the connection is back.
    pub fn not_connected() -> Self {
        Self::new(CODE_NOT_CONNECTED, "Live connection is not established")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CODE_NOT_FOUND, message)
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            details: Some(details),
            ..Self::new(CODE_VALIDATION, "Validation failed")
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(CODE_HTTP, message)
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(CODE_TRANSPORT, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(CODE_DECODE, message)
    }

    pub fn is_not_connected(&self) -> bool {
        self.code == CODE_NOT_CONNECTED
    }

    /// Whether repeating the same action later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.code.as_str() {
            CODE_NOT_CONNECTED | CODE_TRANSPORT => true,
            CODE_HTTP => self.status.is_some_and(|s| s >= 500 || s == 429),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        tracing::warn!(?err, "collaborator request failed");
        if let Some(status) = err.status() {
            return Self::http(status.as_u16(), status.to_string());
        }
        if err.is_decode() {
            return Self::decode("Unexpected response body");
        }
        Self::transport("Request could not be completed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_is_retryable() {
        let err = ClientError::not_connected();
        assert!(err.is_not_connected());
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "NOT_CONNECTED: Live connection is not established");
    }

    #[test]
    fn http_retryability_follows_status() {
        assert!(ClientError::http(503, "unavailable").is_retryable());
        assert!(ClientError::http(429, "slow down").is_retryable());
        assert!(!ClientError::http(404, "missing").is_retryable());
        assert!(!ClientError::validation(vec![]).is_retryable());
    }
}
