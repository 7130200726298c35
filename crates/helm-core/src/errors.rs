use std::time::Duration;

/// An upstream failure reported by a model provider: the HTTP status (0 when
/// the failure did not come with one) and the provider's message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("provider error {status_code}: {message}")]
pub struct ProviderError {
    pub message: String,
    pub status_code: u16,
}

impl ProviderError {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }
}

/// The provider layer gave up after its retry budget while the underlying
/// cause was still retryable. Always classified as retryable.
#[derive(Clone, Debug, thiserror::Error)]
#[error("retry budget exhausted after {} attempt(s)", .attempts.len())]
pub struct RetryError {
    pub attempts: Vec<ProviderError>,
}

impl RetryError {
    pub fn new(attempts: Vec<ProviderError>) -> Self {
        Self { attempts }
    }

    pub fn last(&self) -> Option<&ProviderError> {
        self.attempts.last()
    }
}

/// Errors surfaced by model providers and the transport underneath them.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    RetriesExhausted(#[from] RetryError),

    #[error("network error: {0}")]
    Network(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("circuit open: provider unavailable")]
    CircuitOpen,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("misconfigured provider: {0}")]
    Misconfigured(String),
}

impl GatewayError {
    /// Build a provider error from an HTTP status and response body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self::Provider(ProviderError::new(status, body))
    }

    /// The embedded provider error, if this variant carries one.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Provider(e) => Some(e),
            Self::RetriesExhausted(e) => e.last(),
            _ => None,
        }
    }

    /// Short classification string for logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider",
            Self::RetriesExhausted(_) => "retries_exhausted",
            Self::Network(_) => "network",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Misconfigured(_) => "misconfigured",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_keeps_code_and_body() {
        let err = GatewayError::from_status(429, "slow down");
        let pe = err.provider_error().unwrap();
        assert_eq!(pe.status_code, 429);
        assert_eq!(pe.message, "slow down");
        assert_eq!(err.error_kind(), "provider");
    }

    #[test]
    fn retry_error_exposes_last_attempt() {
        let err = RetryError::new(vec![
            ProviderError::new(500, "first"),
            ProviderError::new(503, "second"),
        ]);
        assert_eq!(err.last().unwrap().message, "second");
        assert!(err.to_string().contains("2 attempt"));
    }

    #[test]
    fn transparent_display() {
        let err = GatewayError::from(ProviderError::new(400, "bad"));
        assert_eq!(err.to_string(), "provider error 400: bad");
    }
}
