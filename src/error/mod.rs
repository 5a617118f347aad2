use thiserror::Error;

/// Errors surfaced to callers of the gateway client.
///
/// Deliberately narrow: transport failures, 5xx storms and credential
/// rejections are resolved inside the retry driver and come back to the
/// caller as a [`crate::api::GatewayResponse`] (a `-1` code marks an
/// attempt that never received a response). Only connection-establishment
/// exhaustion, configuration problems and caller misuse propagate as `Err`.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// All connection-establishment attempts exhausted
    #[error("Connection Error: {0}")]
    Connection(String),

    /// Configuration errors
    #[error("Config Error: {0}")]
    Config(String),

    /// Invalid arguments from the caller (bad target specifier etc.)
    #[error("Usage Error: {0}")]
    Usage(String),
}

impl GatewayError {
    /// Whether a fresh attempt against the same host could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Connection("handshake failed".to_string());
        assert_eq!(err.to_string(), "Connection Error: handshake failed");
        assert!(err.is_retriable());

        let err = GatewayError::Usage("target list is empty".to_string());
        assert!(!err.is_retriable());
    }
}
