//! Error type for calls to the orchestrator API.

use thiserror::Error;

/// Failures returned by a [`RemoteGateway`](super::RemoteGateway).
///
/// - [`Rejected`](GatewayError::Rejected): the remote refused a start request,
///   typically because its own limit was already reached.
/// - [`Api`](GatewayError::Api): any other non-2xx response.
/// - [`Network`](GatewayError::Network): DNS, connection or timeout failure.
/// - [`Decode`](GatewayError::Decode): the response body was not what we expected.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("start request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// The remote is reachable but refused to admit more jobs.
    pub fn is_over_admission(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display() {
        let err = GatewayError::Rejected {
            status: 409,
            message: "limit reached".into(),
        };
        assert_eq!(
            err.to_string(),
            "start request rejected (status 409): limit reached"
        );
        assert!(err.is_over_admission());
    }

    #[test]
    fn api_error_is_not_over_admission() {
        let err = GatewayError::Api {
            status: 503,
            message: "down".into(),
        };
        assert!(!err.is_over_admission());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayError>();
    }
}
