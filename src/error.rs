use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum JobgateError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown process: {0}")]
    UnknownProcess(String),

    #[error("Orchestrator error: {0}")]
    Gateway(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_converts() {
        let err: JobgateError = GatewayError::Api {
            status: 500,
            message: "boom".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Orchestrator error: API error (status 500): boom"
        );
    }

    #[test]
    fn config_error_display() {
        let err = JobgateError::Config("bad".into());
        assert_eq!(err.to_string(), "Config error: bad");
    }
}
