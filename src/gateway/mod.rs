pub mod client;
pub mod error;
#[cfg(test)]
pub mod mock;
pub mod types;

use std::future::Future;

pub use client::OrchestratorClient;
pub use error::GatewayError;
pub use types::{ProcessDetails, QueueDetails, StartedJob};

/// The remote orchestrator as seen by the engine.
///
/// Every call is a single fallible network round trip; callers must not hold
/// store locks while one is in flight.
pub trait RemoteGateway: Send + Sync + 'static {
    /// Running and pending job counts per process.
    fn get_process_details(
        &self,
    ) -> impl Future<Output = Result<ProcessDetails, GatewayError>> + Send;

    /// Items ready to be processed per queue.
    fn get_queue_details(&self) -> impl Future<Output = Result<QueueDetails, GatewayError>> + Send;

    /// Ask the remote to start `count` jobs of `process` in `env`.
    fn start_job(
        &self,
        process: &str,
        env: &str,
        count: u32,
        args: Option<&serde_json::Value>,
    ) -> impl Future<Output = Result<Vec<StartedJob>, GatewayError>> + Send;
}
