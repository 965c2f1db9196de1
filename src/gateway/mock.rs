//! In-memory [`RemoteGateway`] for engine tests.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::types::{ProcessActivity, ProcessDetails, QueueDetails, StartedJob};
use super::{GatewayError, RemoteGateway};

#[derive(Debug, Clone, PartialEq)]
pub struct StartCall {
    pub process: String,
    pub env: String,
    pub count: u32,
    pub args: Option<serde_json::Value>,
}

#[derive(Default)]
struct MockState {
    processes: ProcessDetails,
    queues: QueueDetails,
    unavailable: bool,
    rejections: u32,
    accept_at_most: Option<u32>,
    starts: Vec<StartCall>,
    next_id: i64,
    gate: Option<Arc<Notify>>,
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_process(&self, name: &str, running: u32, pending: u32, job_ids: Vec<i64>) {
        self.state.lock().unwrap().processes.processes.insert(
            name.to_string(),
            ProcessActivity {
                running,
                pending,
                job_ids,
            },
        );
    }

    pub fn set_queue_in_progress(&self, queue_id: i64, in_progress: u32) {
        self.state
            .lock()
            .unwrap()
            .queues
            .in_progress
            .insert(queue_id, in_progress);
    }

    /// Park start requests until the returned handle is notified, once per
    /// request.
    pub fn hold_starts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn set_queue(&self, queue_id: i64, available: u32) {
        self.state
            .lock()
            .unwrap()
            .queues
            .available
            .insert(queue_id, available);
    }

    /// Make the detail endpoints fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Reject the next `n` start requests with a 409.
    pub fn reject_next(&self, n: u32) {
        self.state.lock().unwrap().rejections = n;
    }

    pub fn accept_at_most(&self, n: u32) {
        self.state.lock().unwrap().accept_at_most = Some(n);
    }

    pub fn starts(&self) -> Vec<StartCall> {
        self.state.lock().unwrap().starts.clone()
    }

    pub fn started_jobs(&self) -> u32 {
        self.starts().iter().map(|s| s.count).sum()
    }
}

impl RemoteGateway for MockGateway {
    async fn get_process_details(&self) -> Result<ProcessDetails, GatewayError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(GatewayError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(state.processes.clone())
    }

    async fn get_queue_details(&self) -> Result<QueueDetails, GatewayError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(GatewayError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(state.queues.clone())
    }

    async fn start_job(
        &self,
        process: &str,
        env: &str,
        count: u32,
        args: Option<&serde_json::Value>,
    ) -> Result<Vec<StartedJob>, GatewayError> {
        let gate = self.state.lock().unwrap().gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.state.lock().unwrap();
        state.starts.push(StartCall {
            process: process.to_string(),
            env: env.to_string(),
            count,
            args: args.cloned(),
        });
        if state.rejections > 0 {
            state.rejections -= 1;
            return Err(GatewayError::Rejected {
                status: 409,
                message: "limit reached".into(),
            });
        }
        let accepted = state.accept_at_most.map_or(count, |n| n.min(count));
        let mut jobs = Vec::new();
        for _ in 0..accepted {
            state.next_id += 1;
            jobs.push(StartedJob {
                id: state.next_id,
                release_name: process.to_string(),
            });
        }
        Ok(jobs)
    }
}
