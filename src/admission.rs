//! Admission control: how many jobs may start, and starting them.
//!
//! Every decision reserves slots in the [`StateStore`] first (an atomic
//! check-and-increment per target), then calls the gateway with no lock
//! held. A rejected or short-filled request hands the unused slots back.

use std::ops::AddAssign;
use std::sync::Arc;

use crate::config::Catalog;
use crate::error::JobgateError;
use crate::gateway::{GatewayError, RemoteGateway, StartedJob};
use crate::job::JobLedger;
use crate::store::{DemandSource, FieldRef, ProcessField, QueueId, Reservation, StateStore};

/// What an evaluation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Start requests sent to the remote.
    pub requests: u32,
    /// Jobs the remote accepted.
    pub accepted: u32,
    /// Reserved slots handed back after a rejection or short fill.
    pub rolled_back: u32,
}

impl AddAssign for DispatchReport {
    fn add_assign(&mut self, other: Self) {
        self.requests += other.requests;
        self.accepted += other.accepted;
        self.rolled_back += other.rolled_back;
    }
}

pub struct AdmissionScheduler<G> {
    store: Arc<StateStore>,
    gateway: Arc<G>,
    catalog: Arc<Catalog>,
    ledger: Arc<JobLedger>,
}

impl<G: RemoteGateway> AdmissionScheduler<G> {
    pub fn new(
        store: Arc<StateStore>,
        gateway: Arc<G>,
        catalog: Arc<Catalog>,
        ledger: Arc<JobLedger>,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            ledger,
        }
    }

    /// Evaluate every known queue, then every process backlog, in
    /// registration order.
    pub async fn evaluate_all(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        for queue_id in self.store.queue_ids().await {
            report += self.evaluate_queue(queue_id, u32::MAX).await;
        }
        for process in self.store.process_ids().await {
            report += self.evaluate_process(&process).await;
        }
        if report.requests > 0 {
            tracing::info!(
                requests = report.requests,
                accepted = report.accepted,
                rolled_back = report.rolled_back,
                "admission pass complete"
            );
        }
        report
    }

    /// Start up to `requested` consumers for one queue.
    pub async fn evaluate_queue(&self, queue_id: QueueId, requested: u32) -> DispatchReport {
        match self.store.reserve_queue(queue_id, requested).await {
            Some(reservation) => self.dispatch(reservation).await,
            None => {
                tracing::debug!(queue_id, "no capacity or demand for queue");
                DispatchReport::default()
            }
        }
    }

    /// Start jobs for a process' backlog.
    pub async fn evaluate_process(&self, process: &str) -> DispatchReport {
        match self.store.reserve_process(process).await {
            Some(reservation) => self.dispatch(reservation).await,
            None => DispatchReport::default(),
        }
    }

    /// Start jobs unconditionally, bypassing admission control.
    ///
    /// `pending` is raised by `count` before the remote call, like any other
    /// dispatch, so a "created" event racing the response finds its slot.
    /// Slots the remote did not fill are handed back.
    pub async fn start_job(
        &self,
        process: &str,
        env: &str,
        count: u32,
        args: Option<&serde_json::Value>,
    ) -> Result<Vec<StartedJob>, JobgateError> {
        let pending = FieldRef::Process(process, ProcessField::Pending);
        self.store.apply_delta(pending, i64::from(count)).await;

        let started = match self.gateway.start_job(process, env, count, args).await {
            Ok(started) => started,
            Err(e) => {
                self.store.apply_delta(pending, -i64::from(count)).await;
                tracing::warn!(process, env, count, error = %e, "explicit start failed");
                return Err(e.into());
            }
        };

        let accepted = u32::try_from(started.len()).unwrap_or(u32::MAX).min(count);
        let settled = self.record_started(process, &started).await;
        let unused = count - accepted + settled;
        if unused > 0 {
            self.store.apply_delta(pending, -i64::from(unused)).await;
        }
        tracing::info!(process, env, count = accepted, "explicit start accepted");
        Ok(started)
    }

    async fn dispatch(&self, reservation: Reservation) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(config) = self.catalog.process(&reservation.process) else {
            tracing::warn!(
                process = %reservation.process,
                "no configuration for process, releasing reservation"
            );
            self.store.release(&reservation, reservation.count).await;
            report.rolled_back = reservation.count;
            return report;
        };

        report.requests = 1;
        let result = self
            .gateway
            .start_job(
                &reservation.process,
                &config.env_name,
                reservation.count,
                config.input_arguments.as_ref(),
            )
            .await;

        match result {
            Ok(started) => {
                let accepted = u32::try_from(started.len())
                    .unwrap_or(u32::MAX)
                    .min(reservation.count);
                self.settle_early_starts(&reservation.process, &started)
                    .await;
                let shortfall = reservation.count - accepted;
                if shortfall > 0 {
                    tracing::warn!(
                        process = %reservation.process,
                        requested = reservation.count,
                        accepted,
                        "remote accepted fewer jobs than requested"
                    );
                    self.store.release(&reservation, shortfall).await;
                }
                tracing::info!(
                    process = %reservation.process,
                    queue_id = queue_of(&reservation),
                    count = accepted,
                    "jobs started"
                );
                report.accepted = accepted;
                report.rolled_back = shortfall;
            }
            Err(e) => {
                self.store.release(&reservation, reservation.count).await;
                report.rolled_back = reservation.count;
                log_rejection(&reservation, &e);
            }
        }
        report
    }

    /// Record accepted jobs; returns how many were already seen running.
    async fn record_started(&self, process: &str, started: &[StartedJob]) -> u32 {
        self.ledger
            .record_accepted(process, started.iter().map(|j| j.id))
            .await
    }

    /// Record accepted jobs and drop the pending slots of those whose
    /// "created" event beat the response.
    async fn settle_early_starts(&self, process: &str, started: &[StartedJob]) {
        let settled = self.record_started(process, started).await;
        if settled > 0 {
            self.store
                .apply_delta(
                    FieldRef::Process(process, ProcessField::Pending),
                    -i64::from(settled),
                )
                .await;
        }
    }
}

fn queue_of(reservation: &Reservation) -> Option<QueueId> {
    match reservation.source {
        DemandSource::Queue(id) => Some(id),
        DemandSource::Backlog => None,
    }
}

fn log_rejection(reservation: &Reservation, error: &GatewayError) {
    if error.is_over_admission() {
        tracing::warn!(
            process = %reservation.process,
            count = reservation.count,
            error = %error,
            "start rejected by remote, reservation rolled back"
        );
    } else {
        tracing::warn!(
            process = %reservation.process,
            count = reservation.count,
            error = %error,
            "remote unavailable, reservation rolled back"
        );
    }
}
