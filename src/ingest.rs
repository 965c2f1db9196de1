//! Webhook notifications turned into store mutations.
//!
//! The transport layer sends one [`Command`] per notification over an mpsc
//! channel; [`EventIngestor::run`] consumes them. Counter updates happen in
//! the ingest task itself, anything that calls the remote is spawned so a
//! slow orchestrator never stalls ingestion.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionScheduler, DispatchReport};
use crate::config::Catalog;
use crate::error::JobgateError;
use crate::gateway::RemoteGateway;
use crate::job::{JobLedger, JobState, Transition};
use crate::links::{LinkBook, LinkedAction};
use crate::store::{FieldRef, ProcessField, QueueField, QueueId, StateStore};

/// One inbound notification, already authenticated by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    JobCreated {
        job_id: i64,
        process: String,
    },
    JobFinished {
        job_id: i64,
        process: String,
    },
    QueueItemsCreated {
        queue_id: QueueId,
        item_ids: Vec<i64>,
    },
    QueueItemCompleted {
        item_id: i64,
    },
    RequestRuns {
        process: String,
        count: u32,
    },
    StartJob {
        process: String,
        env: String,
        count: u32,
        args: Option<serde_json::Value>,
    },
}

impl Command {
    /// Commands that only touch local counters.
    fn is_local(&self) -> bool {
        matches!(self, Command::JobCreated { .. } | Command::JobFinished { .. })
    }
}

pub struct EventIngestor<G> {
    store: Arc<StateStore>,
    scheduler: Arc<AdmissionScheduler<G>>,
    catalog: Arc<Catalog>,
    ledger: Arc<JobLedger>,
    links: Arc<LinkBook>,
}

impl<G: RemoteGateway> EventIngestor<G> {
    pub fn new(
        store: Arc<StateStore>,
        scheduler: Arc<AdmissionScheduler<G>>,
        catalog: Arc<Catalog>,
        ledger: Arc<JobLedger>,
        links: Arc<LinkBook>,
    ) -> Self {
        Self {
            store,
            scheduler,
            catalog,
            ledger,
            links,
        }
    }

    pub async fn on_job_created(&self, job_id: i64, process: &str) {
        if self.ledger.observe_created(job_id, process).await == Transition::Duplicate {
            tracing::debug!(job_id, process, "duplicate job created event ignored");
            return;
        }
        let outcome = self
            .store
            .apply_delta(FieldRef::Process(process, ProcessField::Pending), -1)
            .await;
        if outcome.drift.is_some() {
            // Our own start request may still be in flight.
            self.ledger.mark_uncounted(job_id).await;
        }
        self.store
            .apply_delta(FieldRef::Process(process, ProcessField::Running), 1)
            .await;
        tracing::debug!(job_id, process, "job running");
    }

    pub async fn on_job_finished(&self, job_id: i64, process: &str) {
        let field = match self.ledger.observe_finished(job_id).await {
            Transition::Duplicate => {
                tracing::debug!(job_id, process, "duplicate job finished event ignored");
                return;
            }
            Transition::Finished {
                from: JobState::Pending,
            } => ProcessField::Pending,
            _ => ProcessField::Running,
        };
        self.store
            .apply_delta(FieldRef::Process(process, field), -1)
            .await;

        if let Some(queue) = self.catalog.queue_for_process(process) {
            self.store
                .apply_delta(FieldRef::Queue(queue.id, QueueField::ActiveConsumers), -1)
                .await;
        }
        tracing::debug!(job_id, process, "job finished");
    }

    /// New items landed in a queue. One notification asks for at most one new
    /// consumer, however many items it carries.
    pub async fn on_queue_items_created(&self, queue_id: QueueId, count: u32) -> DispatchReport {
        self.store
            .apply_delta(
                FieldRef::Queue(queue_id, QueueField::AvailableItems),
                i64::from(count),
            )
            .await;
        tracing::debug!(queue_id, count, "queue items created");
        self.scheduler.evaluate_queue(queue_id, 1).await
    }

    /// Register `action` to fire when `item_id` of `queue_id` completes.
    pub async fn link_queue_item(&self, queue_id: QueueId, item_id: i64, action: LinkedAction) {
        self.links.link(queue_id, item_id, action).await;
    }

    /// Fire and remove every link registered for a completed item.
    pub async fn on_queue_item_completed(&self, item_id: i64) -> DispatchReport {
        let mut report = DispatchReport::default();
        for action in self.links.take(item_id).await {
            tracing::info!(item_id, ?action, "queue item link triggered");
            match action {
                LinkedAction::StartQueue { queue_id } => {
                    report += self.scheduler.evaluate_queue(queue_id, 1).await;
                }
                LinkedAction::StartProcess { process, env, args } => {
                    report.requests += 1;
                    if let Ok(started) = self
                        .scheduler
                        .start_job(&process, &env, 1, args.as_ref())
                        .await
                    {
                        report.accepted += started.len() as u32;
                    }
                }
            }
        }
        report
    }

    /// Queue `count` runs of a configured process for admission.
    pub async fn request_runs(
        &self,
        process: &str,
        count: u32,
    ) -> Result<DispatchReport, JobgateError> {
        if self.catalog.process(process).is_none() {
            return Err(JobgateError::UnknownProcess(process.to_string()));
        }
        self.store
            .apply_delta(
                FieldRef::Process(process, ProcessField::Backlog),
                i64::from(count),
            )
            .await;
        Ok(self.scheduler.evaluate_process(process).await)
    }

    async fn execute(&self, command: Command) {
        match command {
            Command::JobCreated { job_id, process } => self.on_job_created(job_id, &process).await,
            Command::JobFinished { job_id, process } => {
                self.on_job_finished(job_id, &process).await
            }
            Command::QueueItemsCreated { queue_id, item_ids } => {
                let follow_up = self.catalog.queue(queue_id).and_then(|q| q.follow_up_queue);
                if let Some(follow_up) = follow_up {
                    for &item_id in &item_ids {
                        let action = LinkedAction::StartQueue {
                            queue_id: follow_up,
                        };
                        self.link_queue_item(queue_id, item_id, action).await;
                    }
                }
                let count = u32::try_from(item_ids.len()).unwrap_or(u32::MAX);
                self.on_queue_items_created(queue_id, count).await;
            }
            Command::QueueItemCompleted { item_id } => {
                self.on_queue_item_completed(item_id).await;
            }
            Command::RequestRuns { process, count } => {
                if let Err(e) = self.request_runs(&process, count).await {
                    tracing::warn!(error = %e, "run request ignored");
                }
            }
            Command::StartJob {
                process,
                env,
                count,
                args,
            } => {
                // Failures are logged by the scheduler.
                let _ = self
                    .scheduler
                    .start_job(&process, &env, count, args.as_ref())
                    .await;
            }
        }
    }

    /// Handle one command: local updates inline, remote work on its own task.
    pub async fn handle(self: &Arc<Self>, command: Command) {
        if command.is_local() {
            self.execute(command).await;
        } else {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.execute(command).await });
        }
    }

    /// Consume commands until the channel closes or `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Event ingestor shutting down");
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        tracing::info!("Command channel closed, event ingestor stopping");
                        break;
                    }
                }
            }
        }
    }
}
