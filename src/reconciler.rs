//! Periodic reconciliation against the orchestrator.
//!
//! Webhooks can be lost or arrive out of order. Every cycle the
//! [`Reconciler`] fetches authoritative counts, overwrites the store with
//! them, and runs a full admission pass so capacity freed by a missed
//! "finished" event is used anyway.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionScheduler, DispatchReport};
use crate::config::Catalog;
use crate::gateway::{GatewayError, RemoteGateway};
use crate::job::JobLedger;
use crate::links::LinkBook;
use crate::store::{ProcessCounts, QueueCounts, QueueId, Snapshot, StateStore};

/// Counts applied by one reconciliation cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub processes: Vec<(String, ProcessCounts)>,
    pub queues: Vec<(QueueId, QueueCounts)>,
    pub pruned_jobs: usize,
    pub pruned_links: usize,
    #[serde(skip)]
    pub dispatch: DispatchReport,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(ReconcileSummary),
    /// Another cycle was still running.
    Skipped,
}

pub struct Reconciler<G> {
    store: Arc<StateStore>,
    gateway: Arc<G>,
    scheduler: Arc<AdmissionScheduler<G>>,
    catalog: Arc<Catalog>,
    ledger: Arc<JobLedger>,
    links: Arc<LinkBook>,
    interval: Duration,
    in_progress: AtomicBool,
}

/// Clears the in-progress flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<G: RemoteGateway> Reconciler<G> {
    pub fn new(
        store: Arc<StateStore>,
        gateway: Arc<G>,
        scheduler: Arc<AdmissionScheduler<G>>,
        catalog: Arc<Catalog>,
        ledger: Arc<JobLedger>,
        links: Arc<LinkBook>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            scheduler,
            catalog,
            ledger,
            links,
            interval,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Fetch and apply remote state without dispatching anything.
    pub async fn refresh(&self) -> Result<ReconcileSummary, GatewayError> {
        let observed_at = Utc::now();
        let processes = self.gateway.get_process_details().await?;
        let queues = self.gateway.get_queue_details().await?;

        let mut summary = ReconcileSummary::default();

        // Configured processes with no active jobs are absent from the
        // listing and must be reset.
        let mut names: Vec<String> = self
            .catalog
            .processes()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        names.extend(
            processes
                .processes
                .keys()
                .filter(|name| self.catalog.process(name).is_none())
                .cloned(),
        );

        for name in names {
            let counts = processes
                .processes
                .get(&name)
                .map(|a| ProcessCounts {
                    running: a.running,
                    pending: a.pending,
                })
                .unwrap_or_default();
            self.store
                .replace_snapshot(Snapshot::Process(name.clone(), counts))
                .await;
            summary.processes.push((name, counts));
        }

        let mut queue_ids: Vec<QueueId> = self.catalog.queues().iter().map(|q| q.id).collect();
        queue_ids.extend(
            queues
                .available
                .keys()
                .filter(|id| self.catalog.queue(**id).is_none()),
        );

        for queue_id in queue_ids {
            let active_consumers = self
                .catalog
                .queue(queue_id)
                .and_then(|q| processes.processes.get(&q.process))
                .map(|a| a.running + a.pending)
                .unwrap_or(0);
            let counts = QueueCounts {
                available_items: queues.available.get(&queue_id).copied().unwrap_or(0),
                active_consumers,
            };
            self.store
                .replace_snapshot(Snapshot::Queue(queue_id, counts))
                .await;
            summary.queues.push((queue_id, counts));
        }

        let remote_ids: HashSet<i64> = processes
            .processes
            .values()
            .flat_map(|a| a.job_ids.iter().copied())
            .collect();
        summary.pruned_jobs = self.ledger.retain_active(&remote_ids, observed_at).await;

        let drained: HashSet<QueueId> = queues.drained().collect();
        summary.pruned_links = self.links.prune(&drained, observed_at).await;

        tracing::debug!(
            processes = summary.processes.len(),
            queues = summary.queues.len(),
            pruned_jobs = summary.pruned_jobs,
            pruned_links = summary.pruned_links,
            "state refreshed from orchestrator"
        );
        Ok(summary)
    }

    /// One full cycle: refresh, then an admission pass. Skipped when another
    /// cycle is still in flight.
    pub async fn reconcile_once(&self) -> Result<CycleOutcome, GatewayError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("previous reconciliation still running, skipping");
            return Ok(CycleOutcome::Skipped);
        }
        let _guard = CycleGuard(&self.in_progress);

        let mut summary = self.refresh().await?;
        summary.dispatch = self.scheduler.evaluate_all().await;
        Ok(CycleOutcome::Completed(summary))
    }

    /// Run cycles every `interval` until `cancel` fires. The first tick is one
    /// interval out; the startup cycle is the caller's job.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::warn!(error = %e, "reconciliation cycle skipped");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessConfig, QueueConfig};
    use crate::gateway::mock::MockGateway;
    use crate::links::LinkedAction;
    use crate::store::{FieldRef, ProcessField, QueueField};

    struct Fixture {
        store: Arc<StateStore>,
        gateway: Arc<MockGateway>,
        ledger: Arc<JobLedger>,
        links: Arc<LinkBook>,
        reconciler: Arc<Reconciler<MockGateway>>,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(Catalog::new(
            vec![
                ProcessConfig {
                    name: "P".into(),
                    env_name: "Prod".into(),
                    max_concurrent: Some(5),
                    input_arguments: None,
                },
                ProcessConfig {
                    name: "Idle".into(),
                    env_name: "Prod".into(),
                    max_concurrent: Some(1),
                    input_arguments: None,
                },
            ],
            vec![QueueConfig {
                id: 42,
                process: "P".into(),
                max_consumers: None,
                follow_up_queue: None,
            }],
        ));
        let store = Arc::new(StateStore::new(catalog.limits(1)));
        let gateway = Arc::new(MockGateway::new());
        let ledger = Arc::new(JobLedger::new());
        let links = Arc::new(LinkBook::new());
        let scheduler = Arc::new(AdmissionScheduler::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&catalog),
            Arc::clone(&ledger),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            scheduler,
            catalog,
            Arc::clone(&ledger),
            Arc::clone(&links),
            Duration::from_millis(20),
        ));
        Fixture {
            store,
            gateway,
            ledger,
            links,
            reconciler,
        }
    }

    #[tokio::test]
    async fn snapshot_corrects_drift_and_starts_missed_work() {
        let f = fixture();
        // Local view thinks P is full; a finished webhook was lost.
        f.store
            .apply_delta(FieldRef::Process("P", ProcessField::Running), 5)
            .await;
        f.gateway.set_process("P", 3, 0, vec![1, 2, 3]);
        f.gateway.set_queue(42, 10);

        let outcome = f.reconciler.reconcile_once().await.unwrap();
        let CycleOutcome::Completed(summary) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(summary.dispatch.accepted, 2);

        let starts = f.gateway.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].count, 2);
        let p = f.store.process_counter("P").await;
        assert_eq!((p.running, p.pending), (3, 2));
    }

    #[tokio::test]
    async fn absent_processes_are_reset_to_zero() {
        let f = fixture();
        f.store
            .apply_delta(FieldRef::Process("Idle", ProcessField::Running), 1)
            .await;

        let summary = f.reconciler.refresh().await.unwrap();
        assert!(
            summary
                .processes
                .iter()
                .any(|(n, c)| n == "Idle" && *c == ProcessCounts::default())
        );
        assert_eq!(f.store.process_counter("Idle").await.running, 0);
    }

    #[tokio::test]
    async fn queue_consumers_follow_the_consumer_process() {
        let f = fixture();
        f.store
            .apply_delta(FieldRef::Queue(42, QueueField::ActiveConsumers), 4)
            .await;
        f.gateway.set_process("P", 1, 1, vec![1, 2]);
        f.gateway.set_queue(42, 6);
        f.gateway.set_queue(99, 3);

        f.reconciler.refresh().await.unwrap();
        let queue = f.store.queue_counter(42).await;
        assert_eq!((queue.available_items, queue.active_consumers), (6, 2));
        // Unconfigured queues are tracked but have no consumer.
        assert_eq!(f.store.queue_counter(99).await.available_items, 3);
    }

    #[tokio::test]
    async fn unavailable_remote_leaves_state_untouched() {
        let f = fixture();
        f.store
            .apply_delta(FieldRef::Process("P", ProcessField::Running), 4)
            .await;
        f.gateway.set_unavailable(true);

        assert!(f.reconciler.reconcile_once().await.is_err());
        assert_eq!(f.store.process_counter("P").await.running, 4);
        assert!(f.gateway.starts().is_empty());

        // The flag is cleared, so the next cycle runs.
        f.gateway.set_unavailable(false);
        assert!(matches!(
            f.reconciler.reconcile_once().await.unwrap(),
            CycleOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let f = fixture();
        f.reconciler.in_progress.store(true, Ordering::Release);
        assert!(matches!(
            f.reconciler.reconcile_once().await.unwrap(),
            CycleOutcome::Skipped
        ));
    }

    #[tokio::test]
    async fn stale_ledger_entries_are_pruned() {
        let f = fixture();
        f.ledger.record_accepted("P", [1, 2]).await;
        f.gateway.set_process("P", 1, 0, vec![2]);
        // Let the records age past the listing time.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let summary = f.reconciler.refresh().await.unwrap();
        assert_eq!(summary.pruned_jobs, 1);
        assert!(f.ledger.get(1).await.is_none());
    }

    #[tokio::test]
    async fn links_of_a_drained_queue_are_pruned() {
        let f = fixture();
        for item_id in 0..1000 {
            f.links
                .link(42, item_id, LinkedAction::StartQueue { queue_id: 43 })
                .await;
        }
        f.gateway.set_queue(42, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let summary = f.reconciler.refresh().await.unwrap();
        assert_eq!(summary.pruned_links, 1000);
        assert_eq!(f.links.len().await, 0);
    }

    #[tokio::test]
    async fn links_survive_while_items_are_in_progress() {
        let f = fixture();
        f.links
            .link(42, 1, LinkedAction::StartQueue { queue_id: 43 })
            .await;
        f.gateway.set_queue(42, 0);
        f.gateway.set_queue_in_progress(42, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let summary = f.reconciler.refresh().await.unwrap();
        assert_eq!(summary.pruned_links, 0);
        assert_eq!(f.links.len().await, 1);
    }

    #[tokio::test]
    async fn run_loop_reconciles_on_interval_until_cancelled() {
        let f = fixture();
        f.gateway.set_queue(42, 1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&f.reconciler).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        // The mock never reports the started job, so each cycle would retry;
        // admission still keeps it to the one item available.
        assert!(f.gateway.started_jobs() >= 1);
        assert_eq!(f.store.queue_counter(42).await.available_items, 1);
    }
}
