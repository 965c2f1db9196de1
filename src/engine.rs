//! Wiring: one shared store, scheduler, ingestor and reconciler per gateway.

use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionScheduler;
use crate::config::{Catalog, JobgateConfig};
use crate::gateway::RemoteGateway;
use crate::ingest::EventIngestor;
use crate::job::JobLedger;
use crate::links::LinkBook;
use crate::reconciler::Reconciler;
use crate::store::StateStore;

/// Capacity of the webhook to ingestor channel.
pub const COMMAND_BUFFER: usize = 256;

pub struct Engine<G> {
    pub store: Arc<StateStore>,
    pub ingestor: Arc<EventIngestor<G>>,
    pub reconciler: Arc<Reconciler<G>>,
}

impl<G: RemoteGateway> Engine<G> {
    pub fn new(config: &JobgateConfig, gateway: G) -> Self {
        let catalog = Arc::new(Catalog::from_config(config));
        let store = Arc::new(StateStore::new(
            catalog.limits(config.default_max_concurrent),
        ));
        let gateway = Arc::new(gateway);
        let ledger = Arc::new(JobLedger::new());
        let links = Arc::new(LinkBook::with_max_age(Duration::from_secs(
            config.link_max_age_secs,
        )));

        let scheduler = Arc::new(AdmissionScheduler::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&catalog),
            Arc::clone(&ledger),
        ));
        let ingestor = Arc::new(EventIngestor::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&catalog),
            Arc::clone(&ledger),
            Arc::clone(&links),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            gateway,
            scheduler,
            catalog,
            ledger,
            links,
            Duration::from_secs(config.refresh_interval_secs),
        ));

        tracing::debug!(
            processes = config.processes.len(),
            queues = config.queues.len(),
            "engine assembled"
        );
        Self {
            store,
            ingestor,
            reconciler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessConfig, QueueConfig};
    use crate::gateway::mock::MockGateway;
    use crate::ingest::Command;
    use crate::reconciler::CycleOutcome;
    use crate::webhook::{self, SIGNATURE_HEADER, WebhookState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::Engine as _;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn config() -> JobgateConfig {
        JobgateConfig {
            secret_key: "k".into(),
            default_max_concurrent: 1,
            processes: vec![ProcessConfig {
                name: "Invoices".into(),
                env_name: "Prod".into(),
                max_concurrent: Some(2),
                input_arguments: None,
            }],
            queues: vec![QueueConfig {
                id: 42,
                process: "Invoices".into(),
                max_consumers: None,
                follow_up_queue: None,
            }],
            ..JobgateConfig::default()
        }
    }

    fn signed(uri: &str, body: &str) -> Request<Body> {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"k").unwrap();
        mac.update(body.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        Request::post(uri)
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn startup_reconcile_dispatches_queue_consumers() {
        let gateway = MockGateway::new();
        gateway.set_queue(42, 5);
        let engine = Engine::new(&config(), gateway);

        let outcome = engine.reconciler.reconcile_once().await.unwrap();
        let CycleOutcome::Completed(summary) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(summary.dispatch.accepted, 2);
        assert_eq!(engine.store.process_counter("Invoices").await.pending, 2);
        assert_eq!(engine.store.queue_counter(42).await.active_consumers, 2);
    }

    #[tokio::test]
    async fn webhooks_flow_through_to_the_store() {
        let engine = Engine::new(&config(), MockGateway::new());
        let (tx, rx) = mpsc::channel::<Command>(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let ingest = tokio::spawn(Arc::clone(&engine.ingestor).run(rx, cancel.clone()));
        let app = webhook::router(WebhookState::new(tx, "k"));

        let resp = app
            .clone()
            .oneshot(signed(
                "/webhooks/queues/items/created",
                r#"{"QueueItems":[{"Id":1,"QueueDefinitionId":42}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .oneshot(signed(
                "/webhooks/jobs/created",
                r#"{"Jobs":[{"Id":1,"ReleaseName":"Invoices"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Queue commands dispatch on a spawned task.
        for _ in 0..50 {
            let running = engine.store.process_counter("Invoices").await.running;
            let available = engine.store.queue_counter(42).await.available_items;
            if running == 1 && available == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let counter = engine.store.process_counter("Invoices").await;
        assert_eq!(counter.running, 1);
        assert_eq!(engine.store.queue_counter(42).await.available_items, 1);

        cancel.cancel();
        ingest.await.unwrap();
    }
}
