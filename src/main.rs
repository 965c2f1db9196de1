mod admission;
mod cli;
mod config;
mod engine;
mod error;
mod gateway;
mod ingest;
mod job;
mod links;
mod reconciler;
mod store;
mod webhook;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, Command};
use config::JobgateConfig;
use engine::{COMMAND_BUFFER, Engine};
use gateway::OrchestratorClient;
use reconciler::CycleOutcome;
use webhook::WebhookState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "jobgate=debug,tower_http=debug"
    } else {
        "jobgate=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = JobgateConfig::load(&cli.config)?;

    match cli.command {
        Command::CheckConfig => {
            println!(
                "{}: {} processes, {} queues, refresh every {}s",
                cli.config.display(),
                config.processes.len(),
                config.queues.len(),
                config.refresh_interval_secs
            );
        }
        Command::Reconcile { dispatch } => {
            let engine = Engine::new(&config, client_for(&config)?);
            let summary = if dispatch {
                match engine.reconciler.reconcile_once().await? {
                    CycleOutcome::Completed(summary) => summary,
                    CycleOutcome::Skipped => anyhow::bail!("reconciliation already running"),
                }
            } else {
                engine.reconciler.refresh().await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Serve => serve(config).await?,
    }

    Ok(())
}

fn client_for(config: &JobgateConfig) -> Result<OrchestratorClient> {
    let orchestrator = &config.orchestrator;
    OrchestratorClient::new(
        &orchestrator.base_url,
        orchestrator.token.clone(),
        orchestrator.folder_id,
    )
    .context("failed to build orchestrator client")
}

async fn serve(config: JobgateConfig) -> Result<()> {
    if config.secret_key.is_empty() {
        tracing::warn!("no secret key configured; webhook signatures use an empty key");
    }

    let engine = Engine::new(&config, client_for(&config)?);

    match engine.reconciler.reconcile_once().await {
        Ok(CycleOutcome::Completed(summary)) => tracing::info!(
            processes = summary.processes.len(),
            queues = summary.queues.len(),
            started = summary.dispatch.accepted,
            "startup reconciliation complete"
        ),
        Ok(CycleOutcome::Skipped) => {}
        Err(e) => tracing::warn!(error = %e, "startup reconciliation failed"),
    }

    let cancel = CancellationToken::new();
    let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
    let ingest = tokio::spawn(Arc::clone(&engine.ingestor).run(receiver, cancel.clone()));
    let reconcile = tokio::spawn(Arc::clone(&engine.reconciler).run(cancel.clone()));

    let app = webhook::router(WebhookState::new(sender, &config.secret_key));
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(addr = %config.listen, "jobgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let (ingest, reconcile) = tokio::join!(ingest, reconcile);
    ingest?;
    reconcile?;
    tracing::info!("jobgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
