//! mlplane Status Controller
//!
//! Folds per-reporter status events for models, pipelines, experiments and
//! servers into one observed status per resource, and releases deletion
//! finalizers once every reporter confirmed teardown.
//!
//! ## Architecture
//!
//! - **Router**: reads newline-delimited event envelopes and forwards each to
//!   the loop for its kind
//! - **Event loops**: one per kind, applying events in arrival order
//! - **Failed-operation pollers**: re-dispatch failed model and pipeline
//!   operations on an interval

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use mlplane_controller::{
    bus::{KindRouter, NdjsonSource, RouterStats},
    config::{Config, LogFormat},
    dispatch::ChannelCommandSink,
    handlers::EventHandler,
    manifest::Manifest,
    state::ControllerState,
    worker::{EventLoop, LoopStats},
};
use mlplane_events::ResourceKind;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MLPLANE_LOG_LEVEL)
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()));
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }

    info!("Starting mlplane status controller");
    info!(
        events_path = ?config.events_path,
        manifest_path = ?config.manifest_path,
        retry_max_attempts = config.retry.max_attempts,
        channel_capacity = config.channel_capacity,
        "Configuration loaded"
    );

    let manifest = match &config.manifest_path {
        Some(path) => Manifest::load(path).await?,
        None => Manifest::default(),
    };

    // Reporters are simulated in process: each gets a command channel whose
    // commands are logged.
    let sink = Arc::new(ChannelCommandSink::new());
    for reporter in manifest.reporters() {
        let mut commands = sink.register(reporter.clone(), config.channel_capacity).await;
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                info!(
                    reporter = %reporter,
                    kind = %command.kind,
                    resource = %command.resource,
                    operation = %command.operation,
                    iteration = command.iteration,
                    generation = command.generation,
                    "Command received"
                );
            }
        });
    }

    let state = ControllerState::new(config.retry.clone(), sink);
    if let Err(e) = state.apply_manifest(&manifest).await {
        error!(error = %e, "Failed to apply manifest");
        return Err(e.into());
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start one event loop per kind
    let (model_tx, model_rx) = mpsc::channel(config.channel_capacity);
    let (pipeline_tx, pipeline_rx) = mpsc::channel(config.channel_capacity);
    let (experiment_tx, experiment_rx) = mpsc::channel(config.channel_capacity);
    let (server_tx, server_rx) = mpsc::channel(config.channel_capacity);

    let loop_handles = vec![
        spawn_loop(state.model_handler(), model_rx, shutdown_rx.clone()),
        spawn_loop(state.pipeline_handler(), pipeline_rx, shutdown_rx.clone()),
        spawn_loop(state.experiment_handler(), experiment_rx, shutdown_rx.clone()),
        spawn_loop(state.server_handler(), server_rx, shutdown_rx.clone()),
    ];

    // Start failed-operation pollers
    let placement = Arc::new(manifest.placement());
    let model_poller = state.models().poller(placement.clone(), config.failed_ops.clone());
    let pipeline_poller = state.pipelines().poller(placement, config.failed_ops.clone());
    let poller_handles = vec![
        tokio::spawn(model_poller.run(shutdown_rx.clone())),
        tokio::spawn(pipeline_poller.run(shutdown_rx.clone())),
    ];

    // Route the event stream
    let router = KindRouter::new()
        .route(ResourceKind::Model, model_tx)
        .route(ResourceKind::Pipeline, pipeline_tx)
        .route(ResourceKind::Experiment, experiment_tx)
        .route(ResourceKind::Server, server_tx);
    let mut router_handle: JoinHandle<RouterStats> = match &config.events_path {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            info!(path = %path.display(), "Reading events from file");
            tokio::spawn(router.run(NdjsonSource::new(BufReader::new(file)), shutdown_rx.clone()))
        }
        None => {
            info!("Reading events from stdin");
            tokio::spawn(router.run(
                NdjsonSource::new(BufReader::new(tokio::io::stdin())),
                shutdown_rx.clone(),
            ))
        }
    };

    // Wait for shutdown signal (Ctrl+C) or the end of input
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        result = &mut router_handle => {
            match result {
                Ok(stats) => info!(
                    routed = stats.routed,
                    malformed = stats.malformed,
                    unrouted = stats.unrouted,
                    "Event input finished"
                ),
                Err(e) => error!(error = %e, "Router task panicked"),
            }
        }
    }

    // Wait for workers to finish. On end of input the loops drain their
    // channels before stopping.
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    for handle in loop_handles {
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(Ok(stats)) => debug!(?stats, "Event loop joined"),
            Ok(Err(e)) => error!(error = %e, "Event loop task panicked"),
            Err(e) => warn!(error = %e, "Event loop did not shut down in time"),
        }
    }

    let _ = shutdown_tx.send(true);

    if !router_handle.is_finished() {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, router_handle).await {
            warn!(error = %e, "Router did not shut down in time");
        }
    }

    for handle in poller_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Failed-operation poller did not shut down in time");
        }
    }

    let snapshot = state.cluster().snapshot();
    info!(
        models = snapshot.models.len(),
        pipelines = snapshot.pipelines.len(),
        experiments = snapshot.experiments.len(),
        servers = snapshot.servers.len(),
        revision = snapshot.revision,
        "Status controller shutdown complete"
    );
    Ok(())
}

fn spawn_loop<H: EventHandler>(
    handler: H,
    source: mpsc::Receiver<Bytes>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<LoopStats> {
    let event_loop = EventLoop::new(Arc::new(handler));
    tokio::spawn(async move { event_loop.run(source, shutdown).await })
}
