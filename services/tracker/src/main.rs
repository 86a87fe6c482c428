//! Presence tracker service
//!
//! Runs one producer per configured camera feed, an event recorder and the
//! delivery worker until SIGINT or SIGTERM.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{RUN_MODE}.toml)
//! 2. Environment variables (prefixed with TRACKER_)

use anyhow::{Context, Result};
use presence_tracker::config::{ServiceConfig, TrackerConfig};
use presence_tracker::history::HistoryWriter;
use presence_tracker::{
    event_channel, DeliveryWorker, EventRecorder, Feed, FeedProducer, HttpCollector,
    HttpRecognizer, Outbox, SchemeConnector, SiteSnapshot,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = TrackerConfig::load().context("Failed to load configuration")?;

    init_logging(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        feeds = config.feeds.len(),
        "Starting presence tracker"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    run(config).await
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &ServiceConfig) -> Result<()> {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("presence_tracker={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("hyper=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");
    Ok(())
}

async fn run(config: TrackerConfig) -> Result<()> {
    let site = SiteSnapshot::load(&config.site);

    let outbox = Arc::new(
        Outbox::open(&config.storage.data_dir).context("Failed to open outbox")?,
    );
    let backlog = outbox.unconfirmed().context("Failed to read audit journal")?;
    if !backlog.is_empty() {
        info!(
            batch_count = backlog.len(),
            event_count = backlog.iter().map(|b| b.events.len()).sum::<usize>(),
            "Replaying undelivered batches from previous run"
        );
    }

    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let cancel = CancellationToken::new();
    let (sink, events) = event_channel();

    let recorder = EventRecorder::new(
        outbox.clone(),
        Some(HistoryWriter::new(&config.storage.history_dir)),
        events,
    );
    let recorder_handle = tokio::spawn(recorder.run());

    let connector = Arc::new(SchemeConnector::new(&config.recognition, http.clone()));
    let recognizer = Arc::new(HttpRecognizer::new(
        http.clone(),
        config.recognition.inference_endpoint.clone(),
        config.recognition.inference_timeout(),
    ));

    let mut producer_handles = Vec::with_capacity(config.feeds.len());
    for feed_config in &config.feeds {
        let feed = Feed::new(feed_config);
        let status = site.status_for(&feed.source_id);
        let feed = feed.with_status(status);
        let producer = FeedProducer::new(
            feed,
            &site,
            connector.clone(),
            recognizer.clone(),
            sink.clone(),
            &config.recognition,
        );
        producer_handles.push(tokio::spawn(producer.run(cancel.clone())));
    }
    // producers hold the only remaining sinks
    drop(sink);

    let collector = Arc::new(HttpCollector::new(http, &config.delivery));
    let worker = DeliveryWorker::new(outbox, collector, &config.delivery);
    let delivery_handle = tokio::spawn(worker.run(cancel.clone()));

    shutdown_signal().await;
    info!("Shutting down");
    cancel.cancel();

    for result in futures::future::join_all(producer_handles).await {
        if let Err(e) = result {
            error!(error = %e, "Feed producer task panicked");
        }
    }
    if let Err(e) = recorder_handle.await {
        error!(error = %e, "Event recorder task panicked");
    }
    if let Err(e) = delivery_handle.await {
        error!(error = %e, "Delivery worker task panicked");
    }

    info!("Presence tracker stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
