//! Periodic delivery of outbox batches to the remote collector.
//!
//! Each cycle drains the outbox, merges every unconfirmed batch and sends the
//! records in requests of at most `batch_size`, retrying each with exponential
//! backoff. A batch is confirmed once every one of its records has been
//! acknowledged, so a failed or interrupted cycle resends the rest on the next
//! one (at-least-once delivery). Outbox I/O runs on the blocking pool.

use crate::config::DeliveryConfig;
use crate::event::TrackRecord;
use crate::outbox::{Batch, Outbox, OutboxError};
use uuid::Uuid;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors raised while delivering batches.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Collector request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Collector rejected delivery with status {0}")]
    Rejected(u16),

    #[error("Delivery failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<DeliveryError>,
    },

    #[error("Delivery cancelled")]
    Cancelled,

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Outbox task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Remote endpoint accepting batches of records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Collector: Send + Sync {
    async fn submit(&self, records: &[TrackRecord]) -> Result<(), DeliveryError>;
}

/// Collector reached over HTTP with a static API key.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpCollector {
    pub fn new(client: reqwest::Client, config: &DeliveryConfig) -> Self {
        Self {
            client,
            url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn submit(&self, records: &[TrackRecord]) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("ApiKey", &self.api_key)
            .json(records)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(status.as_u16()))
        }
    }
}

/// Result of one delivery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending and no backlog; no request was made.
    Idle,
    /// The whole merged backlog was accepted and confirmed.
    Delivered {
        batches: usize,
        events: usize,
        attempts: u32,
    },
    /// A request exhausted its attempts; counts are what stays unconfirmed.
    Failed { batches: usize, events: usize },
    /// Cancellation arrived before delivery completed.
    Cancelled,
}

/// Drives delivery cycles on a fixed interval.
pub struct DeliveryWorker {
    outbox: Arc<Outbox>,
    collector: Arc<dyn Collector>,
    interval: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    batch_size: usize,
}

impl DeliveryWorker {
    pub fn new(outbox: Arc<Outbox>, collector: Arc<dyn Collector>, config: &DeliveryConfig) -> Self {
        Self {
            outbox,
            collector,
            interval: config.interval(),
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Run cycles until cancelled. The first cycle starts immediately, which
    /// replays any backlog left by a previous run.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            max_attempts = self.max_attempts,
            "Delivery worker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle(&cancel).await {
                Ok(CycleOutcome::Cancelled) => break,
                Ok(outcome) => debug!(?outcome, "Delivery cycle finished"),
                Err(e) => error!(error = %e, "Delivery cycle aborted"),
            }
        }

        info!("Delivery worker stopped");
    }

    /// Execute a single drain-merge-send-confirm cycle.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome, DeliveryError> {
        if let Some(batch) = self.with_outbox(Outbox::drain_all).await? {
            debug!(
                batch_id = %batch.id,
                event_count = batch.events.len(),
                "New batch recorded"
            );
        }

        let batches = self.with_outbox(Outbox::unconfirmed).await?;
        let event_count: usize = batches.iter().map(|b| b.events.len()).sum();
        report_backlog(batches.len(), event_count);

        if batches.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        info!(
            batch_count = batches.len(),
            event_count,
            "Delivering backlog"
        );

        let records = merge_records(&batches);
        let mut progress = Acknowledgements::new(&batches);
        let mut attempts = 0;

        for chunk in records.chunks(self.batch_size) {
            match self.send_with_retry(chunk, cancel).await {
                Ok(made) => {
                    attempts += made;
                    metrics::counter!("tracker.delivery.delivered_events").increment(chunk.len() as u64);
                    self.confirm_all(progress.acknowledge(chunk.len())).await?;
                }
                Err(DeliveryError::Cancelled) => {
                    report_backlog(progress.remaining_batches(), progress.remaining_events());
                    info!(
                        batch_count = progress.remaining_batches(),
                        "Delivery interrupted by shutdown"
                    );
                    return Ok(CycleOutcome::Cancelled);
                }
                Err(e) => {
                    report_backlog(progress.remaining_batches(), progress.remaining_events());
                    warn!(
                        batch_count = progress.remaining_batches(),
                        event_count = progress.remaining_events(),
                        error = %e,
                        "Delivery failed, backlog kept for next cycle"
                    );
                    return Ok(CycleOutcome::Failed {
                        batches: progress.remaining_batches(),
                        events: progress.remaining_events(),
                    });
                }
            }
        }

        // batches without records are covered once everything before them is
        self.confirm_all(progress.acknowledge(0)).await?;
        report_backlog(0, 0);
        info!(
            batch_count = batches.len(),
            event_count,
            attempts,
            "Backlog delivered"
        );
        Ok(CycleOutcome::Delivered {
            batches: batches.len(),
            events: event_count,
            attempts,
        })
    }

    async fn confirm_all(&self, batch_ids: Vec<Uuid>) -> Result<(), DeliveryError> {
        if batch_ids.is_empty() {
            return Ok(());
        }
        self.with_outbox(move |outbox| outbox.confirm_all(&batch_ids)).await
    }

    async fn with_outbox<T, F>(&self, op: F) -> Result<T, DeliveryError>
    where
        F: FnOnce(&Outbox) -> Result<T, OutboxError> + Send + 'static,
        T: Send + 'static,
    {
        let outbox = self.outbox.clone();
        Ok(tokio::task::spawn_blocking(move || op(&outbox)).await??)
    }

    /// Send the records, waiting `base * 2^i` after failed attempt `i`.
    ///
    /// Returns the number of attempts made on success.
    async fn send_with_retry(
        &self,
        records: &[TrackRecord],
        cancel: &CancellationToken,
    ) -> Result<u32, DeliveryError> {
        let mut backoff = self.backoff();
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }

            metrics::counter!("tracker.delivery.attempts").increment(1);
            match self.collector.submit(records).await {
                Ok(()) => return Ok(attempt + 1),
                Err(e) => {
                    metrics::counter!("tracker.delivery.failures").increment(1);
                    warn!(attempt, error = %e, "Delivery attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < self.max_attempts {
                let delay = backoff.next_backoff().unwrap_or(self.backoff_base);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(DeliveryError::Exhausted {
            attempts: self.max_attempts,
            last: Box::new(last_error.unwrap_or(DeliveryError::Cancelled)),
        })
    }

    fn backoff(&self) -> ExponentialBackoff {
        let ceiling = self
            .backoff_base
            .saturating_mul(1u32 << self.max_attempts.min(31));

        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.backoff_base)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(ceiling)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Tracks which batches are fully covered by acknowledged records.
struct Acknowledgements<'a> {
    batches: &'a [Batch],
    acknowledged: usize,
    covered: usize,
    confirmed: usize,
    total_events: usize,
}

impl<'a> Acknowledgements<'a> {
    fn new(batches: &'a [Batch]) -> Self {
        Self {
            batches,
            acknowledged: 0,
            covered: 0,
            confirmed: 0,
            total_events: batches.iter().map(|b| b.events.len()).sum(),
        }
    }

    /// Record `records` more acknowledged records and return the ids of the
    /// batches they complete.
    fn acknowledge(&mut self, records: usize) -> Vec<Uuid> {
        self.acknowledged += records;

        let mut completed = Vec::new();
        while let Some(batch) = self.batches.get(self.confirmed) {
            if self.covered + batch.events.len() > self.acknowledged {
                break;
            }
            self.covered += batch.events.len();
            self.confirmed += 1;
            completed.push(batch.id);
        }
        completed
    }

    fn remaining_batches(&self) -> usize {
        self.batches.len() - self.confirmed
    }

    fn remaining_events(&self) -> usize {
        self.total_events - self.covered
    }
}

fn merge_records(batches: &[Batch]) -> Vec<TrackRecord> {
    batches
        .iter()
        .flat_map(|batch| batch.events.iter())
        .map(TrackRecord::from)
        .collect()
}

fn report_backlog(batches: usize, events: usize) {
    metrics::gauge!("tracker.outbox.backlog_batches").set(batches as f64);
    metrics::gauge!("tracker.outbox.backlog_events").set(events as f64);
}
