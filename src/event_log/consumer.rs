//! # Stream Consumer
//!
//! Background worker draining one (stream, group, consumer) triple.
//!
//! Each poll:
//! 1. Claims entries other members left pending longer than `claim_idle`
//! 2. Otherwise reads from the group
//! 3. Skips events whose id was already processed
//! 4. Calls the handler and acknowledges
//!
//! A failed event is re-appended with `retryCount + 1` until `max_retries`
//! is reached, then moved to `<stream>.dlq`. The original entry is only
//! acknowledged after the retry or dead-letter append succeeded.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::errors::{EventLogResult, HandlerError};
use super::event::{Event, RETRY_COUNT_KEY};
use super::log::EventLog;
use super::stream::{StartOffset, StreamRecord};
use crate::observability::MetricsRegistry;

/// Suffix of dead-letter streams
pub const DLQ_SUFFIX: &str = ".dlq";

/// Dead-letter stream for `stream`
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{}{}", stream, DLQ_SUFFIX)
}

/// Processes one event
pub trait EventHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Consumer worker configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,

    /// Entries per read
    pub batch_size: usize,

    /// Retries before an event is dead-lettered
    pub max_retries: u32,

    /// Pending entries idle this long are claimed from other members
    pub claim_idle: Duration,

    /// Where the group starts when it is first created
    pub start: StartOffset,

    /// Processed event ids remembered for deduplication
    pub dedupe_window: usize,

    /// Pause after a failed poll
    pub error_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 10,
            max_retries: 3,
            claim_idle: Duration::from_secs(300),
            start: StartOffset::Beginning,
            dedupe_window: 10_000,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Bounded set of recently processed event ids
#[derive(Debug)]
pub struct IdempotencyWindow {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl IdempotencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Remember `id`, evicting the oldest id when full
    pub fn insert(&mut self, id: &str) {
        if self.capacity == 0 || self.seen.contains(id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub claimed: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl PollReport {
    /// Entries handled in this poll
    pub fn total(&self) -> usize {
        self.processed + self.duplicates + self.retried + self.dead_lettered
    }
}

/// Consumer worker
pub struct StreamConsumer {
    log: Arc<EventLog>,
    config: ConsumerConfig,
    handler: Arc<dyn EventHandler>,
    processed: Mutex<IdempotencyWindow>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl StreamConsumer {
    pub fn new(log: Arc<EventLog>, config: ConsumerConfig, handler: Arc<dyn EventHandler>) -> Self {
        let window = IdempotencyWindow::new(config.dedupe_window);
        Self {
            log,
            config,
            handler,
            processed: Mutex::new(window),
            metrics: None,
        }
    }

    /// Record outcomes in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Create the consumer group if it does not exist yet
    pub async fn init(&self) -> EventLogResult<()> {
        self.log
            .create_group(&self.config.stream, &self.config.group, self.config.start)
            .await?;
        Ok(())
    }

    /// Run one claim-or-read cycle
    pub async fn poll_once(&self) -> EventLogResult<PollReport> {
        let mut report = PollReport::default();
        let cfg = &self.config;

        let claimed = self
            .log
            .claim(
                &cfg.stream,
                &cfg.group,
                &cfg.consumer,
                cfg.claim_idle,
                cfg.batch_size,
            )
            .await?;
        report.claimed = claimed.len();

        let records = if claimed.is_empty() {
            self.log
                .read_group(&cfg.stream, &cfg.group, &cfg.consumer, cfg.batch_size)
                .await?
        } else {
            claimed
        };

        for record in records {
            self.process(record, &mut report).await?;
        }

        if report.total() > 0 {
            debug!(
                stream = %cfg.stream,
                consumer = %cfg.consumer,
                processed = report.processed,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "poll complete"
            );
        }
        Ok(report)
    }

    fn already_processed(&self, id: &str) -> bool {
        self.processed
            .lock()
            .map(|w| w.contains(id))
            .unwrap_or(false)
    }

    fn remember(&self, id: &str) {
        if let Ok(mut window) = self.processed.lock() {
            window.insert(id);
        }
    }

    async fn ack(&self, offset: u64) -> EventLogResult<()> {
        let acked = self
            .log
            .ack(&self.config.stream, &self.config.group, &[offset])
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.add_events_acked(acked as u64);
        }
        Ok(())
    }

    async fn process(&self, record: StreamRecord, report: &mut PollReport) -> EventLogResult<()> {
        if self.already_processed(&record.event.id) {
            debug!(id = %record.event.id, offset = record.offset, "duplicate event skipped");
            self.ack(record.offset).await?;
            report.duplicates += 1;
            return Ok(());
        }

        match self.handler.handle(&record.event).await {
            Ok(()) => {
                self.ack(record.offset).await?;
                self.remember(&record.event.id);
                report.processed += 1;
            }
            Err(e) => {
                if self.fail(&record, &e).await? {
                    report.dead_lettered += 1;
                } else {
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }

    /// Retry or dead-letter a failed entry; returns true if dead-lettered
    async fn fail(&self, record: &StreamRecord, cause: &HandlerError) -> EventLogResult<bool> {
        let cfg = &self.config;
        let retry_count = record.event.retry_count();

        if retry_count < cfg.max_retries {
            let mut retry = record.event.clone();
            retry.set_metadata(RETRY_COUNT_KEY, (retry_count + 1).to_string());
            self.log.append(&cfg.stream, retry).await?;
            self.ack(record.offset).await?;

            warn!(
                stream = %cfg.stream,
                id = %record.event.id,
                attempt = retry_count + 1,
                max_retries = cfg.max_retries,
                error = %cause,
                "event handler failed, retrying"
            );
            if let Some(metrics) = &self.metrics {
                metrics.increment_events_retried();
            }
            return Ok(false);
        }

        let dlq = dead_letter_stream(&cfg.stream);
        let dead = record
            .event
            .clone()
            .with_metadata("error", cause.to_string())
            .with_metadata("originalOffset", record.offset.to_string())
            .with_metadata(
                "failedAt",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        self.log.append(&dlq, dead).await?;
        self.ack(record.offset).await?;

        error!(
            stream = %cfg.stream,
            dlq = %dlq,
            id = %record.event.id,
            error = %cause,
            "event moved to dead-letter stream"
        );
        if let Some(metrics) = &self.metrics {
            metrics.increment_events_dead_lettered();
        }
        Ok(true)
    }

    /// Run until `shutdown` turns true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.init().await {
                error!(stream = %self.config.stream, error = %e, "consumer group setup failed");
            }
            info!(
                stream = %self.config.stream,
                group = %self.config.group,
                consumer = %self.config.consumer,
                "consumer started"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    result = self.poll_once() => {
                        if let Err(e) = result {
                            error!(stream = %self.config.stream, error = %e, "consumer poll failed");
                            tokio::time::sleep(self.config.error_backoff).await;
                        }
                    }
                }
            }

            info!(stream = %self.config.stream, consumer = %self.config.consumer, "consumer stopped");
        })
    }
}
