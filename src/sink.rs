// ABOUTME: Bounded-queue webhook log sink with rate-limited background shipping.
// ABOUTME: Drops oldest events under backpressure and replaces them with a single marker event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WebhookConfig;
use crate::events::LogEvent;
use crate::metrics;

/// Delivery seam for the sink. Production uses HTTP; tests record batches.
#[async_trait]
pub trait LogDelivery: Send + Sync {
    async fn deliver(&self, batch: &[LogEvent]) -> anyhow::Result<()>;
}

/// Ships batches to the configured webhook endpoint over HTTP.
pub struct HttpDelivery {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpDelivery {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl LogDelivery for HttpDelivery {
    async fn deliver(&self, batch: &[LogEvent]) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "source": "chirp",
            "events": batch,
        });
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("webhook delivery failed with status {}", response.status());
        }
        Ok(())
    }
}

/// Tuning knobs for the sink, derived from [`WebhookConfig`].
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Minimum delay between shipped batches
    pub min_interval: Duration,
    pub retry_budget: u32,
    /// Base delay between delivery retries (doubles per attempt)
    pub retry_delay: Duration,
    /// How long shutdown waits for the queue to flush
    pub flush_deadline: Duration,
}

impl From<&WebhookConfig> for SinkConfig {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            batch_size: config.batch_size,
            min_interval: Duration::from_millis(config.min_interval_ms),
            retry_budget: config.retry_budget,
            retry_delay: Duration::from_millis(500),
            flush_deadline: Duration::from_millis(config.flush_deadline_ms),
        }
    }
}

struct SinkQueue {
    events: VecDeque<LogEvent>,
    /// Events dropped since the last drain; folded into one marker event
    dropped_since_drain: u64,
}

struct SinkInner {
    queue: Mutex<SinkQueue>,
    notify: Notify,
    capacity: usize,
}

/// Cheap-to-clone handle for enqueueing log events from any task.
#[derive(Clone)]
pub struct SinkHandle {
    inner: Arc<SinkInner>,
}

impl SinkHandle {
    /// Append an event to the queue. Never blocks and never fails; when the
    /// queue is full the oldest entry is dropped to make room.
    pub fn enqueue(&self, event: LogEvent) {
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if queue.events.len() >= self.inner.capacity {
            queue.events.pop_front();
            queue.dropped_since_drain += 1;
            metrics::record_sink_dropped(1);
        }
        queue.events.push_back(event);
        drop(queue);

        self.inner.notify.notify_one();
    }

    /// Current queue depth (for diagnostics and tests).
    pub fn queue_len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .events
            .len()
    }
}

/// The webhook log sink: a bounded queue plus a background shipping task.
pub struct WebhookSink {
    handle: SinkHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    flush_deadline: Duration,
}

impl WebhookSink {
    /// Spawn the background shipper and return the sink.
    pub fn spawn(config: SinkConfig, delivery: Arc<dyn LogDelivery>) -> Self {
        let inner = Arc::new(SinkInner {
            queue: Mutex::new(SinkQueue {
                events: VecDeque::new(),
                dropped_since_drain: 0,
            }),
            notify: Notify::new(),
            capacity: config.queue_capacity,
        });
        let handle = SinkHandle {
            inner: Arc::clone(&inner),
        };
        let cancel = CancellationToken::new();
        let flush_deadline = config.flush_deadline;

        let task = tokio::spawn(run_shipper(inner, config, delivery, cancel.clone()));

        Self {
            handle,
            cancel,
            task,
            flush_deadline,
        }
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Stop the shipper, flushing remaining events within the deadline.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.handle.inner.notify.notify_one();

        match tokio::time::timeout(self.flush_deadline, &mut self.task).await {
            Ok(Ok(())) => tracing::debug!("Webhook sink flushed and stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Webhook sink task failed"),
            Err(_) => {
                tracing::warn!(
                    deadline_ms = self.flush_deadline.as_millis() as u64,
                    "Webhook sink flush deadline exceeded, abandoning queue"
                );
                self.task.abort();
            }
        }
    }
}

/// Pull the next batch off the queue. A pending drop count is folded into a
/// single synthetic marker event at the front of the batch.
fn take_batch(inner: &SinkInner, batch_size: usize) -> Vec<LogEvent> {
    let mut queue = inner
        .queue
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut batch = Vec::new();
    if queue.dropped_since_drain > 0 {
        batch.push(LogEvent::warning(
            "sink",
            format!(
                "{} log events dropped due to backpressure",
                queue.dropped_since_drain
            ),
        ));
        queue.dropped_since_drain = 0;
    }
    while batch.len() < batch_size {
        match queue.events.pop_front() {
            Some(event) => batch.push(event),
            None => break,
        }
    }
    batch
}

async fn run_shipper(
    inner: Arc<SinkInner>,
    config: SinkConfig,
    delivery: Arc<dyn LogDelivery>,
    cancel: CancellationToken,
) {
    loop {
        let batch = take_batch(&inner, config.batch_size);

        if batch.is_empty() {
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = cancel.cancelled() => {}
            }
            continue;
        }

        ship_batch(&batch, config.retry_budget, config.retry_delay, delivery.as_ref()).await;

        // Rate-limit window between batches; skipped once shutdown begins
        // so the flush can complete within its deadline.
        if !cancel.is_cancelled() {
            tokio::select! {
                _ = tokio::time::sleep(config.min_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

/// Deliver one batch, retrying transient failures with doubling delays.
/// A batch that still fails after the budget is dropped with a local
/// stderr fallback; the sink must never wedge on an unreachable endpoint.
async fn ship_batch(
    batch: &[LogEvent],
    retry_budget: u32,
    retry_delay: Duration,
    delivery: &dyn LogDelivery,
) {
    let mut delay = retry_delay;
    for attempt in 0..=retry_budget {
        match delivery.deliver(batch).await {
            Ok(()) => {
                tracing::trace!(events = batch.len(), "Shipped log batch");
                return;
            }
            Err(e) if attempt < retry_budget => {
                tracing::debug!(
                    error = %e,
                    attempt = attempt + 1,
                    "Webhook delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                eprintln!(
                    "chirp: dropping {} log events after {} failed delivery attempts: {}",
                    batch.len(),
                    retry_budget + 1,
                    e
                );
                metrics::record_sink_dropped(batch.len() as u64);
            }
        }
    }
}
