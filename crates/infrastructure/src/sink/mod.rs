//! Time-series metrics sink. Fire-and-forget from the caller's side:
//! submission is non-blocking, the buffer is bounded with drop-oldest, and
//! flush failures are retried without ever backpressuring devices.

mod line_protocol;

pub use line_protocol::{encode_batch, encode_point};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domain::metrics::Point;

use crate::config::SinkConfig;

const RETRY_INITIAL_MS: u64 = 1_000;
const RETRY_MAX_MS: u64 = 30_000;

pub struct MetricsSink {
    config: SinkConfig,
    buffer: Mutex<VecDeque<Point>>,
    batch_ready: Notify,
    dropped: AtomicU64,
    written: AtomicU64,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsSink {
    /// Builds the sink and starts its flusher task.
    pub fn start(config: SinkConfig) -> Arc<Self> {
        let sink = Arc::new(Self {
            buffer: Mutex::new(VecDeque::new()),
            batch_ready: Notify::new(),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            flusher: Mutex::new(None),
            config,
        });

        if sink.config.url.is_none() {
            info!("Metrics sink has no endpoint configured; points will be discarded");
        }

        let task_sink = sink.clone();
        let handle = tokio::spawn(async move { task_sink.run_flusher().await });
        *sink.flusher.lock().unwrap() = Some(handle);
        sink
    }

    /// Non-blocking submission. On overflow the oldest point is dropped
    /// and counted.
    pub fn submit(&self, point: Point) {
        let batch_full = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() >= self.config.buffer_capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(point);
            buffer.len() >= self.config.batch_size
        };
        if batch_full {
            self.batch_ready.notify_one();
        }
    }

    pub fn metrics_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn points_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Stops the flusher and makes a best-effort final flush bounded by
    /// the configured shutdown deadline.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let deadline = Duration::from_millis(self.config.shutdown_flush_ms);
        if tokio::time::timeout(deadline, self.flush_remaining())
            .await
            .is_err()
        {
            warn!(
                pending = self.pending(),
                "Metrics sink shutdown deadline hit with points unflushed"
            );
        }
    }

    fn drain_batch(&self) -> Vec<Point> {
        let mut buffer = self.buffer.lock().unwrap();
        let take = buffer.len().min(self.config.batch_size);
        buffer.drain(..take).collect()
    }

    async fn run_flusher(&self) {
        let client = self.make_client();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms.max(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.batch_ready.notified() => {}
            }

            loop {
                let batch = self.drain_batch();
                if batch.is_empty() {
                    break;
                }
                let full = batch.len() == self.config.batch_size;
                self.write_batch(&client, batch).await;
                if !full || self.cancel.is_cancelled() {
                    break;
                }
            }
        }
    }

    async fn flush_remaining(&self) {
        let client = self.make_client();
        loop {
            let batch = self.drain_batch();
            if batch.is_empty() {
                return;
            }
            // one attempt per batch on shutdown; errors are logged only
            if self.post_once(&client, &batch).await.is_ok() {
                self.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
        }
    }

    fn make_client(&self) -> Option<reqwest::Client> {
        self.config.url.as_ref().map(|_| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client construction cannot fail with default TLS")
        })
    }

    /// Writes one batch, retrying with capped exponential backoff until it
    /// lands or the sink shuts down.
    async fn write_batch(&self, client: &Option<reqwest::Client>, batch: Vec<Point>) {
        let mut backoff_ms = RETRY_INITIAL_MS;
        loop {
            match self.post_once(client, &batch).await {
                Ok(()) => {
                    self.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, points = batch.len(), "Sink write failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            // retried on the shutdown path instead
                            let mut buffer = self.buffer.lock().unwrap();
                            for point in batch.into_iter().rev() {
                                buffer.push_front(point);
                            }
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                    backoff_ms = (backoff_ms * 2).min(RETRY_MAX_MS);
                }
            }
        }
    }

    async fn post_once(
        &self,
        client: &Option<reqwest::Client>,
        batch: &[Point],
    ) -> anyhow::Result<()> {
        let Some(client) = client else {
            // discard mode
            debug!(points = batch.len(), "Discarding batch (no sink endpoint)");
            return Ok(());
        };
        let url = self.config.url.as_deref().unwrap_or_default();

        let body = encode_batch(batch);
        let mut request = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = &self.config.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("sink returned {}", response.status());
        }
        Ok(())
    }
}
