use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use domain::device::ConnectionState;
use domain::error::{EngineError, Result};

use super::{OutcomeSender, Publish, PublishQueue, report_outcome};

/// Resolved HTTP endpoint for one device.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    pub base_url: String,
    pub path: String,
    pub request_timeout: Duration,
    /// Consecutive failed POSTs before the link counts as down.
    pub failure_threshold: u32,
}

impl HttpEndpoint {
    pub fn url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

/// HTTP egress: each publish is a POST with a JSON body over a pooled
/// connection.
pub struct HttpAdapter {
    endpoint: HttpEndpoint,
    queue: Arc<PublishQueue>,
    outcome_tx: OutcomeSender,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    running: bool,
}

impl HttpAdapter {
    pub fn new(endpoint: HttpEndpoint, outcome_tx: OutcomeSender, queue_capacity: usize) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint,
            queue: PublishQueue::new(queue_capacity),
            outcome_tx,
            state_tx,
            state_rx,
            cancel: CancellationToken::new(),
            running: false,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.state_tx.send_replace(ConnectionState::Connecting);

        let client = reqwest::Client::builder()
            .timeout(self.endpoint.request_timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("http client: {e}")))?;

        self.state_tx.send_replace(ConnectionState::Connected);

        let url = self.endpoint.url();
        let failure_threshold = self.endpoint.failure_threshold;
        let queue = self.queue.clone();
        let outcome_tx = self.outcome_tx.clone();
        let state_tx = self.state_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = queue.pop() => item,
                };
                let Publish {
                    attribute,
                    payload,
                    binary,
                    value,
                    ..
                } = item;
                let bytes = payload.len();
                let content_type = if binary {
                    "application/octet-stream"
                } else {
                    "application/json"
                };

                let response = client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(payload)
                    .send()
                    .await;
                let success = match response {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        debug!(error = %e, "HTTP publish failed");
                        false
                    }
                };

                if success {
                    consecutive_failures = 0;
                    state_tx.send_replace(ConnectionState::Connected);
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures >= failure_threshold {
                        state_tx.send_replace(ConnectionState::Reconnecting);
                    }
                }
                report_outcome(&outcome_tx, attribute, bytes, success, value);
            }
        });

        self.running = true;
        Ok(())
    }

    pub fn submit(&self, publish: Publish) {
        self.queue.push(publish);
    }

    pub(crate) fn queue_handle(&self) -> Arc<PublishQueue> {
        self.queue.clone()
    }

    pub fn watch_state(&self) -> &watch::Receiver<ConnectionState> {
        &self.state_rx
    }

    pub fn dropped_publishes(&self) -> u64 {
        self.queue.dropped()
    }

    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.running = false;
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Simulates a dropped link: stops the worker but reports
    /// `Reconnecting` instead of a clean disconnect.
    pub async fn sever(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.running = false;
        self.state_tx.send_replace(ConnectionState::Reconnecting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join_tolerates_slashes() {
        let endpoint = HttpEndpoint {
            base_url: "http://ingest:8080/".into(),
            path: "/telemetry".into(),
            request_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        };
        assert_eq!(endpoint.url(), "http://ingest:8080/telemetry");

        let endpoint = HttpEndpoint {
            base_url: "http://ingest:8080".into(),
            path: "telemetry".into(),
            request_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        };
        assert_eq!(endpoint.url(), "http://ingest:8080/telemetry");
    }
}
