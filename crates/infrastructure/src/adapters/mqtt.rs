use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use domain::device::ConnectionState;
use domain::error::Result;

use super::{OutcomeSender, Publish, PublishQueue, report_outcome};

const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 60_000;

/// Resolved MQTT endpoint for one device. Patterns are interpolated by the
/// device before the adapter is built.
#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive_secs: u16,
    pub qos: u8,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publish_timeout: Duration,
}

/// Persistent MQTT connection with automatic reconnect. The event-loop
/// task owns the link state; the worker task drains the publish queue.
pub struct MqttAdapter {
    endpoint: MqttEndpoint,
    queue: Arc<PublishQueue>,
    outcome_tx: OutcomeSender,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    client: Option<AsyncClient>,
}

impl MqttAdapter {
    pub fn new(endpoint: MqttEndpoint, outcome_tx: OutcomeSender, queue_capacity: usize) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint,
            queue: PublishQueue::new(queue_capacity),
            outcome_tx,
            state_tx,
            state_rx,
            cancel: CancellationToken::new(),
            client: None,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            // Event loop already running; it reconnects on its own.
            return Ok(());
        }

        let mut options = MqttOptions::new(
            &self.endpoint.client_id,
            &self.endpoint.host,
            self.endpoint.port,
        );
        options.set_keep_alive(Duration::from_secs(self.endpoint.keepalive_secs.max(5) as u64));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.endpoint.username, &self.endpoint.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        self.state_tx.send_replace(ConnectionState::Connecting);

        // Event loop: drives the connection, publishes link state.
        let state_tx = self.state_tx.clone();
        let cancel = self.cancel.clone();
        let client_id = self.endpoint.client_id.clone();
        tokio::spawn(async move {
            let mut backoff_ms = INITIAL_BACKOFF_MS;
            let mut ever_connected = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            debug!(client_id = %client_id, "MQTT connected");
                            ever_connected = true;
                            backoff_ms = INITIAL_BACKOFF_MS;
                            state_tx.send_replace(ConnectionState::Connected);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(client_id = %client_id, error = %e, "MQTT connection error");
                            state_tx.send_replace(if ever_connected {
                                ConnectionState::Reconnecting
                            } else {
                                ConnectionState::Connecting
                            });
                            let sleep_ms = jittered(backoff_ms);
                            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                            }
                        }
                    }
                }
            }
            // final link state is written by close()/sever(), not here
        });

        // Worker: drains the publish queue.
        let queue = self.queue.clone();
        let outcome_tx = self.outcome_tx.clone();
        let state_rx = self.state_rx.clone();
        let worker_client = client.clone();
        let cancel = self.cancel.clone();
        let qos = match self.endpoint.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        };
        let publish_timeout = self.endpoint.publish_timeout;
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = queue.pop() => item,
                };
                let Publish {
                    attribute,
                    topic,
                    payload,
                    value,
                    ..
                } = item;
                let bytes = payload.len();

                if !state_rx.borrow().is_connected() {
                    report_outcome(&outcome_tx, attribute, bytes, false, value);
                    continue;
                }

                let result = tokio::time::timeout(
                    publish_timeout,
                    worker_client.publish(&topic, qos, false, payload),
                )
                .await;
                let success = matches!(result, Ok(Ok(())));
                report_outcome(&outcome_tx, attribute, bytes, success, value);
            }
        });

        self.client = Some(client);
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
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.cancel = CancellationToken::new();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Simulates a dropped link (group dropout): tears the connection down
    /// without touching the queue, leaving state at `Reconnecting`.
    pub async fn sever(&mut self) {
        self.cancel.cancel();
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.cancel = CancellationToken::new();
        self.state_tx.send_replace(ConnectionState::Reconnecting);
    }
}

impl MqttAdapter {
    pub fn endpoint(&self) -> &MqttEndpoint {
        &self.endpoint
    }
}

fn jittered(base_ms: u64) -> u64 {
    let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    (base_ms as f64 * factor) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        for _ in 0..200 {
            let v = jittered(1_000);
            assert!((800..=1_200).contains(&v), "jitter out of range: {v}");
        }
    }

    #[tokio::test]
    async fn test_unconnected_publishes_fail_fast() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let endpoint = MqttEndpoint {
            host: "localhost".into(),
            port: 1883,
            client_id: "test".into(),
            keepalive_secs: 60,
            qos: 0,
            username: None,
            password: None,
            publish_timeout: Duration::from_millis(100),
        };
        let adapter = MqttAdapter::new(endpoint, tx, 16);
        assert_eq!(
            *adapter.watch_state().borrow(),
            ConnectionState::Disconnected
        );
        drop(adapter);
        assert!(rx.try_recv().is_err());
    }
}
