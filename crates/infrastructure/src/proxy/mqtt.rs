use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domain::device::BindingConfig;
use domain::error::{EngineError, Result};

const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 60_000;

/// Subscribe-side MQTT adapter for one bound proxy device. Each received
/// message is forwarded to the device's inbound channel; a full channel
/// drops the payload rather than stalling the event loop.
pub struct MqttIngress {
    cancel: CancellationToken,
}

impl MqttIngress {
    pub async fn start(
        device_id: &str,
        binding: &BindingConfig,
        inbound_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<Self> {
        let broker = binding
            .broker
            .clone()
            .ok_or_else(|| EngineError::Validation("mqtt binding requires a broker".into()))?;
        let port = binding
            .port
            .ok_or_else(|| EngineError::Validation("mqtt binding requires a port".into()))?;
        let topic = binding
            .topic
            .clone()
            .ok_or_else(|| EngineError::Validation("mqtt binding requires a topic".into()))?;
        let qos = match binding.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        };

        let mut options = MqttOptions::new(format!("proxy-{device_id}"), broker, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let Some(user) = &binding.username {
            // passwordRef names an environment variable holding the secret
            let password = binding
                .password_ref
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .unwrap_or_default();
            options.set_credentials(user.clone(), password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_device = device_id.to_string();
        tokio::spawn(async move {
            let mut backoff_ms = INITIAL_BACKOFF_MS;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        let _ = client.disconnect().await;
                        break;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(device_id = %task_device, topic = %topic, "Proxy subscription (re)established");
                            backoff_ms = INITIAL_BACKOFF_MS;
                            if let Err(e) = client.subscribe(&topic, qos).await {
                                warn!(device_id = %task_device, error = %e, "Proxy subscribe failed");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if inbound_tx.try_send(publish.payload.to_vec()).is_err() {
                                debug!(device_id = %task_device, "Proxy inbound channel full, payload dropped");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(device_id = %task_device, error = %e, "Proxy MQTT connection error");
                            let sleep = Duration::from_millis(backoff_ms);
                            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                            tokio::select! {
                                _ = task_cancel.cancelled() => break,
                                _ = tokio::time::sleep(sleep) => {}
                            }
                        }
                    }
                }
            }
            debug!(device_id = %task_device, "Proxy ingress stopped");
        });

        Ok(Self { cancel })
    }

    /// Stops the subscription; the event-loop task disconnects and exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MqttIngress {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
