use std::net::SocketAddr;
use std::time::Duration;

use coap_lite::{CoapRequest, ContentFormat, MessageType, Packet, RequestType};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use domain::device::ConnectionState;
use domain::error::{EngineError, Result};

use super::{OutcomeSender, Publish, PublishQueue, report_outcome};
use std::sync::Arc;

/// Resolved CoAP endpoint for one device.
#[derive(Debug, Clone)]
pub struct CoapEndpoint {
    pub host: String,
    pub port: u16,
    pub resource_path: String,
    pub confirmable: bool,
    pub ack_timeout: Duration,
    /// Consecutive exchange failures before the link counts as down.
    pub failure_threshold: u32,
}

/// Connectionless CoAP egress: each publish is a POST to the resource.
/// There is no session to keep alive; the link counts as down only after
/// a run of consecutive failures.
pub struct CoapAdapter {
    endpoint: CoapEndpoint,
    queue: Arc<PublishQueue>,
    outcome_tx: OutcomeSender,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    running: bool,
}

impl CoapAdapter {
    pub fn new(endpoint: CoapEndpoint, outcome_tx: OutcomeSender, queue_capacity: usize) -> Self {
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

        let target = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let addr: SocketAddr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| EngineError::Unavailable(format!("coap resolve {target}: {e}")))?
            .next()
            .ok_or_else(|| EngineError::Unavailable(format!("coap resolve {target}: no address")))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| EngineError::Unavailable(format!("coap bind: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| EngineError::Unavailable(format!("coap connect {addr}: {e}")))?;

        self.state_tx.send_replace(ConnectionState::Connected);

        let queue = self.queue.clone();
        let outcome_tx = self.outcome_tx.clone();
        let state_tx = self.state_tx.clone();
        let cancel = self.cancel.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let mut message_id: u16 = 0;
            let mut consecutive_failures: u32 = 0;
            let mut buf = [0u8; 1500];

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
                message_id = message_id.wrapping_add(1);

                let request = build_post(&endpoint, message_id, payload, binary);
                let success = match request.message.to_bytes() {
                    Ok(wire) => exchange(&socket, &endpoint, &wire, &mut buf).await,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode CoAP message");
                        false
                    }
                };

                if success {
                    consecutive_failures = 0;
                    state_tx.send_replace(ConnectionState::Connected);
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures >= endpoint.failure_threshold {
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

fn build_post(
    endpoint: &CoapEndpoint,
    message_id: u16,
    payload: Vec<u8>,
    binary: bool,
) -> CoapRequest<SocketAddr> {
    let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
    request.set_method(RequestType::Post);
    request.set_path(&endpoint.resource_path);
    request.message.header.message_id = message_id;
    request.message.header.set_type(if endpoint.confirmable {
        MessageType::Confirmable
    } else {
        MessageType::NonConfirmable
    });
    request.message.set_content_format(if binary {
        ContentFormat::ApplicationOctetStream
    } else {
        ContentFormat::ApplicationJSON
    });
    request.message.payload = payload;
    request
}

async fn exchange(
    socket: &UdpSocket,
    endpoint: &CoapEndpoint,
    wire: &[u8],
    buf: &mut [u8],
) -> bool {
    if let Err(e) = socket.send(wire).await {
        debug!(error = %e, "CoAP send failed");
        return false;
    }
    if !endpoint.confirmable {
        return true;
    }
    match tokio::time::timeout(endpoint.ack_timeout, socket.recv(buf)).await {
        Ok(Ok(n)) => match Packet::from_bytes(&buf[..n]) {
            Ok(packet) => matches!(
                packet.header.get_type(),
                MessageType::Acknowledgement | MessageType::NonConfirmable
            ),
            Err(e) => {
                debug!(error = %e, "CoAP response did not parse");
                false
            }
        },
        Ok(Err(e)) => {
            debug!(error = %e, "CoAP recv failed");
            false
        }
        Err(_) => {
            debug!("CoAP ack timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_confirmable_post() {
        let endpoint = CoapEndpoint {
            host: "localhost".into(),
            port: 5683,
            resource_path: "/telemetry".into(),
            confirmable: true,
            ack_timeout: Duration::from_secs(2),
            failure_threshold: 3,
        };
        let request = build_post(&endpoint, 7, b"{\"t\":1}".to_vec(), false);
        assert_eq!(request.message.header.message_id, 7);
        assert_eq!(request.message.header.get_type(), MessageType::Confirmable);
        assert_eq!(
            request.message.get_content_format(),
            Some(ContentFormat::ApplicationJSON)
        );
        // encodes to valid wire bytes
        assert!(request.message.to_bytes().is_ok());
    }

    #[test]
    fn test_binary_payload_uses_octet_stream() {
        let endpoint = CoapEndpoint {
            host: "localhost".into(),
            port: 5683,
            resource_path: "/telemetry".into(),
            confirmable: false,
            ack_timeout: Duration::from_secs(2),
            failure_threshold: 3,
        };
        let request = build_post(&endpoint, 1, vec![0xde, 0xad], true);
        assert_eq!(
            request.message.header.get_type(),
            MessageType::NonConfirmable
        );
        assert_eq!(
            request.message.get_content_format(),
            Some(ContentFormat::ApplicationOctetStream)
        );
    }
}
