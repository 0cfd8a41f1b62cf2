//! Shared in-process mock transport for integration tests.
//!
//! Modeled on the "in-memory socket pair" shape used by mock WS server/
//! client harnesses in the example corpus: one end is handed to the
//! coordinator as a `Transport`, the other (`MockEndpoint`) is the test's
//! hand on the wire, able to inject frames and observe what the client
//! sent. A `MockEndpointFactory` hands out one pre-built pair per
//! `start()`/reconnect attempt, in order, so multi-attempt reconnect
//! scenarios can be scripted from the test body.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hub_connection::{
    HubConnectionError, HubMessage, HubProtocol, JsonHubProtocol, Payload, TransferFormat,
    Transport, TransportFeatures,
};
use tokio::sync::mpsc;

pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Payload>,
    outbound: mpsc::UnboundedSender<Payload>,
    features: TransportFeatures,
    stopped: Arc<AtomicBool>,
    connection_id: Option<String>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn start(&mut self, _transfer_format: TransferFormat) -> Result<(), HubConnectionError> {
        Ok(())
    }

    async fn send(&mut self, payload: Payload) -> Result<(), HubConnectionError> {
        self.outbound
            .send(payload)
            .map_err(|_| HubConnectionError::Transport("mock endpoint dropped".to_owned()))
    }

    async fn recv(&mut self) -> Result<Option<Payload>, HubConnectionError> {
        Ok(self.inbound.recv().await)
    }

    async fn stop(&mut self, _error: Option<HubConnectionError>) -> Result<(), HubConnectionError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn features(&self) -> TransportFeatures {
        self.features
    }

    fn set_reconnect(&mut self, _enabled: bool) {}

    fn connection_id(&self) -> Option<String> {
        self.connection_id.clone()
    }
}

pub struct MockEndpoint {
    to_client: mpsc::UnboundedSender<Payload>,
    from_client: Mutex<mpsc::UnboundedReceiver<Payload>>,
    pub stopped: Arc<AtomicBool>,
}

impl MockEndpoint {
    pub fn pair(features: TransportFeatures, connection_id: Option<&str>) -> (MockTransport, MockEndpoint) {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let transport = MockTransport {
            inbound,
            outbound,
            features,
            stopped: Arc::clone(&stopped),
            connection_id: connection_id.map(str::to_owned),
        };
        let endpoint = MockEndpoint {
            to_client,
            from_client: Mutex::new(from_client),
            stopped,
        };
        (transport, endpoint)
    }

    pub fn send_handshake_ok(&self) {
        let mut json = serde_json::to_string(&hub_connection::HandshakeResponseMessage { error: None }).unwrap();
        json.push('\u{1e}');
        let _ = self.to_client.send(Payload::Text(json));
    }

    pub fn send(&self, message: &HubMessage) {
        let payload = JsonHubProtocol.write_message(message).unwrap();
        let _ = self.to_client.send(payload);
    }

    pub async fn recv_message(&self) -> HubMessage {
        let payload = self.from_client.lock().unwrap().recv().await.unwrap();
        let mut messages = JsonHubProtocol.parse_messages(&payload).unwrap();
        messages.remove(0)
    }

    pub async fn try_recv_message(&self, within: std::time::Duration) -> Option<HubMessage> {
        let payload = tokio::time::timeout(within, async {
            self.from_client.lock().unwrap().recv().await
        })
        .await
        .ok()
        .flatten()?;
        let mut messages = JsonHubProtocol.parse_messages(&payload).unwrap();
        Some(messages.remove(0))
    }
}

/// Hands out queued `(MockTransport, MockEndpoint)` pairs, one per call to
/// the `TransportFactory` closure, in FIFO order. Built via `scripted`, then
/// split into the factory to give the coordinator and the endpoint queue to
/// drive from the test body.
pub struct ScriptedTransports {
    endpoints: Mutex<VecDeque<MockEndpoint>>,
}

impl ScriptedTransports {
    pub fn scripted(pairs: Vec<(MockTransport, MockEndpoint)>) -> (hub_connection::TransportFactory, Arc<ScriptedTransports>) {
        let mut transports = VecDeque::new();
        let mut endpoints = VecDeque::new();
        for (t, e) in pairs {
            transports.push_back(t);
            endpoints.push_back(e);
        }
        let transports = Mutex::new(transports);
        let script = Arc::new(ScriptedTransports {
            endpoints: Mutex::new(endpoints),
        });
        let factory: hub_connection::TransportFactory = Arc::new(move |_url| {
            let next = transports.lock().unwrap().pop_front();
            Box::pin(async move {
                match next {
                    Some(t) => Ok(Box::new(t) as Box<dyn Transport>),
                    None => Err(HubConnectionError::Transport("no scripted transport left".to_owned())),
                }
            })
        });
        (factory, script)
    }

    /// Pop the next endpoint in script order (panics if the script under-
    /// provisioned — a test bug, not a runtime condition to handle).
    pub fn next_endpoint(&self) -> MockEndpoint {
        self.endpoints.lock().unwrap().pop_front().expect("script exhausted")
    }
}
