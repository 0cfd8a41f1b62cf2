//! Transport contract (spec §6, consumed only — no concrete transport is in
//! scope). Modeled as a bidirectional frame stream plus a small feature
//! block, the way `forwarder::uplink::UplinkSession` wraps a
//! `tokio_tungstenite` socket and calls `send`/`recv` directly rather than
//! registering callbacks.

use async_trait::async_trait;

use crate::error::HubConnectionError;
use crate::protocol::{Payload, TransferFormat};

/// Capabilities the negotiated transport advertises (spec §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportFeatures {
    /// The transport pings on its own (e.g. WebSocket ping frames); the
    /// coordinator's server-timeout timer is suppressed entirely when this
    /// is set (spec §4.5).
    pub inherent_keep_alive: bool,
    /// The transport supports stateful reconnect: the coordinator will
    /// instantiate a `MessageBuffer` and, around each reconnect attempt,
    /// call its `disconnected`/`resend` directly (spec §4.3 step 6). The
    /// spec frames this as the transport invoking a hook pair; here the
    /// coordinator is the sole driver of both ends of that pair, since it
    /// already serializes every state transition through one actor loop
    /// and has no need to hand the buffer to the transport itself.
    pub reconnect: bool,
}

/// Abstract transport surface (spec §6, "Transport contract (consumed)").
///
/// A transport instance is single-use: `start` brings it up, `send`/`recv`
/// exchange frames, and `stop` tears it down. The coordinator creates a
/// fresh instance (via the configured factory) for every connection and
/// reconnection attempt.
#[async_trait]
pub trait Transport: Send {
    /// Bring the transport up using the negotiated transfer format.
    async fn start(&mut self, transfer_format: TransferFormat) -> Result<(), HubConnectionError>;

    /// Send one already-framed payload.
    async fn send(&mut self, payload: Payload) -> Result<(), HubConnectionError>;

    /// Receive the next inbound frame. `Ok(None)` signals a clean close;
    /// `Err` signals an abnormal close. The coordinator is the sole caller
    /// (spec's "single subscriber" requirement for `onReceive`/`onClose`).
    async fn recv(&mut self) -> Result<Option<Payload>, HubConnectionError>;

    /// Tear the transport down. `error` is the reason, if any, forwarded by
    /// the caller (e.g. a user `stop()` or a timeout).
    async fn stop(&mut self, error: Option<HubConnectionError>) -> Result<(), HubConnectionError>;

    fn features(&self) -> TransportFeatures;

    /// Enable/disable the transport's own willingness to participate in
    /// reconnection; the coordinator clears this during `stop()` so no
    /// further reconnect attempt is initiated (spec §4.3 "stop()").
    fn set_reconnect(&mut self, enabled: bool);

    /// Opaque connection id assigned during negotiation, if the transport
    /// exposes one. Surfaced verbatim to `onreconnected` callbacks.
    fn connection_id(&self) -> Option<String> {
        None
    }
}
