//! A client-side hub connection: the `HubConnection`/`Hub` pairing SignalR
//! and its protocol family use for a persistent, full-duplex RPC channel
//! over a pluggable transport — connect/reconnect lifecycle, request/
//! response and streaming invocations, and optional stateful-reconnect
//! message buffering, all driven by one actor task (see `connection`).
//!
//! No concrete transport ships here (spec §6): bring your own WebSocket (or
//! other duplex frame stream) by implementing `transport::Transport`.

mod buffer;
mod connection;
mod error;
mod options;
mod protocol;
mod registry;
mod retry;
mod state;
mod transport;

pub use connection::{ClientHandler, HubConnection, HubStream, TransportFactory};
pub use error::{transport_error, HubConnectionError};
pub use options::{HubConnectionBuilder, HubConnectionOptions};
pub use protocol::{
    HandshakeProtocol, HandshakeRequestMessage, HandshakeResponseMessage, HubMessage, HubProtocol,
    JsonHandshakeProtocol, JsonHubProtocol, Payload, TransferFormat,
};
pub use registry::InvocationArg;
pub use retry::{DefaultRetryPolicy, NoRetryPolicy, RetryContext, RetryPolicy};
pub use state::ConnectionState;
pub use transport::{Transport, TransportFeatures};
