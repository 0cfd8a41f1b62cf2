//! Connection state machine data type (spec §3, §4.3).

use tokio::sync::watch;

/// Lifecycle state of the logical connection.
///
/// Transitions follow the graph in spec §4.3; only the coordinator's
/// actor task ever writes this value (spec §3 ownership invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Reconnecting => "Reconnecting",
        }
    }
}

/// Broadcast side of the observable state stream (spec §3: "Observable via
/// a broadcast notification stream").
pub fn channel() -> (watch::Sender<ConnectionState>, watch::Receiver<ConnectionState>) {
    watch::channel(ConnectionState::Disconnected)
}
