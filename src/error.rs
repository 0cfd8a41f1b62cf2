//! Error taxonomy for the hub connection core (spec §7).

use std::fmt;

/// Every failure mode the coordinator can produce or surface from a
/// collaborator (transport, protocol, retry policy).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubConnectionError {
    /// User invoked an operation in a disallowed state.
    #[error("{0}")]
    ProtocolState(String),

    /// Handshake parse failure or server-reported handshake error.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Error surfaced from the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Close frame carrying an error string from the server.
    #[error("server closed the connection: {0}")]
    ServerClose(String),

    /// Server-silence timeout elapsed.
    #[error("server timeout elapsed")]
    Timeout,

    /// Inbound Sequence.sequenceId exceeded nextReceivingSequenceId.
    #[error("Sequence ID greater than amount of messages we've received")]
    SequenceViolation,

    /// Retry policy returned no further delay.
    #[error("retry policy exhausted")]
    RetryExhausted,

    /// A pending invocation failed because the connection closed.
    #[error("invocation canceled because the connection closed")]
    InvocationCanceled,

    /// Server sent an Invocation with a non-empty invocationId (expects a
    /// response); this is explicitly unsupported.
    #[error("server-initiated invocations expecting a response are not supported")]
    UnsupportedServerRequest,

    /// A Completion referenced an invocation id with no registry entry, or
    /// an invocation id received a message type it cannot handle.
    #[error("unexpected message for invocation {0}")]
    UnexpectedInvocationMessage(String),

    /// Protocol codec failure (handshake or hub protocol framing).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Catch-all for collaborator errors that don't fit the above.
    #[error("{0}")]
    Other(String),
}

impl HubConnectionError {
    pub(crate) fn not_disconnected() -> Self {
        HubConnectionError::ProtocolState(
            "Cannot start a HubConnection that is not in the Disconnected state".to_owned(),
        )
    }
}

/// Helper used by transports/protocols that want to report an arbitrary
/// `Display`-able cause without pulling in a dependency on this crate's enum.
pub fn transport_error(cause: impl fmt::Display) -> HubConnectionError {
    HubConnectionError::Transport(cause.to_string())
}
