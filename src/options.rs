//! Configuration surface (ambient stack addition, SPEC_FULL §1.1).
//!
//! Mirrors `forwarder::config::ForwarderConfig`'s shape — a plain struct of
//! typed knobs grouped the same way (`server`/`journal`/`uplink` there,
//! timing/sizing here) — but `ForwarderConfig` only ever exists as the
//! product of `load_config()` deserializing a required TOML file, with its
//! defaults inlined in that parsing code rather than on a `Default` impl.
//! This type has no config file to deserialize, so its defaults live on an
//! actual `impl Default` instead, and there is no `load_config()`: callers
//! build `HubConnectionOptions` directly or via `HubConnectionBuilder`.

use std::sync::Arc;

use crate::protocol::{HandshakeProtocol, HubProtocol};
use crate::retry::RetryPolicy;

/// Timing and sizing knobs for a `HubConnection` (spec §3, §4.5).
#[derive(Debug, Clone)]
pub struct HubConnectionOptions {
    /// Ping cadence while Connected (spec §4.5). Default 15,000 ms.
    pub keep_alive_interval_ms: u64,
    /// Server-silence timeout (spec §4.5). Default 30,000 ms. Ignored
    /// entirely when the transport advertises inherent keep-alive.
    pub server_timeout_ms: u64,
    /// MessageBuffer backpressure threshold in bytes (spec §3). Default
    /// 100,000.
    pub buffer_size_bytes: usize,
    /// ACK-coalescing timer duration (spec §4.1). Default 1,000 ms.
    pub ack_coalesce_ms: u64,
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 15_000,
            server_timeout_ms: 30_000,
            buffer_size_bytes: 100_000,
            ack_coalesce_ms: 1_000,
        }
    }
}

/// Builder for assembling a `HubConnection` from its collaborators (spec
/// §6 external interfaces — transport/protocol/handshake protocol are all
/// injected, never constructed internally).
pub struct HubConnectionBuilder {
    pub(crate) hub_protocol: Arc<dyn HubProtocol>,
    pub(crate) handshake_protocol: Arc<dyn HandshakeProtocol>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) options: HubConnectionOptions,
}

impl HubConnectionBuilder {
    pub fn new(hub_protocol: Arc<dyn HubProtocol>, handshake_protocol: Arc<dyn HandshakeProtocol>) -> Self {
        Self {
            hub_protocol,
            handshake_protocol,
            retry_policy: None,
            options: HubConnectionOptions::default(),
        }
    }

    /// Install a retry policy; omitting one means a transport loss always
    /// completes the close instead of reconnecting (spec §4.4 step 2).
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_options(mut self, options: HubConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_keep_alive_interval_ms(mut self, ms: u64) -> Self {
        self.options.keep_alive_interval_ms = ms;
        self
    }

    pub fn with_server_timeout_ms(mut self, ms: u64) -> Self {
        self.options.server_timeout_ms = ms;
        self
    }

    pub fn with_buffer_size_bytes(mut self, bytes: usize) -> Self {
        self.options.buffer_size_bytes = bytes;
        self
    }
}
