//! The coordinator: a single actor task owns every piece of mutable state
//! (spec §5 "single logical executor, no locking") and is addressed through
//! a cheap-to-clone `HubConnection` handle that sends `Command`s over an
//! unbounded channel. Every external event — a user call, an inbound frame,
//! a timer firing — funnels through that one channel or is observed inside
//! the actor's own `tokio::select!` loops, so nothing here ever needs a
//! mutex. This is the same "one task, message-passing handle" shape
//! `forwarder::uplink::UplinkSession` uses for its socket, scaled up to a
//! full state machine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_stream::StreamExt;

use crate::error::HubConnectionError;
use crate::options::{HubConnectionBuilder, HubConnectionOptions};
use crate::protocol::{
    HandshakeProtocol, HandshakeRequestMessage, HubMessage, HubProtocol, Payload,
};
use crate::registry::{extract_streams, ExtractedStream, InvocationArg, InvocationRegistry};
use crate::retry::{delay_duration, RetryContext, RetryPolicy};
use crate::state::ConnectionState;
use crate::buffer::MessageBuffer;
use crate::transport::Transport;

/// Factory invoked once per `start()` and once per reconnect attempt to
/// produce a fresh transport instance (spec §6: "a transport instance is
/// single-use").
pub type TransportFactory = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<Box<dyn Transport>, HubConnectionError>> + Send>>
        + Send
        + Sync,
>;

pub type ClientHandler = Arc<dyn Fn(&[Value]) -> Result<(), HubConnectionError> + Send + Sync>;
type CloseCallback = Arc<dyn Fn(Option<HubConnectionError>) + Send + Sync>;
type ReconnectingCallback = Arc<dyn Fn(Option<HubConnectionError>) + Send + Sync>;
type ReconnectedCallback = Arc<dyn Fn(Option<String>) + Send + Sync>;

pub(crate) enum Command {
    Start(oneshot::Sender<Result<(), HubConnectionError>>),
    Stop(oneshot::Sender<()>),
    Send {
        target: String,
        args: Vec<InvocationArg>,
        resp: oneshot::Sender<Result<(), HubConnectionError>>,
    },
    Invoke {
        target: String,
        args: Vec<InvocationArg>,
        resp: oneshot::Sender<Result<Value, HubConnectionError>>,
    },
    Stream {
        target: String,
        args: Vec<InvocationArg>,
        #[allow(clippy::type_complexity)]
        resp: oneshot::Sender<
            Result<(String, mpsc::UnboundedReceiver<Result<Value, HubConnectionError>>), HubConnectionError>,
        >,
    },
    CancelStream(String),
    ClientStreamItem(String, Value),
    ClientStreamComplete(String),
    On {
        method: String,
        handler: ClientHandler,
    },
    Off {
        method: String,
        handler: Option<ClientHandler>,
    },
    OnClose(CloseCallback),
    OnReconnecting(ReconnectingCallback),
    OnReconnected(ReconnectedCallback),
    SetBaseUrl(String, oneshot::Sender<Result<(), HubConnectionError>>),
}

fn stream_ids_of(streams: &[ExtractedStream]) -> Option<Vec<String>> {
    if streams.is_empty() {
        None
    } else {
        Some(streams.iter().map(|s| s.id.clone()).collect())
    }
}

fn closed_err() -> HubConnectionError {
    HubConnectionError::Other("hub connection actor has shut down".to_owned())
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    base_url: String,
    transport_factory: TransportFactory,
    hub_protocol: Arc<dyn HubProtocol>,
    handshake_protocol: Arc<dyn HandshakeProtocol>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    options: HubConnectionOptions,

    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    buffer: Option<MessageBuffer>,
    registry: InvocationRegistry,
    handlers: HashMap<String, Vec<ClientHandler>>,
    on_close: Vec<CloseCallback>,
    on_reconnecting: Vec<ReconnectingCallback>,
    on_reconnected: Vec<ReconnectedCallback>,

    connection_started: bool,
    connection_id: Option<String>,
    stop_during_start_error: Option<HubConnectionError>,
    pending_stop_resp: Option<oneshot::Sender<()>>,
    self_tx: mpsc::UnboundedSender<Command>,
}

enum ConnectedExit {
    Stopped,
    TransportLost(Option<HubConnectionError>),
    FinalClose(Option<HubConnectionError>),
}

enum DispatchAction {
    None,
    CloseWithReconnect(Option<HubConnectionError>),
    CloseFinal(Option<HubConnectionError>),
}

struct DispatchOutcome {
    arm_ack_timer: Option<Duration>,
    action: DispatchAction,
}

impl Actor {
    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    fn can_enqueue(&self) -> bool {
        self.state == ConnectionState::Connected
            || (self.state == ConnectionState::Reconnecting && self.buffer.is_some())
    }

    fn fire_onclose(&self, error: Option<HubConnectionError>) {
        for cb in &self.on_close {
            let cb = Arc::clone(cb);
            let err = error.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || cb(err))).is_err() {
                tracing::error!("onclose callback panicked");
            }
        }
    }

    fn fire_onreconnecting(&self, error: Option<HubConnectionError>) {
        for cb in &self.on_reconnecting {
            let cb = Arc::clone(cb);
            let err = error.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || cb(err))).is_err() {
                tracing::error!("onreconnecting callback panicked");
            }
        }
    }

    fn fire_onreconnected(&self, connection_id: Option<String>) {
        for cb in &self.on_reconnected {
            let cb = Arc::clone(cb);
            let id = connection_id.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || cb(id))).is_err() {
                tracing::error!("onreconnected callback panicked");
            }
        }
    }

    fn dispatch_invocation(&self, target: &str, args: &[Value]) {
        let key = target.to_lowercase();
        let Some(list) = self.handlers.get(&key) else {
            tracing::debug!(target, "no handler registered for invocation target");
            return;
        };
        for handler in list {
            let handler = Arc::clone(handler);
            let owned_args = args.to_vec();
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || handler(&owned_args)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, target, "handler returned an error"),
                Err(_) => tracing::error!(target, "handler panicked"),
            }
        }
    }

    fn launch_client_streams(&self, streams: Vec<ExtractedStream>) {
        for stream in streams {
            let tx = self.self_tx.clone();
            let id = stream.id;
            let mut source = stream.source;
            tokio::spawn(async move {
                while let Some(item) = source.next().await {
                    if tx.send(Command::ClientStreamItem(id.clone(), item)).is_err() {
                        return;
                    }
                }
                let _ = tx.send(Command::ClientStreamComplete(id));
            });
        }
    }

    /// Routes one invocation-family (or control) message through the buffer
    /// (if stateful reconnect is active) and on to the transport (spec
    /// §4.1 `send`).
    async fn buffer_send(&mut self, message: &HubMessage) -> Result<(), HubConnectionError> {
        if let Some(buffer) = self.buffer.as_mut() {
            let rx = buffer
                .send(message, self.hub_protocol.as_ref(), self.transport.as_deref_mut())
                .await?;
            if let Some(rx) = rx {
                match rx.await {
                    Ok(inner) => inner?,
                    Err(_) => return Err(HubConnectionError::InvocationCanceled),
                }
            }
            Ok(())
        } else {
            let payload = self.hub_protocol.write_message(message)?;
            match self.transport.as_mut() {
                Some(t) => t.send(payload).await,
                None => Err(HubConnectionError::Transport("not connected".to_owned())),
            }
        }
    }

    /// Commands that make sense regardless of lifecycle phase, i.e.
    /// everything except `Stop` (each calling context handles `Stop`
    /// itself, since its effect depends on exactly where in the lifecycle
    /// it lands — spec §4.3 "stop()").
    async fn handle_command_generic(&mut self, cmd: Command) {
        match cmd {
            Command::Start(resp) => {
                let _ = resp.send(Err(HubConnectionError::not_disconnected()));
            }
            Command::Stop(resp) => {
                let _ = resp.send(());
            }
            Command::Send { target, args, resp } => {
                if !self.can_enqueue() {
                    let _ = resp.send(Err(HubConnectionError::ProtocolState(
                        "cannot send while not connected".to_owned(),
                    )));
                    return;
                }
                let (values, streams) = extract_streams(args, &mut self.registry);
                let message = HubMessage::Invocation {
                    invocation_id: None,
                    target,
                    arguments: values,
                    stream_ids: stream_ids_of(&streams),
                };
                let result = self.buffer_send(&message).await;
                if result.is_ok() {
                    self.launch_client_streams(streams);
                }
                let _ = resp.send(result);
            }
            Command::Invoke { target, args, resp } => {
                if !self.can_enqueue() {
                    let _ = resp.send(Err(HubConnectionError::ProtocolState(
                        "cannot invoke while not connected".to_owned(),
                    )));
                    return;
                }
                let id = self.registry.allocate_id();
                let (values, streams) = extract_streams(args, &mut self.registry);
                let message = HubMessage::Invocation {
                    invocation_id: Some(id.clone()),
                    target,
                    arguments: values,
                    stream_ids: stream_ids_of(&streams),
                };
                match self.buffer_send(&message).await {
                    Ok(()) => {
                        self.registry.register_invoke_with(id, resp);
                        self.launch_client_streams(streams);
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            Command::Stream { target, args, resp } => {
                if !self.can_enqueue() {
                    let _ = resp.send(Err(HubConnectionError::ProtocolState(
                        "cannot stream while not connected".to_owned(),
                    )));
                    return;
                }
                let id = self.registry.allocate_id();
                let (values, streams) = extract_streams(args, &mut self.registry);
                let message = HubMessage::StreamInvocation {
                    invocation_id: id.clone(),
                    target,
                    arguments: values,
                    stream_ids: stream_ids_of(&streams),
                };
                match self.buffer_send(&message).await {
                    Ok(()) => {
                        let rx = self.registry.register_stream(id.clone());
                        self.launch_client_streams(streams);
                        let _ = resp.send(Ok((id, rx)));
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            Command::CancelStream(id) => {
                if self.registry.remove(&id) {
                    let _ = self
                        .buffer_send(&HubMessage::CancelInvocation { invocation_id: id })
                        .await;
                }
            }
            Command::ClientStreamItem(id, item) => {
                let _ = self
                    .buffer_send(&HubMessage::StreamItem {
                        invocation_id: id,
                        item,
                    })
                    .await;
            }
            Command::ClientStreamComplete(id) => {
                let _ = self
                    .buffer_send(&HubMessage::Completion {
                        invocation_id: id,
                        result: None,
                        error: None,
                    })
                    .await;
            }
            Command::On { method, handler } => {
                let list = self.handlers.entry(method.to_lowercase()).or_default();
                if !list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
                    list.push(handler);
                }
            }
            Command::Off { method, handler } => {
                if let Some(list) = self.handlers.get_mut(&method.to_lowercase()) {
                    match handler {
                        Some(h) => list.retain(|existing| !Arc::ptr_eq(existing, &h)),
                        None => list.clear(),
                    }
                }
            }
            Command::OnClose(cb) => self.on_close.push(cb),
            Command::OnReconnecting(cb) => self.on_reconnecting.push(cb),
            Command::OnReconnected(cb) => self.on_reconnected.push(cb),
            Command::SetBaseUrl(url, resp) => {
                if matches!(
                    self.state,
                    ConnectionState::Disconnected | ConnectionState::Reconnecting
                ) {
                    self.base_url = url;
                    let _ = resp.send(Ok(()));
                } else {
                    let _ = resp.send(Err(HubConnectionError::ProtocolState(
                        "base URL can only be changed while Disconnected or Reconnecting".to_owned(),
                    )));
                }
            }
        }
    }

    /// spec §4.6 "Inbound dispatcher". Parses one transport frame into zero
    /// or more hub messages and routes each past the buffer gate and into
    /// handlers/registry/control handling.
    async fn dispatch_inbound(&mut self, payload: Payload) -> DispatchOutcome {
        let messages = match self.hub_protocol.parse_messages(&payload) {
            Ok(m) => m,
            Err(e) => {
                return DispatchOutcome {
                    arm_ack_timer: None,
                    action: DispatchAction::CloseFinal(Some(e)),
                };
            }
        };

        let mut arm_ack_timer = None;
        for message in messages {
            if let Some(buffer) = self.buffer.as_mut() {
                let outcome = buffer.should_process_message(&message);
                if outcome.arm_ack_timer.is_some() {
                    arm_ack_timer = outcome.arm_ack_timer;
                }
                if !outcome.accept {
                    continue;
                }
            }

            match message {
                HubMessage::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    ..
                } => {
                    if invocation_id.filter(|id| !id.is_empty()).is_some() {
                        return DispatchOutcome {
                            arm_ack_timer,
                            action: DispatchAction::CloseFinal(Some(
                                HubConnectionError::UnsupportedServerRequest,
                            )),
                        };
                    }
                    self.dispatch_invocation(&target, &arguments);
                }
                HubMessage::StreamItem { invocation_id, item } => {
                    self.registry.push_stream_item(&invocation_id, item);
                }
                HubMessage::Completion {
                    invocation_id,
                    result,
                    error,
                } => {
                    self.registry.complete(&invocation_id, result, error);
                }
                HubMessage::StreamInvocation { .. } | HubMessage::CancelInvocation { .. } => {
                    tracing::warn!("ignoring client-to-server message type received from server");
                }
                HubMessage::Ping => {}
                HubMessage::Close { error, allow_reconnect } => {
                    let hub_error = error.map(HubConnectionError::ServerClose);
                    return DispatchOutcome {
                        arm_ack_timer,
                        action: if allow_reconnect.unwrap_or(false) {
                            DispatchAction::CloseWithReconnect(hub_error)
                        } else {
                            DispatchAction::CloseFinal(hub_error)
                        },
                    };
                }
                HubMessage::Ack { sequence_id } => {
                    if let Some(buffer) = self.buffer.as_mut() {
                        buffer.ack(sequence_id);
                    }
                }
                HubMessage::Sequence { sequence_id } => {
                    if let Some(buffer) = self.buffer.as_mut() {
                        if let Err(e) = buffer.reset_sequence(sequence_id) {
                            return DispatchOutcome {
                                arm_ack_timer,
                                action: DispatchAction::CloseFinal(Some(e)),
                            };
                        }
                    }
                }
            }
        }

        DispatchOutcome {
            arm_ack_timer,
            action: DispatchAction::None,
        }
    }

    /// spec §4.3 step 3: wait for the handshake response frame while still
    /// draining the command channel, so a concurrent `on`/`off`/`Send` (or
    /// `stop()`, deferred via `pending_stop_resp`) is not starved.
    async fn await_handshake_response(
        &mut self,
        transport: &mut dyn Transport,
        rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<Payload, HubConnectionError> {
        let deadline = sleep(delay_duration(self.options.server_timeout_ms));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Err(HubConnectionError::Timeout),
                frame = transport.recv() => {
                    return match frame {
                        Ok(Some(payload)) => Ok(payload),
                        Ok(None) => Err(HubConnectionError::Handshake(
                            "connection closed during handshake".to_owned(),
                        )),
                        Err(e) => Err(e),
                    };
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Stop(resp)) => {
                            let err = self.stop_during_start_error.clone().unwrap_or_else(|| {
                                HubConnectionError::Other("connection stopped".to_owned())
                            });
                            self.stop_during_start_error = Some(err);
                            self.pending_stop_resp = Some(resp);
                        }
                        Some(other) => self.handle_command_generic(other).await,
                        None => return Err(HubConnectionError::Other(
                            "connection handle dropped".to_owned(),
                        )),
                    }
                }
            }
        }
    }

    /// spec §4.3 "start()"/`_startInternal`, shared by the first `start()`
    /// and every reconnect attempt. Does not touch `self.state` beyond the
    /// final success transition — callers set `Connecting`/`Reconnecting`
    /// before calling this, matching the documented transition graph (a
    /// reconnect attempt's handshake runs while state is still
    /// `Reconnecting`, never `Connecting`).
    async fn start_internal(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), HubConnectionError> {
        let mut transport = (self.transport_factory)(self.base_url.clone()).await?;
        let features = transport.features();
        // spec §4.3 step 2: downgrade to protocol version 1 when the
        // transport cannot carry reconnection state.
        let version = if features.reconnect {
            self.hub_protocol.version()
        } else {
            1
        };

        transport.start(self.hub_protocol.transfer_format()).await?;

        let handshake_payload = self.handshake_protocol.write_handshake_request(&HandshakeRequestMessage {
            protocol: self.hub_protocol.name().to_owned(),
            version,
        });
        if let Err(e) = transport.send(handshake_payload).await {
            let _ = transport.stop(Some(e.clone())).await;
            return Err(e);
        }

        let raw = match self.await_handshake_response(&mut *transport, rx).await {
            Ok(payload) => payload,
            Err(e) => {
                let _ = transport.stop(Some(e.clone())).await;
                return Err(e);
            }
        };

        let (response, remaining) = match self.handshake_protocol.parse_handshake_response(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = transport.stop(Some(e.clone())).await;
                return Err(e);
            }
        };

        if let Some(err) = response.error {
            let error = HubConnectionError::Handshake(err);
            let _ = transport.stop(Some(error.clone())).await;
            return Err(error);
        }

        // spec §4.3 step 5: a stop() observed during the handshake wait is
        // re-raised here, once the handshake outcome is known either way.
        if let Some(err) = self.stop_during_start_error.take() {
            let _ = transport.stop(Some(err.clone())).await;
            return Err(err);
        }

        // spec §4.3 step 6: wire (or skip) stateful reconnect.
        if features.reconnect {
            let already_buffering = self.buffer.is_some();
            if !already_buffering {
                self.buffer = Some(MessageBuffer::new(
                    self.options.buffer_size_bytes,
                    self.options.ack_coalesce_ms,
                ));
            } else {
                let buffer = self.buffer.as_mut().expect("checked above");
                if let Err(e) = buffer.resend(&mut *transport, self.hub_protocol.as_ref()).await {
                    let _ = transport.stop(Some(e.clone())).await;
                    return Err(e);
                }
            }
        } else {
            self.buffer = None;
        }

        self.connection_id = transport.connection_id();
        self.transport = Some(transport);
        self.connection_started = true;

        if let Some(rest) = remaining {
            let outcome = self.dispatch_inbound(rest).await;
            if !matches!(outcome.action, DispatchAction::None) {
                if let Some(t) = self.transport.as_mut() {
                    let _ = t.stop(None).await;
                }
                self.transport = None;
                return Err(HubConnectionError::Handshake(
                    "connection closed immediately after handshake".to_owned(),
                ));
            }
        }

        Ok(())
    }

    /// spec §4.3 "start()" entry point for the very first connection
    /// attempt (never retried — only a subsequent, already-established
    /// connection's loss goes through the reconnect loop).
    async fn do_start(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) -> Result<(), HubConnectionError> {
        self.set_state(ConnectionState::Connecting);
        self.stop_during_start_error = None;
        self.pending_stop_resp = None;

        let result = self.start_internal(rx).await;
        match &result {
            Ok(()) => self.set_state(ConnectionState::Connected),
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                if let Some(resp) = self.pending_stop_resp.take() {
                    let _ = resp.send(());
                }
            }
        }
        result
    }

    /// spec §4.4 "Reconnect loop".
    async fn reconnect_loop(&mut self, error: Option<HubConnectionError>, rx: &mut mpsc::UnboundedReceiver<Command>) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.disconnected();
        }

        let Some(policy) = self.retry_policy.clone() else {
            self.set_state(ConnectionState::Disconnecting);
            self.complete_close(error).await;
            return;
        };

        let reason = error
            .clone()
            .unwrap_or_else(|| HubConnectionError::Transport("connection lost".to_owned()));
        let Some(mut delay_ms) = policy.next_retry_delay_ms(&RetryContext {
            elapsed_ms: 0,
            previous_retry_count: 0,
            retry_reason: reason,
        }) else {
            self.set_state(ConnectionState::Disconnecting);
            self.complete_close(error).await;
            return;
        };

        self.set_state(ConnectionState::Reconnecting);
        self.fire_onreconnecting(error);
        if self.state != ConnectionState::Reconnecting {
            // A callback called stop() in response; it already finalized.
            return;
        }

        let started_at = Instant::now();
        let mut previous_attempts: u32 = 0;

        loop {
            if !self.wait_out_reconnect_delay(delay_ms, rx).await {
                return; // stopped or the handle was dropped mid-delay
            }
            if self.state != ConnectionState::Reconnecting {
                return;
            }

            match self.start_internal(rx).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    self.fire_onreconnected(self.connection_id.clone());
                    return;
                }
                Err(e) => {
                    if self.pending_stop_resp.is_some() {
                        self.close_after_start_failure(e).await;
                        return;
                    }
                    previous_attempts += 1;
                    let ctx = RetryContext {
                        elapsed_ms: started_at.elapsed().as_millis() as u64,
                        previous_retry_count: previous_attempts,
                        retry_reason: e.clone(),
                    };
                    match policy.next_retry_delay_ms(&ctx) {
                        Some(next) => delay_ms = next,
                        None => {
                            self.close_after_start_failure(e).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sleeps for `delay_ms`, processing other commands as they arrive, and
    /// returns `false` if a `Stop` (or handle drop) ended things early.
    async fn wait_out_reconnect_delay(
        &mut self,
        delay_ms: u64,
        rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let deadline = sleep(delay_duration(delay_ms));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Stop(resp)) => {
                            self.complete_close(None).await;
                            let _ = resp.send(());
                            return false;
                        }
                        Some(other) => self.handle_command_generic(other).await,
                        None => return false,
                    }
                }
            }
        }
    }

    async fn close_after_start_failure(&mut self, error: HubConnectionError) {
        self.complete_close(Some(error)).await;
        if let Some(resp) = self.pending_stop_resp.take() {
            let _ = resp.send(());
        }
    }

    /// spec §4.3 `_connectionClosed(error)`.
    async fn connection_closed(&mut self, error: Option<HubConnectionError>, rx: &mut mpsc::UnboundedReceiver<Command>) {
        match self.state {
            ConnectionState::Disconnecting => self.complete_close(error).await,
            ConnectionState::Connected => self.reconnect_loop(error, rx).await,
            _ => {}
        }
    }

    /// Terminal close: every pending invocation is errored, any buffered
    /// backpressure handle is released with an error, and `onclose` fires
    /// iff the connection had ever successfully started (spec §7 "every
    /// pending invocation continuation is errored exactly once"; spec §3
    /// `connectionStarted` flag).
    async fn complete_close(&mut self, error: Option<HubConnectionError>) {
        let registry_error = error.clone().unwrap_or(HubConnectionError::InvocationCanceled);
        self.registry.close_all(registry_error.clone());
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.dispose(registry_error);
        }
        self.buffer = None;
        self.transport = None;
        let was_started = self.connection_started;
        self.connection_started = false;
        self.connection_id = None;
        self.stop_during_start_error = None;
        self.set_state(ConnectionState::Disconnected);
        if was_started {
            self.fire_onclose(error);
        }
    }

    /// spec §4.5 "Keep-alive & timeout engine" plus §4.6 "Inbound
    /// dispatcher", run while `state == Connected`.
    async fn run_connected(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) -> ConnectedExit {
        let suppress_timeout = self
            .transport
            .as_ref()
            .map(|t| t.features().inherent_keep_alive)
            .unwrap_or(false);

        let mut ping_interval =
            tokio::time::interval(delay_duration(self.options.keep_alive_interval_ms).max(Duration::from_millis(1)));
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_interval.tick().await; // the first tick fires immediately; discard it

        let mut timeout_interval = if suppress_timeout {
            None
        } else {
            let mut iv = tokio::time::interval(
                delay_duration(self.options.server_timeout_ms).max(Duration::from_millis(1)),
            );
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv.tick().await;
            Some(iv)
        };

        let mut ack_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Stop(resp)) => {
                            self.set_state(ConnectionState::Disconnecting);
                            if let Some(t) = self.transport.as_mut() {
                                t.set_reconnect(false);
                                let _ = t.stop(self.stop_during_start_error.clone()).await;
                            }
                            self.complete_close(None).await;
                            let _ = resp.send(());
                            return ConnectedExit::Stopped;
                        }
                        Some(other) => {
                            self.handle_command_generic(other).await;
                            // Approximation of spec §4.5's "outbound resets the
                            // ping timer": any processed command resets it,
                            // not only ones that produced a wire write.
                            ping_interval.reset();
                        }
                        None => {
                            self.set_state(ConnectionState::Disconnecting);
                            if let Some(t) = self.transport.as_mut() {
                                let _ = t.stop(None).await;
                            }
                            self.complete_close(None).await;
                            return ConnectedExit::Stopped;
                        }
                    }
                }

                frame = async {
                    match self.transport.as_mut() {
                        Some(t) => t.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(Some(payload)) => {
                            if let Some(iv) = timeout_interval.as_mut() {
                                iv.reset();
                            }
                            let outcome = self.dispatch_inbound(payload).await;
                            if let Some(duration) = outcome.arm_ack_timer {
                                ack_deadline = Some(Instant::now() + duration);
                            }
                            match outcome.action {
                                DispatchAction::None => {}
                                DispatchAction::CloseWithReconnect(e) => {
                                    if let Some(t) = self.transport.as_mut() {
                                        let _ = t.stop(e.clone()).await;
                                    }
                                    self.transport = None;
                                    return ConnectedExit::TransportLost(e);
                                }
                                DispatchAction::CloseFinal(e) => {
                                    self.set_state(ConnectionState::Disconnecting);
                                    if let Some(t) = self.transport.as_mut() {
                                        let _ = t.stop(e.clone()).await;
                                    }
                                    self.transport = None;
                                    return ConnectedExit::FinalClose(e);
                                }
                            }
                        }
                        Ok(None) => {
                            self.transport = None;
                            return ConnectedExit::TransportLost(None);
                        }
                        Err(e) => {
                            self.transport = None;
                            return ConnectedExit::TransportLost(Some(e));
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    if let Some(t) = self.transport.as_mut() {
                        if let Ok(payload) = self.hub_protocol.write_message(&HubMessage::Ping) {
                            let _ = t.send(payload).await;
                        }
                    }
                }

                _ = async {
                    match timeout_interval.as_mut() {
                        Some(iv) => { iv.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    return ConnectedExit::TransportLost(Some(HubConnectionError::Timeout));
                }

                _ = async {
                    match ack_deadline {
                        Some(d) => sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    ack_deadline = None;
                    if let Some(buffer) = self.buffer.as_mut() {
                        if let Some(ack) = buffer.ack_timer_fired() {
                            if let Some(t) = self.transport.as_mut() {
                                if let Ok(payload) = self.hub_protocol.write_message(&ack) {
                                    let _ = t.send(payload).await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn drive_connected_until_idle(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) {
        loop {
            match self.run_connected(rx).await {
                ConnectedExit::Stopped => return,
                ConnectedExit::FinalClose(err) => {
                    self.complete_close(err).await;
                    return;
                }
                ConnectedExit::TransportLost(err) => {
                    self.connection_closed(err, rx).await;
                    if self.state != ConnectionState::Connected {
                        return;
                    }
                }
            }
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let cmd = match rx.recv().await {
                Some(c) => c,
                None => return,
            };
            match cmd {
                Command::Start(resp) => {
                    if self.state != ConnectionState::Disconnected {
                        let _ = resp.send(Err(HubConnectionError::not_disconnected()));
                        continue;
                    }
                    let result = self.do_start(&mut rx).await;
                    let _ = resp.send(result.clone());
                    if result.is_ok() {
                        self.drive_connected_until_idle(&mut rx).await;
                    }
                }
                Command::Stop(resp) => {
                    let _ = resp.send(());
                }
                other => self.handle_command_generic(other).await,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

impl HubConnectionBuilder {
    /// Spawn the coordinator actor and return a cheap-to-clone handle. A
    /// fresh transport is produced by `transport_factory` for the initial
    /// `start()` and for every later reconnect attempt.
    pub fn build(self, base_url: impl Into<String>, transport_factory: TransportFactory) -> HubConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = crate::state::channel();
        let actor = Actor {
            base_url: base_url.into(),
            transport_factory,
            hub_protocol: self.hub_protocol,
            handshake_protocol: self.handshake_protocol,
            retry_policy: self.retry_policy,
            options: self.options,
            state_tx,
            state: ConnectionState::Disconnected,
            transport: None,
            buffer: None,
            registry: InvocationRegistry::new(),
            handlers: HashMap::new(),
            on_close: Vec::new(),
            on_reconnecting: Vec::new(),
            on_reconnected: Vec::new(),
            connection_started: false,
            connection_id: None,
            stop_during_start_error: None,
            pending_stop_resp: None,
            self_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        HubConnection { tx, state_rx }
    }
}

/// A cheap-to-clone handle to a running hub connection coordinator. Every
/// method is a message send (plus, for request/response operations, an
/// await on the reply) — the actual state lives exclusively in the actor
/// task spawned by `HubConnectionBuilder::build`.
#[derive(Clone)]
pub struct HubConnection {
    tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl HubConnection {
    pub async fn start(&self) -> Result<(), HubConnectionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx.send(Command::Start(resp_tx)).map_err(|_| closed_err())?;
        resp_rx.await.map_err(|_| closed_err())?
    }

    pub async fn stop(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(Command::Stop(resp_tx)).is_ok() {
            let _ = resp_rx.await;
        }
    }

    pub async fn send(&self, target: impl Into<String>, args: Vec<InvocationArg>) -> Result<(), HubConnectionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                target: target.into(),
                args,
                resp: resp_tx,
            })
            .map_err(|_| closed_err())?;
        resp_rx.await.map_err(|_| closed_err())?
    }

    pub async fn invoke(&self, target: impl Into<String>, args: Vec<InvocationArg>) -> Result<Value, HubConnectionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Invoke {
                target: target.into(),
                args,
                resp: resp_tx,
            })
            .map_err(|_| closed_err())?;
        resp_rx.await.map_err(|_| closed_err())?
    }

    pub async fn stream(&self, target: impl Into<String>, args: Vec<InvocationArg>) -> Result<HubStream, HubConnectionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Stream {
                target: target.into(),
                args,
                resp: resp_tx,
            })
            .map_err(|_| closed_err())?;
        let (id, rx) = resp_rx.await.map_err(|_| closed_err())??;
        Ok(HubStream {
            id,
            rx: Some(rx),
            cancel_tx: self.tx.clone(),
        })
    }

    /// Register a handler for server-to-client invocations of `method`
    /// (case-insensitive, spec §4.6).
    ///
    /// Takes the `Arc` directly, and hands it back, rather than wrapping a
    /// plain closure internally: registering the exact same `ClientHandler`
    /// twice is a no-op (spec §8 "`on` called multiple times with the same
    /// instance"), and that can only be checked by identity if the caller
    /// is the one holding the `Arc` — the idiomatic stand-in for JS's
    /// function-reference equality. Wrap a closure once with
    /// `Arc::new(...) as ClientHandler` and keep the result to pass to
    /// `off` later.
    pub fn on(&self, method: impl Into<String>, handler: ClientHandler) -> ClientHandler {
        let _ = self.tx.send(Command::On {
            method: method.into(),
            handler: Arc::clone(&handler),
        });
        handler
    }

    /// Remove one handler (`Some`) or every handler (`None`) registered for
    /// `method`.
    pub fn off(&self, method: impl Into<String>, handler: Option<ClientHandler>) {
        let _ = self.tx.send(Command::Off {
            method: method.into(),
            handler,
        });
    }

    pub fn on_close(&self, cb: impl Fn(Option<HubConnectionError>) + Send + Sync + 'static) {
        let _ = self.tx.send(Command::OnClose(Arc::new(cb)));
    }

    pub fn on_reconnecting(&self, cb: impl Fn(Option<HubConnectionError>) + Send + Sync + 'static) {
        let _ = self.tx.send(Command::OnReconnecting(Arc::new(cb)));
    }

    pub fn on_reconnected(&self, cb: impl Fn(Option<String>) + Send + Sync + 'static) {
        let _ = self.tx.send(Command::OnReconnected(Arc::new(cb)));
    }

    /// Allowed only while Disconnected or Reconnecting (spec §6 user-facing
    /// API table).
    pub async fn set_base_url(&self, url: impl Into<String>) -> Result<(), HubConnectionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::SetBaseUrl(url.into(), resp_tx))
            .map_err(|_| closed_err())?;
        resp_rx.await.map_err(|_| closed_err())?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Observable state stream (spec §3 "Observable via a broadcast
    /// notification stream").
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// A client-to-server-originated, server-to-client stream in progress (spec
/// §4.2/§4.7). Dropping it before exhaustion sends `CancelInvocation`.
pub struct HubStream {
    id: String,
    rx: Option<mpsc::UnboundedReceiver<Result<Value, HubConnectionError>>>,
    cancel_tx: mpsc::UnboundedSender<Command>,
}

impl HubStream {
    pub async fn next(&mut self) -> Option<Result<Value, HubConnectionError>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for HubStream {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(Command::CancelStream(self.id.clone()));
    }
}

impl tokio_stream::Stream for HubStream {
    type Item = Result<Value, HubConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => std::task::Poll::Ready(None),
        }
    }
}
