//! Stateful-reconnect message buffer (spec §4.1).
//!
//! Owns the sliding window of unacknowledged invocation-family messages on
//! the send side, and the sequence-dedup/ACK-scheduling state on the
//! receive side. Only active when the negotiated transport advertises
//! stateful-reconnect support (spec §6 `TransportFeatures::reconnect`).
//!
//! Timer ownership lives with the coordinator's actor loop, not here —
//! this type is a plain synchronous state machine plus the two spots
//! (`send`, `resend`) that need to touch the transport directly. That
//! keeps the "single logical executor" invariant (spec §5) honest: the
//! actor is the only thing that ever awaits.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::HubConnectionError;
use crate::protocol::{HubMessage, HubProtocol, Payload};
use crate::transport::Transport;

type BackpressureTx = oneshot::Sender<Result<(), HubConnectionError>>;
type BackpressureRx = oneshot::Receiver<Result<(), HubConnectionError>>;

struct BufferedItem {
    payload: Payload,
    local_id: u64,
    size: usize,
    completion: Option<BackpressureTx>,
}

/// What the actor should do after `should_process_message` returns.
#[derive(Debug, Clone, Copy)]
pub struct ShouldProcessOutcome {
    /// Whether the dispatcher should continue routing this message to
    /// handlers/registry.
    pub accept: bool,
    /// `Some(duration)` the first time the ACK-coalesce timer needs arming;
    /// `None` if it's already running or no ACK is owed.
    pub arm_ack_timer: Option<Duration>,
}

pub struct MessageBuffer {
    buffer_size_bytes: usize,
    ack_coalesce_ms: u64,

    // Send side.
    items: VecDeque<BufferedItem>,
    buffered_byte_count: usize,
    total_message_count: u64,
    reconnect_in_progress: bool,

    // Receive side.
    next_receiving_sequence_id: u64,
    latest_received_sequence_id: u64,
    wait_for_sequence_message: bool,
    ack_timer_running: bool,
}

impl MessageBuffer {
    pub fn new(buffer_size_bytes: usize, ack_coalesce_ms: u64) -> Self {
        Self {
            buffer_size_bytes,
            ack_coalesce_ms,
            items: VecDeque::new(),
            buffered_byte_count: 0,
            total_message_count: 0,
            reconnect_in_progress: false,
            next_receiving_sequence_id: 1,
            latest_received_sequence_id: 0,
            wait_for_sequence_message: false,
            ack_timer_running: false,
        }
    }

    pub fn buffered_byte_count(&self) -> usize {
        self.buffered_byte_count
    }

    pub fn is_reconnect_in_progress(&self) -> bool {
        self.reconnect_in_progress
    }

    /// spec §4.1 `send(message)`.
    ///
    /// Returns a backpressure receiver the caller should await *after* this
    /// call returns (it resolves immediately unless backpressure engaged).
    pub async fn send(
        &mut self,
        message: &HubMessage,
        protocol: &dyn HubProtocol,
        mut transport: Option<&mut (dyn Transport + '_)>,
    ) -> Result<Option<BackpressureRx>, HubConnectionError> {
        let payload = protocol.write_message(message)?;

        if !message.is_invocation_family() {
            if let Some(t) = transport.as_deref_mut() {
                t.send(payload).await?;
            }
            return Ok(None);
        }

        self.total_message_count += 1;
        let local_id = self.total_message_count;
        let size = payload.len();
        self.buffered_byte_count += size;

        let mut backpressure_rx = None;
        let completion = if self.buffered_byte_count >= self.buffer_size_bytes {
            let (tx, rx) = oneshot::channel();
            backpressure_rx = Some(rx);
            Some(tx)
        } else {
            None
        };

        self.items.push_back(BufferedItem {
            payload: payload.clone(),
            local_id,
            size,
            completion,
        });

        if !self.reconnect_in_progress {
            if let Some(t) = transport.as_deref_mut() {
                if let Err(e) = t.send(payload).await {
                    tracing::warn!(error = %e, "transport send failed, entering buffered reconnect mode");
                    self.disconnected();
                }
            }
        }

        Ok(backpressure_rx)
    }

    /// spec §4.1 `ack(ackMessage)`.
    pub fn ack(&mut self, sequence_id: u64) {
        while let Some(front) = self.items.front() {
            if front.local_id > sequence_id {
                break;
            }
            let item = self.items.pop_front().expect("front just peeked");
            self.buffered_byte_count -= item.size;
            if let Some(tx) = item.completion {
                let _ = tx.send(Ok(()));
            }
        }

        // Release backpressure on items not yet acknowledged but now within
        // budget. `buffered_byte_count` does not shrink further as handles
        // are released (those bytes are still buffered), so this is a
        // single pass: either the whole remaining window is within budget
        // or none of it is.
        if self.buffered_byte_count < self.buffer_size_bytes {
            for item in self.items.iter_mut() {
                if let Some(tx) = item.completion.take() {
                    let _ = tx.send(Ok(()));
                }
            }
        }
    }

    /// spec §4.1 `shouldProcessMessage(message)`.
    pub fn should_process_message(&mut self, message: &HubMessage) -> ShouldProcessOutcome {
        if self.wait_for_sequence_message {
            if matches!(message, HubMessage::Sequence { .. }) {
                self.wait_for_sequence_message = false;
                return ShouldProcessOutcome {
                    accept: true,
                    arm_ack_timer: None,
                };
            }
            return ShouldProcessOutcome {
                accept: false,
                arm_ack_timer: None,
            };
        }

        if !message.is_invocation_family() {
            return ShouldProcessOutcome {
                accept: true,
                arm_ack_timer: None,
            };
        }

        let current_id = self.next_receiving_sequence_id;
        self.next_receiving_sequence_id += 1;

        if current_id <= self.latest_received_sequence_id {
            let arm = if current_id == self.latest_received_sequence_id {
                self.note_ack_needed()
            } else {
                None
            };
            return ShouldProcessOutcome {
                accept: false,
                arm_ack_timer: arm,
            };
        }

        self.latest_received_sequence_id = current_id;
        let arm = self.note_ack_needed();
        ShouldProcessOutcome {
            accept: true,
            arm_ack_timer: arm,
        }
    }

    fn note_ack_needed(&mut self) -> Option<Duration> {
        if self.ack_timer_running {
            None
        } else {
            self.ack_timer_running = true;
            Some(Duration::from_millis(self.ack_coalesce_ms))
        }
    }

    /// Called by the actor when the ACK-coalesce timer fires. Returns the
    /// Ack message to send, or `None` if a reconnect is in progress (spec
    /// §4.1 "ACK scheduling").
    pub fn ack_timer_fired(&mut self) -> Option<HubMessage> {
        self.ack_timer_running = false;
        if self.reconnect_in_progress {
            None
        } else {
            Some(HubMessage::Ack {
                sequence_id: self.latest_received_sequence_id,
            })
        }
    }

    /// spec §4.1 `resetSequence(SequenceMessage)`.
    pub fn reset_sequence(&mut self, sequence_id: u64) -> Result<(), HubConnectionError> {
        if sequence_id > self.next_receiving_sequence_id {
            return Err(HubConnectionError::SequenceViolation);
        }
        self.next_receiving_sequence_id = sequence_id;
        Ok(())
    }

    /// spec §4.1 `disconnected()`. Also drops any ack-coalesce timer that was
    /// armed on the now-dead transport's connection task, since nothing will
    /// ever call `ack_timer_fired()` for it — otherwise `ack_timer_running`
    /// would stay stuck `true` and `note_ack_needed()` would refuse to arm a
    /// new timer on the next transport for the rest of this buffer's life.
    pub fn disconnected(&mut self) {
        self.reconnect_in_progress = true;
        self.wait_for_sequence_message = true;
        self.ack_timer_running = false;
    }

    /// spec §4.1 `resend()`.
    pub async fn resend(
        &mut self,
        transport: &mut dyn Transport,
        protocol: &dyn HubProtocol,
    ) -> Result<(), HubConnectionError> {
        let base_sequence = self
            .items
            .front()
            .map(|item| item.local_id)
            .unwrap_or(self.total_message_count + 1);

        let sequence_payload = protocol.write_message(&HubMessage::Sequence {
            sequence_id: base_sequence,
        })?;
        transport.send(sequence_payload).await?;

        let snapshot: Vec<Payload> = self.items.iter().map(|item| item.payload.clone()).collect();
        for payload in snapshot {
            transport.send(payload).await?;
        }

        self.reconnect_in_progress = false;
        Ok(())
    }

    /// spec §4.1 `dispose(error)`.
    pub fn dispose(&mut self, error: HubConnectionError) {
        for item in self.items.drain(..) {
            if let Some(tx) = item.completion {
                let _ = tx.send(Err(error.clone()));
            }
        }
        self.buffered_byte_count = 0;
    }
}
