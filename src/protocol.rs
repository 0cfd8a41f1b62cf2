//! Wire message types and the `HubProtocol` / `HandshakeProtocol` contracts
//! (spec §6). The codecs themselves are out of scope — only the trait
//! surface is specified — but a JSON reference implementation is provided
//! here so the coordinator is exercisable in tests without a real transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubConnectionError;

/// Which wire representation a protocol/transport pair negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

/// A framed payload ready to hand to (or received from) a transport.
///
/// `len()` backs the buffer's byte accounting (spec §3, "Buffered byte
/// count").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Invocation-family and control message kinds (spec GLOSSARY).
///
/// Only `Invocation`, `StreamItem`, `Completion`, `StreamInvocation`, and
/// `CancelInvocation` are invocation-family: these participate in sequence
/// numbering and buffering. `Ping`, `Close`, `Ack`, and `Sequence` are
/// control messages and are never buffered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
    Invocation {
        #[serde(skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_ids: Option<Vec<String>>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
    },
    Completion {
        invocation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_ids: Option<Vec<String>>,
    },
    CancelInvocation {
        invocation_id: String,
    },
    Ping,
    Close {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        allow_reconnect: Option<bool>,
    },
    Ack {
        sequence_id: u64,
    },
    Sequence {
        sequence_id: u64,
    },
}

impl HubMessage {
    /// True for the invocation-family messages that participate in sequence
    /// numbering and buffering (spec GLOSSARY).
    pub fn is_invocation_family(&self) -> bool {
        matches!(
            self,
            HubMessage::Invocation { .. }
                | HubMessage::StreamItem { .. }
                | HubMessage::Completion { .. }
                | HubMessage::StreamInvocation { .. }
                | HubMessage::CancelInvocation { .. }
        )
    }

    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            HubMessage::Invocation { invocation_id, .. } => invocation_id.as_deref(),
            HubMessage::StreamItem { invocation_id, .. }
            | HubMessage::Completion { invocation_id, .. }
            | HubMessage::StreamInvocation { invocation_id, .. }
            | HubMessage::CancelInvocation { invocation_id, .. } => Some(invocation_id),
            _ => None,
        }
    }
}

/// Handshake request sent by the client immediately after the transport
/// comes up (spec §4.3 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequestMessage {
    pub protocol: String,
    pub version: i32,
}

/// Handshake response as reported by the server; `error` is `Some` on
/// rejection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandshakeResponseMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Codec contract for hub traffic (spec §6, "HubProtocol contract").
///
/// Implementations are expected to be cheap to share (`Send + Sync`); the
/// coordinator never mutates a protocol instance.
pub trait HubProtocol: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> i32;
    fn transfer_format(&self) -> TransferFormat;
    fn write_message(&self, message: &HubMessage) -> Result<Payload, HubConnectionError>;
    fn parse_messages(&self, data: &Payload) -> Result<Vec<HubMessage>, HubConnectionError>;
}

/// Codec contract for the handshake exchange (spec §6, "HandshakeProtocol
/// contract").
pub trait HandshakeProtocol: Send + Sync {
    fn write_handshake_request(&self, request: &HandshakeRequestMessage) -> Payload;

    /// Returns the parsed response plus any bytes left over after the
    /// handshake frame (a transport may deliver the handshake response and
    /// the start of hub traffic in the same read).
    fn parse_handshake_response(
        &self,
        data: &Payload,
    ) -> Result<(HandshakeResponseMessage, Option<Payload>), HubConnectionError>;
}

// ---------------------------------------------------------------------------
// JSON reference implementation
// ---------------------------------------------------------------------------
//
// SignalR's JSON protocol frames each message with a trailing record
// separator (`\x1e`); a text payload may carry several frames back to back.
// This is reproduced here only so the coordinator has something concrete to
// exercise in tests — a production build would supply its own protocol.

const RECORD_SEPARATOR: char = '\u{1e}';

/// JSON framing of `HubMessage`, one `RECORD_SEPARATOR`-terminated object
/// per frame, matching `rt_protocol`'s "top-level discriminated union"
/// convention but framed the way SignalR's text protocol is.
#[derive(Debug, Default)]
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        "json"
    }

    fn version(&self) -> i32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, message: &HubMessage) -> Result<Payload, HubConnectionError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| HubConnectionError::Protocol(e.to_string()))?;
        json.push(RECORD_SEPARATOR);
        Ok(Payload::Text(json))
    }

    fn parse_messages(&self, data: &Payload) -> Result<Vec<HubMessage>, HubConnectionError> {
        let text = match data {
            Payload::Text(t) => t.as_str(),
            Payload::Binary(_) => {
                return Err(HubConnectionError::Protocol(
                    "json protocol does not accept binary frames".to_owned(),
                ));
            }
        };
        text.split(RECORD_SEPARATOR)
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                serde_json::from_str(frame).map_err(|e| HubConnectionError::Protocol(e.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct JsonHandshakeProtocol;

impl HandshakeProtocol for JsonHandshakeProtocol {
    fn write_handshake_request(&self, request: &HandshakeRequestMessage) -> Payload {
        let mut json = serde_json::to_string(request).expect("handshake request always encodes");
        json.push(RECORD_SEPARATOR);
        Payload::Text(json)
    }

    fn parse_handshake_response(
        &self,
        data: &Payload,
    ) -> Result<(HandshakeResponseMessage, Option<Payload>), HubConnectionError> {
        let text = match data {
            Payload::Text(t) => t.as_str(),
            Payload::Binary(_) => {
                return Err(HubConnectionError::Handshake(
                    "json handshake protocol does not accept binary frames".to_owned(),
                ));
            }
        };
        let Some(sep) = text.find(RECORD_SEPARATOR) else {
            return Err(HubConnectionError::Handshake(
                "incomplete handshake frame".to_owned(),
            ));
        };
        let (frame, rest) = text.split_at(sep);
        let response: HandshakeResponseMessage = serde_json::from_str(frame)
            .map_err(|e| HubConnectionError::Handshake(e.to_string()))?;
        let remaining = &rest[1..]; // skip the separator itself
        let remaining = if remaining.is_empty() {
            None
        } else {
            Some(Payload::Text(remaining.to_owned()))
        };
        Ok((response, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_protocol_round_trips_invocation() {
        let protocol = JsonHubProtocol;
        let message = HubMessage::Invocation {
            invocation_id: Some("0".to_owned()),
            target: "Echo".to_owned(),
            arguments: vec![Value::String("x".to_owned())],
            stream_ids: None,
        };
        let payload = protocol.write_message(&message).unwrap();
        let parsed = protocol.parse_messages(&payload).unwrap();
        assert_eq!(parsed, vec![message]);
    }

    #[test]
    fn json_protocol_parses_multiple_frames_in_one_payload() {
        let protocol = JsonHubProtocol;
        let a = protocol.write_message(&HubMessage::Ping).unwrap();
        let b = protocol
            .write_message(&HubMessage::Completion {
                invocation_id: "1".to_owned(),
                result: None,
                error: None,
            })
            .unwrap();
        let (Payload::Text(mut combined), Payload::Text(b_text)) = (a, b) else {
            unreachable!()
        };
        combined.push_str(&b_text);
        let parsed = protocol.parse_messages(&Payload::Text(combined)).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn handshake_round_trip_keeps_trailing_hub_frame() {
        let handshake = JsonHandshakeProtocol;
        let request = HandshakeRequestMessage {
            protocol: "json".to_owned(),
            version: 1,
        };
        let _ = handshake.write_handshake_request(&request);

        let response = HandshakeResponseMessage { error: None };
        let mut json = serde_json::to_string(&response).unwrap();
        json.push(RECORD_SEPARATOR);
        json.push_str("{\"type\":\"ping\"}\u{1e}");

        let (parsed, remaining) = handshake
            .parse_handshake_response(&Payload::Text(json))
            .unwrap();
        assert!(parsed.error.is_none());
        assert!(remaining.is_some());
    }
}
