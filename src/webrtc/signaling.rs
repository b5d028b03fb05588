//! DataChannel signalling protocol
//!
//! Two disjoint payload shapes share the signalling DataChannel: transport
//! signalling wrapped in a `{"type": "signalling", "message": ...}` envelope,
//! and RTVI application messages identified by their `rtvi-ai` label.

use super::WebRTCError;
use crate::message::{RtviMessage, RTVI_MESSAGE_LABEL};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SIGNALLING_TYPE: &str = "signalling";

/// Transport-level control messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignallingMessage {
    /// Enable state of the local sender at transceiver `receiver_index`
    TrackStatus { receiver_index: usize, enabled: bool },

    /// Remote asks for a fresh offer on the current connection
    Renegotiate,

    /// Remote peer is gone
    PeerLeft,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'a SignallingMessage,
}

impl SignallingMessage {
    /// Serialize inside the signalling envelope
    pub fn to_json(&self) -> Result<String, WebRTCError> {
        serde_json::to_string(&Envelope {
            kind: SIGNALLING_TYPE,
            message: self,
        })
        .map_err(|e| WebRTCError::ProtocolError(format!("Failed to serialize message: {}", e)))
    }
}

/// Classified inbound DataChannel payload
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Signalling(SignallingMessage),
    Application(RtviMessage),
    /// Keep-alive traffic or JSON addressed to someone else
    Ignored,
}

/// Classify one inbound text payload.
///
/// Returns `ProtocolError` for non-JSON text, a broken envelope, an unknown
/// signalling kind or a malformed application message.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, WebRTCError> {
    if text.starts_with("ping") || text.starts_with("pong") {
        return Ok(InboundMessage::Ignored);
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| WebRTCError::ProtocolError(format!("Invalid JSON payload: {}", e)))?;

    if value.get("type").and_then(Value::as_str) == Some(SIGNALLING_TYPE) {
        let message = value
            .get("message")
            .cloned()
            .ok_or_else(|| WebRTCError::ProtocolError("Signalling envelope without message".to_string()))?;
        let message = serde_json::from_value(message)
            .map_err(|e| WebRTCError::ProtocolError(format!("Unrecognized signalling message: {}", e)))?;
        return Ok(InboundMessage::Signalling(message));
    }

    if value.get("label").and_then(Value::as_str) == Some(RTVI_MESSAGE_LABEL) {
        let message = serde_json::from_value(value)
            .map_err(|e| WebRTCError::ProtocolError(format!("Invalid application message: {}", e)))?;
        return Ok(InboundMessage::Application(message));
    }

    Ok(InboundMessage::Ignored)
}
