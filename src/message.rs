//! RTVI application messages
//!
//! Application payloads are opaque to the transport; the only thing it
//! relies on is the `label` field used to tell them apart from signalling.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Label carried by every application message
pub const RTVI_MESSAGE_LABEL: &str = "rtvi-ai";

/// Protocol version announced in `client-ready`
pub const RTVI_PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtviMessage {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
}

impl RtviMessage {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: RTVI_MESSAGE_LABEL.to_string(),
            message_type: message_type.into(),
            data,
        }
    }

    /// Handshake sent once the client is ready to exchange messages
    pub fn client_ready() -> Self {
        Self::new(
            "client-ready",
            json!({
                "version": RTVI_PROTOCOL_VERSION,
                "about": {
                    "library": env!("CARGO_PKG_NAME"),
                    "library_version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )
    }

    pub fn is_rtvi(&self) -> bool {
        self.label == RTVI_MESSAGE_LABEL
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
