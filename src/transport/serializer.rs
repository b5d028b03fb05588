//! Frame serialization for byte-stream transports
//!
//! Transports that do not have a DataChannel carry the same application
//! messages and raw audio over a single stream of frames.

use crate::message::RtviMessage;
use crate::transport::TransportError;
use base64::Engine;
use bytes::Bytes;
use log::debug;
use serde::{Deserialize, Serialize};

/// PCM16 audio chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub num_channels: u16,
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio(AudioFrame),
    Message(RtviMessage),
}

pub trait FrameSerializer: Send + Sync {
    fn serialize_message(&self, message: &RtviMessage) -> Result<Bytes, TransportError>;

    fn serialize_audio(
        &self,
        samples: &[i16],
        sample_rate: u32,
        num_channels: u16,
    ) -> Result<Bytes, TransportError>;

    fn deserialize(&self, data: &[u8]) -> Result<Frame, TransportError>;
}

#[derive(Serialize, Deserialize)]
struct AudioEnvelope {
    #[serde(rename = "type")]
    kind: String,
    audio: String,
    sample_rate: u32,
    num_channels: u16,
}

const AUDIO_TYPE: &str = "audio";

/// JSON frames: RTVI messages as-is, audio as base64 little-endian PCM16
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameSerializer;

impl FrameSerializer for JsonFrameSerializer {
    fn serialize_message(&self, message: &RtviMessage) -> Result<Bytes, TransportError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| TransportError::Protocol(format!("Failed to serialize message: {}", e)))
    }

    fn serialize_audio(
        &self,
        samples: &[i16],
        sample_rate: u32,
        num_channels: u16,
    ) -> Result<Bytes, TransportError> {
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let envelope = AudioEnvelope {
            kind: AUDIO_TYPE.to_string(),
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
            sample_rate,
            num_channels,
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| TransportError::Protocol(format!("Failed to serialize audio: {}", e)))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Frame, TransportError> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| TransportError::Protocol(format!("Invalid frame: {}", e)))?;

        if value.get("type").and_then(|t| t.as_str()) == Some(AUDIO_TYPE) {
            let envelope: AudioEnvelope = serde_json::from_value(value)
                .map_err(|e| TransportError::Protocol(format!("Invalid audio frame: {}", e)))?;
            let pcm = base64::engine::general_purpose::STANDARD
                .decode(envelope.audio)
                .map_err(|e| TransportError::Protocol(format!("Invalid audio payload: {}", e)))?;
            if pcm.len() % 2 != 0 {
                return Err(TransportError::Protocol("Odd PCM16 payload length".to_string()));
            }
            let samples = pcm
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            return Ok(Frame::Audio(AudioFrame {
                samples,
                sample_rate: envelope.sample_rate,
                num_channels: envelope.num_channels,
            }));
        }

        let message: RtviMessage = serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("Invalid message frame: {}", e)))?;
        if !message.is_rtvi() {
            debug!("Frame with foreign label {}", message.label);
        }
        Ok(Frame::Message(message))
    }
}
