//! small-webrtc-transport - WebRTC client transport
//!
//! Peer-to-peer audio/video/data session with a bot: SDP offer/answer over
//! HTTP, trickle ICE batching, a DataChannel for application messages and
//! track-status signalling, and bounded reconnection on ICE failure.

pub mod config;
pub mod media;
pub mod message;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::{Config, ConnectionParams, RequestParams, TransportConfig, TransportSettings};
pub use media::{MediaSource, SlotType, StaticMediaSource};
pub use message::RtviMessage;
pub use transport::{
    SmallWebRtcTransport, Transport, TransportCallbacks, TransportError, TransportState,
};
pub use self::webrtc::{SignallingMessage, WebRTCError};
