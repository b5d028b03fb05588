//! Transport contract
//!
//! A transport carries RTVI application messages and media between the
//! client and a bot. `SmallWebRtcTransport` is the peer-to-peer WebRTC
//! implementation; sibling transports that run over a plain byte stream
//! share the same contract and plug a `FrameSerializer` in instead.

pub mod serializer;
pub mod small_webrtc;

pub use serializer::{Frame, FrameSerializer, JsonFrameSerializer};
pub use small_webrtc::SmallWebRtcTransport;

use crate::config::ConnectionParams;
use crate::media::{DeviceInfo, LocalTracks};
use crate::message::RtviMessage;
use crate::webrtc::peer_connection::RemoteTrack;
use crate::webrtc::tracks::StreamType;
use crate::webrtc::WebRTCError;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Initializing,
    Initialized,
    Connecting,
    Connected,
    Ready,
    Disconnecting,
    Error,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Initializing => "initializing",
            TransportState::Initialized => "initialized",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Ready => "ready",
            TransportState::Disconnecting => "disconnecting",
            TransportState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Fatal failure while starting a session
    Start(String),
    /// Network failure recovered by retrying
    TransientNetwork(String),
    /// Malformed or unrecognized payload
    Protocol(String),
    /// Reconnection gave up after the configured number of attempts
    ExhaustedRetries { attempts: u32 },
    /// Capability not implemented by this transport or media source
    Unsupported(String),
    InvalidConfig(String),
    InvalidParams(String),
    InvalidState(String),
    Media(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Start(msg) => write!(f, "Failed to start session: {}", msg),
            TransportError::TransientNetwork(msg) => write!(f, "Network error: {}", msg),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TransportError::ExhaustedRetries { attempts } => {
                write!(f, "Reconnection failed after {} attempts", attempts)
            }
            TransportError::Unsupported(what) => write!(f, "Unsupported operation: {}", what),
            TransportError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            TransportError::InvalidParams(msg) => write!(f, "Invalid connection parameters: {}", msg),
            TransportError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            TransportError::Media(msg) => write!(f, "Media error: {}", msg),
        }
    }
}

impl Error for TransportError {}

impl From<WebRTCError> for TransportError {
    fn from(e: WebRTCError) -> Self {
        match e {
            WebRTCError::ProtocolError(msg) => TransportError::Protocol(msg),
            WebRTCError::MediaError(msg) => TransportError::Media(msg),
            WebRTCError::InvalidState(msg) => TransportError::InvalidState(msg),
            other => TransportError::TransientNetwork(other.to_string()),
        }
    }
}

/// Remote tracks currently received, per stream type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTracks {
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
    pub screen_video: Option<RemoteTrack>,
}

impl RemoteTracks {
    pub fn get(&self, stream: StreamType) -> Option<&RemoteTrack> {
        match stream {
            StreamType::Microphone => self.audio.as_ref(),
            StreamType::Camera => self.video.as_ref(),
            StreamType::ScreenVideo => self.screen_video.as_ref(),
        }
    }

    pub fn set(&mut self, stream: StreamType, track: Option<RemoteTrack>) {
        match stream {
            StreamType::Microphone => self.audio = track,
            StreamType::Camera => self.video = track,
            StreamType::ScreenVideo => self.screen_video = track,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tracks {
    pub local: LocalTracks,
    pub remote: RemoteTracks,
}

/// Handler for inbound application messages
pub type MessageHandler = Arc<dyn Fn(RtviMessage) + Send + Sync>;

/// Notifications raised by a transport. Every method defaults to a no-op.
pub trait TransportCallbacks: Send + Sync {
    fn on_transport_state_changed(&self, _state: TransportState) {}

    fn on_connected(&self) {}

    fn on_disconnected(&self) {}

    fn on_track_started(&self, _stream: StreamType, _track: &RemoteTrack) {}

    fn on_track_stopped(&self, _stream: StreamType, _track: &RemoteTrack) {}

    /// Fatal, non-recoverable errors
    fn on_error(&self, _error: &TransportError) {}
}

/// Callbacks that ignore everything
pub struct NoopCallbacks;

impl TransportCallbacks for NoopCallbacks {}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Install callbacks and the message handler; state becomes `disconnected`
    async fn initialize(&self, callbacks: Arc<dyn TransportCallbacks>, message_handler: MessageHandler);

    async fn init_devices(&self) -> Result<(), TransportError>;

    /// Resolves once the session is usable or fails with `TransportError::Start`
    async fn connect(&self, params: ConnectionParams) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Logged no-op while the message channel is not open
    async fn send_message(&self, message: RtviMessage) -> Result<(), TransportError>;

    async fn send_ready_message(&self) -> Result<(), TransportError>;

    fn state(&self) -> TransportState;

    fn tracks(&self) -> Tracks;

    async fn enable_mic(&self, enabled: bool) -> Result<(), TransportError>;
    async fn enable_cam(&self, enabled: bool) -> Result<(), TransportError>;
    async fn enable_screen_share(&self, enabled: bool) -> Result<(), TransportError>;

    fn is_mic_enabled(&self) -> bool;
    fn is_cam_enabled(&self) -> bool;
    fn is_sharing_screen(&self) -> bool;

    fn get_all_mics(&self) -> Vec<DeviceInfo>;
    fn get_all_cams(&self) -> Vec<DeviceInfo>;
    fn get_all_speakers(&self) -> Vec<DeviceInfo>;

    fn update_mic(&self, device_id: &str) -> Result<(), TransportError>;
    fn update_cam(&self, device_id: &str) -> Result<(), TransportError>;
    fn update_speaker(&self, device_id: &str) -> Result<(), TransportError>;
}
