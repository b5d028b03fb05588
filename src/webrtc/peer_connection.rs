//! Peer connection abstraction
//!
//! The session driver talks to peer connections only through the traits in
//! this module. Backend callbacks are translated into the closed `PeerEvent`
//! type and pushed into the driver's event queue through a `PeerEventSink`.

use super::session::DriverEvent;
use super::WebRTCError;
use crate::config::IceServerConfig;
use crate::media::LocalTrack;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Label of the single ordered signalling DataChannel
pub const SIGNALLING_CHANNEL_LABEL: &str = "chat";

/// Media kind of an m-line / transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Transceiver direction used by the client slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP text plus its negotiation role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self { sdp_type: SdpType::Offer, sdp }
    }

    pub fn answer(sdp: String) -> Self {
        Self { sdp_type: SdpType::Answer, sdp }
    }
}

/// A locally gathered ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Identity of a track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTrackChange {
    Added,
    Unmuted,
    Muted,
    Ended,
}

/// Remote track notification, tagged with the mid of its transceiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackEvent {
    pub mid: Option<String>,
    pub track: RemoteTrack,
    pub change: RemoteTrackChange,
}

/// Everything a peer connection or its DataChannel can report
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    IceGatheringStateChanged(IceGatheringState),
    IceConnectionStateChanged(IceConnectionState),
    SignalingStateChanged(SignalingState),
    Track(RemoteTrackEvent),
    DataChannelOpen,
    DataChannelMessage(String),
    DataChannelClosed,
}

/// Sender half handed to a backend; stamps events with the generation of
/// the peer connection they belong to.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<DriverEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue an event; dropped silently once the driver is gone.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(DriverEvent::Peer {
            generation: self.generation,
            event,
        });
    }
}

/// Ordered, reliable text channel negotiated inside the peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), WebRTCError>;

    async fn close(&self) -> Result<(), WebRTCError>;
}

/// The subset of an RTCPeerConnection the transport relies on
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Append a transceiver; creation order defines its slot index.
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), WebRTCError>;

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, WebRTCError>;

    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), WebRTCError>;

    fn ice_gathering_state(&self) -> IceGatheringState;

    /// Resolve once ICE gathering reaches `complete`.
    async fn gathering_complete(&self);

    /// Swap the track sent by the transceiver at `slot`.
    async fn replace_track(&self, slot: usize, track: Option<LocalTrack>) -> Result<(), WebRTCError>;

    /// Stop every sender and transceiver, then close the connection.
    async fn close(&self) -> Result<(), WebRTCError>;
}

/// Builds peer connections wired to an event sink
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, WebRTCError>;
}
