//! `webrtc` crate backend
//!
//! Implements the peer connection traits on top of `RTCPeerConnection`.
//! Every callback is translated into a `PeerEvent` here and nowhere else.

use super::peer_connection::{
    DataChannel, IceCandidate, IceConnectionState, IceGatheringState, MediaKind, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTrack, RemoteTrackChange,
    RemoteTrackEvent, SdpType, SessionDescription, SignalingState, TransceiverDirection,
};
use super::WebRTCError;
use crate::config::IceServerConfig;
use crate::media::LocalTrack;
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

/// Builds `RTCPeerConnection`s with the default codecs and interceptors
pub struct RtcPeerConnectionFactory {
    api: API,
}

impl RtcPeerConnectionFactory {
    pub fn new() -> Result<Self, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

fn rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, WebRTCError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        install_handlers(&pc, &events);
        debug!("Created RTCPeerConnection (generation {})", events.generation());

        Ok(Arc::new(RtcPeerConnection { pc, events }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!("All ICE candidates gathered");
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(PeerEvent::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match state {
                RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                RTCIceGathererState::Complete => IceGatheringState::Complete,
                _ => IceGatheringState::New,
            };
            sink.emit(PeerEvent::IceGatheringStateChanged(state));
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match state {
                RTCIceConnectionState::Checking => IceConnectionState::Checking,
                RTCIceConnectionState::Connected => IceConnectionState::Connected,
                RTCIceConnectionState::Completed => IceConnectionState::Completed,
                RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                RTCIceConnectionState::Failed => IceConnectionState::Failed,
                RTCIceConnectionState::Closed => IceConnectionState::Closed,
                _ => IceConnectionState::New,
            };
            sink.emit(PeerEvent::IceConnectionStateChanged(state));
        })
    }));

    let sink = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match state {
                RTCSignalingState::Stable => SignalingState::Stable,
                RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
                RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
                RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
                RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
                RTCSignalingState::Closed => SignalingState::Closed,
                _ => return,
            };
            sink.emit(PeerEvent::SignalingStateChanged(state));
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _receiver, transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            let mid = transceiver.mid().map(|m| m.to_string());
            watch_remote_track(track, mid, sink);
        })
    }));
}

/// Remote media counts as muted after this long without RTP
const REMOTE_MUTE_TIMEOUT: Duration = Duration::from_secs(3);

/// Report a remote track and follow it until its RTP stream ends.
///
/// Packets flowing means unmuted; a gap of `REMOTE_MUTE_TIMEOUT` means muted.
fn watch_remote_track(track: Arc<TrackRemote>, mid: Option<String>, sink: PeerEventSink) {
    let remote = RemoteTrack {
        id: track.id(),
        kind: match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        },
    };
    let emit = move |change: RemoteTrackChange| {
        sink.emit(PeerEvent::Track(RemoteTrackEvent {
            mid: mid.clone(),
            track: remote.clone(),
            change,
        }))
    };
    emit(RemoteTrackChange::Added);

    tokio::spawn(async move {
        let mut unmuted = false;
        loop {
            match tokio::time::timeout(REMOTE_MUTE_TIMEOUT, track.read_rtp()).await {
                Ok(Ok(_)) => {
                    if !unmuted {
                        unmuted = true;
                        emit(RemoteTrackChange::Unmuted);
                    }
                }
                Ok(Err(e)) => {
                    debug!("Remote track {} ended: {}", track.id(), e);
                    break;
                }
                Err(_) => {
                    if unmuted {
                        unmuted = false;
                        emit(RemoteTrackChange::Muted);
                    }
                }
            }
        }
        emit(RemoteTrackChange::Ended);
    });
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, WebRTCError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| WebRTCError::SdpError(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Option<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(desc.sdp)),
        _ => None,
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), WebRTCError> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        let direction = match direction {
            TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        };

        self.pc
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} transceiver: {}", kind.as_str(), e)))?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, WebRTCError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| WebRTCError::DataChannelError(format!("Failed to create data channel: {}", e)))?;

        let sink = self.events.clone();
        dc.on_open(Box::new(move || {
            sink.emit(PeerEvent::DataChannelOpen);
            Box::pin(async {})
        }));

        let sink = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                if !msg.is_string {
                    debug!("Ignoring binary DataChannel message ({} bytes)", msg.data.len());
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => sink.emit(PeerEvent::DataChannelMessage(text)),
                    Err(e) => warn!("Non UTF-8 DataChannel text: {}", e),
                }
            })
        }));

        let sink = self.events.clone();
        dc.on_close(Box::new(move || {
            sink.emit(PeerEvent::DataChannelClosed);
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcDataChannel {
            label: label.to_string(),
            dc,
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc_description)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        match self.pc.ice_gathering_state() {
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
            _ => IceGatheringState::New,
        }
    }

    async fn gathering_complete(&self) {
        if self.ice_gathering_state() == IceGatheringState::Complete {
            return;
        }
        let mut done = self.pc.gathering_complete_promise().await;
        let _ = done.recv().await;
    }

    async fn replace_track(&self, slot: usize, track: Option<LocalTrack>) -> Result<(), WebRTCError> {
        let transceivers = self.pc.get_transceivers().await;
        let transceiver = transceivers
            .get(slot)
            .ok_or_else(|| WebRTCError::MediaError(format!("No transceiver at index {}", slot)))?;

        transceiver
            .sender()
            .await
            .replace_track(track)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to replace track {}: {}", slot, e)))
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        let senders = self.pc.get_senders().await;
        for result in join_all(senders.iter().map(|s| s.stop())).await {
            if let Err(e) = result {
                debug!("Sender stop: {}", e);
            }
        }

        let transceivers = self.pc.get_transceivers().await;
        for result in join_all(transceivers.iter().map(|t| t.stop())).await {
            if let Err(e) = result {
                debug!("Transceiver stop: {}", e);
            }
        }

        self.pc
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Close failed: {}", e)))
    }
}

struct RtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), WebRTCError> {
        self.dc
            .send_text(text)
            .await
            .map_err(|e| WebRTCError::DataChannelError(format!("Send failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.dc
            .close()
            .await
            .map_err(|e| WebRTCError::DataChannelError(format!("Close failed: {}", e)))
    }
}
