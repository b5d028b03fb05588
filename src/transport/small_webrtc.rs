//! Peer-to-peer WebRTC transport
//!
//! Public face of the session driver. Every call goes through the driver
//! lock; `connect` waits for the signalling channel outside of it so the
//! event pump can make progress.

use super::{MessageHandler, Tracks, Transport, TransportCallbacks, TransportError, TransportState};
use crate::config::{ConnectionParams, TransportSettings};
use crate::media::{DeviceInfo, MediaSource, SlotType};
use crate::message::RtviMessage;
use crate::webrtc::endpoint::{HttpSignalingEndpoint, SignalingEndpoint};
use crate::webrtc::negotiation::NegotiationPhase;
use crate::webrtc::peer_connection::PeerConnectionFactory;
use crate::webrtc::rtc_backend::RtcPeerConnectionFactory;
use crate::webrtc::session::{spawn_event_pump, DriverEvent, SessionDriver, TransportStatus};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub struct SmallWebRtcTransport {
    driver: Arc<Mutex<SessionDriver>>,
    status: Arc<RwLock<TransportStatus>>,
    media: Arc<dyn MediaSource>,
    events: mpsc::UnboundedSender<DriverEvent>,
    pump: JoinHandle<()>,
}

impl SmallWebRtcTransport {
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: TransportSettings,
        factory: Arc<dyn PeerConnectionFactory>,
        endpoint: Arc<dyn SignalingEndpoint>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(TransportStatus::default()));
        let driver = Arc::new(Mutex::new(SessionDriver::new(
            settings,
            factory,
            endpoint,
            media.clone(),
            events.clone(),
            status.clone(),
        )));
        let pump = spawn_event_pump(Arc::downgrade(&driver), rx);

        Self {
            driver,
            status,
            media,
            events,
            pump,
        }
    }

    /// Transport backed by the `webrtc` crate and the HTTP offer endpoint
    pub fn with_webrtc(
        settings: TransportSettings,
        media: Arc<dyn MediaSource>,
    ) -> Result<Self, TransportError> {
        let factory = RtcPeerConnectionFactory::new()?;
        Ok(Self::new(
            settings,
            Arc::new(factory),
            Arc::new(HttpSignalingEndpoint::new()),
            media,
        ))
    }

    /// `connect` with loosely-typed parameters, normalized first.
    pub async fn connect_with_value(&self, params: &Value) -> Result<(), TransportError> {
        let start_endpoint = self.driver.lock().await.settings().start_endpoint.clone();
        let params = ConnectionParams::from_value(params, start_endpoint.as_ref())?;
        self.connect(params).await
    }

    pub fn status(&self) -> TransportStatus {
        self.status.read().clone()
    }

    pub async fn negotiation_phase(&self) -> Option<NegotiationPhase> {
        self.driver.lock().await.negotiation_phase()
    }

    /// Takes effect on the next offer.
    pub async fn set_audio_codec(&self, codec: Option<String>) -> Result<(), TransportError> {
        self.driver.lock().await.set_audio_codec(codec)
    }

    /// Takes effect on the next offer.
    pub async fn set_video_codec(&self, codec: Option<String>) -> Result<(), TransportError> {
        self.driver.lock().await.set_video_codec(codec)
    }

    async fn sync_slot(&self, slot: SlotType) {
        self.driver.lock().await.send_slot_status(slot).await;
    }
}

impl Drop for SmallWebRtcTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl Transport for SmallWebRtcTransport {
    async fn initialize(&self, callbacks: Arc<dyn TransportCallbacks>, message_handler: MessageHandler) {
        self.driver.lock().await.set_callbacks(callbacks, message_handler);

        let events = self.events.clone();
        self.media.on_track_changed(Arc::new(move |slot, track| {
            let _ = events.send(DriverEvent::LocalTrackChanged { slot, track });
        }));
        debug!("Transport initialized");
    }

    async fn init_devices(&self) -> Result<(), TransportError> {
        let mut driver = self.driver.lock().await;
        driver.set_state(TransportState::Initializing);
        if let Err(e) = self.media.initialize().await {
            driver.set_state(TransportState::Error);
            return Err(e);
        }
        driver.set_state(TransportState::Initialized);
        Ok(())
    }

    async fn connect(&self, params: ConnectionParams) -> Result<(), TransportError> {
        let connected = {
            let mut driver = self.driver.lock().await;
            let request = params.request.or_else(|| driver.settings().request.clone());
            let ice_servers = params
                .ice_servers
                .unwrap_or_else(|| driver.settings().ice_servers.clone());
            driver.start(request, ice_servers).await?
        };

        let result = connected.await.unwrap_or_else(|_| {
            Err(TransportError::Start("Transport dropped while connecting".to_string()))
        });
        if result.is_ok() {
            info!("Transport connected");
        }
        result
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.driver.lock().await.shutdown().await;
        Ok(())
    }

    async fn send_message(&self, message: RtviMessage) -> Result<(), TransportError> {
        self.driver.lock().await.send_message(&message).await;
        Ok(())
    }

    async fn send_ready_message(&self) -> Result<(), TransportError> {
        self.driver.lock().await.send_ready_message().await;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.status.read().state
    }

    fn tracks(&self) -> Tracks {
        Tracks {
            local: self.media.tracks(),
            remote: self.status.read().remote_tracks.clone(),
        }
    }

    async fn enable_mic(&self, enabled: bool) -> Result<(), TransportError> {
        self.media.enable_mic(enabled);
        self.sync_slot(SlotType::Audio).await;
        Ok(())
    }

    async fn enable_cam(&self, enabled: bool) -> Result<(), TransportError> {
        self.media.enable_cam(enabled);
        self.sync_slot(SlotType::Video).await;
        Ok(())
    }

    async fn enable_screen_share(&self, enabled: bool) -> Result<(), TransportError> {
        if !self.media.supports_screen_share() {
            return Err(TransportError::Unsupported(
                "Screen sharing is not supported by this media source".to_string(),
            ));
        }
        self.media.enable_screen_share(enabled).await?;
        self.sync_slot(SlotType::ScreenVideo).await;
        Ok(())
    }

    fn is_mic_enabled(&self) -> bool {
        self.media.is_mic_enabled()
    }

    fn is_cam_enabled(&self) -> bool {
        self.media.is_cam_enabled()
    }

    fn is_sharing_screen(&self) -> bool {
        self.media.is_sharing_screen()
    }

    fn get_all_mics(&self) -> Vec<DeviceInfo> {
        self.media.get_all_mics()
    }

    fn get_all_cams(&self) -> Vec<DeviceInfo> {
        self.media.get_all_cams()
    }

    fn get_all_speakers(&self) -> Vec<DeviceInfo> {
        self.media.get_all_speakers()
    }

    fn update_mic(&self, device_id: &str) -> Result<(), TransportError> {
        self.media.update_mic(device_id)
    }

    fn update_cam(&self, device_id: &str) -> Result<(), TransportError> {
        self.media.update_cam(device_id)
    }

    fn update_speaker(&self, device_id: &str) -> Result<(), TransportError> {
        self.media.update_speaker(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestParams;
    use crate::media::{LocalTrack, StaticMediaSource};
    use crate::webrtc::peer_connection::{
        IceCandidate, IceConnectionState, IceGatheringState, MediaKind, PeerEvent, RemoteTrack,
        RemoteTrackChange, RemoteTrackEvent, SignalingState, TransceiverDirection,
    };
    use crate::webrtc::testing::{FakeEndpoint, FakeFactory, FakePeerConnection, RecordingCallbacks};
    use crate::webrtc::tracks::StreamType;
    use std::time::Duration;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    struct Harness {
        transport: SmallWebRtcTransport,
        factory: Arc<FakeFactory>,
        endpoint: Arc<FakeEndpoint>,
        media: Arc<StaticMediaSource>,
        callbacks: Arc<RecordingCallbacks>,
        received: Arc<parking_lot::Mutex<Vec<RtviMessage>>>,
    }

    fn settings() -> TransportSettings {
        TransportSettings {
            request: Some(RequestParams::new("http://bot.local/api/offer")),
            ..TransportSettings::default()
        }
    }

    async fn harness_with(settings: TransportSettings, media: StaticMediaSource) -> Harness {
        let factory = FakeFactory::new();
        let endpoint = FakeEndpoint::new();
        let media = Arc::new(media);
        let callbacks = RecordingCallbacks::new();
        let received: Arc<parking_lot::Mutex<Vec<RtviMessage>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let transport = SmallWebRtcTransport::new(settings, factory.clone(), endpoint.clone(), media.clone());
        let sink = received.clone();
        transport
            .initialize(callbacks.clone(), Arc::new(move |message: RtviMessage| sink.lock().push(message)))
            .await;

        Harness {
            transport,
            factory,
            endpoint,
            media,
            callbacks,
            received,
        }
    }

    async fn harness(media: StaticMediaSource) -> Harness {
        harness_with(settings(), media).await
    }

    async fn connected(media: StaticMediaSource) -> Harness {
        let h = harness(media).await;
        h.transport.connect(ConnectionParams::default()).await.unwrap();
        h
    }

    /// Let the event pump drain without reaching any timer
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host", n, n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn track_event(id: &str, mid: &str, change: RemoteTrackChange) -> PeerEvent {
        PeerEvent::Track(RemoteTrackEvent {
            mid: Some(mid.to_string()),
            track: RemoteTrack {
                id: id.to_string(),
                kind: MediaKind::Audio,
            },
            change,
        })
    }

    fn track_status(index: usize, enabled: bool) -> String {
        format!(
            r#"{{"type":"signalling","message":{{"type":"trackStatus","receiver_index":{},"enabled":{}}}}}"#,
            index, enabled
        )
    }

    fn signalling(kind: &str) -> PeerEvent {
        PeerEvent::DataChannelMessage(format!(
            r#"{{"type":"signalling","message":{{"type":"{}"}}}}"#,
            kind
        ))
    }

    fn opus_track(id: &str) -> LocalTrack {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            "local".to_owned(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_syncs_track_status_before_messages() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        assert_eq!(h.transport.state(), TransportState::Connected);

        h.transport.send_ready_message().await.unwrap();

        let sent = h.factory.pc(0).channel().sent_messages();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], track_status(0, true));
        assert_eq!(sent[1], track_status(1, false));
        assert!(sent[2].contains(r#""type":"client-ready""#));

        assert_eq!(
            h.callbacks.states(),
            vec![TransportState::Connecting, TransportState::Connected, TransportState::Ready]
        );
        assert_eq!(h.callbacks.connected_count(), 1);

        let offers = h.endpoint.offers();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].session_id, None);
        assert!(!offers[0].restart_session);
        assert_eq!(h.transport.status().session_id.as_deref(), Some("session-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn transceivers_are_created_in_slot_order() {
        let h = connected(StaticMediaSource::new(true, true).with_screen_share(true)).await;
        assert_eq!(
            h.factory.pc(0).transceivers(),
            vec![
                (MediaKind::Audio, TransceiverDirection::SendRecv),
                (MediaKind::Video, TransceiverDirection::SendRecv),
                (MediaKind::Video, TransceiverDirection::SendOnly),
            ]
        );
        assert_eq!(h.factory.pc(0).channel().sent_messages()[2], track_status(2, false));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_endpoint_is_a_start_error() {
        let h = harness_with(TransportSettings::default(), StaticMediaSource::new(true, false)).await;
        let result = h.transport.connect(ConnectionParams::default()).await;
        assert!(matches!(result, Err(TransportError::Start(_))));
        assert!(h.factory.created().is_empty());
        assert_eq!(h.transport.state(), TransportState::Error);
        assert_eq!(h.callbacks.states(), vec![TransportState::Connecting, TransportState::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_params_override_configured_endpoint() {
        let h = harness_with(TransportSettings::default(), StaticMediaSource::new(true, false)).await;
        h.transport
            .connect_with_value(&serde_json::json!({ "webrtc_url": "http://other/api/offer" }))
            .await
            .unwrap();
        assert_eq!(h.transport.state(), TransportState::Connected);

        let h = harness(StaticMediaSource::new(true, false)).await;
        let result = h.transport.connect_with_value(&serde_json::json!({ "roomUrl": "x" })).await;
        assert!(matches!(result, Err(TransportError::InvalidParams(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn first_negotiation_failure_is_fatal() {
        let h = harness(StaticMediaSource::new(true, false)).await;
        h.endpoint.fail_next(1);

        let result = h.transport.connect(ConnectionParams::default()).await;
        assert!(matches!(result, Err(TransportError::Start(_))));
        assert_eq!(h.transport.state(), TransportState::Error);
        settle().await;
        assert!(h.factory.pc(0).is_closed());

        // a fresh connect from the error state works
        h.transport.connect(ConnectionParams::default()).await.unwrap();
        assert_eq!(h.transport.state(), TransportState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_rejected() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let result = h.transport.connect(ConnectionParams::default()).await;
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
        assert_eq!(h.factory.created().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_are_batched_per_flush_window() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let pc = h.factory.pc(0);
        for n in 1..=5 {
            pc.emit(PeerEvent::IceCandidate(candidate(n)));
        }
        settle().await;
        assert!(h.endpoint.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let batches = h.endpoint.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].session_id, "session-1");
        let sent: Vec<_> = batches[0].candidates.iter().map(|c| c.candidate.clone()).collect();
        let expected: Vec<_> = (1..=5).map(|n| candidate(n).candidate).collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_wait_for_the_first_answer() {
        let h = harness(StaticMediaSource::new(true, false)).await;
        h.endpoint.hold();

        let (result, _) = tokio::join!(h.transport.connect(ConnectionParams::default()), async {
            settle().await;
            let pc = h.factory.pc(0);
            for n in 1..=3 {
                pc.emit(PeerEvent::IceCandidate(candidate(n)));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(h.endpoint.batches().is_empty());
            h.endpoint.release();
        });
        result.unwrap();
        settle().await;

        let batches = h.endpoint.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].candidates.len(), 3);
        assert_eq!(batches[0].session_id, "session-1");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_candidate_batch_is_not_retried() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let pc = h.factory.pc(0);
        h.endpoint.fail_candidates(true);

        pc.emit(PeerEvent::IceCandidate(candidate(1)));
        pc.emit(PeerEvent::IceCandidate(candidate(2)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.endpoint.batches().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.endpoint.batches().len(), 1);
        assert_eq!(h.transport.state(), TransportState::Connected);
        assert_eq!(h.factory.created().len(), 1);

        // the rejected candidates are gone from the queue
        h.endpoint.fail_candidates(false);
        pc.emit(PeerEvent::IceCandidate(candidate(3)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        let batches = h.endpoint.batches();
        assert_eq!(batches.len(), 2);
        let sent: Vec<_> = batches[1].candidates.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(sent, vec![candidate(3).candidate]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnection_is_bounded() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        h.endpoint.fail_next(10);

        h.factory.pc(0).emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Failed));
        tokio::time::sleep(Duration::from_secs(10)).await;

        // the original connection plus exactly three replacements
        assert_eq!(h.factory.created().len(), 4);
        let offers = h.endpoint.offers();
        assert_eq!(offers.len(), 4);
        for offer in &offers[1..] {
            assert_eq!(offer.session_id.as_deref(), Some("session-1"));
            assert!(offer.restart_session);
        }

        assert_eq!(h.transport.state(), TransportState::Disconnected);
        assert_eq!(h.callbacks.disconnected_count(), 1);
        assert_eq!(h.callbacks.errors(), vec![TransportError::ExhaustedRetries { attempts: 3 }]);
        assert!(h.factory.created().iter().all(|pc| pc.is_closed()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.factory.created().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stabilization_resets_attempt_count() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        h.endpoint.fail_next(10);

        let pc = h.factory.pc(0);
        pc.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Failed));
        settle().await;
        tokio::time::sleep(Duration::from_millis(2001)).await;
        assert_eq!(h.transport.status().reconnection_attempts, 2);

        h.endpoint.fail_next(0);
        pc.emit(PeerEvent::SignalingStateChanged(SignalingState::Stable));
        settle().await;
        assert_eq!(h.transport.status().reconnection_attempts, 0);

        h.endpoint.hold();
        pc.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Failed));
        settle().await;
        assert_eq!(h.transport.status().reconnection_attempts, 1);

        h.endpoint.release();
        settle().await;
        assert_eq!(h.transport.status().active_generation, Some(4));
        assert_eq!(h.transport.state(), TransportState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_swaps_only_after_negotiation() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let old = h.factory.pc(0);
        old.emit(track_event("bot-audio", "0", RemoteTrackChange::Added));
        old.emit(track_event("bot-audio", "0", RemoteTrackChange::Unmuted));
        settle().await;

        h.endpoint.hold();
        old.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Failed));
        settle().await;

        let status = h.transport.status();
        assert_eq!(status.active_generation, Some(1));
        assert_eq!(status.pending_generation, Some(2));
        assert!(!old.is_closed());
        assert!(h.transport.tracks().remote.audio.is_some());

        h.endpoint.release();
        settle().await;

        let status = h.transport.status();
        assert_eq!(status.active_generation, Some(2));
        assert_eq!(status.pending_generation, None);
        assert_eq!(status.session_id.as_deref(), Some("session-2"));
        assert!(old.is_closed());
        assert!(h.transport.tracks().remote.audio.is_none());
        assert_eq!(h.callbacks.stopped(), vec![(StreamType::Microphone, "bot-audio".to_string())]);

        let offers = h.endpoint.offers();
        assert_eq!(offers[1].session_id.as_deref(), Some("session-1"));
        assert!(offers[1].restart_session);

        // the new connection syncs track status on its own channel
        let replacement = h.factory.pc(1);
        assert_eq!(
            replacement.channel().sent_messages(),
            vec![track_status(0, true), track_status(1, false)]
        );
        assert_eq!(h.callbacks.connected_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_ice_recovers_within_grace() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let pc = h.factory.pc(0);

        pc.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
        tokio::time::sleep(Duration::from_secs(2)).await;
        pc.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.factory.created().len(), 1);

        pc.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(h.factory.created().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn renegotiate_request_reuses_connection() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        h.factory.pc(0).emit(signalling("renegotiate"));
        settle().await;

        assert_eq!(h.factory.created().len(), 1);
        let offers = h.endpoint.offers();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[1].session_id.as_deref(), Some("session-1"));
        assert!(!offers[1].restart_session);
        assert_eq!(h.transport.status().session_id.as_deref(), Some("session-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn gathering_complete_while_checking_renegotiates_in_place() {
        let h = harness_with(
            TransportSettings {
                wait_for_ice_gathering: true,
                ..settings()
            },
            StaticMediaSource::new(true, false),
        )
        .await;
        h.transport.connect(ConnectionParams::default()).await.unwrap();

        let pc = h.factory.pc(0);
        pc.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Checking));
        pc.emit(PeerEvent::IceGatheringStateChanged(IceGatheringState::Complete));
        settle().await;

        assert_eq!(h.factory.created().len(), 1);
        let offers = h.endpoint.offers();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[1].session_id.as_deref(), Some("session-1"));
        assert!(!offers[1].restart_session);
        assert_eq!(h.transport.state(), TransportState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn gathering_complete_is_ignored_without_waiting_for_gathering() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let pc = h.factory.pc(0);
        pc.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Checking));
        pc.emit(PeerEvent::IceGatheringStateChanged(IceGatheringState::Complete));
        settle().await;

        assert_eq!(h.factory.created().len(), 1);
        assert_eq!(h.endpoint.offers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_stops_when_channel_closes() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let pc = h.factory.pc(0);
        let pings = |pc: &FakePeerConnection| {
            pc.channel().sent().iter().filter(|s| s.starts_with("ping: ")).count()
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(pings(&pc), 2);

        pc.emit(PeerEvent::DataChannelClosed);
        settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pings(&pc), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_waits_for_channel_opened_after_answer() {
        let h = harness(StaticMediaSource::new(true, false)).await;
        h.factory.set_auto_open(false);

        let (result, _) = tokio::join!(h.transport.connect(ConnectionParams::default()), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let pc = h.factory.pc(0);
            assert!(pc.remote_description().is_some());
            assert_eq!(h.transport.state(), TransportState::Connecting);
            assert_eq!(h.callbacks.connected_count(), 0);
            assert!(pc.channel().sent().is_empty());

            pc.channel().set_open(true);
            pc.emit(PeerEvent::DataChannelOpen);
        });
        result.unwrap();

        assert_eq!(h.transport.state(), TransportState::Connected);
        assert_eq!(h.callbacks.connected_count(), 1);
        assert_eq!(
            h.factory.pc(0).channel().sent_messages(),
            vec![track_status(0, true), track_status(1, false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn peer_left_disconnects() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        h.factory.pc(0).emit(signalling("peerLeft"));
        settle().await;

        assert_eq!(h.transport.state(), TransportState::Disconnected);
        assert_eq!(h.callbacks.disconnected_count(), 1);
        assert!(h.factory.pc(0).is_closed());
        assert!(h.callbacks.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_reach_the_handler() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let pc = h.factory.pc(0);
        let message = RtviMessage::new("bot-ready", serde_json::json!({ "version": "1.0.0" }));

        pc.emit(PeerEvent::DataChannelMessage(message.to_json().unwrap()));
        pc.emit(PeerEvent::DataChannelMessage("pong: 1".to_string()));
        pc.emit(signalling("bogus"));
        pc.emit(PeerEvent::DataChannelMessage("not json".to_string()));
        settle().await;

        let received = h.received.lock().clone();
        assert_eq!(received, vec![message]);
        assert_eq!(h.transport.state(), TransportState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_track_mute_lifecycle() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let pc = h.factory.pc(0);

        pc.emit(track_event("bot-audio", "0", RemoteTrackChange::Added));
        settle().await;
        assert!(h.transport.tracks().remote.audio.is_some());

        pc.emit(track_event("bot-audio", "0", RemoteTrackChange::Unmuted));
        pc.emit(track_event("bot-audio", "0", RemoteTrackChange::Muted));
        pc.emit(track_event("bot-audio", "0", RemoteTrackChange::Ended));
        settle().await;

        let expected = vec![(StreamType::Microphone, "bot-audio".to_string())];
        assert_eq!(h.callbacks.started(), expected);
        assert_eq!(h.callbacks.stopped(), expected);
        assert!(h.transport.tracks().remote.audio.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn device_toggles_send_one_status() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        let channel = h.factory.pc(0).channel();

        h.transport.enable_mic(false).await.unwrap();
        h.transport.enable_cam(true).await.unwrap();
        assert!(!h.transport.is_mic_enabled());
        assert!(h.transport.is_cam_enabled());

        let sent = channel.sent_messages();
        assert_eq!(&sent[2..], &[track_status(0, false), track_status(1, true)]);

        let result = h.transport.enable_screen_share(true).await;
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn local_track_change_replaces_sender_track() {
        let h = connected(StaticMediaSource::new(true, false)).await;

        h.media.set_track(SlotType::Audio, Some(opus_track("mic-2")));
        h.media.set_track(SlotType::ScreenAudio, Some(opus_track("screen-audio")));
        settle().await;

        assert_eq!(h.factory.pc(0).replaced(), vec![(0, Some("mic-2".to_string()))]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_tears_down_once() {
        let h = connected(StaticMediaSource::new(true, false)).await;
        h.transport.disconnect().await.unwrap();
        h.transport.disconnect().await.unwrap();

        assert_eq!(h.transport.state(), TransportState::Disconnected);
        assert_eq!(h.callbacks.disconnected_count(), 1);
        assert_eq!(
            &h.callbacks.states()[2..],
            &[TransportState::Disconnecting, TransportState::Disconnected]
        );
        assert!(h.factory.pc(0).is_closed());

        h.transport.send_message(RtviMessage::client_ready()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn init_devices_walks_through_initializing() {
        let h = harness(StaticMediaSource::new(true, false)).await;
        h.transport.init_devices().await.unwrap();
        assert_eq!(
            h.callbacks.states(),
            vec![TransportState::Initializing, TransportState::Initialized]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn codec_preference_filters_the_offer() {
        let h = harness(StaticMediaSource::new(true, false)).await;
        h.transport.set_audio_codec(Some("opus".to_string())).await.unwrap();
        h.transport.connect(ConnectionParams::default()).await.unwrap();

        let sdp = &h.endpoint.offers()[0].sdp;
        assert!(sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 96\r\n"));
        assert!(!sdp.contains("PCMU"));
    }
}
