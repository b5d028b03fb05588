//! In-memory peer connection, endpoint and callback doubles for tests

use super::endpoint::{AnswerResponse, CandidateBatch, OfferRequest, SignalingEndpoint};
use super::peer_connection::{
    DataChannel, IceGatheringState, MediaKind, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, SdpType, SessionDescription, SignalingState, TransceiverDirection,
};
use super::tracks::StreamType;
use super::WebRTCError;
use crate::config::{IceServerConfig, RequestParams};
use crate::media::LocalTrack;
use crate::transport::{TransportCallbacks, TransportError, TransportState};
use crate::webrtc::peer_connection::RemoteTrack;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub const TEST_OFFER_SDP: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:96 rtx/48000\r\n\
a=fmtp:96 apt=111\r\n\
a=sendrecv\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 H264/90000\r\n\
a=sendrecv\r\n";

pub struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl FakeDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Sent payloads other than keep-alive pings
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent().into_iter().filter(|s| !s.starts_with("ping")).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), WebRTCError> {
        if !self.is_open() {
            return Err(WebRTCError::DataChannelError("closed".to_string()));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Peer connection that completes every step immediately. Applying the
/// answer reports `stable` and, unless disabled, opens the channel.
pub struct FakePeerConnection {
    sink: Option<PeerEventSink>,
    channel: Arc<FakeDataChannel>,
    transceivers: Mutex<Vec<(MediaKind, TransceiverDirection)>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    replaced: Mutex<Vec<(usize, Option<String>)>>,
    hold_gathering: AtomicBool,
    auto_open: AtomicBool,
    closed: AtomicBool,
}

impl FakePeerConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn with_sink(sink: PeerEventSink) -> Arc<Self> {
        Arc::new(Self::build(Some(sink)))
    }

    fn build(sink: Option<PeerEventSink>) -> Self {
        Self {
            sink,
            channel: FakeDataChannel::new("chat"),
            transceivers: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            replaced: Mutex::new(Vec::new()),
            hold_gathering: AtomicBool::new(false),
            auto_open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    pub fn channel(&self) -> Arc<FakeDataChannel> {
        self.channel.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn transceivers(&self) -> Vec<(MediaKind, TransceiverDirection)> {
        self.transceivers.lock().clone()
    }

    /// Track ids handed to `replace_track`, by slot
    pub fn replaced(&self) -> Vec<(usize, Option<String>)> {
        self.replaced.lock().clone()
    }

    /// Never report gathering complete
    pub fn hold_gathering(&self) {
        self.hold_gathering.store(true, Ordering::SeqCst);
    }

    pub fn set_auto_open(&self, auto_open: bool) {
        self.auto_open.store(auto_open, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), WebRTCError> {
        self.transceivers.lock().push((kind, direction));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, WebRTCError> {
        assert_eq!(label, self.channel.label());
        Ok(self.channel.clone())
    }

    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError> {
        Ok(SessionDescription::offer(TEST_OFFER_SDP.to_string()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        if desc.sdp_type != SdpType::Answer {
            return Err(WebRTCError::SdpError("expected answer".to_string()));
        }
        *self.remote.lock() = Some(desc);
        self.emit(PeerEvent::SignalingStateChanged(SignalingState::Stable));
        if self.auto_open.load(Ordering::SeqCst) && !self.channel.is_open() {
            self.channel.set_open(true);
            self.emit(PeerEvent::DataChannelOpen);
        }
        Ok(())
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        if self.hold_gathering.load(Ordering::SeqCst) {
            IceGatheringState::Gathering
        } else {
            IceGatheringState::Complete
        }
    }

    async fn gathering_complete(&self) {
        if self.hold_gathering.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
    }

    async fn replace_track(&self, slot: usize, track: Option<LocalTrack>) -> Result<(), WebRTCError> {
        self.replaced
            .lock()
            .push((slot, track.map(|t| t.id().to_string())));
        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.closed.store(true, Ordering::SeqCst);
        self.channel.close().await
    }
}

/// Hands out `FakePeerConnection`s and remembers them in creation order
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    auto_open: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            auto_open: AtomicBool::new(true),
        })
    }

    /// Connections created from now on keep their channel closed
    pub fn set_auto_open(&self, auto_open: bool) {
        self.auto_open.store(auto_open, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakePeerConnection>> {
        self.created.lock().clone()
    }

    pub fn pc(&self, index: usize) -> Arc<FakePeerConnection> {
        self.created.lock()[index].clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, WebRTCError> {
        let pc = FakePeerConnection::with_sink(events);
        pc.set_auto_open(self.auto_open.load(Ordering::SeqCst));
        self.created.lock().push(pc.clone());
        Ok(pc)
    }
}

/// Records offers and candidate batches; answers with `session-<n>`
pub struct FakeEndpoint {
    offers: Mutex<Vec<OfferRequest>>,
    batches: Mutex<Vec<CandidateBatch>>,
    failures: AtomicU32,
    fail_candidates: AtomicBool,
    answered: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl FakeEndpoint {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            offers: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            fail_candidates: AtomicBool::new(false),
            answered: AtomicUsize::new(0),
            gate,
        })
    }

    pub fn offers(&self) -> Vec<OfferRequest> {
        self.offers.lock().clone()
    }

    pub fn batches(&self) -> Vec<CandidateBatch> {
        self.batches.lock().clone()
    }

    /// Reject the next `n` offers
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Reject every candidate batch; rejected batches are still recorded
    pub fn fail_candidates(&self, fail: bool) {
        self.fail_candidates.store(fail, Ordering::SeqCst);
    }

    /// Keep offers waiting for an answer until `release`
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl SignalingEndpoint for FakeEndpoint {
    async fn exchange_offer(
        &self,
        _params: &RequestParams,
        offer: OfferRequest,
    ) -> Result<AnswerResponse, WebRTCError> {
        self.offers.lock().push(offer);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WebRTCError::SignalingError("offer rejected".to_string()));
        }

        let n = self.answered.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AnswerResponse {
            sdp: format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\n", n),
            sdp_type: SdpType::Answer,
            session_id: format!("session-{}", n),
        })
    }

    async fn send_candidates(
        &self,
        _params: &RequestParams,
        batch: CandidateBatch,
    ) -> Result<(), WebRTCError> {
        self.batches.lock().push(batch);
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(WebRTCError::SignalingError("candidates rejected".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCallbacks {
    pub states: Mutex<Vec<TransportState>>,
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub started: Mutex<Vec<(StreamType, String)>>,
    pub stopped: Mutex<Vec<(StreamType, String)>>,
    pub errors: Mutex<Vec<TransportError>>,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<TransportState> {
        self.states.lock().clone()
    }

    pub fn started(&self) -> Vec<(StreamType, String)> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<(StreamType, String)> {
        self.stopped.lock().clone()
    }

    pub fn errors(&self) -> Vec<TransportError> {
        self.errors.lock().clone()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnected_count(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl TransportCallbacks for RecordingCallbacks {
    fn on_transport_state_changed(&self, state: TransportState) {
        self.states.lock().push(state);
    }

    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_track_started(&self, stream: StreamType, track: &RemoteTrack) {
        self.started.lock().push((stream, track.id.clone()));
    }

    fn on_track_stopped(&self, stream: StreamType, track: &RemoteTrack) {
        self.stopped.lock().push((stream, track.id.clone()));
    }

    fn on_error(&self, error: &TransportError) {
        self.errors.lock().push(error.clone());
    }
}
