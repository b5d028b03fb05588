//! Session driver
//!
//! The driver owns the active (and, during a replacement, the pending)
//! peer connection and every piece of session state. All backend
//! callbacks, timers and network completions arrive as `DriverEvent`s on
//! one queue; `SessionDriver::handle_event` is the only place where they
//! turn into state transitions.
//!
//! Long-running work (offer/answer exchange, ICE-gathering wait, candidate
//! PATCH, timers) runs in spawned tasks that report back through the same
//! queue, so the driver never holds its lock across network I/O.

use super::candidates::CandidateBatcher;
use super::data_channel::{slot_status, track_statuses, SignalingChannel};
use super::endpoint::{AnswerResponse, SignalingEndpoint};
use super::negotiation::{negotiate, NegotiationPhase, NegotiationRequest, PhaseTracker};
use super::peer_connection::{
    IceCandidate, IceConnectionState, IceGatheringState, MediaKind, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTrackChange, RemoteTrackEvent,
    SignalingState, TransceiverDirection, SIGNALLING_CHANNEL_LABEL,
};
use super::reconnect::{
    ice_connection_action, needs_in_place_renegotiation, AttemptDecision, IceAction,
    ReconnectionMode, ReconnectionState,
};
use super::signaling::{parse_inbound, InboundMessage, SignallingMessage};
use super::tracks::{IncomingTracks, StreamType, TrackNotification};
use super::WebRTCError;
use crate::config::{normalize_codec, IceServerConfig, RequestParams, TransportSettings};
use crate::media::{LocalTrack, MediaSource, SlotType};
use crate::message::RtviMessage;
use crate::transport::{
    MessageHandler, NoopCallbacks, RemoteTracks, TransportCallbacks, TransportError,
    TransportState,
};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Why a negotiation round was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationKind {
    /// First round of a session; failure is fatal
    Initial,
    /// Round of a pending replacement connection
    Replacement,
    /// Renegotiation on the active connection
    InPlace,
}

/// Everything the driver reacts to
pub enum DriverEvent {
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    NegotiationFinished {
        generation: u64,
        kind: NegotiationKind,
        result: Result<AnswerResponse, WebRTCError>,
    },
    FlushCandidates,
    /// Grace period after ICE `disconnected` elapsed
    DisconnectedCheck { generation: u64 },
    /// Backoff after a failed attempt elapsed
    RetryReconnection { generation: u64 },
    LocalTrackChanged {
        slot: SlotType,
        track: Option<LocalTrack>,
    },
}

/// Snapshot readable without taking the driver lock
#[derive(Debug, Clone)]
pub struct TransportStatus {
    pub state: TransportState,
    pub session_id: Option<String>,
    pub active_generation: Option<u64>,
    pub pending_generation: Option<u64>,
    pub remote_tracks: RemoteTracks,
    pub reconnection_attempts: u32,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            state: TransportState::Disconnected,
            session_id: None,
            active_generation: None,
            pending_generation: None,
            remote_tracks: RemoteTracks::default(),
            reconnection_attempts: 0,
        }
    }
}

type ConnectWaiter = oneshot::Sender<Result<(), TransportError>>;

/// One peer connection with its signalling channel
struct PeerSession {
    generation: u64,
    pc: Arc<dyn PeerConnection>,
    channel: SignalingChannel,
    phase: PhaseTracker,
    ice_connection: IceConnectionState,
    ice_gathering: IceGatheringState,
    negotiated: bool,
    channel_open: bool,
    synced: bool,
}

impl PeerSession {
    fn new(generation: u64, pc: Arc<dyn PeerConnection>, channel: SignalingChannel) -> Self {
        Self {
            generation,
            pc,
            channel,
            phase: PhaseTracker::new(generation),
            ice_connection: IceConnectionState::New,
            ice_gathering: IceGatheringState::New,
            negotiated: false,
            channel_open: false,
            synced: false,
        }
    }

    fn target(&self) -> (u64, Arc<dyn PeerConnection>, PhaseTracker) {
        (self.generation, self.pc.clone(), self.phase.clone())
    }

    async fn close(mut self) {
        debug!("Closing peer connection {}", self.generation);
        self.channel.close().await;
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection {}: {}", self.generation, e);
        }
    }
}

pub struct SessionDriver {
    settings: TransportSettings,
    factory: Arc<dyn PeerConnectionFactory>,
    endpoint: Arc<dyn SignalingEndpoint>,
    media: Arc<dyn MediaSource>,
    callbacks: Arc<dyn TransportCallbacks>,
    message_handler: Option<MessageHandler>,

    state: TransportState,
    request: Option<RequestParams>,
    ice_servers: Vec<IceServerConfig>,
    active: Option<PeerSession>,
    pending: Option<PeerSession>,
    session_id: Option<String>,
    candidates: CandidateBatcher,
    reconnect: ReconnectionState,
    incoming: IncomingTracks,
    remote: RemoteTracks,
    connect_waiter: Option<ConnectWaiter>,

    events: mpsc::UnboundedSender<DriverEvent>,
    next_generation: u64,
    tasks: Vec<JoinHandle<()>>,
    status: Arc<RwLock<TransportStatus>>,
}

impl SessionDriver {
    pub fn new(
        settings: TransportSettings,
        factory: Arc<dyn PeerConnectionFactory>,
        endpoint: Arc<dyn SignalingEndpoint>,
        media: Arc<dyn MediaSource>,
        events: mpsc::UnboundedSender<DriverEvent>,
        status: Arc<RwLock<TransportStatus>>,
    ) -> Self {
        let candidates = CandidateBatcher::new(settings.candidate_flush_delay);
        let reconnect = ReconnectionState::new(settings.max_reconnection_attempts);
        let ice_servers = settings.ice_servers.clone();

        Self {
            settings,
            factory,
            endpoint,
            media,
            callbacks: Arc::new(NoopCallbacks),
            message_handler: None,
            state: TransportState::Disconnected,
            request: None,
            ice_servers,
            active: None,
            pending: None,
            session_id: None,
            candidates,
            reconnect,
            incoming: IncomingTracks::new(),
            remote: RemoteTracks::default(),
            connect_waiter: None,
            events,
            next_generation: 0,
            tasks: Vec::new(),
            status,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn media(&self) -> &Arc<dyn MediaSource> {
        &self.media
    }

    pub fn negotiation_phase(&self) -> Option<NegotiationPhase> {
        self.active.as_ref().map(|a| a.phase.get())
    }

    pub fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>, handler: MessageHandler) {
        self.callbacks = callbacks;
        self.message_handler = Some(handler);
    }

    pub fn set_audio_codec(&mut self, codec: Option<String>) -> Result<(), TransportError> {
        self.settings.audio_codec = normalize_codec("audio_codec", codec)?;
        Ok(())
    }

    pub fn set_video_codec(&mut self, codec: Option<String>) -> Result<(), TransportError> {
        self.settings.video_codec = normalize_codec("video_codec", codec)?;
        Ok(())
    }

    /// Move to `state`, notifying once. Same-state transitions are no-ops.
    pub fn set_state(&mut self, state: TransportState) {
        if self.state == state {
            return;
        }
        debug!("Transport state: {} -> {}", self.state, state);
        self.state = state;
        self.publish_status();
        self.callbacks.on_transport_state_changed(state);
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.state = self.state;
        status.session_id = self.session_id.clone();
        status.active_generation = self.active.as_ref().map(|a| a.generation);
        status.pending_generation = self.pending.as_ref().map(|p| p.generation);
        status.remote_tracks = self.remote.clone();
        status.reconnection_attempts = self.reconnect.attempts();
    }

    fn track_task(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|h| !h.is_finished());
        self.tasks.push(handle);
    }

    fn schedule(&mut self, delay: Duration, event: DriverEvent) {
        let tx = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        self.track_task(handle);
    }

    /// Begin a new session. The returned receiver resolves once the
    /// signalling channel is open or the first negotiation failed.
    pub async fn start(
        &mut self,
        request: Option<RequestParams>,
        ice_servers: Vec<IceServerConfig>,
    ) -> Result<oneshot::Receiver<Result<(), TransportError>>, TransportError> {
        match self.state {
            TransportState::Connecting
            | TransportState::Connected
            | TransportState::Ready
            | TransportState::Disconnecting => {
                return Err(TransportError::InvalidState(format!(
                    "Cannot connect while {}",
                    self.state
                )));
            }
            _ => {}
        }

        self.set_state(TransportState::Connecting);
        let Some(request) = request else {
            error!("No offer endpoint configured");
            self.set_state(TransportState::Error);
            return Err(TransportError::Start("No offer endpoint configured".to_string()));
        };
        info!("Connecting to {}", request.endpoint);
        if let Err(e) = self.media.connect().await {
            self.set_state(TransportState::Error);
            return Err(e);
        }

        self.request = Some(request);
        self.ice_servers = ice_servers;
        self.session_id = None;
        self.candidates = CandidateBatcher::new(self.settings.candidate_flush_delay);
        self.reconnect = ReconnectionState::new(self.settings.max_reconnection_attempts);

        let peer = match self.build_peer().await {
            Ok(peer) => peer,
            Err(e) => {
                error!("Failed to create peer connection: {}", e);
                self.set_state(TransportState::Error);
                return Err(TransportError::Start(e.to_string()));
            }
        };

        let (tx, rx) = oneshot::channel();
        self.connect_waiter = Some(tx);
        self.spawn_negotiation(peer.target(), NegotiationKind::Initial, None, false);
        self.active = Some(peer);
        self.publish_status();
        Ok(rx)
    }

    /// Full disconnect: `disconnecting`, teardown, `disconnected`.
    pub async fn shutdown(&mut self) {
        if self.state == TransportState::Disconnected && self.active.is_none() {
            return;
        }

        info!("Disconnecting");
        self.set_state(TransportState::Disconnecting);
        self.teardown().await;
        if let Err(e) = self.media.disconnect().await {
            warn!("Media source disconnect failed: {}", e);
        }
        self.set_state(TransportState::Disconnected);
        self.callbacks.on_disconnected();
    }

    async fn teardown(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
        if let Some(pending) = self.pending.take() {
            pending.close().await;
        }
        if let Some(active) = self.active.take() {
            active.close().await;
        }

        self.candidates.clear();
        self.reconnect.stabilized();
        self.incoming.clear();
        self.remote = RemoteTracks::default();
        self.session_id = None;

        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(TransportError::Start(
                "Session closed before it was connected".to_string(),
            )));
        }
        self.publish_status();
    }

    pub async fn send_message(&self, message: &RtviMessage) {
        match &self.active {
            Some(active) => active.channel.send_message(message).await,
            None => warn!("No active session, dropping message {}", message.message_type),
        }
    }

    pub async fn send_ready_message(&mut self) {
        self.set_state(TransportState::Ready);
        self.send_message(&RtviMessage::client_ready()).await;
    }

    /// Report the enable state of one slot to the remote side
    pub async fn send_slot_status(&self, slot: SlotType) {
        let Some(active) = &self.active else {
            return;
        };
        if !active.channel.is_open() {
            debug!("Signalling channel not open, {} status will sync on open", slot);
            return;
        }
        if let Some(status) = slot_status(self.media.as_ref(), slot) {
            active.channel.sync_track_status(&[status]).await;
        }
    }

    async fn build_peer(&mut self) -> Result<PeerSession, WebRTCError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = PeerEventSink::new(generation, self.events.clone());
        let pc = self.factory.create(&self.ice_servers, sink).await?;

        match self.prepare_peer(&pc).await {
            Ok(channel) => {
                debug!("Created peer connection {}", generation);
                Ok(PeerSession::new(generation, pc, channel))
            }
            Err(e) => {
                let _ = pc.close().await;
                Err(e)
            }
        }
    }

    /// Transceivers in slot order, the signalling channel, then local media
    async fn prepare_peer(&self, pc: &Arc<dyn PeerConnection>) -> Result<SignalingChannel, WebRTCError> {
        let screen_share = self.media.supports_screen_share();

        pc.add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv).await?;
        pc.add_transceiver(MediaKind::Video, TransceiverDirection::SendRecv).await?;
        if screen_share {
            pc.add_transceiver(MediaKind::Video, TransceiverDirection::SendOnly).await?;
        }

        let channel = pc.create_data_channel(SIGNALLING_CHANNEL_LABEL, true).await?;

        let tracks = self.media.tracks();
        let mut slots = vec![SlotType::Audio, SlotType::Video];
        if screen_share {
            slots.push(SlotType::ScreenVideo);
        }
        for slot in slots {
            if let (Some(index), Some(track)) = (slot.transceiver_index(), tracks.get(slot)) {
                pc.replace_track(index, Some(track.clone())).await?;
            }
        }

        Ok(SignalingChannel::new(channel))
    }

    fn spawn_negotiation(
        &mut self,
        target: (u64, Arc<dyn PeerConnection>, PhaseTracker),
        kind: NegotiationKind,
        session_id: Option<String>,
        restart_session: bool,
    ) {
        let (generation, pc, phase) = target;
        let tx = self.events.clone();

        let Some(request) = self.request.clone() else {
            let _ = tx.send(DriverEvent::NegotiationFinished {
                generation,
                kind,
                result: Err(WebRTCError::InvalidState("No offer endpoint".to_string())),
            });
            return;
        };

        let request = NegotiationRequest::new(&self.settings, request).resuming(session_id, restart_session);
        let endpoint = self.endpoint.clone();

        let handle = tokio::spawn(async move {
            let result = negotiate(pc, endpoint, request, phase).await;
            let _ = tx.send(DriverEvent::NegotiationFinished {
                generation,
                kind,
                result,
            });
        });
        self.track_task(handle);
    }

    fn session_mut(&mut self, generation: u64) -> Option<&mut PeerSession> {
        if self.active.as_ref().map(|a| a.generation) == Some(generation) {
            return self.active.as_mut();
        }
        if self.pending.as_ref().map(|p| p.generation) == Some(generation) {
            return self.pending.as_mut();
        }
        None
    }

    fn is_active(&self, generation: u64) -> bool {
        self.active.as_ref().map(|a| a.generation) == Some(generation)
    }

    fn is_pending(&self, generation: u64) -> bool {
        self.pending.as_ref().map(|p| p.generation) == Some(generation)
    }

    /// The connection whose candidates are currently worth sending
    fn candidate_generation(&self) -> Option<u64> {
        self.pending
            .as_ref()
            .or(self.active.as_ref())
            .map(|p| p.generation)
    }

    /// Single translation point for every driver event
    pub async fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Peer { generation, event } => self.on_peer_event(generation, event).await,
            DriverEvent::NegotiationFinished {
                generation,
                kind,
                result,
            } => self.on_negotiation_finished(generation, kind, result).await,
            DriverEvent::FlushCandidates => self.flush_candidates(),
            DriverEvent::DisconnectedCheck { generation } => {
                let still_disconnected = self
                    .active
                    .as_ref()
                    .filter(|a| a.generation == generation)
                    .map_or(false, |a| a.ice_connection == IceConnectionState::Disconnected);
                if still_disconnected {
                    info!("ICE still disconnected, replacing peer connection");
                    self.begin_reconnection(ReconnectionMode::Replace).await;
                } else {
                    debug!("Peer connection {} recovered from disconnect", generation);
                }
            }
            DriverEvent::RetryReconnection { generation } => {
                if self.is_active(generation) {
                    self.begin_reconnection(ReconnectionMode::Replace).await;
                }
            }
            DriverEvent::LocalTrackChanged { slot, track } => self.on_local_track_changed(slot, track).await,
        }
    }

    async fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if !self.is_active(generation) && !self.is_pending(generation) {
            debug!("Dropping {:?} from superseded peer connection {}", event, generation);
            return;
        }

        match event {
            PeerEvent::IceCandidate(candidate) => self.on_ice_candidate(generation, candidate),
            PeerEvent::IceGatheringStateChanged(gathering) => {
                debug!("ICE gathering state ({}): {:?}", generation, gathering);
                let Some(session) = self.session_mut(generation) else {
                    return;
                };
                session.ice_gathering = gathering;
                let connection = session.ice_connection;
                if self.is_active(generation)
                    && self.settings.wait_for_ice_gathering
                    && needs_in_place_renegotiation(gathering, connection)
                {
                    info!("ICE gathering completed while still checking, renegotiating");
                    self.begin_reconnection(ReconnectionMode::InPlace).await;
                }
            }
            PeerEvent::IceConnectionStateChanged(connection) => {
                debug!("ICE connection state ({}): {:?}", generation, connection);
                if let Some(session) = self.session_mut(generation) {
                    session.ice_connection = connection;
                }
                if !self.is_active(generation) {
                    return;
                }
                match ice_connection_action(connection) {
                    IceAction::ReplaceNow => {
                        warn!("ICE connection failed, replacing peer connection");
                        self.begin_reconnection(ReconnectionMode::Replace).await;
                    }
                    IceAction::CheckAfterGrace => {
                        let grace = self.settings.disconnected_grace;
                        self.schedule(grace, DriverEvent::DisconnectedCheck { generation });
                    }
                    IceAction::None => {}
                }
            }
            PeerEvent::SignalingStateChanged(signaling) => {
                debug!("Signaling state ({}): {:?}", generation, signaling);
                if signaling == SignalingState::Stable {
                    self.reconnect.stabilized();
                    self.publish_status();
                }
            }
            PeerEvent::Track(track) => self.on_remote_track(generation, track),
            PeerEvent::DataChannelOpen => {
                info!("Signalling channel open on peer connection {}", generation);
                if let Some(session) = self.session_mut(generation) {
                    session.channel_open = true;
                }
                self.maybe_channel_ready().await;
            }
            PeerEvent::DataChannelMessage(text) => {
                if self.is_active(generation) {
                    self.on_channel_message(&text).await;
                } else {
                    debug!("Ignoring message on pending peer connection {}", generation);
                }
            }
            PeerEvent::DataChannelClosed => {
                info!("Signalling channel closed on peer connection {}", generation);
                if let Some(session) = self.session_mut(generation) {
                    session.channel_open = false;
                    session.synced = false;
                    session.channel.stop_keepalive();
                }
            }
        }
    }

    fn on_ice_candidate(&mut self, generation: u64, candidate: IceCandidate) {
        if self.candidate_generation() != Some(generation) {
            debug!("Dropping candidate of superseded peer connection {}", generation);
            return;
        }
        if self.candidates.enqueue(candidate) {
            let delay = self.candidates.delay();
            self.schedule(delay, DriverEvent::FlushCandidates);
        }
    }

    fn flush_candidates(&mut self) {
        let Some(batch) = self.candidates.flush() else {
            return;
        };
        let Some(request) = self.request.clone() else {
            return;
        };

        let endpoint = self.endpoint.clone();
        let handle = tokio::spawn(async move {
            let count = batch.candidates.len();
            if let Err(e) = endpoint.send_candidates(&request, batch).await {
                warn!("Failed to send {} ICE candidates: {}", count, e);
            }
        });
        self.track_task(handle);
    }

    /// Record the answer's session id and let queued candidates go out.
    fn accept_answer(&mut self, answer: AnswerResponse) {
        self.session_id = Some(answer.session_id.clone());
        self.candidates.authorize(answer.session_id);
        if self.candidates.pending() > 0 {
            let _ = self.events.send(DriverEvent::FlushCandidates);
        }
        self.publish_status();
    }

    fn restore_authorization(&mut self) {
        if let Some(session_id) = self.session_id.clone() {
            self.candidates.authorize(session_id);
        }
    }

    async fn on_negotiation_finished(
        &mut self,
        generation: u64,
        kind: NegotiationKind,
        result: Result<AnswerResponse, WebRTCError>,
    ) {
        let pending = self.is_pending(generation);
        if !self.is_active(generation) && !pending {
            debug!("Discarding late {:?} negotiation result of peer connection {}", kind, generation);
            return;
        }

        match (kind, result) {
            (NegotiationKind::Initial, Ok(answer)) => {
                self.accept_answer(answer);
                if let Some(active) = self.active.as_mut() {
                    active.negotiated = true;
                }
                self.maybe_channel_ready().await;
            }
            (NegotiationKind::Initial, Err(e)) => {
                error!("Initial negotiation failed: {}", e);
                let waiter = self.connect_waiter.take();
                self.set_state(TransportState::Error);
                self.teardown().await;
                if let Err(e) = self.media.disconnect().await {
                    warn!("Media source disconnect failed: {}", e);
                }
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(TransportError::Start(e.to_string())));
                }
            }
            (NegotiationKind::Replacement, Ok(answer)) if pending => {
                self.swap_in_pending(answer).await;
            }
            (NegotiationKind::InPlace, Ok(answer)) => {
                debug!("In-place renegotiation of peer connection {} done", generation);
                self.accept_answer(answer);
            }
            (NegotiationKind::Replacement, Ok(_)) => {
                debug!("Replacement result for non-pending connection {}", generation);
            }
            (kind, Err(e)) => {
                warn!(
                    "Reconnection attempt {} ({:?}) failed: {}",
                    self.reconnect.attempts(),
                    kind,
                    e
                );
                if pending {
                    if let Some(pending) = self.pending.take() {
                        pending.close().await;
                    }
                    self.candidates.clear();
                    self.restore_authorization();
                }
                self.reconnect.attempt_failed();
                self.schedule_retry();
                self.publish_status();
            }
        }
    }

    fn schedule_retry(&mut self) {
        if let Some(generation) = self.active.as_ref().map(|a| a.generation) {
            let backoff = self.settings.reconnect_backoff;
            self.schedule(backoff, DriverEvent::RetryReconnection { generation });
        }
    }

    /// The pending connection negotiated: make it active, then retire the
    /// old one.
    async fn swap_in_pending(&mut self, answer: AnswerResponse) {
        let Some(mut next) = self.pending.take() else {
            return;
        };
        next.negotiated = true;
        let next_generation = next.generation;
        let previous = self.active.replace(next);
        self.accept_answer(answer);

        if let Some(previous) = previous {
            info!(
                "Replaced peer connection {} with {}",
                previous.generation, next_generation
            );
            for (stream, notification) in self.incoming.remove_generation(previous.generation) {
                self.remote.set(stream, None);
                self.notify_track(stream, notification);
            }
            tokio::spawn(previous.close());
        }

        self.publish_status();
        self.maybe_channel_ready().await;
    }

    async fn begin_reconnection(&mut self, mode: ReconnectionMode) {
        if matches!(
            self.state,
            TransportState::Disconnecting | TransportState::Disconnected | TransportState::Error
        ) {
            return;
        }
        if self.active.is_none() || self.session_id.is_none() {
            debug!("No negotiated session yet, not reconnecting");
            return;
        }

        match self.reconnect.begin() {
            AttemptDecision::AlreadyInProgress => {
                debug!("Reconnection already in progress, skipping");
            }
            AttemptDecision::Exhausted => self.give_up().await,
            AttemptDecision::Attempt(n) => {
                info!(
                    "Reconnection attempt {}/{} ({:?})",
                    n,
                    self.reconnect.max_attempts(),
                    mode
                );
                self.publish_status();
                match mode {
                    ReconnectionMode::InPlace => self.renegotiate_in_place(),
                    ReconnectionMode::Replace => self.start_replacement().await,
                }
            }
        }
    }

    fn renegotiate_in_place(&mut self) {
        let Some(target) = self.active.as_ref().map(PeerSession::target) else {
            return;
        };
        let session_id = self.session_id.clone();
        self.spawn_negotiation(target, NegotiationKind::InPlace, session_id, false);
    }

    async fn start_replacement(&mut self) {
        // candidates of the superseded connection are never sent
        self.candidates.clear();

        match self.build_peer().await {
            Ok(peer) => {
                let session_id = self.session_id.clone();
                self.spawn_negotiation(peer.target(), NegotiationKind::Replacement, session_id, true);
                self.pending = Some(peer);
                self.publish_status();
            }
            Err(e) => {
                warn!("Failed to create replacement peer connection: {}", e);
                self.restore_authorization();
                self.reconnect.attempt_failed();
                self.schedule_retry();
            }
        }
    }

    async fn give_up(&mut self) {
        let attempts = self.reconnect.attempts();
        warn!("Max reconnection attempts ({}) reached, stopping transport", attempts);
        self.shutdown().await;
        self.callbacks
            .on_error(&TransportError::ExhaustedRetries { attempts });
    }

    /// Runs once per connection, when it is both negotiated and open
    async fn maybe_channel_ready(&mut self) {
        let statuses = track_statuses(self.media.as_ref());
        let keepalive = self.settings.keepalive_interval;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.negotiated || !active.channel_open || active.synced {
            return;
        }
        active.synced = true;

        active.channel.sync_track_status(&statuses).await;
        active.channel.start_keepalive(keepalive);

        if self.state == TransportState::Connecting {
            self.set_state(TransportState::Connected);
            self.callbacks.on_connected();
            if let Some(waiter) = self.connect_waiter.take() {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    async fn on_channel_message(&mut self, text: &str) {
        match parse_inbound(text) {
            Ok(InboundMessage::Signalling(SignallingMessage::Renegotiate)) => {
                info!("Remote requested renegotiation");
                self.begin_reconnection(ReconnectionMode::InPlace).await;
            }
            Ok(InboundMessage::Signalling(SignallingMessage::PeerLeft)) => {
                info!("Remote peer left");
                self.shutdown().await;
            }
            Ok(InboundMessage::Signalling(SignallingMessage::TrackStatus { receiver_index, enabled })) => {
                debug!("Remote track {} enabled: {}", receiver_index, enabled);
            }
            Ok(InboundMessage::Application(message)) => match &self.message_handler {
                Some(handler) => handler(message),
                None => debug!("No message handler, dropping {}", message.message_type),
            },
            Ok(InboundMessage::Ignored) => {}
            Err(e) => warn!("Dropping inbound payload: {}", e),
        }
    }

    fn on_remote_track(&mut self, generation: u64, event: RemoteTrackEvent) {
        let Some(mid) = event.mid.as_deref() else {
            warn!("Received track {} without transceiver mid", event.track.id);
            return;
        };
        let stream = StreamType::from_mid(mid);

        let notification = match event.change {
            RemoteTrackChange::Added => {
                let replaced = self.incoming.added(stream, generation, event.track.clone());
                self.remote.set(stream, Some(event.track));
                replaced
            }
            RemoteTrackChange::Unmuted => self.incoming.unmuted(stream, generation, &event.track.id),
            RemoteTrackChange::Muted => self.incoming.muted(stream, generation, &event.track.id),
            RemoteTrackChange::Ended => {
                let stopped = self.incoming.ended(stream, generation, &event.track.id);
                if self.incoming.track(stream).is_none() {
                    self.remote.set(stream, None);
                }
                stopped
            }
        };

        self.notify_track(stream, notification);
        self.publish_status();
    }

    fn notify_track(&self, stream: StreamType, notification: Option<TrackNotification>) {
        match notification {
            Some(TrackNotification::Started(track)) => {
                debug!("Remote {} track started", stream);
                self.callbacks.on_track_started(stream, &track);
            }
            Some(TrackNotification::Stopped(track)) => {
                debug!("Remote {} track stopped", stream);
                self.callbacks.on_track_stopped(stream, &track);
            }
            None => {}
        }
    }

    async fn on_local_track_changed(&mut self, slot: SlotType, track: Option<LocalTrack>) {
        let Some(index) = slot.transceiver_index() else {
            debug!("Ignoring local {} track change", slot);
            return;
        };
        if slot == SlotType::ScreenVideo && !self.media.supports_screen_share() {
            debug!("Screen sharing not supported, ignoring screen track");
            return;
        }

        for peer in [self.active.as_ref(), self.pending.as_ref()].into_iter().flatten() {
            if let Err(e) = peer.pc.replace_track(index, track.clone()).await {
                warn!("Failed to replace {} track on peer connection {}: {}", slot, peer.generation, e);
            }
        }

        if slot == SlotType::ScreenVideo {
            self.send_slot_status(slot).await;
        }
    }
}

/// Drain the event queue into the driver until the driver is dropped
pub(crate) fn spawn_event_pump(
    driver: Weak<Mutex<SessionDriver>>,
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(driver) = driver.upgrade() else {
                break;
            };
            driver.lock().await.handle_event(event).await;
        }
    })
}
