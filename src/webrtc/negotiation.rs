//! Offer/answer negotiation
//!
//! One negotiation round against the signalling endpoint. Runs as its own
//! task; the caller decides what a failure means (fatal on the very first
//! round, retried otherwise).

use super::endpoint::{AnswerResponse, OfferRequest, SignalingEndpoint};
use super::peer_connection::{MediaKind, PeerConnection};
use super::sdp::filter_codec;
use super::WebRTCError;
use crate::config::{RequestParams, TransportSettings};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    Offering,
    AwaitingAnswer,
    Stable,
}

/// Shared view of one peer connection's negotiation phase
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    generation: u64,
    phase: Arc<Mutex<NegotiationPhase>>,
}

impl PhaseTracker {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            phase: Arc::new(Mutex::new(NegotiationPhase::Idle)),
        }
    }

    pub fn get(&self) -> NegotiationPhase {
        *self.phase.lock()
    }

    fn set(&self, phase: NegotiationPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            debug!("Negotiation (generation {}): {:?} -> {:?}", self.generation, *current, phase);
            *current = phase;
        }
    }
}

/// Inputs of one negotiation round
#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    pub request: RequestParams,
    /// Session id of the previous answer on this connection
    pub session_id: Option<String>,
    pub restart_session: bool,
    pub wait_for_ice_gathering: bool,
    pub ice_gathering_timeout: Duration,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
}

impl NegotiationRequest {
    pub fn new(settings: &TransportSettings, request: RequestParams) -> Self {
        Self {
            request,
            session_id: None,
            restart_session: false,
            wait_for_ice_gathering: settings.wait_for_ice_gathering,
            ice_gathering_timeout: settings.ice_gathering_timeout,
            audio_codec: settings.audio_codec.clone(),
            video_codec: settings.video_codec.clone(),
        }
    }

    pub fn resuming(mut self, session_id: Option<String>, restart_session: bool) -> Self {
        self.session_id = session_id;
        self.restart_session = restart_session;
        self
    }

    /// Apply the configured codec restrictions to an offer SDP
    pub fn filter_sdp(&self, sdp: String) -> String {
        let sdp = match &self.audio_codec {
            Some(codec) => filter_codec(MediaKind::Audio.as_str(), codec, &sdp),
            None => sdp,
        };
        match &self.video_codec {
            Some(codec) => filter_codec(MediaKind::Video.as_str(), codec, &sdp),
            None => sdp,
        }
    }
}

/// Run offer, optional gathering wait, codec filter, exchange and answer.
pub async fn negotiate(
    pc: Arc<dyn PeerConnection>,
    endpoint: Arc<dyn SignalingEndpoint>,
    request: NegotiationRequest,
    phase: PhaseTracker,
) -> Result<AnswerResponse, WebRTCError> {
    let result = run(pc, endpoint, &request, &phase).await;
    match &result {
        Ok(_) => phase.set(NegotiationPhase::Stable),
        Err(_) => phase.set(NegotiationPhase::Idle),
    }
    result
}

async fn run(
    pc: Arc<dyn PeerConnection>,
    endpoint: Arc<dyn SignalingEndpoint>,
    request: &NegotiationRequest,
    phase: &PhaseTracker,
) -> Result<AnswerResponse, WebRTCError> {
    phase.set(NegotiationPhase::Offering);
    let offer = pc.create_offer().await?;
    pc.set_local_description(offer.clone()).await?;

    if request.wait_for_ice_gathering {
        let waited = tokio::time::timeout(request.ice_gathering_timeout, pc.gathering_complete()).await;
        if waited.is_err() {
            debug!(
                "ICE gathering not complete after {:?}, sending offer anyway",
                request.ice_gathering_timeout
            );
        }
    }

    // after gathering the local description carries the candidates
    let local = pc.local_description().await.unwrap_or(offer);
    let mut offer = local.clone();
    offer.sdp = request.filter_sdp(local.sdp);

    let mut body = OfferRequest::new(offer, request.session_id.clone(), request.restart_session);
    body.extra_request_data = request.request.request_data.clone();

    phase.set(NegotiationPhase::AwaitingAnswer);
    let answer = endpoint.exchange_offer(&request.request, body).await?;
    pc.set_remote_description(answer.description()).await?;

    info!("Negotiated session {}", answer.session_id);
    Ok(answer)
}
