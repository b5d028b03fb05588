//! Out-of-band signalling endpoint
//!
//! Offers are POSTed as JSON and answered synchronously; trickled
//! candidates are PATCHed to the same URL, fire-and-forget.

use super::peer_connection::{IceCandidate, SdpType, SessionDescription};
use super::WebRTCError;
use crate::config::RequestParams;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of the offer request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Session id from the previous answer; `None` for a fresh session
    pub session_id: Option<String>,
    pub restart_session: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_request_data: Option<Value>,
}

impl OfferRequest {
    pub fn new(offer: SessionDescription, session_id: Option<String>, restart_session: bool) -> Self {
        Self {
            sdp: offer.sdp,
            sdp_type: offer.sdp_type,
            session_id,
            restart_session,
            extra_request_data: None,
        }
    }
}

/// Body of the offer response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(alias = "pc_id")]
    pub session_id: String,
}

impl AnswerResponse {
    pub fn description(&self) -> SessionDescription {
        SessionDescription {
            sdp_type: self.sdp_type,
            sdp: self.sdp.clone(),
        }
    }
}

/// One candidate as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl From<IceCandidate> for CandidatePayload {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

/// Body of the candidate PATCH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub session_id: String,
    pub candidates: Vec<CandidatePayload>,
}

#[async_trait]
pub trait SignalingEndpoint: Send + Sync {
    async fn exchange_offer(
        &self,
        params: &RequestParams,
        offer: OfferRequest,
    ) -> Result<AnswerResponse, WebRTCError>;

    async fn send_candidates(
        &self,
        params: &RequestParams,
        batch: CandidateBatch,
    ) -> Result<(), WebRTCError>;
}

/// `reqwest`-backed endpoint client
#[derive(Clone, Default)]
pub struct HttpSignalingEndpoint {
    client: reqwest::Client,
}

impl HttpSignalingEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(&self, method: reqwest::Method, params: &RequestParams) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, &params.endpoint);
        for (name, value) in &params.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = params.timeout() {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

#[async_trait]
impl SignalingEndpoint for HttpSignalingEndpoint {
    async fn exchange_offer(
        &self,
        params: &RequestParams,
        offer: OfferRequest,
    ) -> Result<AnswerResponse, WebRTCError> {
        debug!(
            "POST offer to {} (session {:?}, restart {})",
            params.endpoint, offer.session_id, offer.restart_session
        );

        let response = self
            .request(reqwest::Method::POST, params)
            .json(&offer)
            .send()
            .await
            .map_err(|e| WebRTCError::SignalingError(format!("Offer request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| WebRTCError::SignalingError(format!("Offer rejected: {}", e)))?;

        response
            .json::<AnswerResponse>()
            .await
            .map_err(|e| WebRTCError::SignalingError(format!("Invalid answer body: {}", e)))
    }

    async fn send_candidates(
        &self,
        params: &RequestParams,
        batch: CandidateBatch,
    ) -> Result<(), WebRTCError> {
        debug!(
            "PATCH {} candidates to {} (session {})",
            batch.candidates.len(),
            params.endpoint,
            batch.session_id
        );

        self.request(reqwest::Method::PATCH, params)
            .json(&batch)
            .send()
            .await
            .map_err(|e| WebRTCError::SignalingError(format!("Candidate request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| WebRTCError::SignalingError(format!("Candidates rejected: {}", e)))?;
        Ok(())
    }
}
