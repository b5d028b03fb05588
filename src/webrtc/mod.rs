//! WebRTC session implementation
//!
//! This module provides the client side of a single WebRTC session:
//! - Peer connection abstraction and the `webrtc` crate backend
//! - SDP offer/answer negotiation against an HTTP endpoint
//! - Trickle ICE candidate batching
//! - DataChannel signalling (track status, renegotiation, peer left)
//! - Bounded reconnection on ICE failure

pub mod candidates;
pub mod data_channel;
pub mod endpoint;
pub mod negotiation;
pub mod peer_connection;
pub mod reconnect;
pub mod rtc_backend;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod tracks;

#[cfg(test)]
pub(crate) mod testing;

pub use endpoint::{HttpSignalingEndpoint, SignalingEndpoint};
pub use peer_connection::{PeerConnection, PeerConnectionFactory, PeerEvent};
pub use rtc_backend::RtcPeerConnectionFactory;
pub use signaling::SignallingMessage;

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRTCError {
    /// Peer connection creation or teardown failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Data channel error
    DataChannelError(String),
    /// Media track error
    MediaError(String),
    /// Offer/answer or candidate exchange with the remote endpoint failed
    SignalingError(String),
    /// Malformed or unrecognized DataChannel payload
    ProtocolError(String),
    /// Invalid state transition
    InvalidState(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::DataChannelError(msg) => write!(f, "DataChannel error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::SignalingError(msg) => write!(f, "Signaling error: {}", msg),
            WebRTCError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for WebRTCError {}
