//! Signalling DataChannel
//!
//! Wraps the ordered DataChannel shared by application messages and
//! transport signalling. Sends on a channel that is not open are dropped
//! with a warning; nothing here fails the session.

use super::peer_connection::DataChannel;
use super::signaling::SignallingMessage;
use crate::media::{MediaSource, SlotType};
use crate::message::RtviMessage;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Per-slot enable state, in transceiver order.
///
/// The screen slot is only reported when the media source can share a
/// screen; it counts as enabled while sharing with a track attached.
pub fn track_statuses(media: &dyn MediaSource) -> Vec<(usize, bool)> {
    let mut statuses = vec![
        (0, media.is_mic_enabled()),
        (1, media.is_cam_enabled()),
    ];
    if media.supports_screen_share() {
        let sharing = media.is_sharing_screen() && media.tracks().screen_video.is_some();
        statuses.push((2, sharing));
    }
    statuses
}

/// Enable state reported for one slot
pub fn slot_status(media: &dyn MediaSource, slot: SlotType) -> Option<(usize, bool)> {
    let index = slot.transceiver_index()?;
    let enabled = match slot {
        SlotType::Audio => media.is_mic_enabled(),
        SlotType::Video => media.is_cam_enabled(),
        SlotType::ScreenVideo => media.is_sharing_screen() && media.tracks().screen_video.is_some(),
        SlotType::ScreenAudio => return None,
    };
    Some((index, enabled))
}

fn keepalive_payload() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("ping: {}", millis)
}

pub struct SignalingChannel {
    channel: Arc<dyn DataChannel>,
    keepalive: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self {
            channel,
            keepalive: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    async fn send_text(&self, text: String) {
        if !self.channel.is_open() {
            warn!("DataChannel '{}' not open, dropping message", self.channel.label());
            return;
        }
        if let Err(e) = self.channel.send_text(text).await {
            warn!("Failed to send on DataChannel '{}': {}", self.channel.label(), e);
        }
    }

    pub async fn send_signalling(&self, message: SignallingMessage) {
        match message.to_json() {
            Ok(json) => self.send_text(json).await,
            Err(e) => warn!("{}", e),
        }
    }

    pub async fn send_message(&self, message: &RtviMessage) {
        match message.to_json() {
            Ok(json) => self.send_text(json).await,
            Err(e) => warn!("Failed to serialize message {}: {}", message.id, e),
        }
    }

    /// One `trackStatus` per slot, in order
    pub async fn sync_track_status(&self, statuses: &[(usize, bool)]) {
        for &(receiver_index, enabled) in statuses {
            self.send_signalling(SignallingMessage::TrackStatus {
                receiver_index,
                enabled,
            })
            .await;
        }
    }

    /// Send `ping: <unix-millis>` every `period` until stopped. The first
    /// ping goes out one period after the call.
    pub fn start_keepalive(&mut self, period: Duration) {
        self.stop_keepalive();

        let channel = self.channel.clone();
        self.keepalive = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !channel.is_open() {
                    continue;
                }
                if let Err(e) = channel.send_text(keepalive_payload()).await {
                    debug!("Keep-alive send failed: {}", e);
                }
            }
        }));
    }

    pub fn stop_keepalive(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }

    pub async fn close(&mut self) {
        self.stop_keepalive();
        if let Err(e) = self.channel.close().await {
            debug!("DataChannel close: {}", e);
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}
