//! Incoming track records
//!
//! One record per remote stream type. Records remember which peer
//! connection generation and which track created them so that stale
//! notifications are ignored.

use super::peer_connection::RemoteTrack;
use log::debug;
use std::collections::HashMap;
use std::fmt;

/// Remote stream, derived from the transceiver mid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Microphone,
    Camera,
    ScreenVideo,
}

impl StreamType {
    /// Transceivers are created audio, video, screen video, so the first
    /// two mids are fixed and anything after is screen video.
    pub fn from_mid(mid: &str) -> Self {
        match mid {
            "0" => StreamType::Microphone,
            "1" => StreamType::Camera,
            _ => StreamType::ScreenVideo,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Microphone => write!(f, "microphone"),
            StreamType::Camera => write!(f, "camera"),
            StreamType::ScreenVideo => write!(f, "screenVideo"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    New,
    Muted,
    Unmuted,
    Ended,
}

/// Notification owed to the callback surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackNotification {
    Started(RemoteTrack),
    Stopped(RemoteTrack),
}

#[derive(Debug, Clone)]
struct IncomingTrack {
    generation: u64,
    track: RemoteTrack,
    status: TrackStatus,
}

#[derive(Debug, Default)]
pub struct IncomingTracks {
    records: HashMap<StreamType, IncomingTrack>,
}

impl IncomingTracks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A track appeared. Replaces any previous record for the stream; a
    /// replaced record that was still playing is owed a stop.
    pub fn added(&mut self, stream: StreamType, generation: u64, track: RemoteTrack) -> Option<TrackNotification> {
        debug!("Remote {} track {} added (generation {})", stream, track.id, generation);
        let previous = self.records.insert(
            stream,
            IncomingTrack {
                generation,
                track,
                status: TrackStatus::New,
            },
        );
        previous
            .filter(|p| p.status == TrackStatus::Unmuted)
            .map(|p| TrackNotification::Stopped(p.track))
    }

    fn record_mut(&mut self, stream: StreamType, generation: u64, track_id: &str) -> Option<&mut IncomingTrack> {
        self.records
            .get_mut(&stream)
            .filter(|r| r.generation == generation && r.track.id == track_id)
    }

    pub fn unmuted(&mut self, stream: StreamType, generation: u64, track_id: &str) -> Option<TrackNotification> {
        let record = self.record_mut(stream, generation, track_id)?;
        record.status = TrackStatus::Unmuted;
        Some(TrackNotification::Started(record.track.clone()))
    }

    pub fn muted(&mut self, stream: StreamType, generation: u64, track_id: &str) -> Option<TrackNotification> {
        let record = self.record_mut(stream, generation, track_id)?;
        let was_unmuted = record.status == TrackStatus::Unmuted;
        record.status = TrackStatus::Muted;
        was_unmuted.then(|| TrackNotification::Stopped(record.track.clone()))
    }

    /// The record is dropped; a stop is only owed if the track was playing.
    pub fn ended(&mut self, stream: StreamType, generation: u64, track_id: &str) -> Option<TrackNotification> {
        let record = self.record_mut(stream, generation, track_id)?;
        let was_unmuted = record.status == TrackStatus::Unmuted;
        record.status = TrackStatus::Ended;
        let track = record.track.clone();
        self.records.remove(&stream);
        was_unmuted.then_some(TrackNotification::Stopped(track))
    }

    pub fn status(&self, stream: StreamType) -> Option<TrackStatus> {
        self.records.get(&stream).map(|r| r.status)
    }

    pub fn track(&self, stream: StreamType) -> Option<&RemoteTrack> {
        self.records.get(&stream).map(|r| &r.track)
    }

    /// Drop every record created by `generation`, with the stop owed for
    /// each one that was playing.
    pub fn remove_generation(&mut self, generation: u64) -> Vec<(StreamType, Option<TrackNotification>)> {
        let streams: Vec<StreamType> = self
            .records
            .iter()
            .filter(|(_, r)| r.generation == generation)
            .map(|(s, _)| *s)
            .collect();

        streams
            .into_iter()
            .filter_map(|stream| {
                let record = self.records.remove(&stream)?;
                let stop = (record.status == TrackStatus::Unmuted).then(|| TrackNotification::Stopped(record.track));
                Some((stream, stop))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
