//! Local media collaborator
//!
//! Capture and device handling live outside the transport. The transport
//! only needs the current local track per slot, the enable flags, and a
//! notification whenever a track is swapped.

use crate::transport::TransportError;
use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

/// A local track that can be attached to a transceiver sender
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Called with the slot and its new track whenever a local track changes
pub type TrackChangeListener = Arc<dyn Fn(SlotType, Option<LocalTrack>) + Send + Sync>;

/// Logical media slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    Audio,
    Video,
    ScreenVideo,
    ScreenAudio,
}

impl SlotType {
    /// Transceiver index the slot is bound to, in creation order.
    /// Screen audio has no transceiver of its own.
    pub fn transceiver_index(&self) -> Option<usize> {
        match self {
            SlotType::Audio => Some(0),
            SlotType::Video => Some(1),
            SlotType::ScreenVideo => Some(2),
            SlotType::ScreenAudio => None,
        }
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Audio => write!(f, "audio"),
            SlotType::Video => write!(f, "video"),
            SlotType::ScreenVideo => write!(f, "screenVideo"),
            SlotType::ScreenAudio => write!(f, "screenAudio"),
        }
    }
}

/// Current local tracks
#[derive(Clone, Default)]
pub struct LocalTracks {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
    pub screen_video: Option<LocalTrack>,
    pub screen_audio: Option<LocalTrack>,
}

impl LocalTracks {
    pub fn get(&self, slot: SlotType) -> Option<&LocalTrack> {
        match slot {
            SlotType::Audio => self.audio.as_ref(),
            SlotType::Video => self.video.as_ref(),
            SlotType::ScreenVideo => self.screen_video.as_ref(),
            SlotType::ScreenAudio => self.screen_audio.as_ref(),
        }
    }

    pub fn set(&mut self, slot: SlotType, track: Option<LocalTrack>) {
        match slot {
            SlotType::Audio => self.audio = track,
            SlotType::Video => self.video = track,
            SlotType::ScreenVideo => self.screen_video = track,
            SlotType::ScreenAudio => self.screen_audio = track,
        }
    }
}

impl fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = |t: &Option<LocalTrack>| t.as_ref().map(|t| t.id().to_string());
        f.debug_struct("LocalTracks")
            .field("audio", &id(&self.audio))
            .field("video", &id(&self.video))
            .field("screen_video", &id(&self.screen_video))
            .field("screen_audio", &id(&self.screen_audio))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            kind,
        }
    }
}

/// Source of local media, device lists and enable state
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn initialize(&self) -> Result<(), TransportError>;

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn tracks(&self) -> LocalTracks;

    fn is_mic_enabled(&self) -> bool;
    fn is_cam_enabled(&self) -> bool;
    fn is_sharing_screen(&self) -> bool;
    fn supports_screen_share(&self) -> bool;

    fn enable_mic(&self, enabled: bool);
    fn enable_cam(&self, enabled: bool);
    async fn enable_screen_share(&self, enabled: bool) -> Result<(), TransportError>;

    fn get_all_mics(&self) -> Vec<DeviceInfo>;
    fn get_all_cams(&self) -> Vec<DeviceInfo>;
    fn get_all_speakers(&self) -> Vec<DeviceInfo>;

    fn selected_mic(&self) -> Option<DeviceInfo>;
    fn selected_cam(&self) -> Option<DeviceInfo>;
    fn selected_speaker(&self) -> Option<DeviceInfo>;

    fn update_mic(&self, device_id: &str) -> Result<(), TransportError>;
    fn update_cam(&self, device_id: &str) -> Result<(), TransportError>;
    fn update_speaker(&self, device_id: &str) -> Result<(), TransportError>;

    /// Register the listener for local track changes, replacing any previous one
    fn on_track_changed(&self, listener: TrackChangeListener);
}

#[derive(Default)]
struct StaticState {
    tracks: LocalTracks,
    mic_enabled: bool,
    cam_enabled: bool,
    sharing_screen: bool,
    devices: Vec<DeviceInfo>,
    selected_mic: Option<String>,
    selected_cam: Option<String>,
    selected_speaker: Option<String>,
    listener: Option<TrackChangeListener>,
}

/// Device-less media source holding fixed tracks and flags
///
/// Tracks are supplied by the caller (for example a
/// `TrackLocalStaticSample` fed from a file) and can be swapped with
/// `set_track`, which notifies the transport.
pub struct StaticMediaSource {
    state: RwLock<StaticState>,
    screen_share: bool,
}

impl StaticMediaSource {
    pub fn new(mic_enabled: bool, cam_enabled: bool) -> Self {
        Self {
            state: RwLock::new(StaticState {
                mic_enabled,
                cam_enabled,
                ..Default::default()
            }),
            screen_share: false,
        }
    }

    pub fn with_screen_share(mut self, supported: bool) -> Self {
        self.screen_share = supported;
        self
    }

    pub fn with_devices(self, devices: Vec<DeviceInfo>) -> Self {
        self.state.write().devices = devices;
        self
    }

    pub fn with_track(self, slot: SlotType, track: LocalTrack) -> Self {
        self.state.write().tracks.set(slot, Some(track));
        self
    }

    /// Replace the track of `slot` and notify the listener
    pub fn set_track(&self, slot: SlotType, track: Option<LocalTrack>) {
        let listener = {
            let mut state = self.state.write();
            state.tracks.set(slot, track.clone());
            state.listener.clone()
        };
        debug!("Local {} track replaced", slot);
        if let Some(listener) = listener {
            listener(slot, track);
        }
    }

    fn devices_of(&self, kind: DeviceKind) -> Vec<DeviceInfo> {
        self.state
            .read()
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    fn find(&self, kind: DeviceKind, device_id: &str) -> Result<(), TransportError> {
        if self.devices_of(kind).iter().any(|d| d.device_id == device_id) {
            Ok(())
        } else {
            Err(TransportError::Media(format!("Unknown device: {}", device_id)))
        }
    }

    fn selected(&self, kind: DeviceKind, id: Option<String>) -> Option<DeviceInfo> {
        let id = id?;
        self.devices_of(kind).into_iter().find(|d| d.device_id == id)
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn tracks(&self) -> LocalTracks {
        self.state.read().tracks.clone()
    }

    fn is_mic_enabled(&self) -> bool {
        self.state.read().mic_enabled
    }

    fn is_cam_enabled(&self) -> bool {
        self.state.read().cam_enabled
    }

    fn is_sharing_screen(&self) -> bool {
        self.state.read().sharing_screen
    }

    fn supports_screen_share(&self) -> bool {
        self.screen_share
    }

    fn enable_mic(&self, enabled: bool) {
        self.state.write().mic_enabled = enabled;
    }

    fn enable_cam(&self, enabled: bool) {
        self.state.write().cam_enabled = enabled;
    }

    async fn enable_screen_share(&self, enabled: bool) -> Result<(), TransportError> {
        if !self.screen_share {
            return Err(TransportError::Unsupported("screen share".to_string()));
        }
        self.state.write().sharing_screen = enabled;
        Ok(())
    }

    fn get_all_mics(&self) -> Vec<DeviceInfo> {
        self.devices_of(DeviceKind::AudioInput)
    }

    fn get_all_cams(&self) -> Vec<DeviceInfo> {
        self.devices_of(DeviceKind::VideoInput)
    }

    fn get_all_speakers(&self) -> Vec<DeviceInfo> {
        self.devices_of(DeviceKind::AudioOutput)
    }

    fn selected_mic(&self) -> Option<DeviceInfo> {
        let id = self.state.read().selected_mic.clone();
        self.selected(DeviceKind::AudioInput, id)
    }

    fn selected_cam(&self) -> Option<DeviceInfo> {
        let id = self.state.read().selected_cam.clone();
        self.selected(DeviceKind::VideoInput, id)
    }

    fn selected_speaker(&self) -> Option<DeviceInfo> {
        let id = self.state.read().selected_speaker.clone();
        self.selected(DeviceKind::AudioOutput, id)
    }

    fn update_mic(&self, device_id: &str) -> Result<(), TransportError> {
        self.find(DeviceKind::AudioInput, device_id)?;
        self.state.write().selected_mic = Some(device_id.to_string());
        Ok(())
    }

    fn update_cam(&self, device_id: &str) -> Result<(), TransportError> {
        self.find(DeviceKind::VideoInput, device_id)?;
        self.state.write().selected_cam = Some(device_id.to_string());
        Ok(())
    }

    fn update_speaker(&self, device_id: &str) -> Result<(), TransportError> {
        self.find(DeviceKind::AudioOutput, device_id)?;
        self.state.write().selected_speaker = Some(device_id.to_string());
        Ok(())
    }

    fn on_track_changed(&self, listener: TrackChangeListener) {
        self.state.write().listener = Some(listener);
    }
}
