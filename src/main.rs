//! small-webrtc-client - Main entry point
//!
//! Connects to a bot offer endpoint with a device-less media source, sends
//! `client-ready` and logs everything the bot sends until Ctrl-C.

mod args;

use args::Args;
use clap::Parser;
use log::{debug, error, info, warn};
use small_webrtc_transport::config::{Config, ConnectionParams};
use small_webrtc_transport::transport::{Transport, TransportCallbacks, TransportError, TransportState};
use small_webrtc_transport::webrtc::peer_connection::RemoteTrack;
use small_webrtc_transport::webrtc::tracks::StreamType;
use small_webrtc_transport::{RtviMessage, SmallWebRtcTransport, StaticMediaSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

struct LoggingCallbacks;

impl TransportCallbacks for LoggingCallbacks {
    fn on_transport_state_changed(&self, state: TransportState) {
        info!("Transport state: {}", state);
    }

    fn on_connected(&self) {
        info!("Connected to bot");
    }

    fn on_disconnected(&self) {
        info!("Disconnected from bot");
    }

    fn on_track_started(&self, stream: StreamType, track: &RemoteTrack) {
        info!("Remote {} track started ({})", stream, track.id);
    }

    fn on_track_stopped(&self, stream: StreamType, track: &RemoteTrack) {
        info!("Remote {} track stopped ({})", stream, track.id);
    }

    fn on_error(&self, error: &TransportError) {
        error!("Transport error: {}", error);
    }
}

fn log_message(message: RtviMessage) {
    info!("<- {} {}", message.message_type, message.data);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("SMALL_WEBRTC_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("small-webrtc-client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }
    let settings = config.transport.resolve()?;

    let media = Arc::new(StaticMediaSource::new(settings.enable_mic, settings.enable_cam));
    let transport = SmallWebRtcTransport::with_webrtc(settings, media)?;
    transport
        .initialize(Arc::new(LoggingCallbacks), Arc::new(log_message))
        .await;
    transport.init_devices().await?;

    if let Err(e) = transport.connect(ConnectionParams::default()).await {
        error!("Failed to connect: {}", e);
        return Err(e.into());
    }
    transport.send_ready_message().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let state = transport.state();
                if matches!(state, TransportState::Disconnected | TransportState::Error) {
                    debug!("Session ended ({})", state);
                    break;
                }
            }
        }
    }

    transport.disconnect().await?;
    info!("Bye");
    Ok(())
}
