use clap::Parser;
use std::path::PathBuf;

use small_webrtc_transport::config;

#[derive(Parser, Debug)]
#[command(name = "small-webrtc-client")]
#[command(author = "Selkies Team")]
#[command(version)]
#[command(about = "Peer-to-peer WebRTC client for bot sessions", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/small-webrtc-client.toml")]
    pub config: PathBuf,

    /// Offer endpoint URL (overrides `transport.webrtc_request.endpoint`)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// STUN/TURN server URL, may be repeated
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Restrict the audio m-line to one codec (e.g. "opus")
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Restrict the video m-line to one codec (e.g. "VP8")
    #[arg(long)]
    pub video_codec: Option<String>,

    /// Wait for ICE gathering before sending the offer
    #[arg(long, action)]
    pub wait_for_ice_gathering: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Fold command line overrides into the file configuration
    pub fn apply_overrides(&self, config: &mut config::Config) {
        let transport = &mut config.transport;

        if let Some(ref endpoint) = self.endpoint {
            let request = transport
                .webrtc_request
                .get_or_insert_with(|| config::RequestParams::new(endpoint.clone()));
            request.endpoint = endpoint.clone();
            transport.webrtc_url = None;
            transport.connection_url = None;
        }
        if !self.ice_servers.is_empty() {
            transport.ice_servers = vec![config::IceServerConfig {
                urls: self.ice_servers.clone(),
                username: None,
                credential: None,
            }];
        }
        if self.audio_codec.is_some() {
            transport.audio_codec = self.audio_codec.clone();
        }
        if self.video_codec.is_some() {
            transport.video_codec = self.video_codec.clone();
        }
        if self.wait_for_ice_gathering {
            transport.wait_for_ice_gathering = true;
        }
    }
}
