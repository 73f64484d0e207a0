use crate::media::MediaConstraints;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_RELAY_ADDRESS: &str = "0.0.0.0:3001";
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3001";

/// Client-side settings shared by every peer link of a session.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub ice_servers: Vec<String>,
    pub constraints: MediaConstraints,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            constraints: MediaConstraints::default(),
        }
    }
}

impl MeshConfig {
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_address: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_RELAY_ADDRESS.to_owned(),
        }
    }
}
