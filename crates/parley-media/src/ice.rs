//! ICE server configuration.
//!
//! STUN first for direct connectivity, TURN entries as relay fallback
//! when both peers sit behind symmetric NATs.

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

use parley_shared::constants::ICE_CANDIDATE_POOL_SIZE;

#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_servers: Vec<IceServer>,
    pub turn_servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun.cloudflare.com:3478"),
            ],
            turn_servers: vec![
                IceServer::turn("turn:global.relay.metered.ca:80", "free", "free"),
                IceServer::turn("turn:global.relay.metered.ca:443", "free", "free"),
            ],
            candidate_pool_size: ICE_CANDIDATE_POOL_SIZE,
        }
    }
}

impl IceConfig {
    /// A configuration with no external servers; host candidates only.
    /// Suitable for tests and same-network calls.
    pub fn host_only() -> Self {
        Self {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            candidate_pool_size: 0,
        }
    }

    /// Build the `RTCConfiguration` handed to the WebRTC stack:
    /// audio+video bundled on one transport, muxed RTCP.
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .stun_servers
            .iter()
            .chain(self.turn_servers.iter())
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: self.candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ice_transport_policy: RTCIceTransportPolicy::All,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_stun_and_turn() {
        let config = IceConfig::default();
        assert!(!config.stun_servers.is_empty());
        assert!(!config.turn_servers.is_empty());

        let rtc = config.rtc_configuration();
        assert_eq!(
            rtc.ice_servers.len(),
            config.stun_servers.len() + config.turn_servers.len()
        );
        assert_eq!(rtc.ice_candidate_pool_size, ICE_CANDIDATE_POOL_SIZE);
    }

    #[test]
    fn test_turn_servers_carry_credentials() {
        let config = IceConfig::default();
        let rtc = config.rtc_configuration();
        let turn = rtc
            .ice_servers
            .iter()
            .find(|s| s.urls[0].starts_with("turn:"))
            .unwrap();
        assert!(!turn.username.is_empty());
        assert!(!turn.credential.is_empty());
    }
}
