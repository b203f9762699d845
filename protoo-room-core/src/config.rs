//! Room configuration

use crate::peer::DEFAULT_REQUEST_TIMEOUT;
use crate::socket::{RetryPolicy, TransportError};
use crate::types::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Public mediasoup demo deployment
pub const DEFAULT_HOST: &str = "v3demo.mediasoup.org";

/// Protoo port of the demo deployment
pub const DEFAULT_PORT: u16 = 4443;

/// Session behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomOptions {
    /// Device announced on join
    pub device: DeviceInfo,
    /// Ask the server for TCP only ICE candidates
    pub force_tcp: bool,
    /// Create a send transport and produce media
    pub produce: bool,
    /// Create a receive transport and accept consumers
    pub consume: bool,
    /// Negotiate SCTP data channels
    pub use_data_channel: bool,
    /// Start the microphone once joined
    pub enable_mic_on_join: bool,
    /// Start the camera once joined
    pub enable_cam_on_join: bool,
    /// Bound of every signaling request issued by the session
    pub request_timeout: Duration,
    /// Signaling reconnect pacing
    pub retry: RetryPolicy,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            device: DeviceInfo::current(),
            force_tcp: false,
            produce: true,
            consume: true,
            use_data_channel: false,
            enable_mic_on_join: true,
            enable_cam_on_join: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Coordinates of a room on a protoo server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtooUrl {
    /// Server host name
    pub host: String,
    /// Protoo port
    pub port: u16,
    /// Room id
    pub room_id: String,
    /// Local peer id
    pub peer_id: String,
    /// Ask the server to use H264
    pub force_h264: bool,
    /// Ask the server to use VP9; ignored when `force_h264` is set
    pub force_vp9: bool,
}

impl ProtooUrl {
    /// Room on the default deployment
    pub fn new(room_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            room_id: room_id.into(),
            peer_id: peer_id.into(),
            force_h264: false,
            force_vp9: false,
        }
    }

    /// Use another server
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Signaling URL, `wss://host:port/?roomId=..&peerId=..`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the host is not valid.
    pub fn protoo_url(&self) -> Result<Url, TransportError> {
        let mut url = parse(&format!("wss://{}:{}/", self.host, self.port))?;
        url.query_pairs_mut()
            .append_pair("roomId", &self.room_id)
            .append_pair("peerId", &self.peer_id);
        self.append_codec(&mut url);
        Ok(url)
    }

    /// Web link inviting others into the room
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the host is not valid.
    pub fn invitation_link(&self) -> Result<Url, TransportError> {
        let mut url = parse(&format!("https://{}/", self.host))?;
        url.query_pairs_mut().append_pair("roomId", &self.room_id);
        self.append_codec(&mut url);
        Ok(url)
    }

    fn append_codec(&self, url: &mut Url) {
        if self.force_h264 {
            url.query_pairs_mut().append_pair("forceH264", "true");
        } else if self.force_vp9 {
            url.query_pairs_mut().append_pair("forceVP9", "true");
        }
    }
}

fn parse(text: &str) -> Result<Url, TransportError> {
    Url::parse(text).map_err(|e| TransportError::InvalidUrl(format!("{text}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = RoomOptions::default();
        assert!(options.produce && options.consume);
        assert!(!options.force_tcp);
        assert!(!options.use_data_channel);
        assert!(options.enable_mic_on_join && options.enable_cam_on_join);
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert_eq!(options.retry.retries, 10);
    }

    #[test]
    fn test_options_fill_missing_fields() {
        let options: RoomOptions =
            serde_json::from_str(r#"{"produce": false, "use_data_channel": true}"#).unwrap();
        assert!(!options.produce);
        assert!(options.use_data_channel);
        assert!(options.consume);
    }

    #[test]
    fn test_protoo_url() {
        let url = ProtooUrl::new("room1", "peer1").protoo_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://v3demo.mediasoup.org:4443/?roomId=room1&peerId=peer1"
        );
    }

    #[test]
    fn test_h264_wins_over_vp9() {
        let mut room = ProtooUrl::new("r", "p").with_host("localhost", 9443);
        room.force_vp9 = true;
        assert_eq!(
            room.protoo_url().unwrap().as_str(),
            "wss://localhost:9443/?roomId=r&peerId=p&forceVP9=true"
        );
        room.force_h264 = true;
        assert_eq!(
            room.protoo_url().unwrap().as_str(),
            "wss://localhost:9443/?roomId=r&peerId=p&forceH264=true"
        );
    }

    #[test]
    fn test_invitation_link_escapes_room_id() {
        let link = ProtooUrl::new("my room", "p").invitation_link().unwrap();
        assert_eq!(link.as_str(), "https://v3demo.mediasoup.org/?roomId=my+room");
    }

    #[test]
    fn test_invalid_host() {
        let room = ProtooUrl::new("r", "p").with_host("bad host", 1);
        assert!(matches!(room.protoo_url(), Err(TransportError::InvalidUrl(_))));
    }
}
