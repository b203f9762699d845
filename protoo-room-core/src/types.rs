//! Room types and data structures

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Connection state of a room session
///
/// Transitions are one-way except `Connecting` ↔ `Connected`, which may cycle
/// while the signaling socket reconnects. `Closed` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Client constructed, `join` not called yet
    #[default]
    New,
    /// Waiting for the signaling socket or the join handshake
    Connecting,
    /// Joined the room
    Connected,
    /// Session torn down for good
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `to` is allowed
    #[must_use]
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        matches!(
            (self, to),
            (ConnectionState::New, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connected, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connecting)
                | (ConnectionState::New, ConnectionState::Closed)
                | (ConnectionState::Connecting, ConnectionState::Closed)
                | (ConnectionState::Connected, ConnectionState::Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
    /// Data channel
    Data,
}

impl MediaKind {
    /// Wire name of the kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Data => "data",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    /// Carries local producers
    Send,
    /// Carries remote consumers
    Recv,
}

/// Device descriptor announced to the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Short platform flag, e.g. `"rust"`
    pub flag: String,
    /// Human readable device name
    pub name: String,
    /// Version string
    pub version: String,
}

impl DeviceInfo {
    /// Descriptor for the running process
    #[must_use]
    pub fn current() -> Self {
        Self {
            flag: "rust".to_string(),
            name: format!("Rust {}", std::env::consts::OS),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Descriptor used when a peer did not announce one
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            flag: "unknown".to_string(),
            name: "unknown".to_string(),
            version: "unknown".to_string(),
        }
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// Remote participant as announced by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Device descriptor
    #[serde(default = "DeviceInfo::unknown")]
    pub device: DeviceInfo,
}

/// Notify severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyType {
    /// Informational
    Info,
    /// Something failed
    Error,
    /// Chat style message with a title
    Message,
}

/// Transient user-facing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    /// Random delivery id
    pub id: String,
    /// Severity
    #[serde(rename = "type")]
    pub kind: NotifyType,
    /// Optional title, set for `Message`
    pub title: Option<String>,
    /// Body text
    pub text: String,
    /// Display duration in milliseconds
    pub timeout_ms: u64,
}

impl Notify {
    /// Default display time of info notifies
    pub const INFO_TIMEOUT_MS: u64 = 3000;
    /// Default display time of error and message notifies
    pub const ERROR_TIMEOUT_MS: u64 = 5000;

    /// Create a notify with the default timeout for its type
    pub fn new(kind: NotifyType, text: impl Into<String>) -> Self {
        let timeout_ms = match kind {
            NotifyType::Info => Self::INFO_TIMEOUT_MS,
            NotifyType::Error | NotifyType::Message => Self::ERROR_TIMEOUT_MS,
        };
        Self {
            id: random_id(6),
            kind,
            title: None,
            text: text.into(),
            timeout_ms,
        }
    }

    /// Informational notify
    pub fn info(text: impl Into<String>) -> Self {
        Self::new(NotifyType::Info, text)
    }

    /// Error notify
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(NotifyType::Error, text)
    }

    /// Titled message notify
    pub fn message(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::new(NotifyType::Message, text)
        }
    }

    /// Override the display time
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Random lowercase alphanumeric string, used for notify and peer ids
#[must_use]
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_transitions() {
        use ConnectionState::*;
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(New));
        assert!(!Connected.can_transition_to(New));
        assert!(!New.can_transition_to(Connected));
    }

    #[test]
    fn test_notify_default_timeouts() {
        assert_eq!(Notify::info("hi").timeout_ms, 3000);
        assert_eq!(Notify::error("boom").timeout_ms, 5000);

        let msg = Notify::message("alice", "hello");
        assert_eq!(msg.kind, NotifyType::Message);
        assert_eq!(msg.title.as_deref(), Some("alice"));
        assert_eq!(msg.timeout_ms, 5000);

        assert_eq!(Notify::info("x").with_timeout(10).timeout_ms, 10);
    }

    #[test]
    fn test_notify_ids() {
        let a = Notify::info("a");
        assert_eq!(a.id.len(), 6);
        assert!(a
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let room = random_id(8);
        assert_eq!(room.len(), 8);
        assert_eq!(room, room.to_ascii_lowercase());
    }

    #[test]
    fn test_peer_info_defaults() {
        let peer: PeerInfo = serde_json::from_str(r#"{"id":"p1"}"#).unwrap();
        assert_eq!(peer.id, "p1");
        assert_eq!(peer.display_name, "");
        assert_eq!(peer.device, DeviceInfo::unknown());

        let peer: PeerInfo = serde_json::from_str(
            r#"{"id":"p2","displayName":"Bob","device":{"flag":"chrome","name":"Chrome","version":"120"}}"#,
        )
        .unwrap();
        assert_eq!(peer.display_name, "Bob");
        assert_eq!(peer.device.flag, "chrome");
    }

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
        assert_eq!(MediaKind::Video.to_string(), "video");
    }
}
