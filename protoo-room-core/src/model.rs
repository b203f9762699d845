//! Snapshot types of the room store

use crate::types::{ConnectionState, DeviceInfo, MediaKind, PeerInfo};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Room level state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    /// Signaling URL
    pub url: String,
    /// Room id
    pub room_id: String,
    /// Local peer id
    pub peer_id: String,
    /// Connection state
    pub state: ConnectionState,
    /// Loudest remote peer
    pub active_speaker_id: Option<String>,
}

/// The local participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Me {
    /// Local peer id
    pub id: String,
    /// Display name
    pub display_name: String,
    /// Device announced to the room
    pub device: DeviceInfo,
    /// Microphone production is possible
    pub can_send_mic: bool,
    /// Camera production is possible
    pub can_send_cam: bool,
    /// More than one camera is available
    pub can_change_cam: bool,
    /// Camera switch or enable in flight
    pub cam_in_progress: bool,
    /// Video consumption is paused
    pub audio_only: bool,
    /// Audio-only toggle in flight
    pub audio_only_in_progress: bool,
    /// Local audio playback muted
    pub audio_muted: bool,
    /// ICE restart in flight
    pub restart_ice_in_progress: bool,
}

impl Default for Me {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            device: DeviceInfo::current(),
            can_send_mic: false,
            can_send_cam: false,
            can_change_cam: false,
            cam_in_progress: false,
            audio_only: false,
            audio_only_in_progress: false,
            audio_muted: false,
            restart_ice_in_progress: false,
        }
    }
}

impl Me {
    /// Reset everything except identity
    pub fn clear_transient(&mut self) {
        *self = Self {
            id: std::mem::take(&mut self.id),
            display_name: std::mem::take(&mut self.display_name),
            device: self.device.clone(),
            ..Self::default()
        };
    }
}

/// A remote participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeer {
    /// Peer id
    pub id: String,
    /// Display name
    pub display_name: String,
    /// Device descriptor
    pub device: DeviceInfo,
    /// Consumers receiving this peer's producers
    pub consumers: IndexSet<String>,
    /// Data consumers receiving this peer's data producers
    pub data_consumers: IndexSet<String>,
}

impl From<PeerInfo> for RemotePeer {
    fn from(info: PeerInfo) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            device: info.device,
            consumers: IndexSet::new(),
            data_consumers: IndexSet::new(),
        }
    }
}

/// A local producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerState {
    /// Server-issued id
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Paused on the server
    pub paused: bool,
    /// Engine track id
    pub track_id: String,
    /// Last score reported by the server
    pub score: Option<Value>,
}

/// Who paused a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    /// The local user
    Local,
    /// The remote producer or the server
    Remote,
}

/// A remote stream being received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerState {
    /// Consumer id
    pub id: String,
    /// Owning remote peer
    pub peer_id: String,
    /// Remote producer id
    pub producer_id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Consumer type (`simple`, `simulcast`, `svc`)
    pub consumer_type: String,
    /// Paused by the local user
    pub locally_paused: bool,
    /// Paused by the remote side
    pub remotely_paused: bool,
    /// Spatial layer currently forwarded
    pub spatial_layer: Option<u32>,
    /// Temporal layer currently forwarded
    pub temporal_layer: Option<u32>,
    /// Spatial layer asked for
    pub preferred_spatial_layer: Option<u32>,
    /// Temporal layer asked for
    pub preferred_temporal_layer: Option<u32>,
    /// Last score reported by the server
    pub score: Option<Value>,
    /// Engine track id
    pub track_id: String,
}

impl ConsumerState {
    /// Paused by either side
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.locally_paused || self.remotely_paused
    }
}

/// A remote data channel being received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumerState {
    /// Data consumer id
    pub id: String,
    /// Owning remote peer, `None` for server side producers
    pub peer_id: Option<String>,
    /// Remote data producer id
    pub data_producer_id: String,
    /// Channel label
    pub label: String,
    /// Channel sub-protocol
    pub protocol: String,
}

/// Remote peers in join order
pub type Peers = IndexMap<String, RemotePeer>;
/// Local producers by id
pub type Producers = IndexMap<String, ProducerState>;
/// Consumers by id
pub type Consumers = IndexMap<String, ConsumerState>;
/// Data consumers by id
pub type DataConsumers = IndexMap<String, DataConsumerState>;
