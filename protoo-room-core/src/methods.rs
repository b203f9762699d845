//! Typed protoo method table
//!
//! Every request the client sends implements [`ProtooRequest`], pairing the
//! wire method name with its payload and response shape. Server pushed
//! notifications and requests are decoded into [`ServerNotification`] and
//! [`InboundRequest`]. Media engine parameters (RTP capabilities, DTLS and ICE
//! parameters) stay opaque [`Value`]s: the session only ferries them between
//! the server and the engine.

use crate::message::Notification;
use crate::peer::ProtooError;
use crate::types::{DeviceInfo, MediaKind, PeerInfo};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A client to server request with a known method and response shape
pub trait ProtooRequest: Serialize + Send + Sync {
    /// Wire method name
    const METHOD: &'static str;

    /// Decoded `data` of a successful response
    type Response: DeserializeOwned + Send;
}

/// Response type for methods whose reply data carries nothing of interest
pub type Ack = IgnoredAny;

/// Ask for the router RTP capabilities
#[derive(Debug, Clone, Default, Serialize)]
pub struct GetRouterRtpCapabilities {}

impl ProtooRequest for GetRouterRtpCapabilities {
    const METHOD: &'static str = "getRouterRtpCapabilities";
    type Response = Value;
}

/// Ask the server to create a WebRTC transport
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransport {
    /// Force TCP ICE candidates
    pub force_tcp: bool,
    /// Transport will carry producers
    pub producing: bool,
    /// Transport will carry consumers
    pub consuming: bool,
    /// Local SCTP capabilities when data channels are used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_capabilities: Option<Value>,
}

/// Parameters of a transport created on the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    /// Server-side transport id
    pub id: String,
    /// ICE parameters
    pub ice_parameters: Value,
    /// ICE candidates
    pub ice_candidates: Value,
    /// DTLS parameters
    pub dtls_parameters: Value,
    /// SCTP parameters, present when data channels were requested
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

impl ProtooRequest for CreateWebRtcTransport {
    const METHOD: &'static str = "createWebRtcTransport";
    type Response = TransportInfo;
}

/// Hand the local DTLS parameters of a transport to the server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransport {
    /// Server-side transport id
    pub transport_id: String,
    /// Local DTLS parameters
    pub dtls_parameters: Value,
}

impl ProtooRequest for ConnectWebRtcTransport {
    const METHOD: &'static str = "connectWebRtcTransport";
    type Response = Ack;
}

/// Restart ICE on a transport; the response data is the new ICE parameters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartIce {
    /// Server-side transport id
    pub transport_id: String,
}

impl ProtooRequest for RestartIce {
    const METHOD: &'static str = "restartIce";
    type Response = Value;
}

/// Enter the room
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    /// Local display name
    pub display_name: String,
    /// Local device descriptor
    pub device: DeviceInfo,
    /// Local RTP capabilities, sent only when consuming
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtp_capabilities: Option<Value>,
    /// Local SCTP capabilities, sent only with data channels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_capabilities: Option<Value>,
}

/// Response to [`Join`]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JoinResponse {
    /// Peers already in the room
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

impl ProtooRequest for Join {
    const METHOD: &'static str = "join";
    type Response = JoinResponse;
}

/// Create a server-side producer for a local track
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    /// Send transport id
    pub transport_id: String,
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters from the engine
    pub rtp_parameters: Value,
    /// Application data
    pub app_data: Value,
}

/// Server-issued id of a new producer or data producer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProducedId {
    /// Id
    pub id: String,
}

impl ProtooRequest for Produce {
    const METHOD: &'static str = "produce";
    type Response = ProducedId;
}

/// Create a server-side data producer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    /// Send transport id
    pub transport_id: String,
    /// SCTP stream parameters from the engine
    pub sctp_stream_parameters: Value,
    /// Channel label
    pub label: String,
    /// Channel sub-protocol
    pub protocol: String,
    /// Application data
    pub app_data: Value,
}

impl ProtooRequest for ProduceData {
    const METHOD: &'static str = "produceData";
    type Response = ProducedId;
}

macro_rules! producer_request {
    ($(#[$doc:meta])* $name:ident, $method:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            /// Producer id
            pub producer_id: String,
        }

        impl ProtooRequest for $name {
            const METHOD: &'static str = $method;
            type Response = Ack;
        }
    };
}

macro_rules! consumer_request {
    ($(#[$doc:meta])* $name:ident, $method:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            /// Consumer id
            pub consumer_id: String,
        }

        impl ProtooRequest for $name {
            const METHOD: &'static str = $method;
            type Response = Ack;
        }
    };
}

producer_request!(
    /// Close a producer on the server
    CloseProducer,
    "closeProducer"
);
producer_request!(
    /// Pause a producer on the server
    PauseProducer,
    "pauseProducer"
);
producer_request!(
    /// Resume a producer on the server
    ResumeProducer,
    "resumeProducer"
);
consumer_request!(
    /// Pause a consumer on the server
    PauseConsumer,
    "pauseConsumer"
);
consumer_request!(
    /// Resume a consumer on the server
    ResumeConsumer,
    "resumeConsumer"
);
consumer_request!(
    /// Ask the remote producer for a key frame
    RequestConsumerKeyFrame,
    "requestConsumerKeyFrame"
);

/// Select the spatial and temporal layers a consumer should receive
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsumerPreferredLayers {
    /// Consumer id
    pub consumer_id: String,
    /// Spatial layer
    pub spatial_layer: u32,
    /// Temporal layer
    pub temporal_layer: u32,
}

impl ProtooRequest for SetConsumerPreferredLayers {
    const METHOD: &'static str = "setConsumerPreferredLayers";
    type Response = Ack;
}

/// Rename the local peer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDisplayName {
    /// New display name
    pub display_name: String,
}

impl ProtooRequest for ChangeDisplayName {
    const METHOD: &'static str = "changeDisplayName";
    type Response = Ack;
}

/// Notifications pushed by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerNotification {
    /// Quality score of a local producer
    ProducerScore {
        /// Producer id
        producer_id: String,
        /// Opaque score document
        score: Value,
    },
    /// A peer entered the room
    NewPeer(PeerInfo),
    /// A peer left the room
    PeerClosed {
        /// Peer id
        peer_id: String,
    },
    /// A peer renamed itself
    PeerDisplayNameChanged {
        /// Peer id
        peer_id: String,
        /// New name
        display_name: String,
        /// Previous name
        #[serde(default)]
        old_display_name: String,
    },
    /// The server closed a consumer
    ConsumerClosed {
        /// Consumer id
        consumer_id: String,
    },
    /// The remote side paused a consumer
    ConsumerPaused {
        /// Consumer id
        consumer_id: String,
    },
    /// The remote side resumed a consumer
    ConsumerResumed {
        /// Consumer id
        consumer_id: String,
    },
    /// The layers forwarded to a consumer changed
    ConsumerLayersChanged {
        /// Consumer id
        consumer_id: String,
        /// Current spatial layer, absent while nothing is forwarded
        spatial_layer: Option<u32>,
        /// Current temporal layer
        temporal_layer: Option<u32>,
    },
    /// Quality score of a consumer
    ConsumerScore {
        /// Consumer id
        consumer_id: String,
        /// Opaque score document
        score: Value,
    },
    /// The server closed a data consumer
    DataConsumerClosed {
        /// Data consumer id
        data_consumer_id: String,
    },
    /// Loudest peer changed; `None` when nobody speaks
    ActiveSpeaker {
        /// Peer id
        peer_id: Option<String>,
    },
}

impl ServerNotification {
    /// Methods understood by [`ServerNotification::from_notification`]
    pub const METHODS: &'static [&'static str] = &[
        "producerScore",
        "newPeer",
        "peerClosed",
        "peerDisplayNameChanged",
        "consumerClosed",
        "consumerPaused",
        "consumerResumed",
        "consumerLayersChanged",
        "consumerScore",
        "dataConsumerClosed",
        "activeSpeaker",
    ];

    /// Decode a raw notification
    ///
    /// # Errors
    ///
    /// [`ProtooError::UnknownMethod`] for methods outside the table and
    /// [`ProtooError::Json`] when the payload does not match the method.
    pub fn from_notification(notification: &Notification) -> Result<Self, ProtooError> {
        decode_tagged(Self::METHODS, &notification.method, &notification.data)
    }
}

/// Payload of a `newConsumer` server request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumerRequest {
    /// Owning remote peer
    pub peer_id: String,
    /// Remote producer id
    pub producer_id: String,
    /// Consumer id
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters for the engine
    pub rtp_parameters: Value,
    /// Consumer type (`simple`, `simulcast`, `svc`)
    #[serde(rename = "type", default)]
    pub consumer_type: String,
    /// Application data
    #[serde(default)]
    pub app_data: Value,
    /// Whether the remote producer is paused
    #[serde(default)]
    pub producer_paused: bool,
}

/// Payload of a `newDataConsumer` server request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataConsumerRequest {
    /// Owning remote peer, `None` for server side data producers
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Remote data producer id
    pub data_producer_id: String,
    /// Data consumer id
    pub id: String,
    /// SCTP stream parameters for the engine
    pub sctp_stream_parameters: Value,
    /// Channel label
    #[serde(default)]
    pub label: String,
    /// Channel sub-protocol
    #[serde(default)]
    pub protocol: String,
    /// Application data
    #[serde(default)]
    pub app_data: Value,
}

/// Requests the server sends to the client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum InboundRequest {
    /// Start receiving a remote producer
    NewConsumer(NewConsumerRequest),
    /// Start receiving a remote data producer
    NewDataConsumer(NewDataConsumerRequest),
}

impl InboundRequest {
    /// Methods understood by [`InboundRequest::decode`]
    pub const METHODS: &'static [&'static str] = &["newConsumer", "newDataConsumer"];

    /// Decode a server request payload
    ///
    /// # Errors
    ///
    /// [`ProtooError::UnknownMethod`] or [`ProtooError::Json`], as for
    /// [`ServerNotification::from_notification`].
    pub fn decode(method: &str, data: &Value) -> Result<Self, ProtooError> {
        decode_tagged(Self::METHODS, method, data)
    }
}

fn decode_tagged<T: DeserializeOwned>(
    known: &[&str],
    method: &str,
    data: &Value,
) -> Result<T, ProtooError> {
    if !known.contains(&method) {
        return Err(ProtooError::UnknownMethod(method.to_string()));
    }
    Ok(serde_json::from_value(json!({
        "method": method,
        "data": data,
    }))?)
}
