//! Media engine interface
//!
//! The session drives an external mediasoup-style device through these
//! traits. Implementations own capture, codecs and the RTP/ICE/DTLS stacks;
//! the session only sequences them against the signaling channel.
//!
//! Transport listeners are invoked from inside [`SendTransport::produce`] and
//! friends, on the session task. They answer by round-tripping through the
//! protoo peer, which completes independently of the session task.

use crate::methods::TransportInfo;
use crate::types::MediaKind;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Media engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaEngineError {
    /// Router capabilities were never loaded
    #[error("Media engine not loaded")]
    NotLoaded,

    /// The device cannot send this kind
    #[error("Cannot produce {0}")]
    CannotProduce(MediaKind),

    /// Engine specific failure
    #[error("Media engine error: {0}")]
    Engine(String),
}

/// Called by the engine when a producer or consumer dies with its transport.
/// Receives the id of the object that closed.
pub type CloseHook = Box<dyn FnOnce(String) + Send + 'static>;

/// Server parameters needed to materialize a local transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    /// Server-side transport id
    pub id: String,
    /// ICE parameters
    pub ice_parameters: Value,
    /// ICE candidates
    pub ice_candidates: Value,
    /// DTLS parameters
    pub dtls_parameters: Value,
    /// SCTP parameters
    pub sctp_parameters: Option<Value>,
}

impl From<TransportInfo> for TransportOptions {
    fn from(info: TransportInfo) -> Self {
        Self {
            id: info.id,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
            sctp_parameters: info.sctp_parameters,
        }
    }
}

/// Local capture track handed to [`SendTransport::produce`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Engine track id
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
}

/// Arguments of [`SendTransport::produce`]
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// Track to send
    pub track: LocalTrack,
    /// RTP encodings, empty for the engine default
    pub encodings: Vec<Value>,
    /// Codec options
    pub codec_options: Option<Value>,
    /// Application data forwarded to the server
    pub app_data: Value,
}

/// Arguments of [`SendTransport::produce_data`]
#[derive(Debug, Clone)]
pub struct ProduceDataOptions {
    /// Channel label
    pub label: String,
    /// Channel sub-protocol
    pub protocol: String,
    /// Ordered delivery
    pub ordered: bool,
    /// Application data forwarded to the server
    pub app_data: Value,
}

/// Arguments of [`RecvTransport::consume`]
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Consumer id
    pub id: String,
    /// Remote producer id
    pub producer_id: String,
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters from the server
    pub rtp_parameters: Value,
    /// Application data
    pub app_data: Value,
}

/// Arguments of [`RecvTransport::consume_data`]
#[derive(Debug, Clone)]
pub struct ConsumeDataOptions {
    /// Data consumer id
    pub id: String,
    /// Remote data producer id
    pub data_producer_id: String,
    /// SCTP stream parameters from the server
    pub sctp_stream_parameters: Value,
    /// Channel label
    pub label: String,
    /// Channel sub-protocol
    pub protocol: String,
    /// Application data
    pub app_data: Value,
}

/// Callbacks shared by both transport directions
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// The transport needs its DTLS parameters signaled before media flows
    async fn on_connect(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), MediaEngineError>;

    /// ICE/DTLS connection state changed
    fn on_connection_state_change(&self, transport_id: &str, state: &str);
}

/// Callbacks of a send transport
#[async_trait]
pub trait SendTransportListener: TransportListener {
    /// A producer is being created; returns the server-issued producer id
    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String, MediaEngineError>;

    /// A data producer is being created; returns the server-issued id
    async fn on_produce_data(
        &self,
        transport_id: &str,
        sctp_stream_parameters: Value,
        label: &str,
        protocol: &str,
        app_data: Value,
    ) -> Result<String, MediaEngineError>;
}

/// Local media source bound to the send transport
pub trait Producer: Send + Sync {
    /// Server-issued id
    fn id(&self) -> &str;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Id of the track being sent
    fn track_id(&self) -> &str;
    /// Whether sending is paused
    fn is_paused(&self) -> bool;
    /// Pause sending
    fn pause(&self);
    /// Resume sending
    fn resume(&self);
    /// Stop sending and release the track
    fn close(&self);
}

/// Remote media sink bound to the receive transport
pub trait Consumer: Send + Sync {
    /// Consumer id
    fn id(&self) -> &str;
    /// Remote producer id
    fn producer_id(&self) -> &str;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Id of the track being rendered
    fn track_id(&self) -> &str;
    /// Whether reception is paused locally
    fn is_paused(&self) -> bool;
    /// Pause locally
    fn pause(&self);
    /// Resume locally
    fn resume(&self);
    /// Release the consumer
    fn close(&self);
}

/// Outgoing data channel
pub trait DataProducer: Send + Sync {
    /// Server-issued id
    fn id(&self) -> &str;
    /// Channel label
    fn label(&self) -> &str;
    /// Send a text message
    ///
    /// # Errors
    ///
    /// Fails when the channel is not open.
    fn send(&self, text: &str) -> Result<(), MediaEngineError>;
    /// Close the channel
    fn close(&self);
}

/// Incoming data channel
pub trait DataConsumer: Send + Sync {
    /// Data consumer id
    fn id(&self) -> &str;
    /// Remote data producer id
    fn data_producer_id(&self) -> &str;
    /// Channel label
    fn label(&self) -> &str;
    /// Close the channel
    fn close(&self);
}

/// Local transport carrying producers
#[async_trait]
pub trait SendTransport: Send + Sync {
    /// Server-side transport id
    fn id(&self) -> &str;

    /// Start sending a track
    ///
    /// Drives [`SendTransportListener::on_produce`] (and `on_connect` for the
    /// first producer) before returning.
    async fn produce(
        &self,
        options: ProduceOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn Producer>, MediaEngineError>;

    /// Open an outgoing data channel
    async fn produce_data(
        &self,
        options: ProduceDataOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn DataProducer>, MediaEngineError>;

    /// Apply ICE parameters returned by `restartIce`
    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), MediaEngineError>;

    /// Close the transport
    fn close(&self);
}

/// Local transport carrying consumers
#[async_trait]
pub trait RecvTransport: Send + Sync {
    /// Server-side transport id
    fn id(&self) -> &str;

    /// Start receiving a remote producer
    async fn consume(
        &self,
        options: ConsumeOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn Consumer>, MediaEngineError>;

    /// Start receiving a remote data producer
    async fn consume_data(
        &self,
        options: ConsumeDataOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn DataConsumer>, MediaEngineError>;

    /// Apply ICE parameters returned by `restartIce`
    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), MediaEngineError>;

    /// Close the transport
    fn close(&self);
}

/// The device: capabilities, capture and transport factory
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Whether router capabilities were loaded
    fn is_loaded(&self) -> bool;

    /// Load the router RTP capabilities
    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), MediaEngineError>;

    /// Local RTP capabilities, available once loaded
    fn rtp_capabilities(&self) -> Result<Value, MediaEngineError>;

    /// Local SCTP capabilities, available once loaded
    fn sctp_capabilities(&self) -> Result<Value, MediaEngineError>;

    /// Whether the loaded device can send `kind`
    fn can_produce(&self, kind: MediaKind) -> bool;

    /// Whether more than one camera is available
    fn can_change_cam(&self) -> bool {
        false
    }

    /// Open a capture track
    async fn create_track(&self, kind: MediaKind) -> Result<LocalTrack, MediaEngineError>;

    /// Switch the active camera
    async fn switch_camera(&self) -> Result<(), MediaEngineError>;

    /// Materialize the send transport
    async fn create_send_transport(
        &self,
        listener: Arc<dyn SendTransportListener>,
        options: TransportOptions,
    ) -> Result<Box<dyn SendTransport>, MediaEngineError>;

    /// Materialize the receive transport
    async fn create_recv_transport(
        &self,
        listener: Arc<dyn TransportListener>,
        options: TransportOptions,
    ) -> Result<Box<dyn RecvTransport>, MediaEngineError>;

    /// Release every engine resource; called once on session close
    fn dispose(&self);
}
