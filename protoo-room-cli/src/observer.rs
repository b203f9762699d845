//! Signaling-only media engine
//!
//! Lets the CLI sit in a room without capture or decode support. It loads the
//! router capabilities, never produces media, and accepts every consumer the
//! server offers with a placeholder that only tracks its paused flag.

use async_trait::async_trait;
use protoo_room_core::media_engine::{
    CloseHook, ConsumeDataOptions, ConsumeOptions, Consumer, DataConsumer, DataProducer,
    LocalTrack, MediaEngine, MediaEngineError, ProduceDataOptions, ProduceOptions, Producer,
    RecvTransport, SendTransport, SendTransportListener, TransportListener, TransportOptions,
};
use protoo_room_core::MediaKind;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Receive-only engine for observing a room
#[derive(Default)]
pub struct ObserverEngine {
    router_capabilities: Mutex<Option<Value>>,
}

impl ObserverEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn loaded_capabilities(&self) -> Result<Value, MediaEngineError> {
        self.router_capabilities
            .lock()
            .map_err(|_| MediaEngineError::Engine("capabilities lock poisoned".to_string()))?
            .clone()
            .ok_or(MediaEngineError::NotLoaded)
    }
}

#[async_trait]
impl MediaEngine for ObserverEngine {
    fn is_loaded(&self) -> bool {
        self.router_capabilities
            .lock()
            .map(|caps| caps.is_some())
            .unwrap_or(false)
    }

    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), MediaEngineError> {
        let mut caps = self
            .router_capabilities
            .lock()
            .map_err(|_| MediaEngineError::Engine("capabilities lock poisoned".to_string()))?;
        *caps = Some(router_rtp_capabilities);
        tracing::debug!("router capabilities loaded");
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<Value, MediaEngineError> {
        // Claim whatever the router offers so the server forwards every stream
        let router = self.loaded_capabilities()?;
        Ok(json!({
            "codecs": router.get("codecs").cloned().unwrap_or_else(|| json!([])),
            "headerExtensions": router.get("headerExtensions").cloned().unwrap_or_else(|| json!([])),
        }))
    }

    fn sctp_capabilities(&self) -> Result<Value, MediaEngineError> {
        self.loaded_capabilities()?;
        Ok(json!({"numStreams": {"OS": 1024, "MIS": 1024}}))
    }

    fn can_produce(&self, _kind: MediaKind) -> bool {
        false
    }

    async fn create_track(&self, kind: MediaKind) -> Result<LocalTrack, MediaEngineError> {
        Err(MediaEngineError::CannotProduce(kind))
    }

    async fn switch_camera(&self) -> Result<(), MediaEngineError> {
        Err(MediaEngineError::CannotProduce(MediaKind::Video))
    }

    async fn create_send_transport(
        &self,
        listener: Arc<dyn SendTransportListener>,
        options: TransportOptions,
    ) -> Result<Box<dyn SendTransport>, MediaEngineError> {
        Ok(Box::new(ObserverSendTransport {
            id: options.id,
            listener,
        }))
    }

    async fn create_recv_transport(
        &self,
        _listener: Arc<dyn TransportListener>,
        options: TransportOptions,
    ) -> Result<Box<dyn RecvTransport>, MediaEngineError> {
        Ok(Box::new(ObserverRecvTransport { id: options.id }))
    }

    fn dispose(&self) {
        if let Ok(mut caps) = self.router_capabilities.lock() {
            caps.take();
        }
    }
}

/// Carries only the chat data channel
struct ObserverSendTransport {
    id: String,
    listener: Arc<dyn SendTransportListener>,
}

#[async_trait]
impl SendTransport for ObserverSendTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(
        &self,
        options: ProduceOptions,
        _on_transport_close: CloseHook,
    ) -> Result<Box<dyn Producer>, MediaEngineError> {
        Err(MediaEngineError::CannotProduce(options.track.kind))
    }

    async fn produce_data(
        &self,
        options: ProduceDataOptions,
        _on_transport_close: CloseHook,
    ) -> Result<Box<dyn DataProducer>, MediaEngineError> {
        let id = self
            .listener
            .on_produce_data(
                &self.id,
                json!({"streamId": 0, "ordered": options.ordered}),
                &options.label,
                &options.protocol,
                options.app_data,
            )
            .await?;
        Ok(Box::new(ObserverDataProducer {
            id,
            label: options.label,
        }))
    }

    async fn restart_ice(&self, _ice_parameters: Value) -> Result<(), MediaEngineError> {
        Ok(())
    }

    fn close(&self) {
        tracing::debug!(transport_id = %self.id, "send transport closed");
    }
}

struct ObserverRecvTransport {
    id: String,
}

#[async_trait]
impl RecvTransport for ObserverRecvTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn consume(
        &self,
        options: ConsumeOptions,
        _on_transport_close: CloseHook,
    ) -> Result<Box<dyn Consumer>, MediaEngineError> {
        Ok(Box::new(ObserverConsumer {
            track_id: format!("observer-{}", options.id),
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            paused: AtomicBool::new(false),
        }))
    }

    async fn consume_data(
        &self,
        options: ConsumeDataOptions,
        _on_transport_close: CloseHook,
    ) -> Result<Box<dyn DataConsumer>, MediaEngineError> {
        Ok(Box::new(ObserverDataConsumer {
            id: options.id,
            data_producer_id: options.data_producer_id,
            label: options.label,
        }))
    }

    async fn restart_ice(&self, _ice_parameters: Value) -> Result<(), MediaEngineError> {
        Ok(())
    }

    fn close(&self) {
        tracing::debug!(transport_id = %self.id, "recv transport closed");
    }
}

struct ObserverConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track_id: String,
    paused: AtomicBool,
}

impl Consumer for ObserverConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track_id(&self) -> &str {
        &self.track_id
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn close(&self) {}
}

/// Chat channel without an SCTP stack; messages are only logged
struct ObserverDataProducer {
    id: String,
    label: String,
}

impl DataProducer for ObserverDataProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, text: &str) -> Result<(), MediaEngineError> {
        tracing::info!(data_producer_id = %self.id, text, "chat message");
        Ok(())
    }

    fn close(&self) {}
}

struct ObserverDataConsumer {
    id: String,
    data_producer_id: String,
    label: String,
}

impl DataConsumer for ObserverDataConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn close(&self) {}
}
