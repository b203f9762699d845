//! Session actor
//!
//! All orchestration runs on one task: commands from [`crate::room::RoomClient`],
//! peer events and media engine close callbacks are multiplexed into a single
//! dispatch loop, so the transports, producers and consumers below are never
//! touched concurrently.

use crate::config::RoomOptions;
use crate::media_engine::{
    CloseHook, ConsumeDataOptions, ConsumeOptions, Consumer, DataConsumer, DataProducer,
    MediaEngine, MediaEngineError, ProduceDataOptions, ProduceOptions, Producer, RecvTransport,
    SendTransport, SendTransportListener, TransportListener,
};
use crate::message::Notification;
use crate::methods::{
    ChangeDisplayName, CloseProducer, ConnectWebRtcTransport, CreateWebRtcTransport,
    GetRouterRtpCapabilities, InboundRequest, Join, NewConsumerRequest, NewDataConsumerRequest,
    PauseConsumer, PauseProducer, Produce, ProduceData, RequestConsumerKeyFrame, RestartIce,
    ResumeConsumer, ResumeProducer, ServerNotification, SetConsumerPreferredLayers,
};
use crate::model::{ConsumerState, DataConsumerState, Originator, ProducerState};
use crate::peer::{Peer, PeerEvent, ProtooError, ServerRequest};
use crate::room::RoomError;
use crate::store::RoomStore;
use crate::types::{ConnectionState, MediaKind, Notify, TransportRole};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Intent posted by the public handle
#[derive(Debug)]
pub(crate) enum Command {
    EnableMic,
    DisableMic,
    MuteMic,
    UnmuteMic,
    EnableCam,
    DisableCam,
    ChangeCam,
    EnableAudioOnly,
    DisableAudioOnly,
    MuteAudio,
    UnmuteAudio,
    RestartIce,
    ChangeDisplayName(String),
    SendChatMessage(String),
    SetConsumerPreferredLayers {
        consumer_id: String,
        spatial_layer: u32,
        temporal_layer: u32,
    },
    RequestConsumerKeyFrame(String),
    Close(oneshot::Sender<()>),
}

/// Engine callbacks for objects that died with their transport
#[derive(Debug)]
enum MediaEvent {
    ProducerClosed(String),
    DataProducerClosed(String),
    ConsumerClosed(String),
    DataConsumerClosed(String),
}

enum Flow {
    Continue,
    Stop,
}

struct OwnedConsumer {
    peer_id: String,
    consumer: Box<dyn Consumer>,
}

struct OwnedDataConsumer {
    peer_id: Option<String>,
    data_consumer: Box<dyn DataConsumer>,
}

pub(crate) struct Session {
    options: RoomOptions,
    display_name: String,
    engine: Arc<dyn MediaEngine>,
    store: Arc<RoomStore>,
    peer: Peer,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    media_rx: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    send_transport: Option<Box<dyn SendTransport>>,
    recv_transport: Option<Box<dyn RecvTransport>>,
    mic_producer: Option<Box<dyn Producer>>,
    cam_producer: Option<Box<dyn Producer>>,
    chat_producer: Option<Box<dyn DataProducer>>,
    consumers: HashMap<String, OwnedConsumer>,
    data_consumers: HashMap<String, OwnedDataConsumer>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        options: RoomOptions,
        display_name: String,
        engine: Arc<dyn MediaEngine>,
        store: Arc<RoomStore>,
        peer: Peer,
    ) -> Self {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        Self {
            options,
            display_name,
            engine,
            store,
            peer,
            media_tx,
            media_rx: Some(media_rx),
            send_transport: None,
            recv_transport: None,
            mic_producer: None,
            cam_producer: None,
            chat_producer: None,
            consumers: HashMap::new(),
            data_consumers: HashMap::new(),
            closed: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let Some(mut media_rx) = self.media_rx.take() else {
            return;
        };

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        Flow::Stop
                    }
                    Some(command) => {
                        self.handle_command(command).await;
                        Flow::Continue
                    }
                    None => {
                        self.shutdown().await;
                        Flow::Stop
                    }
                },
                event = peer_events.recv() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => {
                        self.shutdown().await;
                        Flow::Stop
                    }
                },
                Some(event) = media_rx.recv() => {
                    self.handle_media_event(event);
                    Flow::Continue
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }
        tracing::debug!("session task finished");
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, "command");
        match command {
            Command::EnableMic => self.enable_mic().await,
            Command::DisableMic => self.disable_mic().await,
            Command::MuteMic => self.mute_mic().await,
            Command::UnmuteMic => self.unmute_mic().await,
            Command::EnableCam => self.enable_cam().await,
            Command::DisableCam => self.disable_cam().await,
            Command::ChangeCam => self.change_cam().await,
            Command::EnableAudioOnly => self.enable_audio_only().await,
            Command::DisableAudioOnly => self.disable_audio_only().await,
            Command::MuteAudio => self.store.set_audio_muted_state(true),
            Command::UnmuteAudio => self.store.set_audio_muted_state(false),
            Command::RestartIce => self.restart_ice().await,
            Command::ChangeDisplayName(name) => self.change_display_name(name).await,
            Command::SendChatMessage(text) => self.send_chat_message(&text),
            Command::SetConsumerPreferredLayers {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                self.set_consumer_preferred_layers(consumer_id, spatial_layer, temporal_layer)
                    .await
            }
            Command::RequestConsumerKeyFrame(consumer_id) => {
                self.request_consumer_key_frame(consumer_id).await
            }
            Command::Close(_) => {}
        }
    }

    fn notify_error(&self, text: String) {
        tracing::error!(%text, "session error");
        self.store.add_notify(Notify::error(text));
    }

    // Connection lifecycle

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Flow {
        match event {
            PeerEvent::Open => match self.join_room().await {
                Ok(()) => {}
                Err(RoomError::Protoo(ProtooError::Disconnected)) => {
                    tracing::warn!("signaling lost while joining, waiting for reconnect");
                }
                Err(e) => {
                    self.notify_error(format!("Could not join the room: {e}"));
                    self.shutdown().await;
                    return Flow::Stop;
                }
            },
            PeerEvent::Failed => {
                self.store
                    .add_notify(Notify::error("WebSocket connection failed"));
                self.store.set_room_state(ConnectionState::Connecting);
            }
            PeerEvent::Disconnected => {
                self.store.add_notify(Notify::error("WebSocket disconnected"));
                self.dispose_media();
                self.store.set_room_state(ConnectionState::Connecting);
            }
            PeerEvent::Closed => {
                tracing::info!("signaling closed");
                self.shutdown().await;
                return Flow::Stop;
            }
            PeerEvent::Request(request) => self.handle_server_request(request).await,
            PeerEvent::Notification(notification) => self.handle_notification(&notification),
        }
        Flow::Continue
    }

    #[tracing::instrument(skip(self), fields(display_name = %self.display_name))]
    async fn join_room(&mut self) -> Result<(), RoomError> {
        tracing::info!("joining room");
        let router_rtp_capabilities = self.peer.send(&GetRouterRtpCapabilities::default()).await?;
        if self.engine.is_loaded() {
            tracing::debug!("media engine already loaded");
        } else {
            self.engine.load(router_rtp_capabilities).await?;
        }
        self.store.set_media_capabilities(
            self.engine.can_produce(MediaKind::Audio),
            self.engine.can_produce(MediaKind::Video),
        );
        self.store.set_can_change_cam(self.engine.can_change_cam());

        let sctp_capabilities = if self.options.use_data_channel {
            Some(self.engine.sctp_capabilities()?)
        } else {
            None
        };

        if self.options.produce {
            let info = self
                .peer
                .send(&CreateWebRtcTransport {
                    force_tcp: self.options.force_tcp,
                    producing: true,
                    consuming: false,
                    sctp_capabilities: sctp_capabilities.clone(),
                })
                .await?;
            let listener = Arc::new(SignalingListener::new(self.peer.clone(), TransportRole::Send));
            let transport = self
                .engine
                .create_send_transport(listener, info.into())
                .await?;
            tracing::info!(transport_id = transport.id(), "send transport created");
            self.send_transport = Some(transport);
        }

        if self.options.consume {
            let info = self
                .peer
                .send(&CreateWebRtcTransport {
                    force_tcp: self.options.force_tcp,
                    producing: false,
                    consuming: true,
                    sctp_capabilities: sctp_capabilities.clone(),
                })
                .await?;
            let listener = Arc::new(SignalingListener::new(self.peer.clone(), TransportRole::Recv));
            let transport = self
                .engine
                .create_recv_transport(listener, info.into())
                .await?;
            tracing::info!(transport_id = transport.id(), "recv transport created");
            self.recv_transport = Some(transport);
        }

        let rtp_capabilities = if self.options.consume {
            Some(self.engine.rtp_capabilities()?)
        } else {
            None
        };
        let response = self
            .peer
            .send(&Join {
                display_name: self.display_name.clone(),
                device: self.options.device.clone(),
                rtp_capabilities,
                sctp_capabilities,
            })
            .await?;

        for peer in response.peers {
            self.store.add_peer(peer);
        }
        self.store.set_room_state(ConnectionState::Connected);
        self.store.add_notify(Notify::info("You are in the room!"));

        if self.options.produce {
            if self.options.enable_mic_on_join {
                self.enable_mic().await;
            }
            if self.options.enable_cam_on_join {
                self.enable_cam().await;
            }
            if self.options.use_data_channel {
                self.enable_chat_data_producer().await;
            }
        }
        Ok(())
    }

    /// Release every media object of the current connection
    fn dispose_media(&mut self) {
        for (_, owned) in self.consumers.drain() {
            owned.consumer.close();
        }
        for (_, owned) in self.data_consumers.drain() {
            owned.data_consumer.close();
        }
        for producer in [self.mic_producer.take(), self.cam_producer.take()]
            .into_iter()
            .flatten()
        {
            producer.close();
        }
        if let Some(chat) = self.chat_producer.take() {
            chat.close();
        }
        if let Some(transport) = self.send_transport.take() {
            transport.close();
        }
        if let Some(transport) = self.recv_transport.take() {
            transport.close();
        }
        self.store.reset_session();
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::info!("closing room session");

        self.dispose_media();
        self.peer.close().await;
        self.engine.dispose();
        self.store.set_room_state(ConnectionState::Closed);
    }

    // Producers

    fn ready_to_produce(&self, kind: MediaKind) -> Result<&dyn SendTransport, RoomError> {
        if !self.engine.is_loaded() {
            return Err(RoomError::Precondition("media engine not loaded".to_string()));
        }
        if !self.engine.can_produce(kind) {
            return Err(RoomError::Precondition(format!("cannot produce {kind}")));
        }
        self.send_transport
            .as_deref()
            .ok_or_else(|| RoomError::Precondition("send transport not created".to_string()))
    }

    async fn produce(&self, kind: MediaKind) -> Result<Box<dyn Producer>, RoomError> {
        let transport = self.ready_to_produce(kind)?;
        let track = self.engine.create_track(kind).await?;
        let media = self.media_tx.clone();
        let on_close: CloseHook = Box::new(move |id| {
            let _ = media.send(MediaEvent::ProducerClosed(id));
        });

        let producer = transport
            .produce(
                ProduceOptions {
                    track,
                    encodings: Vec::new(),
                    codec_options: None,
                    app_data: json!({}),
                },
                on_close,
            )
            .await?;
        tracing::info!(producer_id = producer.id(), %kind, "producer created");

        self.store.add_producer(ProducerState {
            id: producer.id().to_string(),
            kind,
            paused: producer.is_paused(),
            track_id: producer.track_id().to_string(),
            score: None,
        });
        Ok(producer)
    }

    async fn enable_mic(&mut self) {
        if self.mic_producer.is_some() {
            tracing::debug!("microphone already enabled");
            return;
        }
        match self.produce(MediaKind::Audio).await {
            Ok(producer) => self.mic_producer = Some(producer),
            Err(RoomError::Precondition(reason)) => {
                tracing::warn!(%reason, "cannot enable microphone");
            }
            Err(e) => self.notify_error(format!("Error enabling microphone: {e}")),
        }
    }

    async fn disable_mic(&mut self) {
        if let Some(producer) = self.mic_producer.take() {
            self.close_producer(producer, "mic").await;
        }
    }

    async fn enable_cam(&mut self) {
        if self.cam_producer.is_some() {
            tracing::debug!("camera already enabled");
            return;
        }
        self.store.set_cam_in_progress(true);
        match self.produce(MediaKind::Video).await {
            Ok(producer) => self.cam_producer = Some(producer),
            Err(RoomError::Precondition(reason)) => {
                tracing::warn!(%reason, "cannot enable camera");
            }
            Err(e) => self.notify_error(format!("Error enabling webcam: {e}")),
        }
        self.store.set_cam_in_progress(false);
    }

    async fn disable_cam(&mut self) {
        if let Some(producer) = self.cam_producer.take() {
            self.close_producer(producer, "webcam").await;
        }
    }

    async fn change_cam(&mut self) {
        if self.cam_producer.is_none() {
            tracing::warn!("no camera producer to switch");
            return;
        }
        self.store.set_cam_in_progress(true);
        if let Err(e) = self.engine.switch_camera().await {
            self.notify_error(format!("Could not change cam: {e}"));
        }
        self.store.set_cam_in_progress(false);
    }

    async fn close_producer(&self, producer: Box<dyn Producer>, label: &str) {
        let producer_id = producer.id().to_string();
        producer.close();
        self.store.remove_producer(&producer_id);

        if let Err(e) = self.peer.send(&CloseProducer { producer_id }).await {
            self.notify_error(format!("Error closing server-side {label} Producer: {e}"));
        }
    }

    async fn mute_mic(&self) {
        let Some(producer) = self.mic_producer.as_deref() else {
            tracing::warn!("no microphone producer to mute");
            return;
        };
        let producer_id = producer.id().to_string();
        producer.pause();

        match self
            .peer
            .send(&PauseProducer {
                producer_id: producer_id.clone(),
            })
            .await
        {
            Ok(_) => {
                self.store.set_producer_paused(&producer_id);
            }
            Err(e) => {
                producer.resume();
                self.notify_error(format!("Error pausing server-side mic Producer: {e}"));
            }
        }
    }

    async fn unmute_mic(&self) {
        let Some(producer) = self.mic_producer.as_deref() else {
            tracing::warn!("no microphone producer to unmute");
            return;
        };
        let producer_id = producer.id().to_string();
        producer.resume();

        match self
            .peer
            .send(&ResumeProducer {
                producer_id: producer_id.clone(),
            })
            .await
        {
            Ok(_) => {
                self.store.set_producer_resumed(&producer_id);
            }
            Err(e) => {
                producer.pause();
                self.notify_error(format!("Error resuming server-side mic Producer: {e}"));
            }
        }
    }

    async fn enable_chat_data_producer(&mut self) {
        if self.chat_producer.is_some() {
            return;
        }
        let Some(transport) = self.send_transport.as_deref() else {
            tracing::warn!("cannot create chat DataProducer without a send transport");
            return;
        };
        let media = self.media_tx.clone();
        let on_close: CloseHook = Box::new(move |id| {
            let _ = media.send(MediaEvent::DataProducerClosed(id));
        });

        let options = ProduceDataOptions {
            label: "chat".to_string(),
            protocol: "chat".to_string(),
            ordered: false,
            app_data: json!({"info": "my-chat-DataProducer"}),
        };
        match transport.produce_data(options, on_close).await {
            Ok(chat) => {
                tracing::info!(data_producer_id = chat.id(), "chat DataProducer created");
                self.chat_producer = Some(chat);
            }
            Err(e) => self.notify_error(format!("Error creating chat DataProducer: {e}")),
        }
    }

    fn send_chat_message(&self, text: &str) {
        let Some(chat) = self.chat_producer.as_deref() else {
            self.notify_error("No chat DataProducer".to_string());
            return;
        };
        if let Err(e) = chat.send(text) {
            self.notify_error(format!("Chat message could not be sent: {e}"));
        }
    }

    // Consumers

    fn consumer_ids(&self, kind: MediaKind) -> Vec<String> {
        self.consumers
            .iter()
            .filter(|(_, owned)| owned.consumer.kind() == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn pause_consumer(&self, consumer_id: &str) {
        let Some(owned) = self.consumers.get(consumer_id) else {
            return;
        };
        if owned.consumer.is_paused() {
            return;
        }
        match self
            .peer
            .send(&PauseConsumer {
                consumer_id: consumer_id.to_string(),
            })
            .await
        {
            Ok(_) => {
                owned.consumer.pause();
                self.store.set_consumer_paused(consumer_id, Originator::Local);
            }
            Err(e) => self.notify_error(format!("Error pausing Consumer: {e}")),
        }
    }

    async fn resume_consumer(&self, consumer_id: &str) {
        let Some(owned) = self.consumers.get(consumer_id) else {
            return;
        };
        if !owned.consumer.is_paused() {
            return;
        }
        match self
            .peer
            .send(&ResumeConsumer {
                consumer_id: consumer_id.to_string(),
            })
            .await
        {
            Ok(_) => {
                owned.consumer.resume();
                self.store.set_consumer_resumed(consumer_id, Originator::Local);
            }
            Err(e) => self.notify_error(format!("Error resuming Consumer: {e}")),
        }
    }

    async fn enable_audio_only(&mut self) {
        self.store.set_audio_only_in_progress(true);
        self.disable_cam().await;
        for consumer_id in self.consumer_ids(MediaKind::Video) {
            self.pause_consumer(&consumer_id).await;
        }
        self.store.set_audio_only_state(true);
        self.store.set_audio_only_in_progress(false);
    }

    async fn disable_audio_only(&mut self) {
        self.store.set_audio_only_in_progress(true);
        if self.cam_producer.is_none() && self.options.produce {
            self.enable_cam().await;
        }
        for consumer_id in self.consumer_ids(MediaKind::Video) {
            self.resume_consumer(&consumer_id).await;
        }
        self.store.set_audio_only_state(false);
        self.store.set_audio_only_in_progress(false);
    }

    #[tracing::instrument(skip(self))]
    async fn set_consumer_preferred_layers(
        &self,
        consumer_id: String,
        spatial_layer: u32,
        temporal_layer: u32,
    ) {
        if !self.consumers.contains_key(&consumer_id) {
            tracing::warn!("unknown consumer");
            return;
        }
        let request = SetConsumerPreferredLayers {
            consumer_id: consumer_id.clone(),
            spatial_layer,
            temporal_layer,
        };
        match self.peer.send(&request).await {
            Ok(_) => {
                self.store
                    .set_consumer_preferred_layers(&consumer_id, spatial_layer, temporal_layer);
            }
            Err(e) => self.notify_error(format!("Error setting Consumer preferred layers: {e}")),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn request_consumer_key_frame(&self, consumer_id: String) {
        if !self.consumers.contains_key(&consumer_id) {
            tracing::warn!("unknown consumer");
            return;
        }
        match self.peer.send(&RequestConsumerKeyFrame { consumer_id }).await {
            Ok(_) => self
                .store
                .add_notify(Notify::info("Keyframe requested for video consumer")),
            Err(e) => self.notify_error(format!("Error requesting key frame for Consumer: {e}")),
        }
    }

    // Session wide

    async fn restart_ice(&self) {
        self.store.set_restart_ice_in_progress(true);
        if let Err(e) = self.try_restart_ice().await {
            self.notify_error(format!("ICE restart failed: {e}"));
        }
        self.store.set_restart_ice_in_progress(false);
    }

    async fn try_restart_ice(&self) -> Result<(), RoomError> {
        if let Some(transport) = self.send_transport.as_deref() {
            let transport_id = transport.id().to_string();
            let ice_parameters: Value = self.peer.send(&RestartIce { transport_id }).await?;
            transport.restart_ice(ice_parameters).await?;
        }
        if let Some(transport) = self.recv_transport.as_deref() {
            let transport_id = transport.id().to_string();
            let ice_parameters: Value = self.peer.send(&RestartIce { transport_id }).await?;
            transport.restart_ice(ice_parameters).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn change_display_name(&mut self, display_name: String) {
        let request = ChangeDisplayName {
            display_name: display_name.clone(),
        };
        match self.peer.send(&request).await {
            Ok(_) => {
                self.store.set_display_name(&display_name);
                self.display_name = display_name;
                self.store.add_notify(Notify::info("Display name changed"));
            }
            Err(e) => self.notify_error(format!("Could not change display name: {e}")),
        }
    }

    // Server requests

    async fn handle_server_request(&mut self, request: ServerRequest) {
        match request.decode() {
            Ok(InboundRequest::NewConsumer(data)) => self.on_new_consumer(request, data).await,
            Ok(InboundRequest::NewDataConsumer(data)) => {
                self.on_new_data_consumer(request, data).await;
            }
            Err(e) => {
                tracing::warn!(method = request.method(), error = %e, "rejecting server request");
                log_reply(request.reject(400, e.to_string()));
            }
        }
    }

    async fn on_new_consumer(&mut self, request: ServerRequest, data: NewConsumerRequest) {
        if !self.options.consume {
            log_reply(request.reject(403, "I do not want to consume"));
            return;
        }
        let Some(transport) = self.recv_transport.as_deref() else {
            log_reply(request.reject(500, "no receive transport"));
            return;
        };

        let NewConsumerRequest {
            peer_id,
            producer_id,
            id,
            kind,
            rtp_parameters,
            consumer_type,
            app_data,
            producer_paused,
        } = data;

        let media = self.media_tx.clone();
        let on_close: CloseHook = Box::new(move |id| {
            let _ = media.send(MediaEvent::ConsumerClosed(id));
        });
        let options = ConsumeOptions {
            id: id.clone(),
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            app_data,
        };
        let consumer = match transport.consume(options, on_close).await {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(consumer_id = %id, error = %e, "consume failed");
                log_reply(request.reject(500, e.to_string()));
                return;
            }
        };

        self.store.add_consumer(ConsumerState {
            id: id.clone(),
            peer_id: peer_id.clone(),
            producer_id,
            kind,
            consumer_type,
            locally_paused: false,
            remotely_paused: producer_paused,
            spatial_layer: None,
            temporal_layer: None,
            preferred_spatial_layer: None,
            preferred_temporal_layer: None,
            score: None,
            track_id: consumer.track_id().to_string(),
        });
        self.consumers
            .insert(id.clone(), OwnedConsumer { peer_id, consumer });
        tracing::info!(consumer_id = %id, %kind, "consumer created");
        log_reply(request.accept(json!({})));

        if kind == MediaKind::Video && self.store.me.with(|me| me.audio_only) {
            self.pause_consumer(&id).await;
        }
    }

    async fn on_new_data_consumer(&mut self, request: ServerRequest, data: NewDataConsumerRequest) {
        if !self.options.use_data_channel {
            log_reply(request.reject(403, "I do not want to data consume"));
            return;
        }
        let Some(transport) = self.recv_transport.as_deref() else {
            log_reply(request.reject(500, "no receive transport"));
            return;
        };

        let NewDataConsumerRequest {
            peer_id,
            data_producer_id,
            id,
            sctp_stream_parameters,
            label,
            protocol,
            app_data,
        } = data;

        let media = self.media_tx.clone();
        let on_close: CloseHook = Box::new(move |id| {
            let _ = media.send(MediaEvent::DataConsumerClosed(id));
        });
        let options = ConsumeDataOptions {
            id: id.clone(),
            data_producer_id: data_producer_id.clone(),
            sctp_stream_parameters,
            label: label.clone(),
            protocol: protocol.clone(),
            app_data,
        };
        let data_consumer = match transport.consume_data(options, on_close).await {
            Ok(data_consumer) => data_consumer,
            Err(e) => {
                tracing::error!(data_consumer_id = %id, error = %e, "data consume failed");
                log_reply(request.reject(500, e.to_string()));
                return;
            }
        };

        self.store.add_data_consumer(DataConsumerState {
            id: id.clone(),
            peer_id: peer_id.clone(),
            data_producer_id,
            label,
            protocol,
        });
        self.data_consumers.insert(
            id,
            OwnedDataConsumer {
                peer_id,
                data_consumer,
            },
        );
        log_reply(request.accept(json!({})));
    }

    // Notifications

    fn handle_notification(&mut self, notification: &Notification) {
        let notification = match ServerNotification::from_notification(notification) {
            Ok(notification) => notification,
            Err(ProtooError::UnknownMethod(method)) => {
                tracing::debug!(%method, "ignoring unknown notification");
                return;
            }
            Err(e) => {
                tracing::warn!(method = %notification.method, error = %e, "malformed notification");
                return;
            }
        };

        match notification {
            ServerNotification::ProducerScore { producer_id, score } => {
                self.store.set_producer_score(&producer_id, score);
            }
            ServerNotification::NewPeer(info) => {
                let text = format!("{} has joined the room", info.display_name);
                self.store.add_peer(info);
                self.store.add_notify(Notify::info(text));
            }
            ServerNotification::PeerClosed { peer_id } => self.on_peer_closed(&peer_id),
            ServerNotification::PeerDisplayNameChanged {
                peer_id,
                display_name,
                old_display_name,
            } => {
                if self.store.set_peer_display_name(&peer_id, &display_name) {
                    self.store.add_notify(Notify::info(format!(
                        "{old_display_name} is now {display_name}"
                    )));
                }
            }
            ServerNotification::ConsumerClosed { consumer_id } => {
                if let Some(owned) = self.consumers.remove(&consumer_id) {
                    owned.consumer.close();
                }
                self.store.remove_consumer(&consumer_id);
            }
            ServerNotification::ConsumerPaused { consumer_id } => {
                self.store
                    .set_consumer_paused(&consumer_id, Originator::Remote);
            }
            ServerNotification::ConsumerResumed { consumer_id } => {
                self.store
                    .set_consumer_resumed(&consumer_id, Originator::Remote);
            }
            ServerNotification::ConsumerLayersChanged {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                self.store
                    .set_consumer_current_layers(&consumer_id, spatial_layer, temporal_layer);
            }
            ServerNotification::ConsumerScore { consumer_id, score } => {
                self.store.set_consumer_score(&consumer_id, score);
            }
            ServerNotification::DataConsumerClosed { data_consumer_id } => {
                if let Some(owned) = self.data_consumers.remove(&data_consumer_id) {
                    owned.data_consumer.close();
                }
                self.store.remove_data_consumer(&data_consumer_id);
            }
            ServerNotification::ActiveSpeaker { peer_id } => {
                self.store.set_room_active_speaker(peer_id);
            }
        }
    }

    fn on_peer_closed(&mut self, peer_id: &str) {
        self.consumers.retain(|_, owned| {
            let keep = owned.peer_id != peer_id;
            if !keep {
                owned.consumer.close();
            }
            keep
        });
        self.data_consumers.retain(|_, owned| {
            let keep = owned.peer_id.as_deref() != Some(peer_id);
            if !keep {
                owned.data_consumer.close();
            }
            keep
        });
        if self.store.remove_peer(peer_id).is_none() {
            tracing::debug!(peer_id, "peerClosed for unknown peer");
        }
    }

    // Engine callbacks

    fn handle_media_event(&mut self, event: MediaEvent) {
        tracing::debug!(?event, "media event");
        match event {
            MediaEvent::ProducerClosed(id) => {
                if self.mic_producer.as_ref().is_some_and(|p| p.id() == id) {
                    self.mic_producer = None;
                } else if self.cam_producer.as_ref().is_some_and(|p| p.id() == id) {
                    self.cam_producer = None;
                }
                self.store.remove_producer(&id);
            }
            MediaEvent::DataProducerClosed(id) => {
                if self.chat_producer.as_ref().is_some_and(|p| p.id() == id) {
                    self.chat_producer = None;
                }
            }
            MediaEvent::ConsumerClosed(id) => {
                self.consumers.remove(&id);
                self.store.remove_consumer(&id);
            }
            MediaEvent::DataConsumerClosed(id) => {
                self.data_consumers.remove(&id);
                self.store.remove_data_consumer(&id);
            }
        }
    }
}

fn log_reply(result: Result<(), ProtooError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "could not answer server request");
    }
}

/// Answers engine transport callbacks through the protoo peer
struct SignalingListener {
    peer: Peer,
    role: TransportRole,
}

impl SignalingListener {
    fn new(peer: Peer, role: TransportRole) -> Self {
        Self { peer, role }
    }
}

fn engine_error(e: ProtooError) -> MediaEngineError {
    MediaEngineError::Engine(e.to_string())
}

#[async_trait]
impl TransportListener for SignalingListener {
    async fn on_connect(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), MediaEngineError> {
        tracing::debug!(transport_id, role = ?self.role, "connecting transport");
        self.peer
            .send(&ConnectWebRtcTransport {
                transport_id: transport_id.to_string(),
                dtls_parameters,
            })
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    fn on_connection_state_change(&self, transport_id: &str, state: &str) {
        tracing::info!(transport_id, role = ?self.role, state, "transport connection state");
    }
}

#[async_trait]
impl SendTransportListener for SignalingListener {
    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String, MediaEngineError> {
        let response = self
            .peer
            .send(&Produce {
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters,
                app_data,
            })
            .await
            .map_err(engine_error)?;
        Ok(response.id)
    }

    async fn on_produce_data(
        &self,
        transport_id: &str,
        sctp_stream_parameters: Value,
        label: &str,
        protocol: &str,
        app_data: Value,
    ) -> Result<String, MediaEngineError> {
        let response = self
            .peer
            .send(&ProduceData {
                transport_id: transport_id.to_string(),
                sctp_stream_parameters,
                label: label.to_string(),
                protocol: protocol.to_string(),
                app_data,
            })
            .await
            .map_err(engine_error)?;
        Ok(response.id)
    }
}
