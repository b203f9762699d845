//! Shared fixtures: an in-process protoo server and a recording media engine

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use protoo_room_core::media_engine::{
    CloseHook, ConsumeDataOptions, ConsumeOptions, Consumer, DataConsumer, DataProducer,
    LocalTrack, MediaEngine, MediaEngineError, ProduceDataOptions, ProduceOptions, Producer,
    RecvTransport, SendTransport, SendTransportListener, TransportListener, TransportOptions,
};
use protoo_room_core::socket::{ProtooTransport, TransportError, TransportEvent};
use protoo_room_core::store::Observable;
use protoo_room_core::{
    ConnectionState, MediaKind, Message, Notification, Notify, ProtooUrl, Request, Response,
    ResponseBody, RoomClient, RoomOptions,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until an observable snapshot satisfies `predicate`
pub async fn wait_for<T: Clone>(observable: &Observable<T>, predicate: impl Fn(&T) -> bool) -> T {
    let mut rx = observable.observe();
    let wait = async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            rx.changed().await.unwrap();
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("store never reached the expected state")
}

/// Wait for a notify whose text starts with `prefix`
pub async fn wait_notify(rx: &mut broadcast::Receiver<Notify>, prefix: &str) -> Notify {
    let wait = async {
        loop {
            let notify = rx.recv().await.unwrap();
            if notify.text.starts_with(prefix) {
                return notify;
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .unwrap_or_else(|_| panic!("no notify starting with {prefix:?}"))
}

/// Protoo server living behind the transport seam
///
/// Requests from the client are answered inline with canned responses,
/// unless a rejection or silence was configured for their method.
#[derive(Default)]
pub struct FakeServer {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    open: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    requests: Mutex<Vec<Request>>,
    responses: Mutex<Vec<Response>>,
    rejections: Mutex<HashMap<String, (i64, String)>>,
    peers: Mutex<Value>,
    next_object: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let server = Self::default();
        *server.peers.lock() = json!([]);
        Arc::new(server)
    }

    /// Peers returned by `join`
    pub fn set_peers(&self, peers: Value) {
        *self.peers.lock() = peers;
    }

    pub fn reject(&self, method: &str, code: i64, reason: &str) {
        self.rejections
            .lock()
            .insert(method.to_string(), (code, reason.to_string()));
    }

    pub fn accept(&self, method: &str) {
        self.rejections.lock().remove(method);
    }

    fn inject(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.inject(TransportEvent::Open);
    }

    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.inject(TransportEvent::Disconnected);
    }

    pub fn fail(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.inject(TransportEvent::Failed);
    }

    /// Server side close; terminal
    pub fn hang_up(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.inject(TransportEvent::Closed);
    }

    pub fn notify(&self, method: &str, data: Value) {
        let text = Message::Notification(Notification {
            method: method.to_string(),
            data,
        })
        .to_text();
        self.inject(TransportEvent::Text(text));
    }

    pub fn request(&self, id: u32, method: &str, data: Value) {
        let text = Message::Request(Request {
            id,
            method: method.to_string(),
            data,
        })
        .to_text();
        self.inject(TransportEvent::Text(text));
    }

    pub fn push_text(&self, text: &str) {
        self.inject(TransportEvent::Text(text.to_string()));
    }

    /// Client answer to a server request
    pub async fn response(&self, id: u32) -> ResponseBody {
        eventually("client response", || {
            self.responses.lock().iter().any(|r| r.id == id)
        })
        .await;
        let responses = self.responses.lock();
        let response = responses.iter().find(|r| r.id == id).unwrap();
        response.body.clone()
    }

    pub fn requests(&self, method: &str) -> Vec<Request> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.method == method).count()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &Request) -> ResponseBody {
        if let Some((code, reason)) = self.rejections.lock().get(&request.method) {
            return ResponseBody::Err {
                code: *code,
                reason: reason.clone(),
            };
        }
        let n = self.next_object.fetch_add(1, Ordering::SeqCst);
        let data = match request.method.as_str() {
            "getRouterRtpCapabilities" => json!({"codecs": [], "headerExtensions": []}),
            "createWebRtcTransport" => json!({
                "id": format!("transport-{n}"),
                "iceParameters": {"usernameFragment": "u", "password": "p"},
                "iceCandidates": [],
                "dtlsParameters": {"role": "auto", "fingerprints": []}
            }),
            "join" => json!({"peers": self.peers.lock().clone()}),
            "produce" => json!({"id": format!("producer-{n}")}),
            "produceData" => json!({"id": format!("data-producer-{n}")}),
            "restartIce" => json!({"usernameFragment": "u2", "password": "p2"}),
            _ => json!({}),
        };
        ResponseBody::Ok(data)
    }
}

#[async_trait]
impl ProtooTransport for FakeServer {
    fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError> {
        let mut slot = self.events.lock();
        if slot.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        *slot = Some(events);
        Ok(())
    }

    fn send(&self, text: String) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Ok(text);
        }
        match Message::parse(&text) {
            Ok(Message::Request(request)) => {
                let body = self.answer(&request);
                self.requests.lock().push(request.clone());
                let reply = Message::Response(Response {
                    id: request.id,
                    body,
                })
                .to_text();
                self.inject(TransportEvent::Text(reply));
            }
            Ok(Message::Response(response)) => self.responses.lock().push(response),
            Ok(Message::Notification(_)) | Err(_) => {}
        }
        Ok(text)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.store(false, Ordering::SeqCst);
            self.inject(TransportEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type Log = Arc<Mutex<Vec<String>>>;
type Hooks = Arc<Mutex<HashMap<String, CloseHook>>>;

/// Media engine that records every call and signals like a real device
#[derive(Default)]
pub struct MockEngine {
    loaded: AtomicBool,
    load_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
    next_track: AtomicUsize,
    pub fail_consume: AtomicBool,
    log: Log,
    hooks: Hooks,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn logged(&self, entry: &str) -> bool {
        self.log.lock().iter().any(|e| e == entry)
    }

    /// Simulate the transport underneath `id` dying
    pub fn close_from_transport(&self, id: &str) {
        let hook = self.hooks.lock().remove(id);
        if let Some(hook) = hook {
            hook(id.to_string());
        }
    }
}

fn record(log: &Log, entry: String) {
    log.lock().push(entry);
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn load(&self, _router_rtp_capabilities: Value) -> Result<(), MediaEngineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<Value, MediaEngineError> {
        if !self.is_loaded() {
            return Err(MediaEngineError::NotLoaded);
        }
        Ok(json!({"codecs": [], "headerExtensions": []}))
    }

    fn sctp_capabilities(&self) -> Result<Value, MediaEngineError> {
        if !self.is_loaded() {
            return Err(MediaEngineError::NotLoaded);
        }
        Ok(json!({"numStreams": {"OS": 1024, "MIS": 1024}}))
    }

    fn can_produce(&self, _kind: MediaKind) -> bool {
        self.is_loaded()
    }

    fn can_change_cam(&self) -> bool {
        true
    }

    async fn create_track(&self, kind: MediaKind) -> Result<LocalTrack, MediaEngineError> {
        let n = self.next_track.fetch_add(1, Ordering::SeqCst);
        Ok(LocalTrack {
            id: format!("{kind}-track-{n}"),
            kind,
        })
    }

    async fn switch_camera(&self) -> Result<(), MediaEngineError> {
        record(&self.log, "switch_camera".to_string());
        Ok(())
    }

    async fn create_send_transport(
        &self,
        listener: Arc<dyn SendTransportListener>,
        options: TransportOptions,
    ) -> Result<Box<dyn SendTransport>, MediaEngineError> {
        Ok(Box::new(MockSendTransport {
            id: options.id,
            listener,
            connected: AtomicBool::new(false),
            log: Arc::clone(&self.log),
            hooks: Arc::clone(&self.hooks),
        }))
    }

    async fn create_recv_transport(
        &self,
        listener: Arc<dyn TransportListener>,
        options: TransportOptions,
    ) -> Result<Box<dyn RecvTransport>, MediaEngineError> {
        Ok(Box::new(MockRecvTransport {
            id: options.id,
            listener,
            connected: AtomicBool::new(false),
            fail_consume: self.fail_consume.load(Ordering::SeqCst),
            log: Arc::clone(&self.log),
            hooks: Arc::clone(&self.hooks),
        }))
    }

    fn dispose(&self) {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(false, Ordering::SeqCst);
    }
}

struct MockSendTransport {
    id: String,
    listener: Arc<dyn SendTransportListener>,
    connected: AtomicBool,
    log: Log,
    hooks: Hooks,
}

impl MockSendTransport {
    async fn ensure_connected(&self) -> Result<(), MediaEngineError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.listener
                .on_connect(&self.id, json!({"role": "client", "fingerprints": []}))
                .await?;
            self.listener.on_connection_state_change(&self.id, "connected");
        }
        Ok(())
    }
}

#[async_trait]
impl SendTransport for MockSendTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(
        &self,
        options: ProduceOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn Producer>, MediaEngineError> {
        self.ensure_connected().await?;
        let id = self
            .listener
            .on_produce(&self.id, options.track.kind, json!({"codecs": []}), options.app_data)
            .await?;
        self.hooks.lock().insert(id.clone(), on_transport_close);
        record(&self.log, format!("produce:{id}"));
        Ok(Box::new(MockProducer {
            id,
            kind: options.track.kind,
            track_id: options.track.id,
            paused: AtomicBool::new(false),
            log: Arc::clone(&self.log),
        }))
    }

    async fn produce_data(
        &self,
        options: ProduceDataOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn DataProducer>, MediaEngineError> {
        self.ensure_connected().await?;
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
        self.hooks.lock().insert(id.clone(), on_transport_close);
        Ok(Box::new(MockDataProducer {
            id,
            label: options.label,
            log: Arc::clone(&self.log),
        }))
    }

    async fn restart_ice(&self, _ice_parameters: Value) -> Result<(), MediaEngineError> {
        record(&self.log, format!("restart_ice:{}", self.id));
        Ok(())
    }

    fn close(&self) {
        record(&self.log, format!("close_transport:{}", self.id));
    }
}

struct MockRecvTransport {
    id: String,
    listener: Arc<dyn TransportListener>,
    connected: AtomicBool,
    fail_consume: bool,
    log: Log,
    hooks: Hooks,
}

impl MockRecvTransport {
    async fn ensure_connected(&self) -> Result<(), MediaEngineError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.listener
                .on_connect(&self.id, json!({"role": "server", "fingerprints": []}))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecvTransport for MockRecvTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn consume(
        &self,
        options: ConsumeOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn Consumer>, MediaEngineError> {
        if self.fail_consume {
            return Err(MediaEngineError::Engine("no decoder".to_string()));
        }
        self.ensure_connected().await?;
        self.hooks.lock().insert(options.id.clone(), on_transport_close);
        record(&self.log, format!("consume:{}", options.id));
        Ok(Box::new(MockConsumer {
            track_id: format!("track-{}", options.id),
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            paused: AtomicBool::new(false),
            log: Arc::clone(&self.log),
        }))
    }

    async fn consume_data(
        &self,
        options: ConsumeDataOptions,
        on_transport_close: CloseHook,
    ) -> Result<Box<dyn DataConsumer>, MediaEngineError> {
        self.ensure_connected().await?;
        self.hooks.lock().insert(options.id.clone(), on_transport_close);
        Ok(Box::new(MockDataConsumer {
            id: options.id,
            data_producer_id: options.data_producer_id,
            label: options.label,
            log: Arc::clone(&self.log),
        }))
    }

    async fn restart_ice(&self, _ice_parameters: Value) -> Result<(), MediaEngineError> {
        record(&self.log, format!("restart_ice:{}", self.id));
        Ok(())
    }

    fn close(&self) {
        record(&self.log, format!("close_transport:{}", self.id));
    }
}

struct MockProducer {
    id: String,
    kind: MediaKind,
    track_id: String,
    paused: AtomicBool,
    log: Log,
}

impl Producer for MockProducer {
    fn id(&self) -> &str {
        &self.id
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
        record(&self.log, format!("pause:{}", self.id));
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        record(&self.log, format!("resume:{}", self.id));
    }
    fn close(&self) {
        record(&self.log, format!("close:{}", self.id));
    }
}

struct MockConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track_id: String,
    paused: AtomicBool,
    log: Log,
}

impl Consumer for MockConsumer {
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
        record(&self.log, format!("pause:{}", self.id));
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        record(&self.log, format!("resume:{}", self.id));
    }
    fn close(&self) {
        record(&self.log, format!("close:{}", self.id));
    }
}

struct MockDataProducer {
    id: String,
    label: String,
    log: Log,
}

impl DataProducer for MockDataProducer {
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.label
    }
    fn send(&self, text: &str) -> Result<(), MediaEngineError> {
        record(&self.log, format!("send:{text}"));
        Ok(())
    }
    fn close(&self) {
        record(&self.log, format!("close:{}", self.id));
    }
}

struct MockDataConsumer {
    id: String,
    data_producer_id: String,
    label: String,
    log: Log,
}

impl DataConsumer for MockDataConsumer {
    fn id(&self) -> &str {
        &self.id
    }
    fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }
    fn label(&self) -> &str {
        &self.label
    }
    fn close(&self) {
        record(&self.log, format!("close:{}", self.id));
    }
}

/// Options that keep the join handshake free of media
pub fn quiet_options() -> RoomOptions {
    RoomOptions {
        enable_mic_on_join: false,
        enable_cam_on_join: false,
        ..RoomOptions::default()
    }
}

pub struct Fixture {
    pub room: RoomClient,
    pub server: Arc<FakeServer>,
    pub engine: Arc<MockEngine>,
}

impl Fixture {
    pub fn new(options: RoomOptions) -> Self {
        init_tracing();
        let server = FakeServer::new();
        let engine = MockEngine::new();
        let room = RoomClient::with_transport(
            Arc::clone(&server) as Arc<dyn ProtooTransport>,
            &ProtooUrl::new("room1", "me"),
            "Tester",
            options,
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
        )
        .unwrap();
        Self {
            room,
            server,
            engine,
        }
    }

    /// Join and wait until the room reports `Connected`
    pub async fn joined(options: RoomOptions, peers: Value) -> Self {
        let fixture = Self::new(options);
        fixture.server.set_peers(peers);
        fixture.room.join().unwrap();
        fixture.server.open();
        fixture.wait_state(ConnectionState::Connected).await;
        fixture
    }

    pub async fn wait_state(&self, state: ConnectionState) {
        wait_for(&self.room.store().room_info, |info| info.state == state).await;
    }
}

pub fn consumer_payload(id: &str, peer_id: &str, kind: &str) -> Value {
    json!({
        "peerId": peer_id,
        "producerId": format!("remote-{id}"),
        "id": id,
        "kind": kind,
        "rtpParameters": {"codecs": []},
        "type": "simple",
        "appData": {},
        "producerPaused": false
    })
}
