//! Protoo RPC peer
//!
//! Correlates requests with responses over a [`ProtooTransport`] and surfaces
//! everything else as [`PeerEvent`]s. Inbound frames are handled on the peer's
//! own reader task, so awaiting a response never depends on the consumer of
//! the event channel making progress.
//!
//! # Example
//!
//! ```rust,no_run
//! use protoo_room_core::peer::{Peer, PeerEvent};
//! use protoo_room_core::socket::{RetryPolicy, WebSocketTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = Arc::new(WebSocketTransport::new(
//!     "wss://v3demo.mediasoup.org:4443/?roomId=abc&peerId=me",
//!     RetryPolicy::default(),
//! )?);
//! let (peer, mut events) = Peer::new(transport, Duration::from_secs(5))?;
//!
//! while let Some(event) = events.recv().await {
//!     if let PeerEvent::Open = event {
//!         let caps = peer
//!             .sync_request("getRouterRtpCapabilities", serde_json::json!({}))
//!             .await?;
//!         println!("{caps}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::message::{Message, Notification, Request, Response, ResponseBody};
use crate::methods::{InboundRequest, ProtooRequest};
use crate::socket::{ProtooTransport, TransportError, TransportEvent};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Default bound for [`Peer::sync_request`]
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Protoo errors
#[derive(Error, Debug)]
pub enum ProtooError {
    /// The peer was closed for good
    #[error("Peer closed")]
    PeerClosed,

    /// The signaling socket is not open
    #[error("Signaling disconnected")]
    Disconnected,

    /// No response arrived in time
    #[error("Request {method} timed out after {timeout:?}")]
    Timeout {
        /// Method of the request
        method: String,
        /// Bound that expired
        timeout: Duration,
    },

    /// The server answered `ok: false`
    #[error("Request rejected [{code}]: {reason}")]
    Rejected {
        /// `errorCode`
        code: i64,
        /// `errorReason`
        reason: String,
    },

    /// Frame does not follow the protoo framing
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Payload does not match the method schema
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// [`Peer::blocking_request`] was called on a runtime thread
    #[error("Blocking request called from inside the async runtime")]
    BlockingInRuntime,

    /// Method outside the known table
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
}

/// Events surfaced by a [`Peer`], in socket order
#[derive(Debug)]
pub enum PeerEvent {
    /// Socket opened
    Open,
    /// Connection attempt failed
    Failed,
    /// Open socket lost; pending requests were failed
    Disconnected,
    /// Peer closed; nothing follows
    Closed,
    /// Server request waiting for a reply
    Request(ServerRequest),
    /// Server notification
    Notification(Notification),
}

type PendingSender = oneshot::Sender<Result<Value, ProtooError>>;

struct Inner {
    transport: Arc<dyn ProtooTransport>,
    pending: Mutex<HashMap<u32, PendingSender>>,
    next_id: AtomicU32,
    // Bumped on every disconnect; server request ids belong to one connection
    generation: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    request_timeout: Duration,
    runtime: tokio::runtime::Handle,
}

/// Cloneable handle to a protoo peer
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

impl Peer {
    /// Connect `transport` and start the reader task
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime or when the transport
    /// refuses to connect.
    pub fn new(
        transport: Arc<dyn ProtooTransport>,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), ProtooError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        transport.connect(transport_tx)?;

        let peer = Self {
            inner: Arc::new(Inner {
                transport,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                request_timeout,
                runtime: runtime.clone(),
            }),
        };
        runtime.spawn(peer.clone().read_loop(transport_rx, event_tx));

        Ok((peer, event_rx))
    }

    /// Whether the socket is currently open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether the peer was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Configured bound of [`Peer::sync_request`]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Send a request and wait for its response
    ///
    /// Resolves on response, disconnect or close; never outlives the socket.
    ///
    /// # Errors
    ///
    /// [`ProtooError::Rejected`] for `ok: false` responses,
    /// [`ProtooError::Disconnected`] or [`ProtooError::PeerClosed`] on
    /// connection loss.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, ProtooError> {
        let (_, response) = self.dispatch(method, data)?;
        response.await.unwrap_or(Err(ProtooError::PeerClosed))
    }

    /// [`Peer::request`] bounded by the configured request timeout
    ///
    /// # Errors
    ///
    /// As [`Peer::request`], plus [`ProtooError::Timeout`] on expiry.
    pub async fn sync_request(&self, method: &str, data: Value) -> Result<Value, ProtooError> {
        let timeout = self.inner.request_timeout;
        let (id, response) = self.dispatch(method, data)?;

        match tokio::time::timeout(timeout, response).await {
            Ok(result) => result.unwrap_or(Err(ProtooError::PeerClosed)),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                tracing::warn!(method, id, ?timeout, "request timed out");
                Err(ProtooError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Thread-blocking [`Peer::sync_request`] for code outside the runtime
    ///
    /// The runtime that created the peer must be multi-threaded so its
    /// workers can deliver the response meanwhile.
    ///
    /// # Errors
    ///
    /// [`ProtooError::BlockingInRuntime`] when called from a runtime thread,
    /// otherwise as [`Peer::sync_request`].
    pub fn blocking_request(&self, method: &str, data: Value) -> Result<Value, ProtooError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ProtooError::BlockingInRuntime);
        }
        self.inner
            .runtime
            .block_on(self.sync_request(method, data))
    }

    /// Typed request using the method table
    ///
    /// # Errors
    ///
    /// As [`Peer::sync_request`], plus [`ProtooError::Json`] when the
    /// response does not match `R::Response`.
    pub async fn send<R: ProtooRequest>(&self, request: &R) -> Result<R::Response, ProtooError> {
        let data = serde_json::to_value(request)?;
        let response = self.sync_request(R::METHOD, data).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Send a client notification
    ///
    /// # Errors
    ///
    /// Fails when the peer is closed or disconnected.
    pub fn notify(&self, method: &str, data: Value) -> Result<(), ProtooError> {
        self.ensure_open()?;
        let text = Message::Notification(Notification {
            method: method.to_string(),
            data,
        })
        .to_text();
        self.inner.transport.send(text)?;
        Ok(())
    }

    /// Close the peer and its transport; idempotent
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("closing protoo peer");
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.transport.close().await;
        self.fail_pending(|| ProtooError::PeerClosed);
    }

    fn ensure_open(&self) -> Result<(), ProtooError> {
        if self.is_closed() {
            return Err(ProtooError::PeerClosed);
        }
        if !self.is_connected() {
            return Err(ProtooError::Disconnected);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        method: &str,
        data: Value,
    ) -> Result<(u32, oneshot::Receiver<Result<Value, ProtooError>>), ProtooError> {
        self.ensure_open()?;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.inner.pending.lock();
            let id = loop {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                if id != 0 && !pending.contains_key(&id) {
                    break id;
                }
            };
            pending.insert(id, tx);
            id
        };

        // The reader may have failed the table between the check above and
        // the insert; re-check so the entry cannot be stranded.
        if let Err(e) = self.ensure_open() {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        let text = Message::Request(Request {
            id,
            method: method.to_string(),
            data,
        })
        .to_text();
        match self.inner.transport.send(text) {
            Ok(_) => {
                tracing::debug!(method, id, "request sent");
                Ok((id, rx))
            }
            Err(e) => {
                self.inner.pending.lock().remove(&id);
                Err(e.into())
            }
        }
    }

    fn fail_pending(&self, error: impl Fn() -> ProtooError) {
        let drained: Vec<_> = self.inner.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
    }

    async fn read_loop(
        self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) {
        while let Some(event) = transport_rx.recv().await {
            match event {
                TransportEvent::Open => {
                    self.inner.connected.store(true, Ordering::SeqCst);
                    let _ = events.send(PeerEvent::Open);
                }
                TransportEvent::Failed => {
                    let _ = events.send(PeerEvent::Failed);
                }
                TransportEvent::Disconnected => {
                    self.inner.connected.store(false, Ordering::SeqCst);
                    self.inner.generation.fetch_add(1, Ordering::SeqCst);
                    self.fail_pending(|| ProtooError::Disconnected);
                    let _ = events.send(PeerEvent::Disconnected);
                }
                TransportEvent::Closed => break,
                TransportEvent::Text(text) => self.handle_text(&text, &events),
            }
        }

        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.fail_pending(|| ProtooError::PeerClosed);
        let _ = events.send(PeerEvent::Closed);
    }

    fn handle_text(&self, text: &str, events: &mpsc::UnboundedSender<PeerEvent>) {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "discarding frame");
                return;
            }
        };

        match message {
            Message::Response(Response { id, body }) => {
                let Some(tx) = self.inner.pending.lock().remove(&id) else {
                    tracing::warn!(id, "response for unknown request");
                    return;
                };
                let result = match body {
                    ResponseBody::Ok(data) => Ok(data),
                    ResponseBody::Err { code, reason } => {
                        Err(ProtooError::Rejected { code, reason })
                    }
                };
                let _ = tx.send(result);
            }
            Message::Request(Request { id, method, data }) => {
                tracing::debug!(id, method = %method, "server request");
                let request = ServerRequest {
                    inner: Arc::clone(&self.inner),
                    generation: self.inner.generation.load(Ordering::SeqCst),
                    id,
                    method,
                    data,
                    replied: false,
                };
                let _ = events.send(PeerEvent::Request(request));
            }
            Message::Notification(notification) => {
                tracing::debug!(method = %notification.method, "server notification");
                let _ = events.send(PeerEvent::Notification(notification));
            }
        }
    }
}

/// Server request awaiting exactly one reply
///
/// Dropping it unanswered rejects it with `500 "request not handled"`.
/// A reply after the socket it arrived on was lost is not sent.
pub struct ServerRequest {
    inner: Arc<Inner>,
    generation: u64,
    id: u32,
    method: String,
    data: Value,
    replied: bool,
}

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("data", &self.data)
            .finish()
    }
}

impl ServerRequest {
    /// Request id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Method name
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw payload
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Decode the payload through the method table
    ///
    /// # Errors
    ///
    /// [`ProtooError::UnknownMethod`] or [`ProtooError::Json`].
    pub fn decode(&self) -> Result<InboundRequest, ProtooError> {
        InboundRequest::decode(&self.method, &self.data)
    }

    /// Answer `ok: true`
    ///
    /// # Errors
    ///
    /// Fails if `data` cannot be serialized, the socket is closed or the
    /// request came from an earlier connection.
    pub fn accept(mut self, data: impl Serialize) -> Result<(), ProtooError> {
        let data = serde_json::to_value(data)?;
        self.reply(ResponseBody::Ok(data))
    }

    /// Answer `ok: false`
    ///
    /// # Errors
    ///
    /// Fails if the socket is closed or the request came from an earlier
    /// connection.
    pub fn reject(mut self, code: i64, reason: impl Into<String>) -> Result<(), ProtooError> {
        self.reply(ResponseBody::Err {
            code,
            reason: reason.into(),
        })
    }

    fn reply(&mut self, body: ResponseBody) -> Result<(), ProtooError> {
        self.replied = true;
        if self.inner.generation.load(Ordering::SeqCst) != self.generation {
            tracing::debug!(id = self.id, method = %self.method, "dropping reply for a lost connection");
            return Err(ProtooError::Disconnected);
        }
        let text = Message::Response(Response { id: self.id, body }).to_text();
        self.inner.transport.send(text)?;
        Ok(())
    }
}

impl Drop for ServerRequest {
    fn drop(&mut self) {
        if !self.replied {
            tracing::warn!(id = self.id, method = %self.method, "server request dropped unanswered");
            let _ = self.reply(ResponseBody::Err {
                code: 500,
                reason: "request not handled".to_string(),
            });
        }
    }
}
