//! Resilient signaling socket
//!
//! [`WebSocketTransport`] owns a single WebSocket to the protoo server and a
//! dedicated I/O task. Connection losses are reported as [`TransportEvent`]s
//! and followed by reconnect attempts paced by a [`RetryPolicy`]. The task
//! emits [`TransportEvent::Closed`] exactly once, after which nothing else is
//! delivered.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Subprotocol announced in `Sec-WebSocket-Protocol`
pub const PROTOO_SUBPROTOCOL: &str = "protoo";

/// Upper bound on how long [`ProtooTransport::close`] waits for the I/O task
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Socket errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport was closed
    #[error("Transport closed")]
    Closed,

    /// The signaling URL is unusable
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The connection could not be started
    #[error("Connect failed: {0}")]
    Connect(String),

    /// `connect` was called more than once
    #[error("Transport already connected")]
    AlreadyConnected,
}

/// Events delivered by a transport, in socket order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A socket opened
    Open,
    /// A connection attempt failed before opening
    Failed,
    /// An open socket was lost; a reconnect follows
    Disconnected,
    /// Terminal; no further events follow
    Closed,
    /// Inbound text frame
    Text(String),
}

/// Text frame transport beneath a protoo peer
#[async_trait]
pub trait ProtooTransport: Send + Sync + 'static {
    /// Start connecting, delivering events to `events`
    ///
    /// # Errors
    ///
    /// Fails if the transport was already connected or closed.
    fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError>;

    /// Queue a text frame and return it for logging
    ///
    /// Frames queued while no socket is open are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport is closed.
    fn send(&self, text: String) -> Result<String, TransportError>;

    /// Shut down; idempotent
    async fn close(&self);

    /// Whether the transport is closed or closing
    fn is_closed(&self) -> bool;
}

/// Reconnect pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Reconnect attempts before giving up
    pub retries: u32,
    /// Exponential growth factor
    pub factor: u32,
    /// Delay before the first reconnect
    pub min_timeout: Duration,
    /// Delay ceiling
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            factor: 2,
            min_timeout: Duration::from_millis(1000),
            max_timeout: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// Delay before reconnect `attempt` (zero based), `None` once exhausted
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.retries {
            return None;
        }
        let multiplier = self.factor.saturating_pow(attempt);
        Some(
            self.min_timeout
                .saturating_mul(multiplier)
                .min(self.max_timeout),
        )
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket implementation of [`ProtooTransport`]
pub struct WebSocketTransport {
    url: Url,
    retry: RetryPolicy,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: watch::Sender<bool>,
    closing: AtomicBool,
    finished: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Create a transport for a `ws://` or `wss://` URL
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for unparsable URLs or other
    /// schemes.
    pub fn new(url: &str, retry: RetryPolicy) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            url,
            retry,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown,
            closing: AtomicBool::new(false),
            finished: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Signaling URL
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ProtooTransport for WebSocketTransport {
    fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let outbound = self
            .outbound_rx
            .lock()
            .take()
            .ok_or(TransportError::AlreadyConnected)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let worker = Worker {
            url: self.url.clone(),
            retry: self.retry,
            outbound,
            shutdown: self.shutdown.subscribe(),
            events,
            finished: Arc::clone(&self.finished),
        };
        *self.task.lock() = Some(runtime.spawn(worker.run()));
        Ok(())
    }

    fn send(&self, text: String) -> Result<String, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound_tx
            .send(text.clone())
            .map_err(|_| TransportError::Closed)?;
        Ok(text)
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(url = %self.url, "closing signaling transport");
        self.shutdown.send_replace(true);

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                tracing::warn!(url = %self.url, "transport I/O task did not stop in time");
                task.abort();
            }
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// How a connected socket ended
enum Exit {
    Shutdown,
    ServerClosed,
    Lost,
}

struct Worker {
    url: Url,
    retry: RetryPolicy,
    outbound: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    finished: Arc<AtomicBool>,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let Some(connected) = self.open().await else {
                break;
            };

            let lost = match connected {
                Ok(ws) => {
                    tracing::info!(url = %self.url, "signaling socket open");
                    attempt = 0;
                    let _ = self.events.send(TransportEvent::Open);
                    match self.pump(ws).await {
                        Exit::Shutdown => break,
                        Exit::ServerClosed => {
                            tracing::info!(url = %self.url, "server closed the signaling socket");
                            break;
                        }
                        Exit::Lost => TransportEvent::Disconnected,
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "signaling connect failed");
                    TransportEvent::Failed
                }
            };
            let _ = self.events.send(lost);

            let Some(delay) = self.retry.delay_for_attempt(attempt) else {
                tracing::warn!(url = %self.url, attempts = attempt, "giving up reconnecting");
                break;
            };
            attempt += 1;
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            if !self.idle(delay).await {
                break;
            }
        }

        self.finished.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed);
    }

    /// Connect once. `None` means shutdown was requested meanwhile.
    async fn open(&mut self) -> Option<Result<WsStream, TransportError>> {
        let connecting = connect(&self.url);
        tokio::pin!(connecting);
        loop {
            tokio::select! {
                result = &mut connecting => return Some(result),
                _ = self.shutdown.changed() => return None,
                Some(_) = self.outbound.recv() => {
                    tracing::debug!("dropping outbound frame, socket not open");
                }
            }
        }
    }

    /// Sleep for `delay`, dropping outbound frames. `false` on shutdown.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                _ = self.shutdown.changed() => return false,
                Some(_) = self.outbound.recv() => {
                    tracing::debug!("dropping outbound frame, socket not open");
                }
            }
        }
    }

    async fn pump(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = self.events.send(TransportEvent::Text(text));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        tracing::debug!(len = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::debug!(?frame, "close frame received");
                        return Exit::ServerClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "signaling socket error");
                        return Exit::Lost;
                    }
                    None => return Exit::Lost,
                },
                text = self.outbound.recv() => {
                    let Some(text) = text else {
                        return Exit::Shutdown;
                    };
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        tracing::warn!(error = %e, "signaling write failed");
                        return Exit::Lost;
                    }
                }
                _ = self.shutdown.changed() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
            }
        }
    }
}

async fn connect(url: &Url) -> Result<WsStream, TransportError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(PROTOO_SUBPROTOCOL),
    );

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    Ok(ws)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_delays() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..policy.retries)
            .map(|n| policy.delay_for_attempt(n).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 8000, 8000, 8000, 8000, 8000, 8000]
        );
        assert_eq!(policy.delay_for_attempt(10), None);
    }

    #[test]
    fn test_delays_are_monotonic_and_bounded() {
        let policy = RetryPolicy {
            retries: 40,
            factor: 3,
            min_timeout: Duration::from_millis(7),
            max_timeout: Duration::from_millis(5000),
        };
        let mut previous = Duration::ZERO;
        for n in 0..policy.retries {
            let delay = policy.delay_for_attempt(n).unwrap();
            assert!(delay >= previous);
            assert!(delay <= policy.max_timeout);
            previous = delay;
        }
        assert_eq!(previous, policy.max_timeout);
    }

    #[test]
    fn test_zero_retries_never_reconnects() {
        let policy = RetryPolicy {
            retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), None);
    }

    #[test]
    fn test_rejects_non_websocket_urls() {
        assert!(matches!(
            WebSocketTransport::new("https://example.com", RetryPolicy::default()),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            WebSocketTransport::new("not a url", RetryPolicy::default()),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(WebSocketTransport::new("wss://example.com:4443/?roomId=a", RetryPolicy::default()).is_ok());
    }

    #[tokio::test]
    async fn test_close_without_connect() {
        let transport =
            WebSocketTransport::new("ws://127.0.0.1:9", RetryPolicy::default()).unwrap();
        assert!(!transport.is_closed());
        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());
        assert_eq!(transport.send("x".to_string()), Err(TransportError::Closed));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(transport.connect(tx), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let transport = WebSocketTransport::new(
            "ws://127.0.0.1:9",
            RetryPolicy {
                retries: 0,
                ..RetryPolicy::default()
            },
        )
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(tx.clone()).unwrap();
        assert_eq!(transport.connect(tx), Err(TransportError::AlreadyConnected));
        transport.close().await;
    }
}
