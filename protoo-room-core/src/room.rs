//! Room client
//!
//! [`RoomClient`] is the handle a UI talks to. Intents are posted to the
//! session task and return immediately; outcomes show up in the
//! [`RoomStore`] and as [`Notify`](crate::types::Notify) events.
//!
//! # Example
//!
//! ```rust,no_run
//! use protoo_room_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(engine: Arc<dyn MediaEngine>) -> anyhow::Result<()> {
//! let room = RoomClient::new(
//!     &ProtooUrl::new("my-room", "my-peer"),
//!     "Alice",
//!     RoomOptions::default(),
//!     engine,
//! )?;
//! let mut state = room.store().room_info.observe();
//! room.join()?;
//!
//! while state.changed().await.is_ok() {
//!     if state.borrow().state == ConnectionState::Connected {
//!         room.mute_mic();
//!         break;
//!     }
//! }
//! room.close().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{ProtooUrl, RoomOptions};
use crate::media_engine::{MediaEngine, MediaEngineError};
use crate::peer::{Peer, ProtooError};
use crate::session::{Command, Session};
use crate::socket::{ProtooTransport, TransportError, WebSocketTransport};
use crate::store::RoomStore;
use crate::types::{ConnectionState, Notify};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// How long [`RoomClient::close`] waits for the session to tear down
pub const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Room errors
#[derive(Error, Debug)]
pub enum RoomError {
    /// Signaling socket error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Signaling protocol error
    #[error("Protoo error: {0}")]
    Protoo(#[from] ProtooError),

    /// Media engine error
    #[error("Media engine error: {0}")]
    MediaEngine(#[from] MediaEngineError),

    /// Operation attempted before its requirements were met
    #[error("Precondition failed: {0}")]
    Precondition(String),
}

/// Everything the session needs, held until `join`
struct Setup {
    transport: Arc<dyn ProtooTransport>,
    engine: Arc<dyn MediaEngine>,
    options: RoomOptions,
    display_name: String,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// Handle to one room session
pub struct RoomClient {
    store: Arc<RoomStore>,
    commands: mpsc::UnboundedSender<Command>,
    setup: Mutex<Option<Setup>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("room", &self.store.room_info.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RoomClient {
    /// Client signaling over a WebSocket to `url`
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Transport`] if the URL is invalid.
    pub fn new(
        url: &ProtooUrl,
        display_name: impl Into<String>,
        options: RoomOptions,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Self, RoomError> {
        let signaling_url = url.protoo_url()?;
        let transport = Arc::new(WebSocketTransport::new(signaling_url.as_str(), options.retry)?);
        Self::with_transport(transport, url, display_name, options, engine)
    }

    /// Client signaling over a caller supplied transport
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Transport`] if the URL is invalid.
    pub fn with_transport(
        transport: Arc<dyn ProtooTransport>,
        url: &ProtooUrl,
        display_name: impl Into<String>,
        options: RoomOptions,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Self, RoomError> {
        let display_name = display_name.into();
        let signaling_url = url.protoo_url()?;

        let store = Arc::new(RoomStore::new());
        store.set_room_url(&url.room_id, &url.peer_id, signaling_url.as_str());
        store.set_me(&url.peer_id, &display_name, options.device.clone());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            store,
            commands: commands_tx,
            setup: Mutex::new(Some(Setup {
                transport,
                engine,
                options,
                display_name,
                commands: commands_rx,
            })),
            closed: AtomicBool::new(false),
        })
    }

    /// Shared state written by the session
    #[must_use]
    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    /// Whether the session ended
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.store.state() == ConnectionState::Closed
    }

    /// Start connecting; the join handshake runs once the socket opens
    ///
    /// A second call, or a call after close, does nothing.
    ///
    /// # Errors
    ///
    /// Fails when invoked outside a tokio runtime or when the transport
    /// cannot start; the room is closed in that case.
    #[tracing::instrument(skip(self), fields(room_id = %self.store.room_info.with(|r| r.room_id.clone())))]
    pub fn join(&self) -> Result<(), RoomError> {
        if self.is_closed() {
            tracing::warn!("join() after close");
            return Ok(());
        }
        let Some(setup) = self.setup.lock().take() else {
            tracing::warn!("join() called twice");
            return Ok(());
        };

        tracing::info!("joining");
        self.store.set_room_state(ConnectionState::Connecting);

        let (peer, peer_events) = match Peer::new(setup.transport, setup.options.request_timeout) {
            Ok(started) => started,
            Err(e) => {
                self.closed.store(true, Ordering::SeqCst);
                self.store
                    .add_notify(Notify::error(format!("Could not join the room: {e}")));
                setup.engine.dispose();
                self.store.set_room_state(ConnectionState::Closed);
                return Err(e.into());
            }
        };

        let session = Session::new(
            setup.options,
            setup.display_name,
            setup.engine,
            Arc::clone(&self.store),
            peer,
        );
        tokio::spawn(session.run(setup.commands, peer_events));
        Ok(())
    }

    /// Close the session; idempotent
    ///
    /// Waits at most [`CLOSE_WAIT`] for the teardown to finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let never_joined = self.setup.lock().take();
        if let Some(setup) = never_joined {
            tracing::info!("closing room that was never joined");
            setup.engine.dispose();
            self.store.set_room_state(ConnectionState::Closed);
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close(done_tx)).is_err() {
            // The session already stopped on its own.
            return;
        }
        if tokio::time::timeout(CLOSE_WAIT, done_rx).await.is_err() {
            tracing::warn!("room session did not close in time");
        }
    }

    fn post(&self, command: Command) {
        if self.is_closed() {
            tracing::debug!(?command, "ignoring command after close");
            return;
        }
        let _ = self.commands.send(command);
    }

    /// Start sending the microphone
    pub fn enable_mic(&self) {
        self.post(Command::EnableMic);
    }

    /// Stop sending the microphone
    pub fn disable_mic(&self) {
        self.post(Command::DisableMic);
    }

    /// Pause the microphone producer
    pub fn mute_mic(&self) {
        self.post(Command::MuteMic);
    }

    /// Resume the microphone producer
    pub fn unmute_mic(&self) {
        self.post(Command::UnmuteMic);
    }

    /// Start sending the camera
    pub fn enable_cam(&self) {
        self.post(Command::EnableCam);
    }

    /// Stop sending the camera
    pub fn disable_cam(&self) {
        self.post(Command::DisableCam);
    }

    /// Switch to the next camera
    pub fn change_cam(&self) {
        self.post(Command::ChangeCam);
    }

    /// Stop the camera and pause every video consumer
    pub fn enable_audio_only(&self) {
        self.post(Command::EnableAudioOnly);
    }

    /// Undo [`RoomClient::enable_audio_only`]
    pub fn disable_audio_only(&self) {
        self.post(Command::DisableAudioOnly);
    }

    /// Mute local playback
    pub fn mute_audio(&self) {
        self.post(Command::MuteAudio);
    }

    /// Unmute local playback
    pub fn unmute_audio(&self) {
        self.post(Command::UnmuteAudio);
    }

    /// Restart ICE on both transports
    pub fn restart_ice(&self) {
        self.post(Command::RestartIce);
    }

    /// Rename the local peer
    pub fn change_display_name(&self, display_name: impl Into<String>) {
        self.post(Command::ChangeDisplayName(display_name.into()));
    }

    /// Send text over the chat data channel
    pub fn send_chat_message(&self, text: impl Into<String>) {
        self.post(Command::SendChatMessage(text.into()));
    }

    /// Ask for specific layers of a simulcast or SVC consumer
    pub fn set_consumer_preferred_layers(
        &self,
        consumer_id: impl Into<String>,
        spatial_layer: u32,
        temporal_layer: u32,
    ) {
        self.post(Command::SetConsumerPreferredLayers {
            consumer_id: consumer_id.into(),
            spatial_layer,
            temporal_layer,
        });
    }

    /// Ask the sender of a consumer for a key frame
    pub fn request_consumer_key_frame(&self, consumer_id: impl Into<String>) {
        self.post(Command::RequestConsumerKeyFrame(consumer_id.into()));
    }
}
