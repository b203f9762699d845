//! Protoo Room - mediasoup room client over protoo signaling
//!
//! This library joins a mediasoup SFU room and keeps a local view of it. It
//! covers the signaling and session side of a client:
//!
//! - **Resilient Socket**: WebSocket transport with bounded exponential reconnect
//! - **RPC Peer**: protoo request/response correlation, server requests and notifications
//! - **Session Orchestrator**: join handshake, transports, producers and consumers
//! - **Reactive Store**: observable room, peer, producer and consumer state
//!
//! The media stack itself is supplied by the caller through the
//! [`MediaEngine`] traits.
//!
//! # Examples
//!
//! ```rust,no_run
//! use protoo_room_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(engine: Arc<dyn MediaEngine>) -> anyhow::Result<()> {
//! let url = ProtooUrl::new("my-room", "my-peer");
//! let room = RoomClient::new(&url, "Alice", RoomOptions::default(), engine)?;
//!
//! let mut notifies = room.store().subscribe_notify();
//! room.join()?;
//!
//! while let Ok(notify) = notifies.recv().await {
//!     println!("{:?}: {}", notify.kind, notify.text);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Room types and data structures
pub mod types;

/// Raw protoo frames
pub mod message;

/// Typed protoo method table
pub mod methods;

/// Resilient WebSocket transport
pub mod socket;

/// Protoo RPC peer
pub mod peer;

/// External media engine interface
pub mod media_engine;

/// Store snapshot types
pub mod model;

/// Reactive room store
pub mod store;

/// Room options and URLs
pub mod config;

/// Room client handle
pub mod room;

mod session;

// Re-export main types at crate root
pub use config::{ProtooUrl, RoomOptions};
pub use media_engine::{MediaEngine, MediaEngineError};
pub use message::{Message, Notification, Request, Response, ResponseBody};
pub use peer::{Peer, PeerEvent, ProtooError, ServerRequest};
pub use room::{RoomClient, RoomError};
pub use socket::{ProtooTransport, RetryPolicy, TransportError, TransportEvent, WebSocketTransport};
pub use store::{Observable, RoomStore};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ProtooUrl, RoomOptions};
    pub use crate::media_engine::{MediaEngine, MediaEngineError};
    pub use crate::model::{ConsumerState, Me, ProducerState, RemotePeer, RoomInfo};
    pub use crate::peer::{Peer, PeerEvent, ProtooError};
    pub use crate::room::{RoomClient, RoomError};
    pub use crate::socket::{ProtooTransport, RetryPolicy, WebSocketTransport};
    pub use crate::store::RoomStore;
    pub use crate::types::{ConnectionState, MediaKind, Notify, NotifyType, PeerInfo};
}
