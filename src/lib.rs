//! Serverless peer-to-peer conferencing core.
//!
//! `confmesh` coordinates a full mesh of WebRTC sessions for a named room
//! without any dedicated server: participants discover each other through
//! a redundant set of public MQTT brokers (speaking MQTT 3.1.1 over
//! binary web-sockets), negotiate peer transports with trickle ICE and
//! ICE-restart supervision, and multiplex chat plus moderation control
//! over per-peer data channels.
//!
//! The media pipeline is an external collaborator: the embedder hands the
//! room local tracks and consumes remote tracks from the event stream.
//!
//! ```no_run
//! use confmesh::{Config, CoreContext, RoomController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = CoreContext::new(Config::default());
//!     let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let room = RoomController::new(ctx, event_tx)?;
//!
//!     room.join_room("rainy-day-standup", Some("alice".into())).await?;
//!     while let Some(event) = event_rx.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod events;
pub mod moderation;
pub mod peer;
pub mod room;
pub mod sdp;
pub mod signal;

pub use config::Config;
pub use context::{generate_peer_id, CoreContext};
pub use credentials::{
    BrokerEndpoint, Credentials, CredentialsError, CredentialsProvider, HttpCredentialsProvider,
    IceServer, StaticCredentialsProvider,
};
pub use error::{ErrorKind, RoomError};
pub use events::{
    ChatEvent, PeerSnapshot, RemoteMicEvent, RoomEvent, SignalingState,
};
pub use moderation::{RemoteMicLease, RemoteMicPhase};
pub use peer::{
    AudioRoute, ConnectionQuality, PeerConnectionStats, RmResponseReason, RmStopReason,
};
pub use room::{LocalBusRegistry, RoomController};
pub use signal::{MuteStatus, PeerId, Platform};
