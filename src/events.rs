//! Room Event Surface
//!
//! Everything the embedding application observes comes through one
//! unbounded channel of [`RoomEvent`]s. Peer data crossing this boundary
//! is a read-only snapshot; the live records stay inside the controller.

use std::sync::Arc;

use serde::Serialize;
use webrtc::track::track_remote::TrackRemote;

use crate::error::ErrorKind;
use crate::moderation::remote_mic::RemoteMicPhase;
use crate::peer::channels::RmStopReason;
use crate::signal::message::{MuteStatus, PeerId, Platform};

/// Signaling lifecycle of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// Read-only view of a peer handed to the embedder.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub user_name: Option<String>,
    pub platform: Option<Platform>,
    pub connected: bool,
    pub mute: MuteStatus,
}

/// A chat message delivered from a peer.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub id: String,
    pub sender_id: PeerId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: i64,
}

/// Remote-mic lease updates.
#[derive(Debug, Clone)]
pub enum RemoteMicEvent {
    /// A peer asked for a lease; answer with `respond_remote_mic`.
    Request { from: PeerId, request_id: String },
    /// The lease changed phase.
    Phase {
        request_id: String,
        phase: RemoteMicPhase,
        source: PeerId,
        target: PeerId,
    },
    /// The lease ended.
    Stopped {
        request_id: String,
        reason: RmStopReason,
    },
}

/// Events emitted by the room controller.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    SignalingState(SignalingState),
    /// A peer reached connected; fired once per peer session.
    PeerJoined(PeerSnapshot),
    /// A peer was cleaned up; fired exactly once per peer session.
    PeerLeft { peer_id: PeerId },
    /// A remote media track arrived; hand it to the media pipeline.
    RemoteTrack {
        peer_id: PeerId,
        track: Arc<TrackRemote>,
    },
    Chat(ChatEvent),
    MuteStatus {
        peer_id: PeerId,
        status: MuteStatus,
    },
    RoomLock {
        locked: bool,
        locked_by: Option<PeerId>,
    },
    HandRaised {
        peer_id: PeerId,
        raised: bool,
    },
    /// A peer asks everyone to mute; the controller auto-accepts and
    /// mutes locally, this event lets the UI reflect it.
    MuteAllRequested {
        from: PeerId,
        request_id: String,
        reason: Option<String>,
    },
    /// A response to our own mute-all request.
    MuteAllResponse {
        request_id: String,
        peer_id: PeerId,
        accepted: bool,
    },
    /// All responses to our mute-all request are in.
    MuteAllComplete {
        request_id: String,
        accepted: usize,
        total: usize,
    },
    RemoteMic(RemoteMicEvent),
    /// A broker session recovered; presence was re-announced.
    BrokerRecovered { broker_url: String },
    /// A contained fault; the room stays up unless the signaling state
    /// says otherwise.
    Error { kind: ErrorKind, message: String },
    /// Advisory, e.g. a weak room ID.
    Warning { message: String },
}
