//! Room and Session Errors

use thiserror::Error;

use crate::credentials::CredentialsError;
use crate::signal::message::PeerId;

/// Errors surfaced by room controller operations.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Credential provider failed and strict mode forbids the fallback.
    #[error("credentials unavailable: {0}")]
    CredentialsUnavailable(#[from] CredentialsError),

    /// WebRTC engine error.
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// Operation requires a joined room.
    #[error("no room joined")]
    NotInRoom,

    /// Addressed peer is not part of the mesh.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Exclusive audio routing requires a live target peer.
    #[error("invalid audio route target: {0}")]
    InvalidRouteTarget(PeerId),

    /// A remote-mic lease is already pending or active.
    #[error("remote mic lease busy")]
    RemoteMicBusy,

    /// No lease matches the given request ID.
    #[error("no matching remote mic request: {0}")]
    RemoteMicUnknownRequest(String),

    /// The controller task is gone.
    #[error("room controller closed")]
    ControllerClosed,

    /// Wire (de)serialization failure.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Non-fatal error kinds surfaced through [`RoomEvent::Error`].
///
/// Connection-scoped faults (one broker, one peer) never terminate the
/// room; session-scoped faults flip the signaling state as well.
///
/// [`RoomEvent::Error`]: crate::events::RoomEvent::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credential provider failed.
    CredentialUnavailable,
    /// Zero brokers accepted the connection; room continues local-only.
    MqttConnection,
    /// No broker acknowledged the room subscription; pool torn down.
    MqttSubscribeFailed,
    /// Undecodable frame or payload; dropped.
    TransportMalformed,
    /// ICE restart attempts exhausted for a peer.
    IceRestartExhausted,
    /// Network-monitor reconnect cycles exhausted.
    NetworkReconnectExhausted,
    /// Remote-mic lease fault, reason carried in the message.
    RemoteMic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CredentialUnavailable => "credential-unavailable",
            Self::MqttConnection => "mqtt-connection",
            Self::MqttSubscribeFailed => "mqtt-subscribe-failed",
            Self::TransportMalformed => "transport-malformed",
            Self::IceRestartExhausted => "ice-restart-exhausted",
            Self::NetworkReconnectExhausted => "network-reconnect-exhausted",
            Self::RemoteMic => "remote-mic",
        };
        f.write_str(s)
    }
}
