//! Signaling Message Model
//!
//! Wire envelope, payload types and pre-dispatch screening for the room
//! topic.

pub mod message;
pub mod router;

pub use message::{
    CandidatePayload, MuteStatus, PeerId, Platform, RoomLockPayload, RoomLockedPayload,
    SdpPayload, SignalKind, SignalMessage, PROTOCOL_VERSION,
};
pub use router::{records_activity, screen, Screen};
