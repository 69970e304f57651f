//! Signaling Wire Format
//!
//! JSON envelope exchanged over the broker topic and the local bus. One
//! top-level object per message, tagged by `type` with the payload under
//! `data`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Peer identifier: a random 16-character alphanumeric string minted once
/// per process.
pub type PeerId = String;

/// Coarse platform tag carried in announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Win,
    Mac,
    Linux,
}

impl Platform {
    /// Platform of the running build. Unknown targets report `win`, the
    /// majority platform of the original desktop client.
    pub const fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::Mac
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Win
        }
    }
}

/// Session description payload for offers and answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw SDP body.
    pub sdp: String,
}

impl SdpPayload {
    /// Build the payload from a local description.
    pub fn from_description(desc: &RTCSessionDescription) -> Self {
        Self {
            kind: desc.sdp_type.to_string(),
            sdp: desc.sdp.clone(),
        }
    }

    /// Convert back into an engine description.
    pub fn to_description(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        match self.kind.as_str() {
            "offer" => RTCSessionDescription::offer(self.sdp.clone()),
            "answer" => RTCSessionDescription::answer(self.sdp.clone()),
            _ => RTCSessionDescription::pranswer(self.sdp.clone()),
        }
    }

    /// Whether this payload describes an offer.
    pub fn is_offer(&self) -> bool {
        self.kind == RTCSdpType::Offer.to_string()
    }
}

/// Trickle ICE candidate descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl From<RTCIceCandidateInit> for CandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

impl From<CandidatePayload> for RTCIceCandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Remote mute flags exchanged after connect and on every local change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteStatus {
    pub mic_muted: bool,
    pub speaker_muted: bool,
    pub video_muted: bool,
    pub video_enabled: bool,
    pub is_screen_sharing: bool,
}

/// Room lock broadcast payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomLockPayload {
    pub locked: bool,
}

/// Targeted reply telling a joiner the room is locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLockedPayload {
    pub locked_by: PeerId,
}

/// Signal body, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalKind {
    Announce,
    Offer(SdpPayload),
    Answer(SdpPayload),
    IceCandidate(CandidatePayload),
    Leave,
    Ping,
    Pong,
    MuteStatus(MuteStatus),
    RoomLock(RoomLockPayload),
    RoomLocked(RoomLockedPayload),
}

impl SignalKind {
    /// Wire name of the message type, for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Leave => "leave",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::MuteStatus(_) => "mute-status",
            Self::RoomLock(_) => "room-lock",
            Self::RoomLocked(_) => "room-locked",
        }
    }
}

/// Top-level signaling envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Protocol version.
    pub v: u8,
    #[serde(flatten)]
    pub kind: SignalKind,
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(rename = "userName", default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Unix milliseconds at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    /// Sender's join epoch.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    /// Unique ID for cross-broker deduplication.
    #[serde(rename = "msgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

impl SignalMessage {
    /// Build a broadcast message from the local peer.
    pub fn new(kind: SignalKind, from: impl Into<PeerId>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            from: from.into(),
            to: None,
            user_name: None,
            platform: None,
            ts: Some(Utc::now().timestamp_millis()),
            session_id: None,
            msg_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Address the message to a single peer.
    pub fn to_peer(mut self, to: impl Into<PeerId>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Tag with the sender's join epoch.
    pub const fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Attach the announce identity fields.
    pub fn with_identity(mut self, user_name: Option<String>, platform: Platform) -> Self {
        self.user_name = user_name;
        self.platform = Some(platform);
        self
    }

    /// Parse a wire payload.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
