//! Data Channel Payloads
//!
//! Two ordered channels ride every peer session: `chat` for user
//! messages and `control` for moderation and remote-mic traffic. All
//! payloads are JSON validated on the receiver; malformed input is
//! dropped without closing the channel.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::signal::message::PeerId;

/// Label of the chat data channel.
pub const CHAT_CHANNEL_LABEL: &str = "chat";
/// Label of the control data channel.
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Messages on the chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatChannelMessage {
    #[serde(rename_all = "camelCase")]
    Chat {
        id: String,
        sender_id: PeerId,
        sender_name: String,
        content: String,
        timestamp: i64,
    },
}

impl ChatChannelMessage {
    /// Build an outbound chat message, clamping the content.
    pub fn new(sender_id: &PeerId, sender_name: &str, content: &str, max_len: usize) -> Self {
        Self::Chat {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.clone(),
            sender_name: sender_name.to_string(),
            content: clamp_content(content, max_len),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Parse and validate an inbound chat frame, re-clamping the content;
    /// remote shape is never trusted.
    pub fn parse(payload: &[u8], max_len: usize) -> Result<Self, serde_json::Error> {
        let parsed: Self = serde_json::from_slice(payload)?;
        let Self::Chat {
            id,
            sender_id,
            sender_name,
            content,
            timestamp,
        } = parsed;
        Ok(Self::Chat {
            id,
            sender_id,
            sender_name,
            content: clamp_content(&content, max_len),
            timestamp,
        })
    }
}

fn clamp_content(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        content.to_string()
    } else {
        content.chars().take(max_len).collect()
    }
}

/// Why a remote-mic request was declined (or accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RmResponseReason {
    Accepted,
    Rejected,
    Busy,
    VirtualDeviceMissing,
    VirtualDeviceInstallFailed,
    VirtualDeviceRestartRequired,
    UserCancelled,
    Unknown,
}

/// Why an active remote-mic lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RmStopReason {
    Stopped,
    HeartbeatTimeout,
    PeerDisconnected,
    VirtualDeviceMissing,
    VirtualDeviceInstallFailed,
    VirtualDeviceRestartRequired,
    UserCancelled,
    Error,
    Unknown,
}

/// Messages on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    RmRequest { request_id: String, ts: i64 },
    #[serde(rename_all = "camelCase")]
    RmResponse {
        request_id: String,
        accepted: bool,
        reason: RmResponseReason,
    },
    #[serde(rename_all = "camelCase")]
    RmStart { request_id: String },
    #[serde(rename_all = "camelCase")]
    RmStop {
        request_id: String,
        reason: RmStopReason,
    },
    #[serde(rename_all = "camelCase")]
    RmHeartbeat { request_id: String, ts: i64 },
    #[serde(rename_all = "camelCase")]
    MuteRequest {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MuteResponse { id: String, accepted: bool },
    #[serde(rename_all = "camelCase")]
    RaiseHand { raised: bool },
    #[serde(rename_all = "camelCase")]
    RoomLock { locked: bool },
    #[serde(rename_all = "camelCase")]
    RoomLocked { locked_by: PeerId },
}

impl ControlMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_wire_shape() {
        let msg = ChatChannelMessage::new(&"p1".to_string(), "Alice", "hello", 5000);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["senderId"], "p1");
        assert_eq!(json["senderName"], "Alice");
        assert_eq!(json["content"], "hello");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn chat_content_is_clamped_both_ways() {
        let long = "x".repeat(6000);
        let ChatChannelMessage::Chat { content, .. } =
            ChatChannelMessage::new(&"p1".to_string(), "A", &long, 5000);
        assert_eq!(content.len(), 5000);

        let raw = serde_json::json!({
            "type": "chat",
            "id": "1",
            "senderId": "p2",
            "senderName": "B",
            "content": "y".repeat(6000),
            "timestamp": 1
        });
        let parsed =
            ChatChannelMessage::parse(serde_json::to_vec(&raw).unwrap().as_slice(), 5000).unwrap();
        let ChatChannelMessage::Chat { content, .. } = parsed;
        assert_eq!(content.len(), 5000);
    }

    #[test]
    fn malformed_chat_is_rejected() {
        assert!(ChatChannelMessage::parse(b"not json", 5000).is_err());
        assert!(ChatChannelMessage::parse(br#"{"type":"chat"}"#, 5000).is_err());
        assert!(ChatChannelMessage::parse(br#"{"type":"other","id":"1"}"#, 5000).is_err());
    }

    #[test]
    fn control_wire_names() {
        let msg = ControlMessage::RmResponse {
            request_id: "r1".into(),
            accepted: false,
            reason: RmResponseReason::VirtualDeviceMissing,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "rm_response");
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["reason"], "virtual-device-missing");

        let msg = ControlMessage::RmStop {
            request_id: "r1".into(),
            reason: RmStopReason::HeartbeatTimeout,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "rm_stop");
        assert_eq!(json["reason"], "heartbeat-timeout");

        let msg = ControlMessage::MuteRequest {
            id: "m1".into(),
            reason: Some("meeting".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "mute_request");
    }

    #[test]
    fn control_round_trip() {
        let messages = vec![
            ControlMessage::RmRequest {
                request_id: "r".into(),
                ts: 42,
            },
            ControlMessage::RaiseHand { raised: true },
            ControlMessage::RoomLocked {
                locked_by: "p9".into(),
            },
        ];
        for msg in messages {
            let encoded = msg.encode().unwrap();
            assert_eq!(ControlMessage::parse(encoded.as_bytes()).unwrap(), msg);
        }
    }
}
