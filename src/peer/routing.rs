//! Audio Routing Policy
//!
//! Two modes: broadcast sends the local audio track to every peer,
//! exclusive sends it to exactly one target and nulls the audio sender of
//! everyone else (the remote-mic path). Mode switches are serialized
//! through the room controller, which walks the mesh and applies the
//! policy per sender.

use crate::signal::message::PeerId;

/// Where the local audio track goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AudioRoute {
    /// Every peer receives the local audio track.
    #[default]
    Broadcast,
    /// Only the target receives audio; everyone else gets a null track.
    Exclusive { target: PeerId },
}

impl AudioRoute {
    /// Whether a given peer should receive the local audio track under
    /// this policy.
    pub fn sends_audio_to(&self, peer_id: &PeerId) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Exclusive { target } => target == peer_id,
        }
    }

    /// The exclusive target, if any.
    pub fn exclusive_target(&self) -> Option<&PeerId> {
        match self {
            Self::Broadcast => None,
            Self::Exclusive { target } => Some(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_everyone() {
        let route = AudioRoute::Broadcast;
        assert!(route.sends_audio_to(&"a".to_string()));
        assert!(route.sends_audio_to(&"b".to_string()));
        assert_eq!(route.exclusive_target(), None);
    }

    #[test]
    fn exclusive_reaches_only_target() {
        let route = AudioRoute::Exclusive {
            target: "a".to_string(),
        };
        assert!(route.sends_audio_to(&"a".to_string()));
        assert!(!route.sends_audio_to(&"b".to_string()));
        assert_eq!(route.exclusive_target(), Some(&"a".to_string()));
    }
}
