//! Moderation State
//!
//! Room lock, raised hands and mute-all aggregation. All transitions are
//! driven by the room controller; this module holds the state and the
//! pure bookkeeping so it can be tested without a mesh.

pub mod remote_mic;

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use crate::signal::message::PeerId;

pub use remote_mic::{RemoteMicLease, RemoteMicPhase, RemoteMicState};

/// Aggregation state for one outstanding mute-all request.
#[derive(Debug, Clone)]
pub struct MuteAllRequest {
    pub id: String,
    pub reason: Option<String>,
    /// Peer responses keyed by peer ID.
    pub responses: HashMap<PeerId, bool>,
    /// Number of peers the request was multicast to.
    pub expected: usize,
    pub started_at: Instant,
}

impl MuteAllRequest {
    /// Every addressed peer has answered.
    pub fn is_complete(&self) -> bool {
        self.responses.len() >= self.expected
    }

    /// Peers that accepted.
    pub fn accepted_count(&self) -> usize {
        self.responses.values().filter(|a| **a).count()
    }
}

/// Room-scoped moderation state.
#[derive(Debug, Default)]
pub struct ModerationState {
    pub room_locked: bool,
    pub locked_by: Option<PeerId>,
    pub raised_hands: HashSet<PeerId>,
    pub local_hand_raised: bool,
    pub pending_mute_all: Option<MuteAllRequest>,
}

impl ModerationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a lock update from a peer (or ourselves).
    pub fn set_locked(&mut self, locked: bool, by: Option<PeerId>) {
        self.room_locked = locked;
        self.locked_by = if locked { by } else { None };
    }

    /// Track a raise-hand update from a peer.
    pub fn set_hand(&mut self, peer_id: &PeerId, raised: bool) {
        if raised {
            self.raised_hands.insert(peer_id.clone());
        } else {
            self.raised_hands.remove(peer_id);
        }
    }

    /// Start aggregating a mute-all request we initiated.
    pub fn begin_mute_all(&mut self, id: String, reason: Option<String>, expected: usize) {
        self.pending_mute_all = Some(MuteAllRequest {
            id,
            reason,
            responses: HashMap::new(),
            expected,
            started_at: Instant::now(),
        });
    }

    /// Record a mute-all response. Returns the finished request once all
    /// responses are in.
    pub fn record_mute_response(
        &mut self,
        id: &str,
        peer_id: &PeerId,
        accepted: bool,
    ) -> Option<MuteAllRequest> {
        let pending = self.pending_mute_all.as_mut()?;
        if pending.id != id {
            return None;
        }
        pending.responses.insert(peer_id.clone(), accepted);
        if pending.is_complete() {
            return self.pending_mute_all.take();
        }
        None
    }

    /// A peer left: forget its hand and its pending mute-all answer slot.
    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        self.raised_hands.remove(peer_id);
        if let Some(pending) = self.pending_mute_all.as_mut() {
            if !pending.responses.contains_key(peer_id) && pending.expected > 0 {
                pending.expected -= 1;
            }
        }
    }

    /// Drop everything; used on leave.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_state_follows_updates() {
        let mut state = ModerationState::new();
        state.set_locked(true, Some("p1".to_string()));
        assert!(state.room_locked);
        assert_eq!(state.locked_by.as_deref(), Some("p1"));

        state.set_locked(false, None);
        assert!(!state.room_locked);
        assert!(state.locked_by.is_none());
    }

    #[test]
    fn hands_track_per_peer() {
        let mut state = ModerationState::new();
        state.set_hand(&"a".to_string(), true);
        state.set_hand(&"b".to_string(), true);
        state.set_hand(&"a".to_string(), false);
        assert!(!state.raised_hands.contains("a"));
        assert!(state.raised_hands.contains("b"));
    }

    #[test]
    fn mute_all_completes_when_everyone_answers() {
        let mut state = ModerationState::new();
        state.begin_mute_all("m1".into(), Some("focus".into()), 2);

        assert!(state
            .record_mute_response("m1", &"a".to_string(), true)
            .is_none());
        // Mismatched ID is ignored.
        assert!(state
            .record_mute_response("other", &"b".to_string(), true)
            .is_none());

        let done = state
            .record_mute_response("m1", &"b".to_string(), false)
            .expect("complete");
        assert_eq!(done.accepted_count(), 1);
        assert!(state.pending_mute_all.is_none());
    }

    #[test]
    fn departed_peer_shrinks_expected_responses() {
        let mut state = ModerationState::new();
        state.begin_mute_all("m1".into(), None, 2);
        state.forget_peer(&"b".to_string());

        let done = state.record_mute_response("m1", &"a".to_string(), true);
        assert!(done.is_some());
    }
}
