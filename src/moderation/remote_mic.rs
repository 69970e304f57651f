//! Remote-Mic Lease
//!
//! A time-bounded agreement that the local peer streams its microphone
//! exclusively to one remote peer (or vice versa). One lease at a time;
//! both sides heartbeat while it is active and either side may stop it.
//! The room controller drives the transitions and owns the audio-routing
//! side effects.

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::peer::channels::RmStopReason;
use crate::signal::message::PeerId;

/// Lifecycle phase of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteMicPhase {
    Idle,
    /// We asked a peer and are waiting for its response.
    PendingOutgoing,
    /// A peer asked us and the embedder has not answered yet.
    PendingIncoming,
    Active,
    Stopped,
    Expired,
    Rejected,
    Error,
}

/// An in-flight or active lease.
#[derive(Debug, Clone)]
pub struct RemoteMicLease {
    /// Peer whose microphone is streamed.
    pub source: PeerId,
    /// Peer receiving the exclusive stream.
    pub target: PeerId,
    pub request_id: String,
    pub phase: RemoteMicPhase,
    pub started_at: Option<Instant>,
    pub last_heartbeat: Instant,
}

impl RemoteMicLease {
    /// Whether a peer participates in this lease.
    pub fn involves(&self, peer_id: &PeerId) -> bool {
        self.source == *peer_id || self.target == *peer_id
    }
}

/// Lease slot plus the transition rules.
#[derive(Debug, Default)]
pub struct RemoteMicState {
    lease: Option<RemoteMicLease>,
}

impl RemoteMicState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(&self) -> Option<&RemoteMicLease> {
        self.lease.as_ref()
    }

    /// A lease is pending or active.
    pub fn is_busy(&self) -> bool {
        self.lease.is_some()
    }

    /// Begin an outgoing request: local peer is the source, `target`
    /// receives. Fails while any lease is in flight.
    pub fn begin_outgoing(&mut self, self_id: &PeerId, target: &PeerId) -> Option<String> {
        if self.is_busy() {
            return None;
        }
        let request_id = Uuid::new_v4().to_string();
        self.lease = Some(RemoteMicLease {
            source: self_id.clone(),
            target: target.clone(),
            request_id: request_id.clone(),
            phase: RemoteMicPhase::PendingOutgoing,
            started_at: None,
            last_heartbeat: Instant::now(),
        });
        Some(request_id)
    }

    /// Register an incoming request: remote peer is the source, we are
    /// the target. `false` means busy and the caller should decline.
    pub fn begin_incoming(&mut self, source: &PeerId, self_id: &PeerId, request_id: &str) -> bool {
        if self.is_busy() {
            return false;
        }
        self.lease = Some(RemoteMicLease {
            source: source.clone(),
            target: self_id.clone(),
            request_id: request_id.to_string(),
            phase: RemoteMicPhase::PendingIncoming,
            started_at: None,
            last_heartbeat: Instant::now(),
        });
        true
    }

    /// Move a pending lease to active. Returns the lease snapshot, or
    /// `None` for an unknown request ID.
    pub fn activate(&mut self, request_id: &str) -> Option<RemoteMicLease> {
        let lease = self.lease.as_mut()?;
        if lease.request_id != request_id
            || !matches!(
                lease.phase,
                RemoteMicPhase::PendingOutgoing | RemoteMicPhase::PendingIncoming
            )
        {
            return None;
        }
        lease.phase = RemoteMicPhase::Active;
        lease.started_at = Some(Instant::now());
        lease.last_heartbeat = Instant::now();
        Some(lease.clone())
    }

    /// Record a heartbeat for the active lease.
    pub fn heartbeat(&mut self, request_id: &str) {
        if let Some(lease) = self.lease.as_mut() {
            if lease.request_id == request_id && lease.phase == RemoteMicPhase::Active {
                lease.last_heartbeat = Instant::now();
            }
        }
    }

    /// Whether the active lease has gone silent for longer than `timeout`.
    pub fn heartbeat_expired(&self, timeout: std::time::Duration) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.phase == RemoteMicPhase::Active && l.last_heartbeat.elapsed() > timeout)
    }

    /// End the lease. Returns the ended lease with its terminal phase
    /// set, or `None` when idle.
    pub fn stop(&mut self, reason: RmStopReason) -> Option<RemoteMicLease> {
        let mut lease = self.lease.take()?;
        lease.phase = terminal_phase(lease.phase, reason);
        Some(lease)
    }

    /// Clear without a terminal transition; used on leave.
    pub fn reset(&mut self) {
        self.lease = None;
    }
}

/// Map a stop reason onto the terminal phase of the lease.
fn terminal_phase(current: RemoteMicPhase, reason: RmStopReason) -> RemoteMicPhase {
    match reason {
        RmStopReason::Stopped | RmStopReason::UserCancelled | RmStopReason::PeerDisconnected => {
            RemoteMicPhase::Stopped
        }
        RmStopReason::HeartbeatTimeout => RemoteMicPhase::Expired,
        _ if current == RemoteMicPhase::PendingOutgoing => RemoteMicPhase::Rejected,
        _ => RemoteMicPhase::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (PeerId, PeerId) {
        ("local0000000000aa".to_string(), "remote000000000bb".to_string())
    }

    #[test]
    fn outgoing_lease_lifecycle() {
        let (me, them) = ids();
        let mut state = RemoteMicState::new();

        let request_id = state.begin_outgoing(&me, &them).expect("idle");
        assert_eq!(state.lease().unwrap().phase, RemoteMicPhase::PendingOutgoing);
        // Second request while pending is refused.
        assert!(state.begin_outgoing(&me, &them).is_none());

        let active = state.activate(&request_id).expect("pending");
        assert_eq!(active.phase, RemoteMicPhase::Active);
        assert_eq!(active.source, me);
        assert_eq!(active.target, them);

        let ended = state.stop(RmStopReason::Stopped).expect("active");
        assert_eq!(ended.phase, RemoteMicPhase::Stopped);
        assert!(!state.is_busy());
    }

    #[test]
    fn incoming_busy_is_refused() {
        let (me, them) = ids();
        let mut state = RemoteMicState::new();
        state.begin_outgoing(&me, &them);
        assert!(!state.begin_incoming(&them, &me, "other-request"));
    }

    #[test]
    fn activate_requires_matching_request() {
        let (me, them) = ids();
        let mut state = RemoteMicState::new();
        state.begin_outgoing(&me, &them);
        assert!(state.activate("bogus").is_none());
    }

    #[test]
    fn heartbeat_timeout_detection() {
        let (me, them) = ids();
        let mut state = RemoteMicState::new();
        let request_id = state.begin_outgoing(&me, &them).unwrap();
        state.activate(&request_id);

        assert!(!state.heartbeat_expired(std::time::Duration::from_secs(15)));
        // A zero timeout expires immediately once active.
        assert!(state.heartbeat_expired(std::time::Duration::ZERO));

        let ended = state.stop(RmStopReason::HeartbeatTimeout).unwrap();
        assert_eq!(ended.phase, RemoteMicPhase::Expired);
    }

    #[test]
    fn involvement_covers_both_sides() {
        let (me, them) = ids();
        let mut state = RemoteMicState::new();
        state.begin_outgoing(&me, &them);
        let lease = state.lease().unwrap();
        assert!(lease.involves(&me));
        assert!(lease.involves(&them));
        assert!(!lease.involves(&"someone-else".to_string()));
    }
}
