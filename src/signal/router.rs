//! Signal Routing
//!
//! Pre-dispatch screening for inbound signaling messages. Dispatch itself
//! is a match on [`SignalKind`] in the room controller; this module only
//! decides whether a message reaches it.

use super::message::{SignalMessage, SignalKind};

/// Screening outcome for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// Deliver to the per-type handler.
    Deliver,
    /// The broker or bus echoed our own message back.
    FromSelf,
    /// Addressed to a different peer.
    Misaddressed,
}

/// Screen an inbound message against the local identity.
///
/// Messages from self are echoes (brokers and the local bus both loop
/// publishes back); messages carrying a `to` for another peer are simply
/// not ours.
pub fn screen(msg: &SignalMessage, self_id: &str) -> Screen {
    if msg.from == self_id {
        return Screen::FromSelf;
    }
    if let Some(to) = &msg.to {
        if to != self_id {
            return Screen::Misaddressed;
        }
    }
    Screen::Deliver
}

/// Whether this message type counts as peer activity for heartbeat
/// supervision. Everything a live peer emits counts.
pub const fn records_activity(kind: &SignalKind) -> bool {
    !matches!(kind, SignalKind::Leave)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: SignalKind, from: &str, to: Option<&str>) -> SignalMessage {
        let mut m = SignalMessage::new(kind, from);
        m.to = to.map(Into::into);
        m
    }

    #[test]
    fn drops_own_echo() {
        let m = msg(SignalKind::Announce, "self-peer", None);
        assert_eq!(screen(&m, "self-peer"), Screen::FromSelf);
    }

    #[test]
    fn drops_misaddressed() {
        let m = msg(SignalKind::Ping, "other", Some("third"));
        assert_eq!(screen(&m, "self-peer"), Screen::Misaddressed);
    }

    #[test]
    fn delivers_broadcast_and_addressed() {
        let broadcast = msg(SignalKind::Announce, "other", None);
        assert_eq!(screen(&broadcast, "self-peer"), Screen::Deliver);

        let addressed = msg(SignalKind::Pong, "other", Some("self-peer"));
        assert_eq!(screen(&addressed, "self-peer"), Screen::Deliver);
    }

    #[test]
    fn leave_does_not_refresh_activity() {
        assert!(!records_activity(&SignalKind::Leave));
        assert!(records_activity(&SignalKind::Pong));
        assert!(records_activity(&SignalKind::Announce));
    }
}
