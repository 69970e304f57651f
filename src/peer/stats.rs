//! Connection Statistics
//!
//! On-demand per-peer metrics from the transport stats report: RTT from
//! the nominated candidate pair, jitter and packet loss from inbound RTP,
//! with loss computed as a delta against the previous snapshot.

use std::collections::HashMap;

use serde::Serialize;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::signal::message::PeerId;

/// Quality bucket derived from RTT and loss thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    /// Bucket fixed thresholds on round-trip time and loss rate.
    pub fn from_metrics(rtt_ms: f64, loss_pct: f64) -> Self {
        if rtt_ms < 100.0 && loss_pct < 1.0 {
            Self::Excellent
        } else if rtt_ms < 250.0 && loss_pct < 3.0 {
            Self::Good
        } else if rtt_ms < 400.0 && loss_pct < 8.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// One peer's connection metrics.
#[derive(Debug, Clone, Serialize)]
pub struct PeerConnectionStats {
    /// Round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Inbound jitter in milliseconds.
    pub jitter_ms: f64,
    /// Instantaneous packet loss since the previous snapshot, percent.
    pub packet_loss_pct: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub quality: ConnectionQuality,
}

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    packets_received: u64,
    packets_lost: i64,
}

/// Computes per-peer stats, carrying the previous snapshot for delta
/// computation.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    previous: HashMap<PeerId, Snapshot>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query the transport and fold the report into metrics.
    pub async fn collect(
        &mut self,
        peer_id: &PeerId,
        pc: &RTCPeerConnection,
    ) -> PeerConnectionStats {
        let report = pc.get_stats().await;

        let mut rtt_ms = 0.0f64;
        let mut jitter_ms = 0.0f64;
        let mut bytes_sent = 0u64;
        let mut bytes_received = 0u64;
        let mut packets_received = 0u64;
        let mut packets_lost = 0i64;

        for stat in report.reports.values() {
            match stat {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    rtt_ms = pair.current_round_trip_time * 1000.0;
                    bytes_sent = pair.bytes_sent as u64;
                    bytes_received = pair.bytes_received as u64;
                }
                StatsReportType::InboundRTP(inbound) => {
                    jitter_ms = jitter_ms.max(inbound.jitter * 1000.0);
                    packets_received += inbound.packets_received as u64;
                    packets_lost += inbound.packets_lost as i64;
                }
                _ => {}
            }
        }

        let snapshot = Snapshot {
            packets_received,
            packets_lost,
        };
        let previous = self
            .previous
            .insert(peer_id.clone(), snapshot)
            .unwrap_or_default();
        let packet_loss_pct = loss_delta_pct(previous, snapshot);

        PeerConnectionStats {
            rtt_ms,
            jitter_ms,
            packet_loss_pct,
            bytes_sent,
            bytes_received,
            quality: ConnectionQuality::from_metrics(rtt_ms, packet_loss_pct),
        }
    }

    /// Drop the snapshot for a departed peer.
    pub fn forget(&mut self, peer_id: &PeerId) {
        self.previous.remove(peer_id);
    }
}

/// Loss rate over the window between two snapshots.
fn loss_delta_pct(previous: Snapshot, current: Snapshot) -> f64 {
    let received = current.packets_received.saturating_sub(previous.packets_received);
    let lost = (current.packets_lost - previous.packets_lost).max(0) as u64;
    let total = received + lost;
    if total == 0 {
        0.0
    } else {
        (lost as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_thresholds() {
        assert_eq!(
            ConnectionQuality::from_metrics(40.0, 0.1),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            ConnectionQuality::from_metrics(150.0, 0.5),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_metrics(300.0, 5.0),
            ConnectionQuality::Fair
        );
        assert_eq!(
            ConnectionQuality::from_metrics(600.0, 0.0),
            ConnectionQuality::Poor
        );
        assert_eq!(
            ConnectionQuality::from_metrics(50.0, 20.0),
            ConnectionQuality::Poor
        );
    }

    #[test]
    fn loss_is_computed_on_deltas() {
        let previous = Snapshot {
            packets_received: 900,
            packets_lost: 10,
        };
        let current = Snapshot {
            packets_received: 995,
            packets_lost: 15,
        };
        // 95 received, 5 lost in the window: 5%.
        let pct = loss_delta_pct(previous, current);
        assert!((pct - 5.0).abs() < 0.01);
    }

    #[test]
    fn empty_window_is_zero_loss() {
        let snapshot = Snapshot::default();
        assert_eq!(loss_delta_pct(snapshot, snapshot), 0.0);
    }
}
