//! Peer Session
//!
//! Per-remote-peer record: the WebRTC transport, the two data channels,
//! the ICE-restart bookkeeping and every timer attached to the peer. The
//! room controller owns all records and is the only mutator; transport
//! callbacks never touch a record directly, they post session-tagged
//! events that the controller resolves back to a record by peer ID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::channels::{ControlMessage, CHAT_CHANNEL_LABEL, CONTROL_CHANNEL_LABEL};
use crate::error::RoomError;
use crate::sdp::apply_opus_hints;
use crate::signal::message::{MuteStatus, PeerId, Platform, SdpPayload};

/// Media kind of a local sender slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec: RTPCodecType) -> Self {
        match codec {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Transport and timer events a peer session posts to the controller.
pub enum PeerEvent {
    /// A locally gathered trickle candidate to forward to the peer.
    LocalCandidate(RTCIceCandidateInit),
    IceState(RTCIceConnectionState),
    ConnectionState(RTCPeerConnectionState),
    RemoteTrack(Arc<TrackRemote>),
    /// The remote side opened a data channel towards us.
    RemoteChannel(Arc<RTCDataChannel>),
    ChatData(Bytes),
    ControlData(Bytes),
    /// ICE sat in `disconnected` through the whole grace period.
    GraceElapsed,
    /// An in-flight ICE restart did not reach `connected` in time.
    RestartWindowElapsed,
    /// Backoff delay before the next restart attempt expired.
    RestartRetryDue,
    /// Post-connect delay before sending our mute status expired.
    MuteStatusDue,
}

/// A peer event stamped with its session epoch and origin peer; the
/// controller drops events whose epoch is stale and re-looks the peer up
/// by ID, so a torn-down record can never be revived by a late event.
pub struct PeerEngineEvent {
    pub session: u64,
    pub peer_id: PeerId,
    pub event: PeerEvent,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEngineEvent>;

/// Build the WebRTC engine API shared by every peer session.
pub fn build_webrtc_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// State for one remote peer.
pub struct PeerRecord {
    pub id: PeerId,
    pub pc: Arc<RTCPeerConnection>,
    pub user_name: Option<String>,
    pub platform: Option<Platform>,
    /// The remote peer's join epoch, from its announce.
    pub peer_session: Option<u64>,
    pub joined_at: Instant,
    pub connected: bool,
    pub remote_mute: MuteStatus,
    pub ice_restart_attempts: u32,
    pub ice_restart_in_progress: bool,
    /// Tracks the remote side is sending us, in arrival order.
    pub remote_tracks: Vec<Arc<TrackRemote>>,
    pub last_seen: Instant,
    pub last_ping: Instant,
    chat_channel: Option<Arc<RTCDataChannel>>,
    control_channel: Option<Arc<RTCDataChannel>>,
    senders: HashMap<TrackKind, Arc<RTCRtpSender>>,
    grace_timer: Option<JoinHandle<()>>,
    restart_window_timer: Option<JoinHandle<()>>,
    restart_retry_timer: Option<JoinHandle<()>>,
    mute_status_timer: Option<JoinHandle<()>>,
}

impl PeerRecord {
    /// Create the transport and attach its event handlers.
    pub async fn new(
        api: &API,
        rtc_config: RTCConfiguration,
        peer_id: PeerId,
        session: u64,
        events: PeerEventSender,
    ) -> Result<Self, RoomError> {
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        attach_transport_handlers(&pc, &peer_id, session, &events);

        let now = Instant::now();
        Ok(Self {
            id: peer_id,
            pc,
            user_name: None,
            platform: None,
            peer_session: None,
            joined_at: now,
            connected: false,
            remote_mute: MuteStatus::default(),
            ice_restart_attempts: 0,
            ice_restart_in_progress: false,
            remote_tracks: Vec::new(),
            last_seen: now,
            last_ping: now,
            chat_channel: None,
            control_channel: None,
            senders: HashMap::new(),
            grace_timer: None,
            restart_window_timer: None,
            restart_retry_timer: None,
            mute_status_timer: None,
        })
    }

    /// Create the chat and control channels. The mesh initiator does this
    /// before its first offer so both channels ride the initial SDP.
    pub async fn create_channels(
        &mut self,
        session: u64,
        events: &PeerEventSender,
    ) -> Result<(), RoomError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let chat = self
            .pc
            .create_data_channel(CHAT_CHANNEL_LABEL, Some(init.clone()))
            .await?;
        let control = self
            .pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, Some(init))
            .await?;
        attach_channel_handlers(&chat, &self.id, session, events);
        attach_channel_handlers(&control, &self.id, session, events);
        self.chat_channel = Some(chat);
        self.control_channel = Some(control);
        Ok(())
    }

    /// Adopt a channel the remote side opened.
    pub fn adopt_remote_channel(
        &mut self,
        channel: Arc<RTCDataChannel>,
        session: u64,
        events: &PeerEventSender,
    ) {
        attach_channel_handlers(&channel, &self.id, session, events);
        match channel.label() {
            CHAT_CHANNEL_LABEL => self.chat_channel = Some(channel),
            CONTROL_CHANNEL_LABEL => self.control_channel = Some(channel),
            other => debug!(peer_id = %self.id, label = %other, "Ignoring unknown channel"),
        }
    }

    /// Create an offer (optionally flagged for ICE restart), install it
    /// locally and return the wire payload with the Opus hints applied.
    pub async fn create_offer(&mut self, ice_restart: bool) -> Result<SdpPayload, RoomError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SdpPayload {
            kind: offer.sdp_type.to_string(),
            sdp: apply_opus_hints(&offer.sdp),
        })
    }

    /// Answer a remote offer already installed as the remote description.
    pub async fn create_answer(&mut self) -> Result<SdpPayload, RoomError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SdpPayload::from_description(&answer))
    }

    /// Install a remote description.
    pub async fn set_remote(&mut self, payload: &SdpPayload) -> Result<(), RoomError> {
        let desc = payload.to_description()?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    /// Whether the remote description has been installed yet; candidates
    /// arriving earlier must queue.
    pub async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    /// Apply a trickle candidate.
    pub async fn add_candidate(&self, init: RTCIceCandidateInit) -> Result<(), RoomError> {
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Add or replace local senders for the given tracks. `route_allows`
    /// gates whether the audio sender actually carries the track.
    pub async fn apply_local_tracks(
        &mut self,
        tracks: &[Arc<dyn TrackLocal + Send + Sync>],
        route_allows_audio: bool,
    ) -> Result<bool, RoomError> {
        let mut added_sender = false;
        for track in tracks {
            let kind = TrackKind::from(track.kind());
            let active: Option<Arc<dyn TrackLocal + Send + Sync>> =
                if kind == TrackKind::Audio && !route_allows_audio {
                    None
                } else {
                    Some(track.clone())
                };

            if let Some(sender) = self.senders.get(&kind) {
                sender.replace_track(active).await?;
            } else {
                let sender = self.pc.add_track(track.clone()).await?;
                if active.is_none() {
                    sender.replace_track(None).await?;
                }
                self.senders.insert(kind, sender);
                added_sender = true;
            }
        }
        Ok(added_sender)
    }

    /// Replace the sender of the track's kind, adding one if missing.
    pub async fn replace_track(
        &mut self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<bool, RoomError> {
        let kind = TrackKind::from(track.kind());
        if let Some(sender) = self.senders.get(&kind) {
            sender.replace_track(Some(track)).await?;
            Ok(false)
        } else {
            let sender = self.pc.add_track(track).await?;
            self.senders.insert(kind, sender);
            Ok(true)
        }
    }

    /// Point the audio sender at a track, or null it out.
    pub async fn set_audio_track(
        &self,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<(), RoomError> {
        if let Some(sender) = self.senders.get(&TrackKind::Audio) {
            sender.replace_track(track).await?;
        }
        Ok(())
    }

    /// Send a JSON payload over the chat channel. `false` when the
    /// channel is missing or not yet open.
    pub async fn send_chat(&self, json: &str) -> bool {
        send_on(self.chat_channel.as_ref(), json).await
    }

    /// Send a control message. `false` when the channel is unavailable.
    pub async fn send_control(&self, message: &ControlMessage) -> bool {
        let Ok(json) = message.encode() else {
            return false;
        };
        send_on(self.control_channel.as_ref(), &json).await
    }

    /// Refresh the activity clock.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Transport is neither failed nor closed.
    pub fn is_live(&self) -> bool {
        !matches!(
            self.pc.connection_state(),
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
        )
    }

    pub fn ice_state(&self) -> RTCIceConnectionState {
        self.pc.ice_connection_state()
    }

    // Timer management. Every timer posts a session-tagged event and the
    // controller re-looks the peer up, so firing after cleanup is a no-op;
    // aborting here just avoids the wasted wakeup.

    pub fn arm_grace_timer(&mut self, delay: Duration, session: u64, events: &PeerEventSender) {
        if self.grace_timer.is_some() {
            return;
        }
        self.grace_timer = Some(spawn_peer_timer(
            delay,
            session,
            self.id.clone(),
            events.clone(),
            PeerEvent::GraceElapsed,
        ));
    }

    pub fn clear_grace_timer(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }

    pub fn arm_restart_window(&mut self, delay: Duration, session: u64, events: &PeerEventSender) {
        if let Some(timer) = self.restart_window_timer.take() {
            timer.abort();
        }
        self.restart_window_timer = Some(spawn_peer_timer(
            delay,
            session,
            self.id.clone(),
            events.clone(),
            PeerEvent::RestartWindowElapsed,
        ));
    }

    pub fn clear_restart_window(&mut self) {
        if let Some(timer) = self.restart_window_timer.take() {
            timer.abort();
        }
    }

    pub fn arm_restart_retry(&mut self, delay: Duration, session: u64, events: &PeerEventSender) {
        if let Some(timer) = self.restart_retry_timer.take() {
            timer.abort();
        }
        self.restart_retry_timer = Some(spawn_peer_timer(
            delay,
            session,
            self.id.clone(),
            events.clone(),
            PeerEvent::RestartRetryDue,
        ));
    }

    pub fn arm_mute_status_timer(
        &mut self,
        delay: Duration,
        session: u64,
        events: &PeerEventSender,
    ) {
        if let Some(timer) = self.mute_status_timer.take() {
            timer.abort();
        }
        self.mute_status_timer = Some(spawn_peer_timer(
            delay,
            session,
            self.id.clone(),
            events.clone(),
            PeerEvent::MuteStatusDue,
        ));
    }

    /// Release every timer and close every channel and the transport.
    pub async fn close(&mut self) {
        for timer in [
            self.grace_timer.take(),
            self.restart_window_timer.take(),
            self.restart_retry_timer.take(),
            self.mute_status_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
        if let Some(chat) = self.chat_channel.take() {
            let _ = chat.close().await;
        }
        if let Some(control) = self.control_channel.take() {
            let _ = control.close().await;
        }
        if let Err(e) = self.pc.close().await {
            warn!(peer_id = %self.id, error = %e, "Transport close failed");
        }
    }
}

async fn send_on(channel: Option<&Arc<RTCDataChannel>>, json: &str) -> bool {
    match channel {
        Some(dc) if dc.ready_state() == RTCDataChannelState::Open => {
            dc.send_text(json.to_string()).await.is_ok()
        }
        _ => false,
    }
}

fn spawn_peer_timer(
    delay: Duration,
    session: u64,
    peer_id: PeerId,
    events: PeerEventSender,
    event: PeerEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = events.send(PeerEngineEvent {
            session,
            peer_id,
            event,
        });
    })
}

fn attach_transport_handlers(
    pc: &Arc<RTCPeerConnection>,
    peer_id: &PeerId,
    session: u64,
    events: &PeerEventSender,
) {
    let tx = events.clone();
    let id = peer_id.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEngineEvent {
                            session,
                            peer_id: id,
                            event: PeerEvent::LocalCandidate(init),
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            }
        })
    }));

    let tx = events.clone();
    let id = peer_id.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEngineEvent {
                session,
                peer_id: id,
                event: PeerEvent::IceState(state),
            });
        })
    }));

    let tx = events.clone();
    let id = peer_id.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEngineEvent {
                session,
                peer_id: id,
                event: PeerEvent::ConnectionState(state),
            });
        })
    }));

    let tx = events.clone();
    let id = peer_id.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEngineEvent {
                session,
                peer_id: id,
                event: PeerEvent::RemoteTrack(track),
            });
        })
    }));

    let tx = events.clone();
    let id = peer_id.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEngineEvent {
                session,
                peer_id: id,
                event: PeerEvent::RemoteChannel(channel),
            });
        })
    }));
}

fn attach_channel_handlers(
    channel: &Arc<RTCDataChannel>,
    peer_id: &PeerId,
    session: u64,
    events: &PeerEventSender,
) {
    let is_chat = channel.label() == CHAT_CHANNEL_LABEL;
    let tx = events.clone();
    let id = peer_id.clone();
    channel.on_message(Box::new(move |message| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let event = if is_chat {
                PeerEvent::ChatData(message.data)
            } else {
                PeerEvent::ControlData(message.data)
            };
            let _ = tx.send(PeerEngineEvent {
                session,
                peer_id: id,
                event,
            });
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_kind_mapping() {
        assert_eq!(TrackKind::from(RTPCodecType::Audio), TrackKind::Audio);
        assert_eq!(TrackKind::from(RTPCodecType::Video), TrackKind::Video);
        assert_eq!(TrackKind::from(RTPCodecType::Unspecified), TrackKind::Video);
    }

    #[tokio::test]
    async fn peer_record_creates_and_closes() {
        let api = build_webrtc_api().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut record = PeerRecord::new(
            &api,
            RTCConfiguration::default(),
            "peer-1".to_string(),
            1,
            tx,
        )
        .await
        .unwrap();
        assert!(!record.connected);
        assert!(record.is_live());
        record.close().await;
    }

    #[tokio::test]
    async fn offer_carries_channels_and_opus_hints() {
        let api = build_webrtc_api().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut record = PeerRecord::new(
            &api,
            RTCConfiguration::default(),
            "peer-1".to_string(),
            1,
            tx.clone(),
        )
        .await
        .unwrap();

        record.create_channels(1, &tx).await.unwrap();
        let offer = record.create_offer(false).await.unwrap();
        assert!(offer.is_offer());
        // Data channels put an application m-line in the SDP.
        assert!(offer.sdp.contains("application"));
        record.close().await;
    }
}
