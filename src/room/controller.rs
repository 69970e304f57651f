//! Room Controller
//!
//! The owning actor of a conference room. One task holds the peer map,
//! the broker pool, the moderation and remote-mic state and every timer;
//! public methods enqueue commands and every asynchronous completion
//! (broker delivery, transport callback, timer) re-enters the loop as an
//! event stamped with the join epoch it belongs to. The loop drops
//! anything stamped with a stale epoch, which is what makes rejoining
//! while messages are in flight safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::context::CoreContext;
use crate::credentials::{BrokerEndpoint, Credentials};
use crate::error::{ErrorKind, RoomError};
use crate::events::{
    ChatEvent, PeerSnapshot, RemoteMicEvent, RoomEvent, SignalingState,
};
use crate::moderation::{ModerationState, RemoteMicState};
use crate::peer::channels::{
    ChatChannelMessage, ControlMessage, RmResponseReason, RmStopReason,
};
use crate::peer::routing::AudioRoute;
use crate::peer::session::{
    build_webrtc_api, PeerEngineEvent, PeerEvent, PeerEventSender, PeerRecord, TrackKind,
};
use crate::peer::stats::{PeerConnectionStats, StatsAggregator};
use crate::broker::pool::{BrokerPool, PoolEvent};
use crate::signal::message::{
    CandidatePayload, MuteStatus, PeerId, Platform, RoomLockPayload, RoomLockedPayload,
    SdpPayload, SignalKind, SignalMessage,
};
use crate::signal::router::{records_activity, screen, Screen};

/// Room IDs shorter than this are accepted but flagged as weak.
const MIN_STRONG_ROOM_ID: usize = 8;

type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Public handle to a room controller task.
pub struct RoomController {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

enum Command {
    Join {
        room_id: String,
        display_name: Option<String>,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Leave {
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    AnnounceLeave,
    SendChat {
        content: String,
        reply: oneshot::Sender<Result<usize, RoomError>>,
    },
    SetMuteStatus {
        status: MuteStatus,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    SetLocalStream {
        tracks: Vec<LocalTrack>,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    ReplaceTrack {
        track: LocalTrack,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    SetAudioRoute {
        route: AudioRoute,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    SetRoomLocked {
        locked: bool,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    SetHandRaised {
        raised: bool,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    RequestMuteAll {
        reason: Option<String>,
        reply: oneshot::Sender<Result<String, RoomError>>,
    },
    RequestRemoteMic {
        target: PeerId,
        reply: oneshot::Sender<Result<String, RoomError>>,
    },
    RespondRemoteMic {
        request_id: String,
        accepted: bool,
        reason: RmResponseReason,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    StopRemoteMic {
        reason: RmStopReason,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    ConnectionStats {
        reply: oneshot::Sender<HashMap<PeerId, PeerConnectionStats>>,
    },
    QuerySignalingState {
        reply: oneshot::Sender<SignalingState>,
    },
    NetworkChanged {
        online: bool,
    },
    Shutdown,
}

/// Loop re-entry events, stamped with the epoch they were armed under.
enum Internal {
    PoolMessage { session: u64, payload: Bytes },
    PoolReconnected { session: u64, broker_url: String },
    BusMessage { session: u64, payload: Bytes },
    FirstAnnounceDue { session: u64 },
    AnnounceTick { session: u64 },
    HeartbeatTick { session: u64 },
    NetReconnectDue { session: u64, attempt: u32 },
}

impl RoomController {
    /// Spawn the controller task. Events stream out on `events` for the
    /// lifetime of the controller.
    pub fn new(
        ctx: Arc<CoreContext>,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Result<Self, RoomError> {
        let api = Arc::new(build_webrtc_api()?);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let engine = Engine {
            config: ctx.config().clone(),
            ctx,
            api,
            events,
            internal_tx,
            peer_tx,
            session: 0,
            signaling: SignalingState::Idle,
            local_mute: MuteStatus::default(),
            local_tracks: Vec::new(),
            route: AudioRoute::Broadcast,
            stats: StatsAggregator::new(),
            net: NetworkState::default(),
            room: None,
        };
        let task = tokio::spawn(engine.run(cmd_rx, internal_rx, peer_rx));

        Ok(Self { cmd_tx, task })
    }

    /// Join a room, leaving any current one first.
    pub async fn join_room(
        &self,
        room_id: &str,
        display_name: Option<String>,
    ) -> Result<(), RoomError> {
        self.request(|reply| Command::Join {
            room_id: room_id.to_string(),
            display_name,
            reply,
        })
        .await?
    }

    /// Leave the current room. No-op when idle.
    pub async fn leave_room(&self) -> Result<(), RoomError> {
        self.request(|reply| Command::Leave { reply }).await?
    }

    /// Best-effort leave broadcast for process-exit hooks; does not wait.
    pub fn announce_leave(&self) {
        let _ = self.cmd_tx.try_send(Command::AnnounceLeave);
    }

    /// Fan a chat message out to every open chat channel. Returns the
    /// number of peers it reached.
    pub async fn send_chat(&self, content: &str) -> Result<usize, RoomError> {
        self.request(|reply| Command::SendChat {
            content: content.to_string(),
            reply,
        })
        .await?
    }

    /// Update the local mute flags and broadcast them to the room.
    pub async fn set_mute_status(&self, status: MuteStatus) -> Result<(), RoomError> {
        self.request(|reply| Command::SetMuteStatus { status, reply })
            .await?
    }

    /// Install the local media tracks on every peer session.
    pub async fn set_local_stream(&self, tracks: Vec<LocalTrack>) -> Result<(), RoomError> {
        self.request(|reply| Command::SetLocalStream { tracks, reply })
            .await?
    }

    /// Replace the matching-kind sender on every peer.
    pub async fn replace_track(&self, track: LocalTrack) -> Result<(), RoomError> {
        self.request(|reply| Command::ReplaceTrack { track, reply })
            .await?
    }

    /// Switch the audio routing policy.
    pub async fn set_audio_route(&self, route: AudioRoute) -> Result<(), RoomError> {
        self.request(|reply| Command::SetAudioRoute { route, reply })
            .await?
    }

    /// Lock or unlock the room.
    pub async fn set_room_locked(&self, locked: bool) -> Result<(), RoomError> {
        self.request(|reply| Command::SetRoomLocked { locked, reply })
            .await?
    }

    /// Raise or lower the local hand.
    pub async fn set_hand_raised(&self, raised: bool) -> Result<(), RoomError> {
        self.request(|reply| Command::SetHandRaised { raised, reply })
            .await?
    }

    /// Ask every peer to mute. Returns the request ID used to correlate
    /// responses.
    pub async fn request_mute_all(&self, reason: Option<String>) -> Result<String, RoomError> {
        self.request(|reply| Command::RequestMuteAll { reason, reply })
            .await?
    }

    /// Ask a peer for a remote-mic lease. Returns the request ID.
    pub async fn request_remote_mic(&self, target: &PeerId) -> Result<String, RoomError> {
        self.request(|reply| Command::RequestRemoteMic {
            target: target.clone(),
            reply,
        })
        .await?
    }

    /// Answer an incoming remote-mic request.
    pub async fn respond_remote_mic(
        &self,
        request_id: &str,
        accepted: bool,
        reason: RmResponseReason,
    ) -> Result<(), RoomError> {
        self.request(|reply| Command::RespondRemoteMic {
            request_id: request_id.to_string(),
            accepted,
            reason,
            reply,
        })
        .await?
    }

    /// Stop the current remote-mic lease.
    pub async fn stop_remote_mic(&self, reason: RmStopReason) -> Result<(), RoomError> {
        self.request(|reply| Command::StopRemoteMic { reason, reply })
            .await?
    }

    /// Per-peer connection metrics, computed on demand.
    pub async fn connection_stats(&self) -> Result<HashMap<PeerId, PeerConnectionStats>, RoomError> {
        self.request(|reply| Command::ConnectionStats { reply }).await
    }

    /// Current signaling state.
    pub async fn signaling_state(&self) -> Result<SignalingState, RoomError> {
        self.request(|reply| Command::QuerySignalingState { reply })
            .await
    }

    /// Feed the OS online/offline signal in.
    pub fn network_changed(&self, online: bool) {
        let _ = self.cmd_tx.try_send(Command::NetworkChanged { online });
    }

    /// Leave and stop the controller task.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.task.await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| RoomError::ControllerClosed)?;
        reply_rx.await.map_err(|_| RoomError::ControllerClosed)
    }
}

#[derive(Default)]
struct NetworkState {
    online: bool,
    was_in_room: bool,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct ActiveRoom {
    room_id: String,
    topic: String,
    display_name: Option<String>,
    credentials: Credentials,
    endpoints: Vec<BrokerEndpoint>,
    pool: Option<BrokerPool>,
    pool_forwarder: Option<JoinHandle<()>>,
    bus_tx: broadcast::Sender<Bytes>,
    bus_task: JoinHandle<()>,
    peers: HashMap<PeerId, PeerRecord>,
    pending_candidates: HashMap<PeerId, Vec<RTCIceCandidateInit>>,
    moderation: ModerationState,
    remote_mic: RemoteMicState,
    first_announce_timer: Option<JoinHandle<()>>,
    announce_loop: Option<JoinHandle<()>>,
    heartbeat_loop: Option<JoinHandle<()>>,
    announce_started_at: Instant,
    last_announce: Option<Instant>,
}

struct Engine {
    ctx: Arc<CoreContext>,
    config: Config,
    api: Arc<API>,
    events: mpsc::UnboundedSender<RoomEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    peer_tx: PeerEventSender,
    /// Join epoch; incremented on every join attempt and stamped onto
    /// every outbound message, timer and channel.
    session: u64,
    signaling: SignalingState,
    local_mute: MuteStatus,
    local_tracks: Vec<LocalTrack>,
    route: AudioRoute,
    stats: StatsAggregator,
    net: NetworkState,
    room: Option<ActiveRoom>,
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEngineEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        self.do_leave().await;
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(ev) = internal_rx.recv() => self.handle_internal(ev).await,
                Some(ev) = peer_rx.recv() => self.handle_peer_event(ev).await,
            }
        }
        debug!("Room controller stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Join {
                room_id,
                display_name,
                reply,
            } => {
                let result = self.do_join(room_id, display_name).await;
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                self.do_leave().await;
                let _ = reply.send(Ok(()));
            }
            Command::AnnounceLeave => self.broadcast_leave().await,
            Command::SendChat { content, reply } => {
                let _ = reply.send(self.do_send_chat(&content).await);
            }
            Command::SetMuteStatus { status, reply } => {
                self.local_mute = status;
                let result = self.broadcast_mute_status().await;
                let _ = reply.send(result);
            }
            Command::SetLocalStream { tracks, reply } => {
                let _ = reply.send(self.do_set_local_stream(tracks).await);
            }
            Command::ReplaceTrack { track, reply } => {
                let _ = reply.send(self.do_replace_track(track).await);
            }
            Command::SetAudioRoute { route, reply } => {
                let _ = reply.send(self.do_set_audio_route(route).await);
            }
            Command::SetRoomLocked { locked, reply } => {
                let _ = reply.send(self.do_set_room_locked(locked).await);
            }
            Command::SetHandRaised { raised, reply } => {
                let _ = reply.send(self.do_set_hand_raised(raised).await);
            }
            Command::RequestMuteAll { reason, reply } => {
                let _ = reply.send(self.do_request_mute_all(reason).await);
            }
            Command::RequestRemoteMic { target, reply } => {
                let _ = reply.send(self.do_request_remote_mic(target).await);
            }
            Command::RespondRemoteMic {
                request_id,
                accepted,
                reason,
                reply,
            } => {
                let _ = reply.send(self.do_respond_remote_mic(&request_id, accepted, reason).await);
            }
            Command::StopRemoteMic { reason, reply } => {
                self.end_remote_mic(reason, true).await;
                let _ = reply.send(Ok(()));
            }
            Command::ConnectionStats { reply } => {
                let _ = reply.send(self.do_connection_stats().await);
            }
            Command::QuerySignalingState { reply } => {
                let _ = reply.send(self.signaling);
            }
            Command::NetworkChanged { online } => self.on_network_changed(online),
            Command::Shutdown => unreachable!("handled in run"),
        }
    }

    async fn handle_internal(&mut self, ev: Internal) {
        match ev {
            Internal::PoolMessage { session, payload }
            | Internal::BusMessage { session, payload } => {
                if session != self.session {
                    return;
                }
                self.handle_payload(&payload).await;
            }
            Internal::PoolReconnected { session, broker_url } => {
                if session != self.session {
                    return;
                }
                info!(broker = %broker_url, "Broker recovered, re-announcing presence");
                self.emit(RoomEvent::BrokerRecovered { broker_url });
                if let Some(room) = self.room.as_mut() {
                    room.announce_started_at = Instant::now();
                }
                self.send_announce(None).await;
                self.start_announce_loop();
            }
            Internal::FirstAnnounceDue { session } | Internal::AnnounceTick { session }
                if session != self.session => {}
            Internal::FirstAnnounceDue { .. } => self.send_announce(None).await,
            Internal::AnnounceTick { .. } => self.on_announce_tick().await,
            Internal::HeartbeatTick { session } => {
                if session == self.session {
                    self.on_heartbeat_tick().await;
                }
            }
            Internal::NetReconnectDue { session, attempt } => {
                if session == self.session {
                    self.on_net_reconnect(attempt).await;
                }
            }
        }
    }

    // ---- join / leave ----

    async fn do_join(
        &mut self,
        room_id: String,
        display_name: Option<String>,
    ) -> Result<(), RoomError> {
        if self.room.is_some() {
            self.do_leave().await;
            sleep(self.config.rejoin_delay).await;
        }

        self.session += 1;
        let session = self.session;
        self.set_signaling(SignalingState::Connecting);

        let credentials = match self.ctx.credentials().await {
            Ok(c) => c.clone(),
            Err(e) => {
                self.set_signaling(SignalingState::Failed);
                self.emit(RoomEvent::Error {
                    kind: ErrorKind::CredentialUnavailable,
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        if room_id.len() < MIN_STRONG_ROOM_ID {
            self.emit(RoomEvent::Warning {
                message: format!("room id '{room_id}' is shorter than 8 characters"),
            });
        }

        let topic = format!("p2p-conf/{room_id}");
        let endpoints: Vec<BrokerEndpoint> = match &self.config.broker_urls {
            Some(urls) => urls
                .iter()
                .map(|url| BrokerEndpoint::anonymous(url.clone()))
                .collect(),
            None => credentials.brokers.clone(),
        };

        // Fresh same-device channel for this join.
        let bus_tx = self.ctx.local_bus().channel(&room_id);
        let bus_task = spawn_bus_listener(bus_tx.clone(), self.internal_tx.clone(), session);

        let (pool, pool_forwarder, _opened) =
            self.open_pool(&endpoints, &topic, session).await;

        self.room = Some(ActiveRoom {
            room_id: room_id.clone(),
            topic,
            display_name,
            credentials,
            endpoints,
            pool,
            pool_forwarder,
            bus_tx,
            bus_task,
            peers: HashMap::new(),
            pending_candidates: HashMap::new(),
            moderation: ModerationState::new(),
            remote_mic: RemoteMicState::new(),
            first_announce_timer: None,
            announce_loop: None,
            heartbeat_loop: None,
            announce_started_at: Instant::now(),
            last_announce: None,
        });

        // First announce runs shortly after join so subscriptions settle.
        let first = schedule_internal(
            &self.internal_tx,
            self.config.announce_initial_delay,
            Internal::FirstAnnounceDue { session },
        );
        if let Some(room) = self.room.as_mut() {
            room.first_announce_timer = Some(first);
        }
        self.start_announce_loop();
        self.start_heartbeat_loop();

        self.set_signaling(SignalingState::Connected);
        info!(room_id = %room_id, session, "Joined room");
        Ok(())
    }

    /// Connect and subscribe the broker pool. Faults degrade to
    /// local-only mode rather than failing the join.
    async fn open_pool(
        &mut self,
        endpoints: &[BrokerEndpoint],
        topic: &str,
        session: u64,
    ) -> (Option<BrokerPool>, Option<JoinHandle<()>>, usize) {
        if endpoints.is_empty() {
            return (None, None, 0);
        }

        let (pool_event_tx, pool_event_rx) = mpsc::channel(256);
        let pool = BrokerPool::new(
            endpoints.to_vec(),
            self.ctx.self_id(),
            &self.config,
            pool_event_tx,
        );
        let forwarder = spawn_pool_forwarder(pool_event_rx, self.internal_tx.clone(), session);

        let opened = pool.connect_all().await.len();
        if opened == 0 {
            self.emit(RoomEvent::Error {
                kind: ErrorKind::MqttConnection,
                message: "no broker accepted the connection; continuing local-only".into(),
            });
        }

        let subscribed = pool.subscribe_all(topic).await;
        if subscribed == 0 {
            if opened > 0 {
                self.emit(RoomEvent::Error {
                    kind: ErrorKind::MqttSubscribeFailed,
                    message: "no broker acknowledged the room subscription".into(),
                });
            }
            pool.shutdown().await;
            forwarder.abort();
            return (None, None, opened);
        }

        (Some(pool), Some(forwarder), opened)
    }

    async fn do_leave(&mut self) {
        let Some(mut room) = self.room.take() else {
            return;
        };
        info!(room_id = %room.room_id, "Leaving room");

        for timer in [
            room.first_announce_timer.take(),
            room.announce_loop.take(),
            room.heartbeat_loop.take(),
            room.pool_forwarder.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
        room.bus_task.abort();
        if let Some(timer) = self.net.reconnect_timer.take() {
            timer.abort();
        }

        // Best-effort leave; nobody waits for it.
        let leave = SignalMessage::new(SignalKind::Leave, self.ctx.self_id().clone())
            .with_session(self.session);
        if let Ok(bytes) = leave.encode() {
            if let Some(pool) = &room.pool {
                pool.publish(&bytes).await;
            }
            let _ = room.bus_tx.send(Bytes::from(bytes));
        }

        let events = self.events.clone();
        for (peer_id, mut record) in room.peers.drain() {
            record.close().await;
            self.stats.forget(&peer_id);
            let _ = events.send(RoomEvent::PeerLeft { peer_id });
        }
        room.pending_candidates.clear();

        if let Some(pool) = room.pool.take() {
            pool.shutdown().await;
        }
        self.ctx.local_bus().prune();

        self.route = AudioRoute::Broadcast;
        self.net.was_in_room = false;
        self.set_signaling(SignalingState::Idle);
    }

    // ---- announce & heartbeat ----

    fn start_announce_loop(&mut self) {
        let session = self.session;
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if let Some(old) = room.announce_loop.take() {
            old.abort();
        }
        let tx = self.internal_tx.clone();
        let every = self.config.announce_interval;
        room.announce_loop = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                if tx.send(Internal::AnnounceTick { session }).is_err() {
                    break;
                }
            }
        }));
    }

    fn start_heartbeat_loop(&mut self) {
        let session = self.session;
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if let Some(old) = room.heartbeat_loop.take() {
            old.abort();
        }
        let tx = self.internal_tx.clone();
        let every = self.config.heartbeat_interval;
        room.heartbeat_loop = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                if tx.send(Internal::HeartbeatTick { session }).is_err() {
                    break;
                }
            }
        }));
    }

    async fn on_announce_tick(&mut self) {
        let (healthy, settled) = {
            let Some(room) = self.room.as_ref() else {
                return;
            };
            let healthy = room.peers.values().filter(|p| p.is_live()).count();
            let settled = room.announce_started_at.elapsed() >= self.config.announce_settle;
            (healthy, settled)
        };

        if healthy > 0 {
            if settled {
                debug!("Announce loop settled, stopping");
                if let Some(room) = self.room.as_mut() {
                    if let Some(task) = room.announce_loop.take() {
                        task.abort();
                    }
                }
            }
            return;
        }
        self.send_announce(None).await;
    }

    async fn send_announce(&mut self, target: Option<PeerId>) {
        let session = self.session;
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if target.is_none() {
            if let Some(last) = room.last_announce {
                if last.elapsed() < self.config.announce_debounce {
                    return;
                }
            }
            room.last_announce = Some(Instant::now());
        }

        let mut msg = SignalMessage::new(SignalKind::Announce, self.ctx.self_id().clone())
            .with_session(session)
            .with_identity(room.display_name.clone(), Platform::current());
        if let Some(target) = target {
            msg = msg.to_peer(target);
        }
        self.broadcast_signal(&msg).await;
    }

    async fn on_heartbeat_tick(&mut self) {
        let Some(room) = self.room.as_ref() else {
            return;
        };

        let now = Instant::now();
        let mut to_reap = Vec::new();
        let mut to_ping = Vec::new();
        for (peer_id, record) in &room.peers {
            if now.duration_since(record.last_seen) > self.config.heartbeat_timeout {
                to_reap.push(peer_id.clone());
            } else if now.duration_since(record.last_ping) > self.config.ping_idle {
                to_ping.push(peer_id.clone());
            }
        }

        for peer_id in to_reap {
            warn!(peer_id = %peer_id, "Peer silent past heartbeat timeout, cleaning up");
            self.cleanup_peer(&peer_id, true).await;
        }
        for peer_id in to_ping {
            let msg = SignalMessage::new(SignalKind::Ping, self.ctx.self_id().clone())
                .with_session(self.session)
                .to_peer(peer_id.clone());
            self.broadcast_signal(&msg).await;
            if let Some(record) = self
                .room
                .as_mut()
                .and_then(|room| room.peers.get_mut(&peer_id))
            {
                record.last_ping = Instant::now();
            }
        }

        self.remote_mic_heartbeat().await;
    }

    // ---- outbound signaling ----

    /// Fan a signal out over every connected broker and the local bus.
    async fn broadcast_signal(&mut self, msg: &SignalMessage) {
        let Some(room) = self.room.as_ref() else {
            return;
        };
        let Ok(bytes) = msg.encode() else {
            return;
        };
        let mut delivered = 0;
        if let Some(pool) = &room.pool {
            delivered += pool.publish(&bytes).await;
        }
        if room.bus_tx.send(Bytes::from(bytes)).is_ok() {
            delivered += 1;
        }
        if delivered == 0 {
            debug!(kind = msg.kind.name(), "Signal had no live transport");
        }
    }

    async fn send_signal_to(&mut self, peer_id: &PeerId, kind: SignalKind) {
        let msg = SignalMessage::new(kind, self.ctx.self_id().clone())
            .with_session(self.session)
            .to_peer(peer_id.clone());
        self.broadcast_signal(&msg).await;
    }

    async fn broadcast_leave(&mut self) {
        let msg = SignalMessage::new(SignalKind::Leave, self.ctx.self_id().clone())
            .with_session(self.session);
        self.broadcast_signal(&msg).await;
    }

    async fn broadcast_mute_status(&mut self) -> Result<(), RoomError> {
        if self.room.is_none() {
            return Err(RoomError::NotInRoom);
        }
        let msg = SignalMessage::new(
            SignalKind::MuteStatus(self.local_mute),
            self.ctx.self_id().clone(),
        )
        .with_session(self.session);
        self.broadcast_signal(&msg).await;
        Ok(())
    }

    // ---- inbound signaling ----

    async fn handle_payload(&mut self, payload: &[u8]) {
        let msg = match SignalMessage::parse(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "Dropping malformed signal payload");
                return;
            }
        };
        match screen(&msg, self.ctx.self_id()) {
            Screen::Deliver => {}
            Screen::FromSelf | Screen::Misaddressed => return,
        }

        if records_activity(&msg.kind) {
            if let Some(record) = self
                .room
                .as_mut()
                .and_then(|room| room.peers.get_mut(&msg.from))
            {
                record.touch();
            }
        }

        match msg.kind.clone() {
            SignalKind::Announce => self.handle_announce(msg).await,
            SignalKind::Offer(payload) => self.handle_offer(msg, payload).await,
            SignalKind::Answer(payload) => self.handle_answer(msg, payload).await,
            SignalKind::IceCandidate(candidate) => {
                self.handle_candidate(&msg.from, candidate).await;
            }
            SignalKind::Leave => {
                self.cleanup_peer(&msg.from, true).await;
            }
            SignalKind::Ping => {
                self.send_signal_to(&msg.from, SignalKind::Pong).await;
            }
            SignalKind::Pong => {}
            SignalKind::MuteStatus(status) => {
                if let Some(record) = self
                    .room
                    .as_mut()
                    .and_then(|room| room.peers.get_mut(&msg.from))
                {
                    record.remote_mute = status;
                    self.emit(RoomEvent::MuteStatus {
                        peer_id: msg.from,
                        status,
                    });
                }
            }
            SignalKind::RoomLock(RoomLockPayload { locked }) => {
                self.apply_room_lock(locked, Some(msg.from));
            }
            SignalKind::RoomLocked(RoomLockedPayload { locked_by }) => {
                self.apply_room_lock(true, Some(locked_by));
            }
        }
    }

    async fn handle_announce(&mut self, msg: SignalMessage) {
        let from = msg.from.clone();
        let Some(room) = self.room.as_mut() else {
            return;
        };

        if let Some(record) = room.peers.get(&from) {
            if record.peer_session == msg.session_id {
                // Already negotiating with this incarnation.
                return;
            }
            debug!(peer_id = %from, "Peer rejoined with a new session, renegotiating");
            self.cleanup_peer(&from, true).await;
        }

        let locked_by = self
            .room
            .as_ref()
            .and_then(|room| {
                room.moderation
                    .room_locked
                    .then(|| room.moderation.locked_by.clone())
            })
            .flatten();
        if let Some(room) = self.room.as_ref() {
            if room.moderation.room_locked {
                let locked_by = locked_by.unwrap_or_else(|| self.ctx.self_id().clone());
                self.send_signal_to(&from, SignalKind::RoomLocked(RoomLockedPayload { locked_by }))
                    .await;
                return;
            }
        }

        if self.ctx.self_id().as_str() > from.as_str() {
            // Greater ID initiates.
            if let Err(e) = self.initiate_offer(&msg).await {
                warn!(peer_id = %from, error = %e, "Offer initiation failed");
                self.cleanup_peer(&from, false).await;
            }
        } else {
            // Lesser ID re-announces at the peer and waits for its offer.
            self.send_announce(Some(from)).await;
        }
    }

    async fn initiate_offer(&mut self, announce: &SignalMessage) -> Result<(), RoomError> {
        let session = self.session;
        let peer_id = announce.from.clone();
        let peer_tx = self.peer_tx.clone();
        let api = self.api.clone();
        let local_tracks = self.local_tracks.clone();
        let route_allows = self.route.sends_audio_to(&peer_id);

        let Some(room) = self.room.as_mut() else {
            return Err(RoomError::NotInRoom);
        };
        let rtc_config = room.credentials.rtc_configuration();

        let mut record =
            PeerRecord::new(&api, rtc_config, peer_id.clone(), session, peer_tx.clone()).await?;
        record.peer_session = announce.session_id;
        record.user_name = announce.user_name.clone();
        record.platform = announce.platform;

        record.create_channels(session, &peer_tx).await?;
        record
            .apply_local_tracks(&local_tracks, route_allows)
            .await?;
        let offer = record.create_offer(false).await?;

        room.peers.insert(peer_id.clone(), record);
        self.send_signal_to(&peer_id, SignalKind::Offer(offer)).await;
        Ok(())
    }

    async fn handle_offer(&mut self, msg: SignalMessage, payload: SdpPayload) {
        let peer_id = msg.from.clone();
        let result = self.apply_offer(&msg, payload).await;
        if let Err(e) = result {
            warn!(peer_id = %peer_id, error = %e, "Offer handling failed");
        }
    }

    async fn apply_offer(
        &mut self,
        msg: &SignalMessage,
        payload: SdpPayload,
    ) -> Result<(), RoomError> {
        let session = self.session;
        let peer_id = msg.from.clone();
        let peer_tx = self.peer_tx.clone();
        let api = self.api.clone();
        let local_tracks = self.local_tracks.clone();
        let route_allows = self.route.sends_audio_to(&peer_id);

        let Some(room) = self.room.as_mut() else {
            return Err(RoomError::NotInRoom);
        };

        if !room.peers.contains_key(&peer_id) {
            let rtc_config = room.credentials.rtc_configuration();
            let mut record =
                PeerRecord::new(&api, rtc_config, peer_id.clone(), session, peer_tx).await?;
            record.peer_session = msg.session_id;
            record.user_name = msg.user_name.clone();
            record.platform = msg.platform;
            room.peers.insert(peer_id.clone(), record);
        }

        let record = room
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| RoomError::PeerNotFound(peer_id.clone()))?;
        record.set_remote(&payload).await?;
        record
            .apply_local_tracks(&local_tracks, route_allows)
            .await?;

        // Candidates that raced ahead of the offer apply in arrival order.
        let queued = room.pending_candidates.remove(&peer_id).unwrap_or_default();
        for candidate in queued {
            if let Err(e) = record.add_candidate(candidate).await {
                warn!(peer_id = %peer_id, error = %e, "Queued candidate rejected");
            }
        }

        let answer = record.create_answer().await?;
        self.send_signal_to(&peer_id, SignalKind::Answer(answer)).await;
        Ok(())
    }

    async fn handle_answer(&mut self, msg: SignalMessage, payload: SdpPayload) {
        let peer_id = msg.from.clone();
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let Some(record) = room.peers.get_mut(&peer_id) else {
            debug!(peer_id = %peer_id, "Answer for unknown peer dropped");
            return;
        };
        if let Err(e) = record.set_remote(&payload).await {
            warn!(peer_id = %peer_id, error = %e, "Answer rejected");
            return;
        }
        let queued = room.pending_candidates.remove(&peer_id).unwrap_or_default();
        if let Some(record) = room.peers.get_mut(&peer_id) {
            for candidate in queued {
                if let Err(e) = record.add_candidate(candidate).await {
                    warn!(peer_id = %peer_id, error = %e, "Queued candidate rejected");
                }
            }
        }
    }

    async fn handle_candidate(&mut self, peer_id: &PeerId, candidate: CandidatePayload) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let init: RTCIceCandidateInit = candidate.into();
        let ready = match room.peers.get(peer_id) {
            Some(record) => record.has_remote_description().await,
            None => false,
        };
        if ready {
            if let Some(record) = room.peers.get(peer_id) {
                if let Err(e) = record.add_candidate(init).await {
                    warn!(peer_id = %peer_id, error = %e, "Candidate rejected");
                }
            }
        } else {
            room.pending_candidates
                .entry(peer_id.clone())
                .or_default()
                .push(init);
        }
    }

    // ---- peer transport events ----

    async fn handle_peer_event(&mut self, ev: PeerEngineEvent) {
        if ev.session != self.session {
            return;
        }
        let peer_id = ev.peer_id;
        match ev.event {
            PeerEvent::LocalCandidate(init) => {
                let payload = CandidatePayload::from(init);
                self.send_signal_to(&peer_id, SignalKind::IceCandidate(payload))
                    .await;
            }
            PeerEvent::IceState(state) => self.on_ice_state(&peer_id, state).await,
            PeerEvent::ConnectionState(state) => self.on_connection_state(&peer_id, state).await,
            PeerEvent::RemoteTrack(track) => {
                if let Some(record) = self.peer_mut(&peer_id) {
                    record.remote_tracks.push(track.clone());
                    self.emit(RoomEvent::RemoteTrack { peer_id, track });
                }
            }
            PeerEvent::RemoteChannel(channel) => {
                let session = self.session;
                let peer_tx = self.peer_tx.clone();
                if let Some(record) = self.peer_mut(&peer_id) {
                    record.adopt_remote_channel(channel, session, &peer_tx);
                }
            }
            PeerEvent::ChatData(data) => self.on_chat_data(&peer_id, &data),
            PeerEvent::ControlData(data) => self.on_control_data(&peer_id, &data).await,
            PeerEvent::GraceElapsed => {
                let should_restart = self.peer_mut(&peer_id).is_some_and(|record| {
                    record.clear_grace_timer();
                    !record.ice_restart_in_progress
                        && record.ice_state() == RTCIceConnectionState::Disconnected
                });
                if should_restart {
                    self.attempt_ice_restart(&peer_id).await;
                }
            }
            PeerEvent::RestartWindowElapsed => self.on_restart_window_elapsed(&peer_id).await,
            PeerEvent::RestartRetryDue => self.attempt_ice_restart(&peer_id).await,
            PeerEvent::MuteStatusDue => {
                let status = self.local_mute;
                self.send_signal_to(&peer_id, SignalKind::MuteStatus(status))
                    .await;
            }
        }
    }

    async fn on_ice_state(&mut self, peer_id: &PeerId, state: RTCIceConnectionState) {
        debug!(peer_id = %peer_id, state = ?state, "ICE state");
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                self.on_peer_connected(peer_id).await;
            }
            RTCIceConnectionState::Disconnected => {
                let session = self.session;
                let grace = self.config.ice_grace_period;
                let peer_tx = self.peer_tx.clone();
                if let Some(record) = self.peer_mut(peer_id) {
                    // A restart in flight owns recovery; the grace timer
                    // only guards the non-restart path.
                    if !record.ice_restart_in_progress {
                        record.arm_grace_timer(grace, session, &peer_tx);
                    }
                }
            }
            RTCIceConnectionState::Failed => {
                self.attempt_ice_restart(peer_id).await;
            }
            _ => {}
        }
    }

    async fn on_peer_connected(&mut self, peer_id: &PeerId) {
        let session = self.session;
        let mute_delay = self.config.mute_status_delay;
        let peer_tx = self.peer_tx.clone();
        let route_allows = self.route.sends_audio_to(peer_id);
        let audio = self.local_audio_track();

        let Some(record) = self.peer_mut(peer_id) else {
            return;
        };
        record.clear_grace_timer();
        record.clear_restart_window();
        record.ice_restart_in_progress = false;
        record.ice_restart_attempts = 0;

        if record.connected {
            return;
        }
        record.connected = true;
        record.touch();
        record.arm_mute_status_timer(mute_delay, session, &peer_tx);

        let snapshot = PeerSnapshot {
            id: record.id.clone(),
            user_name: record.user_name.clone(),
            platform: record.platform,
            connected: true,
            mute: record.remote_mute,
        };

        // Enforce the routing policy on the freshly connected sender.
        let audio_for_peer = if route_allows { audio } else { None };
        if let Err(e) = record.set_audio_track(audio_for_peer).await {
            warn!(peer_id = %peer_id, error = %e, "Audio routing apply failed");
        }

        info!(peer_id = %peer_id, "Peer connected");
        self.emit(RoomEvent::PeerJoined(snapshot));
    }

    async fn on_connection_state(&mut self, peer_id: &PeerId, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Failed => {
                let restarting = self
                    .peer_ref(peer_id)
                    .is_some_and(|r| r.ice_restart_in_progress);
                if !restarting {
                    self.cleanup_peer(peer_id, true).await;
                }
            }
            RTCPeerConnectionState::Closed => {
                let was_connected = self.peer_ref(peer_id).is_some_and(|r| r.connected);
                self.cleanup_peer(peer_id, was_connected).await;
            }
            _ => {}
        }
    }

    // ---- ICE restart ----

    async fn attempt_ice_restart(&mut self, peer_id: &PeerId) {
        let session = self.session;
        let max_attempts = self.config.max_ice_restart_attempts;
        let window = self.config.ice_restart_timeout;
        let peer_tx = self.peer_tx.clone();

        let exhausted = {
            let Some(record) = self.peer_mut(peer_id) else {
                return;
            };
            if record.ice_restart_in_progress {
                return;
            }
            record.ice_restart_attempts += 1;
            record.ice_restart_attempts > max_attempts
        };
        if exhausted {
            warn!(peer_id = %peer_id, "ICE restart attempts exhausted");
            self.emit(RoomEvent::Error {
                kind: ErrorKind::IceRestartExhausted,
                message: format!("peer {peer_id} unreachable after {max_attempts} restarts"),
            });
            self.cleanup_peer(peer_id, true).await;
            return;
        }

        let offer = {
            let Some(record) = self.peer_mut(peer_id) else {
                return;
            };
            record.ice_restart_in_progress = true;
            record.arm_restart_window(window, session, &peer_tx);
            info!(
                peer_id = %peer_id,
                attempt = record.ice_restart_attempts,
                "Attempting ICE restart"
            );
            record.create_offer(true).await
        };

        match offer {
            Ok(payload) => {
                self.send_signal_to(peer_id, SignalKind::Offer(payload)).await;
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "ICE restart offer failed");
                self.on_restart_window_elapsed(peer_id).await;
            }
        }
    }

    async fn on_restart_window_elapsed(&mut self, peer_id: &PeerId) {
        let session = self.session;
        let base = self.config.ice_restart_delay;
        let max_attempts = self.config.max_ice_restart_attempts;
        let peer_tx = self.peer_tx.clone();

        let retry = {
            let Some(record) = self.peer_mut(peer_id) else {
                return;
            };
            if !record.ice_restart_in_progress {
                return;
            }
            record.ice_restart_in_progress = false;
            record.clear_restart_window();
            if record.ice_restart_attempts >= max_attempts {
                None
            } else {
                // Exponential backoff between attempts.
                let exp = base.saturating_mul(1 << (record.ice_restart_attempts - 1).min(16));
                record.arm_restart_retry(exp, session, &peer_tx);
                Some(exp)
            }
        };

        match retry {
            Some(delay) => {
                debug!(peer_id = %peer_id, delay_ms = delay.as_millis() as u64, "ICE restart retry scheduled");
            }
            None => {
                self.emit(RoomEvent::Error {
                    kind: ErrorKind::IceRestartExhausted,
                    message: format!("peer {peer_id} unreachable after {max_attempts} restarts"),
                });
                self.cleanup_peer(peer_id, true).await;
            }
        }
    }

    // ---- data channels ----

    fn on_chat_data(&mut self, peer_id: &PeerId, data: &[u8]) {
        if !self.peer_exists(peer_id) {
            return;
        }
        match ChatChannelMessage::parse(data, self.config.chat_max_len) {
            Ok(ChatChannelMessage::Chat {
                id,
                sender_id,
                sender_name,
                content,
                timestamp,
            }) => {
                if let Some(record) = self.peer_mut(peer_id) {
                    record.touch();
                }
                self.emit(RoomEvent::Chat(ChatEvent {
                    id,
                    sender_id,
                    sender_name,
                    content,
                    timestamp,
                }));
            }
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Malformed chat payload dropped");
            }
        }
    }

    async fn on_control_data(&mut self, peer_id: &PeerId, data: &[u8]) {
        if !self.peer_exists(peer_id) {
            return;
        }
        let message = match ControlMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Malformed control payload dropped");
                return;
            }
        };
        if let Some(record) = self.peer_mut(peer_id) {
            record.touch();
        }
        self.handle_control(peer_id.clone(), message).await;
    }

    async fn handle_control(&mut self, from: PeerId, message: ControlMessage) {
        match message {
            ControlMessage::RmRequest { request_id, .. } => {
                self.on_rm_request(from, request_id).await;
            }
            ControlMessage::RmResponse {
                request_id,
                accepted,
                reason,
            } => {
                self.on_rm_response(&from, &request_id, accepted, reason).await;
            }
            ControlMessage::RmStart { request_id } => {
                let Some(room) = self.room.as_mut() else {
                    return;
                };
                if let Some(lease) = room.remote_mic.activate(&request_id) {
                    self.emit(RoomEvent::RemoteMic(RemoteMicEvent::Phase {
                        request_id,
                        phase: lease.phase,
                        source: lease.source,
                        target: lease.target,
                    }));
                }
            }
            ControlMessage::RmStop { request_id, reason } => {
                let matches = self
                    .room
                    .as_ref()
                    .and_then(|room| room.remote_mic.lease())
                    .is_some_and(|lease| lease.request_id == request_id);
                if matches {
                    self.end_remote_mic(reason, false).await;
                }
            }
            ControlMessage::RmHeartbeat { request_id, .. } => {
                if let Some(room) = self.room.as_mut() {
                    room.remote_mic.heartbeat(&request_id);
                }
            }
            ControlMessage::MuteRequest { id, reason } => {
                self.on_mute_request(from, id, reason).await;
            }
            ControlMessage::MuteResponse { id, accepted } => {
                self.emit(RoomEvent::MuteAllResponse {
                    request_id: id.clone(),
                    peer_id: from.clone(),
                    accepted,
                });
                let complete = self
                    .room
                    .as_mut()
                    .and_then(|room| room.moderation.record_mute_response(&id, &from, accepted));
                if let Some(done) = complete {
                    self.emit(RoomEvent::MuteAllComplete {
                        request_id: done.id.clone(),
                        accepted: done.accepted_count(),
                        total: done.responses.len(),
                    });
                }
            }
            ControlMessage::RaiseHand { raised } => {
                if let Some(room) = self.room.as_mut() {
                    room.moderation.set_hand(&from, raised);
                }
                self.emit(RoomEvent::HandRaised {
                    peer_id: from,
                    raised,
                });
            }
            ControlMessage::RoomLock { locked } => {
                self.apply_room_lock(locked, Some(from));
            }
            ControlMessage::RoomLocked { locked_by } => {
                self.apply_room_lock(true, Some(locked_by));
            }
        }
    }

    fn apply_room_lock(&mut self, locked: bool, by: Option<PeerId>) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        room.moderation.set_locked(locked, by);
        let locked_by = room.moderation.locked_by.clone();
        self.emit(RoomEvent::RoomLock { locked, locked_by });
    }

    async fn on_mute_request(&mut self, from: PeerId, id: String, reason: Option<String>) {
        self.emit(RoomEvent::MuteAllRequested {
            from: from.clone(),
            request_id: id.clone(),
            reason,
        });

        // Comply: mute the local mic and tell the room.
        self.local_mute.mic_muted = true;
        let response = ControlMessage::MuteResponse { id, accepted: true };
        if let Some(record) = self.peer_ref(&from) {
            record.send_control(&response).await;
        }
        let _ = self.broadcast_mute_status().await;
    }

    // ---- remote mic ----

    async fn on_rm_request(&mut self, from: PeerId, request_id: String) {
        let self_id = self.ctx.self_id().clone();
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if !room.remote_mic.begin_incoming(&from, &self_id, &request_id) {
            let busy = ControlMessage::RmResponse {
                request_id,
                accepted: false,
                reason: RmResponseReason::Busy,
            };
            if let Some(record) = self.peer_ref(&from) {
                record.send_control(&busy).await;
            }
            return;
        }
        self.emit(RoomEvent::RemoteMic(RemoteMicEvent::Request {
            from,
            request_id,
        }));
    }

    async fn on_rm_response(
        &mut self,
        from: &PeerId,
        request_id: &str,
        accepted: bool,
        reason: RmResponseReason,
    ) {
        let valid = self
            .room
            .as_ref()
            .and_then(|room| room.remote_mic.lease())
            .is_some_and(|lease| {
                lease.request_id == request_id && lease.target == *from
            });
        if !valid {
            debug!(peer_id = %from, request_id, "Stray remote-mic response");
            return;
        }

        if accepted {
            let lease = self
                .room
                .as_mut()
                .and_then(|room| room.remote_mic.activate(request_id));
            let Some(lease) = lease else {
                return;
            };
            let start = ControlMessage::RmStart {
                request_id: request_id.to_string(),
            };
            if let Some(record) = self.peer_ref(from) {
                record.send_control(&start).await;
            }
            // We are the source: route audio exclusively at the target.
            if let Err(e) = self
                .apply_route(AudioRoute::Exclusive {
                    target: from.clone(),
                })
                .await
            {
                warn!(error = %e, "Exclusive routing failed on lease start");
            }
            self.emit(RoomEvent::RemoteMic(RemoteMicEvent::Phase {
                request_id: request_id.to_string(),
                phase: lease.phase,
                source: lease.source,
                target: lease.target,
            }));
        } else {
            let stop_reason = decline_to_stop_reason(reason);
            if let Some(room) = self.room.as_mut() {
                room.remote_mic.stop(stop_reason);
            }
            self.emit(RoomEvent::RemoteMic(RemoteMicEvent::Stopped {
                request_id: request_id.to_string(),
                reason: stop_reason,
            }));
            if !matches!(
                reason,
                RmResponseReason::Rejected | RmResponseReason::UserCancelled
            ) {
                self.emit(RoomEvent::Error {
                    kind: ErrorKind::RemoteMic,
                    message: format!("remote mic declined: {stop_reason:?}"),
                });
            }
        }
    }

    /// End the current lease: notify the counterpart (optionally), revert
    /// routing if we were the source and surface the stop.
    async fn end_remote_mic(&mut self, reason: RmStopReason, notify: bool) {
        let self_id = self.ctx.self_id().clone();
        let ended = self
            .room
            .as_mut()
            .and_then(|room| room.remote_mic.stop(reason));
        let Some(ended) = ended else {
            return;
        };

        let counterpart = if ended.source == self_id {
            ended.target.clone()
        } else {
            ended.source.clone()
        };
        if notify {
            let stop = ControlMessage::RmStop {
                request_id: ended.request_id.clone(),
                reason,
            };
            if let Some(record) = self.peer_ref(&counterpart) {
                record.send_control(&stop).await;
            }
        }

        if ended.source == self_id {
            if let Err(e) = self.apply_route(AudioRoute::Broadcast).await {
                warn!(error = %e, "Routing revert failed after lease end");
            }
        }
        self.emit(RoomEvent::RemoteMic(RemoteMicEvent::Stopped {
            request_id: ended.request_id,
            reason,
        }));
    }

    async fn remote_mic_heartbeat(&mut self) {
        let self_id = self.ctx.self_id().clone();
        let timeout = self.config.rm_heartbeat_timeout;

        let active = self
            .room
            .as_ref()
            .and_then(|room| room.remote_mic.lease())
            .filter(|lease| lease.started_at.is_some())
            .cloned();
        let Some(lease) = active else {
            return;
        };

        if self
            .room
            .as_ref()
            .is_some_and(|room| room.remote_mic.heartbeat_expired(timeout))
        {
            warn!(request_id = %lease.request_id, "Remote mic heartbeat timed out");
            self.end_remote_mic(RmStopReason::HeartbeatTimeout, true).await;
            return;
        }

        let counterpart = if lease.source == self_id {
            lease.target
        } else {
            lease.source
        };
        let beat = ControlMessage::RmHeartbeat {
            request_id: lease.request_id,
            ts: chrono::Utc::now().timestamp_millis(),
        };
        if let Some(record) = self.peer_ref(&counterpart) {
            record.send_control(&beat).await;
        }
    }

    // ---- media & routing ----

    fn local_audio_track(&self) -> Option<LocalTrack> {
        self.local_tracks
            .iter()
            .find(|t| TrackKind::from(t.kind()) == TrackKind::Audio)
            .cloned()
    }

    async fn do_set_local_stream(&mut self, tracks: Vec<LocalTrack>) -> Result<(), RoomError> {
        self.local_tracks = tracks;
        let local_tracks = self.local_tracks.clone();
        let route = self.route.clone();

        let Some(room) = self.room.as_mut() else {
            // No mesh yet; tracks apply when peers appear.
            return Ok(());
        };

        let mut renegotiate = Vec::new();
        for (peer_id, record) in &mut room.peers {
            let allows = route.sends_audio_to(peer_id);
            match record.apply_local_tracks(&local_tracks, allows).await {
                Ok(true) if record.connected => renegotiate.push(peer_id.clone()),
                Ok(_) => {}
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Track install failed"),
            }
        }
        for peer_id in renegotiate {
            self.renegotiate(&peer_id).await;
        }
        Ok(())
    }

    async fn do_replace_track(&mut self, track: LocalTrack) -> Result<(), RoomError> {
        let kind = TrackKind::from(track.kind());
        // Keep the local set coherent for future peers.
        if let Some(slot) = self
            .local_tracks
            .iter_mut()
            .find(|t| TrackKind::from(t.kind()) == kind)
        {
            *slot = track.clone();
        } else {
            self.local_tracks.push(track.clone());
        }

        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        let mut renegotiate = Vec::new();
        for (peer_id, record) in &mut room.peers {
            match record.replace_track(track.clone()).await {
                Ok(true) if record.connected => renegotiate.push(peer_id.clone()),
                Ok(_) => {}
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Track replace failed"),
            }
        }
        for peer_id in renegotiate {
            self.renegotiate(&peer_id).await;
        }
        Ok(())
    }

    /// New senders need new m-lines; re-offer to the affected peer.
    async fn renegotiate(&mut self, peer_id: &PeerId) {
        let offer = {
            let Some(record) = self.peer_mut(peer_id) else {
                return;
            };
            record.create_offer(false).await
        };
        match offer {
            Ok(payload) => self.send_signal_to(peer_id, SignalKind::Offer(payload)).await,
            Err(e) => warn!(peer_id = %peer_id, error = %e, "Renegotiation offer failed"),
        }
    }

    async fn do_set_audio_route(&mut self, route: AudioRoute) -> Result<(), RoomError> {
        if let Some(target) = route.exclusive_target() {
            let live = self
                .peer_ref(target)
                .is_some_and(|record| record.connected && record.is_live());
            if !live {
                return Err(RoomError::InvalidRouteTarget(target.clone()));
            }
        }
        self.apply_route(route).await
    }

    async fn apply_route(&mut self, route: AudioRoute) -> Result<(), RoomError> {
        self.route = route.clone();
        let audio = self.local_audio_track();
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        for (peer_id, record) in &room.peers {
            let track = if route.sends_audio_to(peer_id) {
                audio.clone()
            } else {
                None
            };
            if let Err(e) = record.set_audio_track(track).await {
                warn!(peer_id = %peer_id, error = %e, "Audio routing apply failed");
            }
        }
        Ok(())
    }

    // ---- chat & moderation commands ----

    async fn do_send_chat(&mut self, content: &str) -> Result<usize, RoomError> {
        let self_id = self.ctx.self_id().clone();
        let Some(room) = self.room.as_ref() else {
            return Err(RoomError::NotInRoom);
        };
        let sender_name = room
            .display_name
            .clone()
            .unwrap_or_else(|| self_id.clone());
        let message =
            ChatChannelMessage::new(&self_id, &sender_name, content, self.config.chat_max_len);
        let json = serde_json::to_string(&message)?;

        let mut delivered = 0;
        for record in room.peers.values() {
            if record.send_chat(&json).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn do_set_room_locked(&mut self, locked: bool) -> Result<(), RoomError> {
        let self_id = self.ctx.self_id().clone();
        {
            let Some(room) = self.room.as_mut() else {
                return Err(RoomError::NotInRoom);
            };
            room.moderation.set_locked(locked, locked.then(|| self_id.clone()));
        }

        let control = ControlMessage::RoomLock { locked };
        self.multicast_control(&control).await;
        // Signaling fallback so late joiners hear about the lock.
        let msg = SignalMessage::new(
            SignalKind::RoomLock(RoomLockPayload { locked }),
            self_id,
        )
        .with_session(self.session);
        self.broadcast_signal(&msg).await;

        let locked_by = self
            .room
            .as_ref()
            .and_then(|room| room.moderation.locked_by.clone());
        self.emit(RoomEvent::RoomLock { locked, locked_by });
        Ok(())
    }

    async fn do_set_hand_raised(&mut self, raised: bool) -> Result<(), RoomError> {
        {
            let Some(room) = self.room.as_mut() else {
                return Err(RoomError::NotInRoom);
            };
            room.moderation.local_hand_raised = raised;
        }
        self.multicast_control(&ControlMessage::RaiseHand { raised })
            .await;
        Ok(())
    }

    async fn do_request_mute_all(&mut self, reason: Option<String>) -> Result<String, RoomError> {
        if self.room.is_none() {
            return Err(RoomError::NotInRoom);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let request = ControlMessage::MuteRequest {
            id: id.clone(),
            reason: reason.clone(),
        };
        let reached = self.multicast_control(&request).await;
        if let Some(room) = self.room.as_mut() {
            room.moderation.begin_mute_all(id.clone(), reason, reached);
        }
        Ok(id)
    }

    async fn do_request_remote_mic(&mut self, target: PeerId) -> Result<String, RoomError> {
        let self_id = self.ctx.self_id().clone();
        let live = self
            .peer_ref(&target)
            .is_some_and(|record| record.connected && record.is_live());
        if !live {
            return Err(RoomError::PeerNotFound(target));
        }

        let request_id = {
            let Some(room) = self.room.as_mut() else {
                return Err(RoomError::NotInRoom);
            };
            room.remote_mic
                .begin_outgoing(&self_id, &target)
                .ok_or(RoomError::RemoteMicBusy)?
        };

        let request = ControlMessage::RmRequest {
            request_id: request_id.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
        };
        let sent = match self.peer_ref(&target) {
            Some(record) => record.send_control(&request).await,
            None => false,
        };
        if !sent {
            if let Some(room) = self.room.as_mut() {
                room.remote_mic.reset();
            }
            return Err(RoomError::PeerNotFound(target));
        }
        Ok(request_id)
    }

    async fn do_respond_remote_mic(
        &mut self,
        request_id: &str,
        accepted: bool,
        reason: RmResponseReason,
    ) -> Result<(), RoomError> {
        let lease = self
            .room
            .as_ref()
            .and_then(|room| room.remote_mic.lease())
            .filter(|lease| lease.request_id == request_id)
            .cloned()
            .ok_or_else(|| RoomError::RemoteMicUnknownRequest(request_id.to_string()))?;

        let response = ControlMessage::RmResponse {
            request_id: request_id.to_string(),
            accepted,
            reason,
        };
        if let Some(record) = self.peer_ref(&lease.source) {
            record.send_control(&response).await;
        }

        if !accepted {
            let stop_reason = decline_to_stop_reason(reason);
            if let Some(room) = self.room.as_mut() {
                room.remote_mic.stop(stop_reason);
            }
            self.emit(RoomEvent::RemoteMic(RemoteMicEvent::Stopped {
                request_id: request_id.to_string(),
                reason: stop_reason,
            }));
        }
        Ok(())
    }

    /// Send a control message to every peer; returns how many got it.
    async fn multicast_control(&mut self, message: &ControlMessage) -> usize {
        let Some(room) = self.room.as_ref() else {
            return 0;
        };
        let mut delivered = 0;
        for record in room.peers.values() {
            if record.send_control(message).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn do_connection_stats(&mut self) -> HashMap<PeerId, PeerConnectionStats> {
        let mut out = HashMap::new();
        let Some(room) = self.room.as_ref() else {
            return out;
        };
        let peers: Vec<(PeerId, Arc<webrtc::peer_connection::RTCPeerConnection>)> = room
            .peers
            .iter()
            .map(|(id, record)| (id.clone(), record.pc.clone()))
            .collect();
        for (peer_id, pc) in peers {
            let stats = self.stats.collect(&peer_id, &pc).await;
            out.insert(peer_id, stats);
        }
        out
    }

    // ---- network monitor ----

    fn on_network_changed(&mut self, online: bool) {
        if online == self.net.online {
            return;
        }
        self.net.online = online;

        if !online {
            info!("Network offline");
            self.net.was_in_room = self.room.is_some();
            if let Some(timer) = self.net.reconnect_timer.take() {
                timer.abort();
            }
            return;
        }

        info!("Network online");
        if self.net.was_in_room && self.room.is_some() {
            self.schedule_net_reconnect(1);
        }
    }

    fn schedule_net_reconnect(&mut self, attempt: u32) {
        if let Some(timer) = self.net.reconnect_timer.take() {
            timer.abort();
        }
        let delay = self
            .config
            .net_reconnect_base
            .mul_f64(1.5f64.powi(attempt as i32 - 1));
        self.net.reconnect_timer = Some(schedule_internal(
            &self.internal_tx,
            delay,
            Internal::NetReconnectDue {
                session: self.session,
                attempt,
            },
        ));
    }

    async fn on_net_reconnect(&mut self, attempt: u32) {
        if self.room.is_none() {
            return;
        }
        let session = self.session;
        debug!(attempt, "Network reconnect cycle");

        // Bring the broker side back first.
        let connected = self.reopen_brokers(session).await;

        // Re-announce and restart the announce loop.
        if let Some(room) = self.room.as_mut() {
            room.announce_started_at = Instant::now();
        }
        self.send_announce(None).await;
        self.start_announce_loop();

        // Kick every stalled transport.
        let stalled: Vec<PeerId> = self
            .room
            .as_ref()
            .map(|room| {
                room.peers
                    .iter()
                    .filter(|(_, record)| {
                        matches!(
                            record.ice_state(),
                            RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed
                        )
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        for peer_id in stalled {
            if let Some(record) = self.peer_mut(&peer_id) {
                record.ice_restart_attempts = 0;
                record.ice_restart_in_progress = false;
            }
            self.attempt_ice_restart(&peer_id).await;
        }

        let want_brokers = self
            .room
            .as_ref()
            .is_some_and(|room| !room.endpoints.is_empty());
        if want_brokers && connected == 0 {
            if attempt < self.config.net_reconnect_attempts {
                self.schedule_net_reconnect(attempt + 1);
            } else {
                self.net.was_in_room = false;
                self.emit(RoomEvent::Error {
                    kind: ErrorKind::NetworkReconnectExhausted,
                    message: "network reconnect attempts exhausted".into(),
                });
            }
        }
    }

    /// Reconnect the pool (rebuilding it if it was torn down) and return
    /// the number of live broker sessions.
    async fn reopen_brokers(&mut self, session: u64) -> usize {
        let (endpoints, topic, has_pool) = {
            let Some(room) = self.room.as_ref() else {
                return 0;
            };
            (
                room.endpoints.clone(),
                room.topic.clone(),
                room.pool.is_some(),
            )
        };
        if endpoints.is_empty() {
            return 0;
        }

        if has_pool {
            let Some(room) = self.room.as_ref() else {
                return 0;
            };
            if let Some(pool) = &room.pool {
                return pool.ensure_connected().await;
            }
            return 0;
        }

        let (pool, forwarder, _opened) = self.open_pool(&endpoints, &topic, session).await;
        let connected = match &pool {
            Some(pool) => pool.connected_count().await,
            None => 0,
        };
        if let Some(room) = self.room.as_mut() {
            room.pool = pool;
            room.pool_forwarder = forwarder;
        }
        connected
    }

    // ---- peer cleanup ----

    /// Remove and tear down a peer. The leave event fires at most once
    /// because removal happens before anything awaits.
    async fn cleanup_peer(&mut self, peer_id: &PeerId, fire_leave: bool) {
        let removed = self
            .room
            .as_mut()
            .and_then(|room| room.peers.remove(peer_id));
        let Some(mut record) = removed else {
            return;
        };
        debug!(peer_id = %peer_id, "Cleaning up peer");

        if let Some(room) = self.room.as_mut() {
            room.pending_candidates.remove(peer_id);
            room.moderation.forget_peer(peer_id);
        }
        self.stats.forget(peer_id);

        let lease_involved = self
            .room
            .as_ref()
            .and_then(|room| room.remote_mic.lease())
            .is_some_and(|lease| lease.involves(peer_id));
        if lease_involved {
            // The counterpart is gone; no point notifying it.
            self.end_remote_mic(RmStopReason::PeerDisconnected, false).await;
        }

        record.close().await;
        if fire_leave {
            self.emit(RoomEvent::PeerLeft {
                peer_id: peer_id.clone(),
            });
        }
    }

    // ---- small helpers ----

    fn peer_exists(&self, peer_id: &PeerId) -> bool {
        self.room
            .as_ref()
            .is_some_and(|room| room.peers.contains_key(peer_id))
    }

    fn peer_ref(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.room.as_ref().and_then(|room| room.peers.get(peer_id))
    }

    fn peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerRecord> {
        self.room
            .as_mut()
            .and_then(|room| room.peers.get_mut(peer_id))
    }

    fn set_signaling(&mut self, state: SignalingState) {
        if self.signaling != state {
            self.signaling = state;
            self.emit(RoomEvent::SignalingState(state));
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }
}

/// Map a decline reason onto the stop reason surfaced to the embedder.
fn decline_to_stop_reason(reason: RmResponseReason) -> RmStopReason {
    match reason {
        RmResponseReason::Accepted | RmResponseReason::Rejected => RmStopReason::Stopped,
        RmResponseReason::Busy => RmStopReason::Error,
        RmResponseReason::VirtualDeviceMissing => RmStopReason::VirtualDeviceMissing,
        RmResponseReason::VirtualDeviceInstallFailed => RmStopReason::VirtualDeviceInstallFailed,
        RmResponseReason::VirtualDeviceRestartRequired => {
            RmStopReason::VirtualDeviceRestartRequired
        }
        RmResponseReason::UserCancelled => RmStopReason::UserCancelled,
        RmResponseReason::Unknown => RmStopReason::Unknown,
    }
}

fn schedule_internal(
    tx: &mpsc::UnboundedSender<Internal>,
    delay: Duration,
    event: Internal,
) -> JoinHandle<()> {
    let tx = tx.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = tx.send(event);
    })
}

fn spawn_pool_forwarder(
    mut rx: mpsc::Receiver<PoolEvent>,
    tx: mpsc::UnboundedSender<Internal>,
    session: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let internal = match event {
                PoolEvent::Message { payload, .. } => Internal::PoolMessage { session, payload },
                PoolEvent::Reconnected { broker_url } => {
                    Internal::PoolReconnected { session, broker_url }
                }
            };
            if tx.send(internal).is_err() {
                break;
            }
        }
    })
}

fn spawn_bus_listener(
    bus_tx: broadcast::Sender<Bytes>,
    tx: mpsc::UnboundedSender<Internal>,
    session: u64,
) -> JoinHandle<()> {
    let mut rx = bus_tx.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    if tx.send(Internal::BusMessage { session, payload }).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Local bus listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
