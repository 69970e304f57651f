//! Broker Session
//!
//! One MQTT 3.1.1 session over a binary web-socket. A single I/O task
//! owns the socket: it writes queued frames, reassembles inbound chunks,
//! answers transport pings and emits PINGREQ keep-alives while the socket
//! is open. Intentional closes emit DISCONNECT and suppress the
//! disconnect hook; transport-initiated closes report back to the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use super::error::{BrokerError, FrameError};
use super::packet::{Connect, FrameReassembler, Packet, Publish};
use crate::config::Config;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// SUBACK failure return code.
const SUBACK_FAILURE: u8 = 0x80;

/// Events a broker session reports to its pool.
#[derive(Debug)]
pub enum BrokerEvent {
    /// An application message arrived on a subscribed topic.
    Message {
        broker_url: String,
        topic: String,
        payload: Bytes,
    },
    /// The transport closed without a local `disconnect()`.
    Disconnected { broker_url: String },
}

enum IoCommand {
    Frame(Bytes),
    Subscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Disconnect,
}

/// Handle to a connected broker session.
pub struct BrokerClient {
    url: String,
    cmd_tx: mpsc::Sender<IoCommand>,
    connected: Arc<AtomicBool>,
    subscribed: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
    subscribe_timeout: std::time::Duration,
}

impl BrokerClient {
    /// Open the web-socket, complete the MQTT handshake and start the I/O
    /// task. Resolves once CONNACK arrives or the connect timeout fires.
    pub async fn connect(
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
        self_id: &str,
        config: &Config,
        event_tx: mpsc::Sender<BrokerEvent>,
    ) -> Result<Self, BrokerError> {
        let parsed = Url::parse(url).map_err(|e| BrokerError::Url(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BrokerError::Url(format!("no host in {url}")))?;
        let client_id = derive_client_id(self_id, host);

        let mut request = url
            .into_client_request()
            .map_err(|e| BrokerError::Url(e.to_string()))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt"));

        let (ws, _response) = timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| BrokerError::ConnectTimeout)??;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (connack_tx, connack_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicU64::new(0));

        tokio::spawn(io_loop(
            url.to_string(),
            ws,
            cmd_rx,
            event_tx,
            connack_tx,
            connected.clone(),
            received.clone(),
            config.mqtt_ping_interval,
        ));

        let connect_frame = Packet::Connect(Connect {
            client_id,
            keep_alive_secs: config.mqtt_keep_alive.as_secs() as u16,
            clean_session: true,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
        })
        .encode();
        cmd_tx
            .send(IoCommand::Frame(connect_frame))
            .await
            .map_err(|_| BrokerError::Closed)?;

        let return_code = timeout(config.connect_timeout, connack_rx)
            .await
            .map_err(|_| BrokerError::ConnectTimeout)?
            .map_err(|_| BrokerError::Closed)?;
        if return_code != 0 {
            return Err(BrokerError::ConnectRejected(return_code));
        }

        debug!(broker = %url, "Broker session established");
        Ok(Self {
            url: url.to_string(),
            cmd_tx,
            connected,
            subscribed: Arc::new(AtomicBool::new(false)),
            received,
            subscribe_timeout: config.subscribe_timeout,
        })
    }

    /// Subscribe to a topic at QoS 0. Resolves `true` on SUBACK, `false`
    /// on timeout or transport failure.
    pub async fn subscribe(&self, topic: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = IoCommand::Subscribe {
            topic: topic.to_string(),
            reply: reply_tx,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return false;
        }
        let granted = matches!(timeout(self.subscribe_timeout, reply_rx).await, Ok(Ok(true)));
        if granted {
            self.subscribed.store(true, Ordering::SeqCst);
        }
        granted
    }

    /// Enqueue a QoS 0 publish. Returns `true` iff the frame was handed
    /// to the transport task.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let frame = Packet::Publish(Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos: 0,
            packet_id: None,
        })
        .encode();
        self.cmd_tx.try_send(IoCommand::Frame(frame)).is_ok()
    }

    /// Intentional close: DISCONNECT, socket close, no disconnect hook.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(IoCommand::Disconnect).await;
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// PUBLISH frames received over the session lifetime.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }
}

/// Client ID: 6 chars of the self ID, a 16-bit host hash, 4 random
/// alphanumerics. Distinct per (process, broker, session).
fn derive_client_id(self_id: &str, host: &str) -> String {
    let prefix: String = self_id.chars().take(6).collect();
    let mut rng = rand::thread_rng();
    let entropy: String = (0..4)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect();
    format!("{prefix}-{:04x}-{entropy}", host_hash(host))
}

/// FNV-1a, truncated to 16 bits.
fn host_hash(host: &str) -> u16 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in host.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash & 0xFFFF) as u16
}

#[allow(clippy::too_many_arguments)]
async fn io_loop(
    url: String,
    mut ws: WsStream,
    mut cmd_rx: mpsc::Receiver<IoCommand>,
    event_tx: mpsc::Sender<BrokerEvent>,
    connack_tx: oneshot::Sender<u8>,
    connected: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
    ping_interval: std::time::Duration,
) {
    let mut reassembler = FrameReassembler::new();
    let mut pending_connack = Some(connack_tx);
    let mut pending_subs: HashMap<u16, oneshot::Sender<bool>> = HashMap::new();
    let mut next_packet_id: u16 = 1;
    let mut intentional = false;

    let mut keep_alive = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    // Handle dropped; treat as an intentional close.
                    intentional = true;
                    let _ = ws.close(None).await;
                    break;
                }
                Some(IoCommand::Frame(frame)) => {
                    if let Err(e) = ws.send(Message::binary(frame)).await {
                        warn!(broker = %url, error = %e, "Frame write failed");
                        break;
                    }
                }
                Some(IoCommand::Subscribe { topic, reply }) => {
                    let packet_id = next_packet_id;
                    next_packet_id = next_packet_id.wrapping_add(1).max(1);
                    let frame = Packet::Subscribe { packet_id, topic, qos: 0 }.encode();
                    if ws.send(Message::binary(frame)).await.is_ok() {
                        pending_subs.insert(packet_id, reply);
                    } else {
                        let _ = reply.send(false);
                        break;
                    }
                }
                Some(IoCommand::Disconnect) => {
                    intentional = true;
                    let _ = ws.send(Message::binary(Packet::Disconnect.encode())).await;
                    let _ = ws.close(None).await;
                    break;
                }
            },

            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    reassembler.extend(&data);
                    drain_packets(
                        &url,
                        &mut reassembler,
                        &mut pending_connack,
                        &mut pending_subs,
                        &connected,
                        &received,
                        &event_tx,
                    )
                    .await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(broker = %url, "Broker closed the socket");
                    break;
                }
                Some(Err(e)) => {
                    warn!(broker = %url, error = %e, "Web-socket error");
                    break;
                }
                None => {
                    debug!(broker = %url, "Web-socket stream ended");
                    break;
                }
                _ => {}
            },

            _ = keep_alive.tick() => {
                if connected.load(Ordering::SeqCst) {
                    if let Err(e) = ws.send(Message::binary(Packet::PingReq.encode())).await {
                        warn!(broker = %url, error = %e, "Keep-alive write failed");
                        break;
                    }
                }
            }
        }
    }

    // The hook only fires for sessions that actually completed the MQTT
    // handshake; a refused or half-open connect is the caller's failure.
    let was_established = connected.swap(false, Ordering::SeqCst);
    if !intentional && was_established {
        let _ = event_tx
            .send(BrokerEvent::Disconnected { broker_url: url })
            .await;
    }
}

async fn drain_packets(
    url: &str,
    reassembler: &mut FrameReassembler,
    pending_connack: &mut Option<oneshot::Sender<u8>>,
    pending_subs: &mut HashMap<u16, oneshot::Sender<bool>>,
    connected: &AtomicBool,
    received: &AtomicU64,
    event_tx: &mpsc::Sender<BrokerEvent>,
) {
    loop {
        match reassembler.next_packet() {
            Ok(Some(packet)) => match packet {
                Packet::ConnAck { return_code, .. } => {
                    if return_code == 0 {
                        connected.store(true, Ordering::SeqCst);
                    }
                    if let Some(tx) = pending_connack.take() {
                        let _ = tx.send(return_code);
                    }
                }
                Packet::Publish(publish) => {
                    received.fetch_add(1, Ordering::SeqCst);
                    let _ = event_tx
                        .send(BrokerEvent::Message {
                            broker_url: url.to_string(),
                            topic: publish.topic,
                            payload: publish.payload,
                        })
                        .await;
                }
                Packet::SubAck {
                    packet_id,
                    return_codes,
                } => {
                    if let Some(reply) = pending_subs.remove(&packet_id) {
                        let granted = return_codes
                            .first()
                            .is_some_and(|code| *code != SUBACK_FAILURE);
                        let _ = reply.send(granted);
                    }
                }
                Packet::PingResp => {}
                other => trace!(broker = %url, packet = ?other, "Ignoring packet"),
            },
            Ok(None) => break,
            Err(FrameError::LengthOverflow) => {
                warn!(broker = %url, "Remaining-length overflow, reassembly buffer discarded");
                break;
            }
            Err(e) => {
                warn!(broker = %url, error = %e, "Malformed frame dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_shape() {
        let id = derive_client_id("abcdefghij123456", "broker.example.org");
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "abcdef");
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn host_hash_is_stable_per_host() {
        assert_eq!(host_hash("a.example"), host_hash("a.example"));
        assert_ne!(host_hash("a.example"), host_hash("b.example"));
    }
}
