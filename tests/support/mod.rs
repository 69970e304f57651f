//! Test Helpers
//!
//! An in-process MQTT-over-websocket broker speaking the same 3.1.1
//! subset as the client. Good enough for the signaling tests: CONNACK,
//! SUBACK, QoS 0 publish fan-out (echoing to the publisher when it is
//! subscribed, like a real broker), PINGRESP and clean DISCONNECT. Every
//! accepted PUBLISH is logged so tests can assert on the wire traffic.

#![allow(dead_code)] // not every test binary uses every helper

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use confmesh::broker::packet::{FrameReassembler, Packet, Publish};

struct ConnEntry {
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct BrokerState {
    reject_connect: bool,
    conns: Mutex<HashMap<u64, ConnEntry>>,
    next_id: AtomicU64,
    published: Mutex<Vec<Publish>>,
}

impl BrokerState {
    fn fan_out(&self, topic: &str, payload: &[u8]) {
        let frame = Packet::Publish(Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos: 0,
            packet_id: None,
        })
        .encode();
        let conns = self.conns.lock().unwrap();
        for entry in conns.values() {
            if entry.topics.contains(topic) {
                let _ = entry.tx.send(frame.clone());
            }
        }
    }
}

/// In-process broker for one test.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    /// A broker that refuses every MQTT connect, for fail-open tests.
    pub async fn start_rejecting() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(reject_connect: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState {
            reject_connect,
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            published: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_conn(stream, state).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Deliver a server-originated publish to every subscriber.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        self.state.fan_out(topic, payload);
    }

    /// Every PUBLISH the broker accepted from clients, in order.
    pub fn published(&self) -> Vec<Publish> {
        self.state.published.lock().unwrap().clone()
    }

    /// Payloads published to one topic, parsed as JSON.
    pub fn published_json(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .filter_map(|p| serde_json::from_slice(&p.payload).ok())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.conns.lock().unwrap().len()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_conn(
    stream: TcpStream,
    state: Arc<BrokerState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let conn_id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let mut reassembler = FrameReassembler::new();
    let mut registered = false;

    loop {
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => ws.send(Message::binary(frame)).await?,
                None => break,
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    reassembler.extend(&data);
                    while let Ok(Some(packet)) = reassembler.next_packet() {
                        match packet {
                            Packet::Connect(_) => {
                                if state.reject_connect {
                                    let nack = Packet::ConnAck {
                                        session_present: false,
                                        return_code: 5,
                                    };
                                    ws.send(Message::binary(nack.encode())).await?;
                                    let _ = ws.close(None).await;
                                    cleanup(&state, conn_id);
                                    return Ok(());
                                }
                                state.conns.lock().unwrap().insert(
                                    conn_id,
                                    ConnEntry {
                                        topics: HashSet::new(),
                                        tx: out_tx.clone(),
                                    },
                                );
                                registered = true;
                                let ack = Packet::ConnAck {
                                    session_present: false,
                                    return_code: 0,
                                };
                                ws.send(Message::binary(ack.encode())).await?;
                            }
                            Packet::Subscribe { packet_id, topic, .. } => {
                                if registered {
                                    if let Some(entry) =
                                        state.conns.lock().unwrap().get_mut(&conn_id)
                                    {
                                        entry.topics.insert(topic);
                                    }
                                }
                                let ack = Packet::SubAck {
                                    packet_id,
                                    return_codes: vec![0],
                                };
                                ws.send(Message::binary(ack.encode())).await?;
                            }
                            Packet::Publish(publish) => {
                                state.published.lock().unwrap().push(publish.clone());
                                state.fan_out(&publish.topic, &publish.payload);
                            }
                            Packet::PingReq => {
                                ws.send(Message::binary(Packet::PingResp.encode())).await?;
                            }
                            Packet::Disconnect => {
                                cleanup(&state, conn_id);
                                let _ = ws.close(None).await;
                                return Ok(());
                            }
                            _ => {}
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }
    cleanup(&state, conn_id);
    Ok(())
}

fn cleanup(state: &BrokerState, conn_id: u64) {
    state.conns.lock().unwrap().remove(&conn_id);
}
