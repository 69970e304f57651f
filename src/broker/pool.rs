//! Broker Pool
//!
//! Runs up to N parallel broker sessions against the same topic. Outbound
//! messages fan out to every connected-and-subscribed broker; inbound
//! messages pass through the dedup cache so the room sees each message
//! once no matter how many brokers delivered it. Lost sessions reconnect
//! with exponential backoff, one outstanding cycle per broker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, warn};

use super::client::{BrokerClient, BrokerEvent};
use super::dedup::DedupCache;
use crate::config::Config;
use crate::credentials::BrokerEndpoint;

/// Events the pool reports to the room controller.
#[derive(Debug)]
pub enum PoolEvent {
    /// A deduplicated application message.
    Message { topic: String, payload: Bytes },
    /// A broker session came back after an unintentional disconnect; the
    /// room should re-announce its presence.
    Reconnected { broker_url: String },
}

/// Minimal probe for the dedup key; the full envelope is parsed later by
/// the signal router.
#[derive(Deserialize)]
struct MsgIdProbe {
    #[serde(rename = "msgId")]
    msg_id: Option<String>,
}

struct PoolShared {
    endpoints: Vec<BrokerEndpoint>,
    self_id: String,
    config: Config,
    clients: RwLock<HashMap<String, Arc<BrokerClient>>>,
    topic: RwLock<Option<String>>,
    shutdown: AtomicBool,
    reconnecting: StdMutex<HashSet<String>>,
    broker_event_tx: mpsc::Sender<BrokerEvent>,
    pool_event_tx: mpsc::Sender<PoolEvent>,
}

/// N-broker signaling pool.
pub struct BrokerPool {
    shared: Arc<PoolShared>,
    delivery: StdMutex<Option<JoinHandle<()>>>,
}

impl BrokerPool {
    /// Build a pool over the endpoint list (capped at
    /// `config.max_brokers`) and start the delivery task.
    pub fn new(
        mut endpoints: Vec<BrokerEndpoint>,
        self_id: &str,
        config: &Config,
        pool_event_tx: mpsc::Sender<PoolEvent>,
    ) -> Self {
        endpoints.truncate(config.max_brokers);
        let (broker_event_tx, broker_event_rx) = mpsc::channel(256);

        let shared = Arc::new(PoolShared {
            endpoints,
            self_id: self_id.to_string(),
            config: config.clone(),
            clients: RwLock::new(HashMap::new()),
            topic: RwLock::new(None),
            shutdown: AtomicBool::new(false),
            reconnecting: StdMutex::new(HashSet::new()),
            broker_event_tx,
            pool_event_tx,
        });

        let dedup = DedupCache::new(config.dedup_capacity, config.dedup_ttl);
        let delivery = tokio::spawn(delivery_loop(shared.clone(), broker_event_rx, dedup));

        Self {
            shared,
            delivery: StdMutex::new(Some(delivery)),
        }
    }

    /// Open every broker session in parallel. Returns the URLs that
    /// connected.
    pub async fn connect_all(&self) -> Vec<String> {
        let attempts = self.shared.endpoints.iter().map(|endpoint| {
            let shared = self.shared.clone();
            async move {
                match BrokerClient::connect(
                    &endpoint.url,
                    endpoint.username.as_deref(),
                    endpoint.password.as_deref(),
                    &shared.self_id,
                    &shared.config,
                    shared.broker_event_tx.clone(),
                )
                .await
                {
                    Ok(client) => {
                        shared
                            .clients
                            .write()
                            .await
                            .insert(endpoint.url.clone(), Arc::new(client));
                        Some(endpoint.url.clone())
                    }
                    Err(e) => {
                        warn!(broker = %endpoint.url, error = %e, "Broker connect failed");
                        None
                    }
                }
            }
        });

        let opened: Vec<String> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();
        info!(
            connected = opened.len(),
            total = self.shared.endpoints.len(),
            "Broker pool connected"
        );
        opened
    }

    /// Subscribe every open session to the topic. Returns the number of
    /// acknowledged subscriptions.
    pub async fn subscribe_all(&self, topic: &str) -> usize {
        *self.shared.topic.write().await = Some(topic.to_string());
        let clients: Vec<Arc<BrokerClient>> =
            self.shared.clients.read().await.values().cloned().collect();

        let mut granted = 0;
        for client in clients {
            if client.subscribe(topic).await {
                granted += 1;
            } else {
                warn!(broker = %client.url(), "Subscribe was not acknowledged");
            }
        }
        granted
    }

    /// Fan a payload out to every connected-and-subscribed broker.
    /// Returns the number of successful enqueues.
    pub async fn publish(&self, payload: &[u8]) -> usize {
        let Some(topic) = self.shared.topic.read().await.clone() else {
            return 0;
        };
        let clients = self.shared.clients.read().await;
        clients
            .values()
            .filter(|c| c.is_connected() && c.is_subscribed())
            .filter(|c| c.publish(&topic, payload))
            .count()
    }

    /// Currently connected broker sessions.
    pub async fn connected_count(&self) -> usize {
        self.shared
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Reopen any endpoint without a live session and resubscribe it.
    /// Used by the network monitor after connectivity returns; the
    /// regular backoff cycles cover mid-session drops.
    pub async fn ensure_connected(&self) -> usize {
        let topic = self.shared.topic.read().await.clone();
        for endpoint in &self.shared.endpoints {
            let have_live = self
                .shared
                .clients
                .read()
                .await
                .get(&endpoint.url)
                .is_some_and(|c| c.is_connected());
            let reconnecting = self
                .shared
                .reconnecting
                .lock()
                .expect("reconnecting set poisoned")
                .contains(&endpoint.url);
            if have_live || reconnecting {
                continue;
            }

            match BrokerClient::connect(
                &endpoint.url,
                endpoint.username.as_deref(),
                endpoint.password.as_deref(),
                &self.shared.self_id,
                &self.shared.config,
                self.shared.broker_event_tx.clone(),
            )
            .await
            {
                Ok(client) => {
                    let client = Arc::new(client);
                    let subscribed = match &topic {
                        Some(t) => client.subscribe(t).await,
                        None => true,
                    };
                    if subscribed {
                        self.shared
                            .clients
                            .write()
                            .await
                            .insert(endpoint.url.clone(), client);
                    } else {
                        client.disconnect().await;
                    }
                }
                Err(e) => debug!(broker = %endpoint.url, error = %e, "Reopen failed"),
            }
        }
        self.connected_count().await
    }

    /// Stop everything: reconnect cycles, the delivery task and every
    /// broker session. The dedup cache dies with the delivery task, so a
    /// future pool starts fresh.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .delivery
            .lock()
            .expect("delivery handle poisoned")
            .take()
        {
            handle.abort();
        }
        let clients: Vec<Arc<BrokerClient>> = {
            let mut map = self.shared.clients.write().await;
            map.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.disconnect().await;
        }
    }
}

async fn delivery_loop(
    shared: Arc<PoolShared>,
    mut broker_event_rx: mpsc::Receiver<BrokerEvent>,
    mut dedup: DedupCache,
) {
    let mut sweep = interval(shared.config.dedup_ttl / 2);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut dup_stats = DupStats::new(
        shared.config.duplicate_log_interval,
        shared.config.duplicate_log_threshold,
    );

    loop {
        tokio::select! {
            ev = broker_event_rx.recv() => match ev {
                None => break,
                Some(BrokerEvent::Message { topic, payload, .. }) => {
                    let msg_id = serde_json::from_slice::<MsgIdProbe>(&payload)
                        .ok()
                        .and_then(|probe| probe.msg_id);
                    if let Some(id) = msg_id {
                        if dedup.is_duplicate(&id) {
                            dup_stats.record(&id);
                            continue;
                        }
                    }
                    let _ = shared
                        .pool_event_tx
                        .send(PoolEvent::Message { topic, payload })
                        .await;
                }
                Some(BrokerEvent::Disconnected { broker_url }) => {
                    if shared.shutdown.load(Ordering::SeqCst) {
                        continue;
                    }
                    warn!(broker = %broker_url, "Broker session lost, scheduling reconnect");
                    shared.clients.write().await.remove(&broker_url);
                    spawn_reconnect(shared.clone(), broker_url);
                }
            },
            _ = sweep.tick() => {
                dedup.remove_expired();
                dup_stats.flush_if_due();
            }
        }
    }
}

/// One backoff-reconnect cycle per broker; a second disconnect event for
/// the same URL while a cycle is live is a no-op.
fn spawn_reconnect(shared: Arc<PoolShared>, broker_url: String) {
    {
        let mut set = shared
            .reconnecting
            .lock()
            .expect("reconnecting set poisoned");
        if !set.insert(broker_url.clone()) {
            return;
        }
    }

    tokio::spawn(async move {
        let endpoint = shared
            .endpoints
            .iter()
            .find(|e| e.url == broker_url)
            .cloned();

        if let Some(endpoint) = endpoint {
            reconnect_cycle(&shared, &endpoint).await;
        }

        shared
            .reconnecting
            .lock()
            .expect("reconnecting set poisoned")
            .remove(&broker_url);
    });
}

async fn reconnect_cycle(shared: &Arc<PoolShared>, endpoint: &BrokerEndpoint) {
    for attempt in 1..=shared.config.reconnect_max_attempts {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        sleep(reconnect_delay(&shared.config, attempt)).await;
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        match BrokerClient::connect(
            &endpoint.url,
            endpoint.username.as_deref(),
            endpoint.password.as_deref(),
            &shared.self_id,
            &shared.config,
            shared.broker_event_tx.clone(),
        )
        .await
        {
            Ok(client) => {
                let client = Arc::new(client);
                let topic = shared.topic.read().await.clone();
                let resubscribed = match &topic {
                    Some(t) => client.subscribe(t).await,
                    None => true,
                };
                if resubscribed {
                    shared
                        .clients
                        .write()
                        .await
                        .insert(endpoint.url.clone(), client);
                    info!(broker = %endpoint.url, attempt, "Broker session restored");
                    let _ = shared
                        .pool_event_tx
                        .send(PoolEvent::Reconnected {
                            broker_url: endpoint.url.clone(),
                        })
                        .await;
                    return;
                }
                client.disconnect().await;
                debug!(broker = %endpoint.url, attempt, "Resubscribe failed after reconnect");
            }
            Err(e) => {
                debug!(broker = %endpoint.url, attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }
    warn!(broker = %endpoint.url, "Reconnect attempts exhausted");
}

/// `min(base * 2^(attempt-1), max) + jitter[0..1s]`.
fn reconnect_delay(config: &Config, attempt: u32) -> Duration {
    let exp = config
        .reconnect_base_delay
        .saturating_mul(1u32 << (attempt - 1).min(16));
    let capped = exp.min(config.reconnect_max_delay);
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
}

/// Throttled summary of duplicate drops: flushed every interval or after
/// a threshold of drops, whichever comes first.
struct DupStats {
    window_start: Instant,
    drops: u64,
    counts: HashMap<String, u64>,
    interval: Duration,
    threshold: u64,
}

impl DupStats {
    fn new(interval: Duration, threshold: u64) -> Self {
        Self {
            window_start: Instant::now(),
            drops: 0,
            counts: HashMap::new(),
            interval,
            threshold,
        }
    }

    fn record(&mut self, msg_id: &str) {
        self.drops += 1;
        *self.counts.entry(msg_id.to_string()).or_insert(0) += 1;
        if self.drops >= self.threshold {
            self.flush();
        }
    }

    fn flush_if_due(&mut self) {
        if self.drops > 0 && self.window_start.elapsed() >= self.interval {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let mut top: Vec<(String, u64)> = self.counts.drain().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(5);
        warn!(
            drops = self.drops,
            window_secs = self.window_start.elapsed().as_secs(),
            top = ?top,
            "Dropped duplicate broker messages"
        );
        self.drops = 0;
        self.window_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let config = Config::default();
        for attempt in 1..=10 {
            let delay = reconnect_delay(&config, attempt);
            assert!(delay >= config.reconnect_base_delay);
            assert!(delay <= config.reconnect_max_delay + Duration::from_secs(1));
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let config = Config {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(300),
            ..Config::default()
        };
        // Strip jitter by comparing lower bounds.
        let floor =
            |attempt: u32| config.reconnect_base_delay.saturating_mul(1 << (attempt - 1));
        assert_eq!(floor(1), Duration::from_secs(1));
        assert_eq!(floor(3), Duration::from_secs(4));
        assert_eq!(floor(5), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn dup_stats_flush_on_threshold() {
        let mut stats = DupStats::new(Duration::from_secs(15), 3);
        stats.record("x1");
        stats.record("x1");
        assert_eq!(stats.drops, 2);
        stats.record("x2");
        // Threshold reached: window reset.
        assert_eq!(stats.drops, 0);
        assert!(stats.counts.is_empty());
    }
}
