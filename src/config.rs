//! Core Configuration
//!
//! Tunable timings and limits for the signaling core. Every knob has a
//! production default matching the protocol constants; tests shrink the
//! intervals instead of waiting wall-clock values.

use std::env;
use std::time::Duration;

/// Configuration for a conference core instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential provider endpoint (JSON over HTTPS). `None` uses the
    /// built-in public STUN/broker set.
    pub credentials_url: Option<String>,

    /// Explicit broker web-socket URLs, overriding the provider list.
    pub broker_urls: Option<Vec<String>>,

    /// Fail `join_room` when the credential provider errors instead of
    /// falling back to the public defaults.
    pub strict_credentials: bool,

    /// Maximum parallel broker sessions per room.
    pub max_brokers: usize,

    /// Dedup cache capacity (entries).
    pub dedup_capacity: usize,

    /// Dedup entry time-to-live.
    pub dedup_ttl: Duration,

    /// Keep-alive advertised in the MQTT CONNECT packet.
    pub mqtt_keep_alive: Duration,

    /// Interval between PINGREQ frames while a broker socket is open.
    pub mqtt_ping_interval: Duration,

    /// Broker CONNECT round-trip timeout (transport open + CONNACK).
    pub connect_timeout: Duration,

    /// SUBACK wait per subscription.
    pub subscribe_timeout: Duration,

    /// Broker reconnect backoff base delay.
    pub reconnect_base_delay: Duration,

    /// Broker reconnect backoff ceiling.
    pub reconnect_max_delay: Duration,

    /// Broker reconnect attempts before giving up on an endpoint.
    pub reconnect_max_attempts: u32,

    /// Duplicate-drop summary flush interval.
    pub duplicate_log_interval: Duration,

    /// Duplicate-drop count that forces an early summary flush.
    pub duplicate_log_threshold: u64,

    /// Delay before the first announce after joining.
    pub announce_initial_delay: Duration,

    /// Announce loop tick while the room has no healthy peer.
    pub announce_interval: Duration,

    /// Minimum spacing between broadcast announces.
    pub announce_debounce: Duration,

    /// Announce loop keeps running this long even after a peer connects.
    pub announce_settle: Duration,

    /// Heartbeat supervision tick.
    pub heartbeat_interval: Duration,

    /// Idle time after which a peer gets a direct ping.
    pub ping_idle: Duration,

    /// Silence after which a peer is reaped.
    pub heartbeat_timeout: Duration,

    /// Pause between leaving an old room and joining the next one.
    pub rejoin_delay: Duration,

    /// Grace period after ICE `disconnected` before attempting a restart.
    pub ice_grace_period: Duration,

    /// ICE restart retry backoff base.
    pub ice_restart_delay: Duration,

    /// Time an ICE restart may stay in flight before it counts as failed.
    pub ice_restart_timeout: Duration,

    /// ICE restarts per peer before the session is torn down.
    pub max_ice_restart_attempts: u32,

    /// Delay between a peer connecting and the local mute-status send.
    pub mute_status_delay: Duration,

    /// Network-monitor reconnect backoff base.
    pub net_reconnect_base: Duration,

    /// Network-monitor reconnect cycles before surfacing exhaustion.
    pub net_reconnect_attempts: u32,

    /// Chat message length clamp (characters).
    pub chat_max_len: usize,

    /// Remote-mic lease heartbeat send interval.
    pub rm_heartbeat_interval: Duration,

    /// Remote-mic lease heartbeat timeout.
    pub rm_heartbeat_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials_url: None,
            broker_urls: None,
            strict_credentials: false,
            max_brokers: 4,
            dedup_capacity: 500,
            dedup_ttl: Duration::from_secs(30),
            mqtt_keep_alive: Duration::from_secs(30),
            mqtt_ping_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(8),
            subscribe_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: 10,
            duplicate_log_interval: Duration::from_secs(15),
            duplicate_log_threshold: 200,
            announce_initial_delay: Duration::from_millis(300),
            announce_interval: Duration::from_secs(3),
            announce_debounce: Duration::from_millis(100),
            announce_settle: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            ping_idle: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            rejoin_delay: Duration::from_millis(100),
            ice_grace_period: Duration::from_secs(5),
            ice_restart_delay: Duration::from_secs(2),
            ice_restart_timeout: Duration::from_secs(15),
            max_ice_restart_attempts: 3,
            mute_status_delay: Duration::from_millis(500),
            net_reconnect_base: Duration::from_secs(2),
            net_reconnect_attempts: 5,
            chat_max_len: 5000,
            rm_heartbeat_interval: Duration::from_secs(5),
            rm_heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("CONFMESH_CREDENTIALS_URL") {
            if !url.is_empty() {
                config.credentials_url = Some(url);
            }
        }
        if let Ok(brokers) = env::var("CONFMESH_BROKERS") {
            let urls: Vec<String> = brokers
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
            if !urls.is_empty() {
                config.broker_urls = Some(urls);
            }
        }
        if let Ok(v) = env::var("CONFMESH_STRICT_CREDENTIALS") {
            config.strict_credentials = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = env_usize("CONFMESH_MAX_BROKERS") {
            config.max_brokers = n.max(1);
        }
        if let Some(n) = env_usize("CONFMESH_DEDUP_CAPACITY") {
            config.dedup_capacity = n.max(1);
        }
        if let Some(secs) = env_u64("CONFMESH_DEDUP_TTL_SECS") {
            config.dedup_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_usize("CONFMESH_CHAT_MAX_LEN") {
            config.chat_max_len = n;
        }

        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.dedup_capacity, 500);
        assert_eq!(config.dedup_ttl, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(8));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(5));
        assert_eq!(config.max_ice_restart_attempts, 3);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.chat_max_len, 5000);
    }

    #[test]
    fn env_overrides_apply() {
        env::set_var("CONFMESH_BROKERS", "wss://a.example/mqtt, wss://b.example/mqtt");
        env::set_var("CONFMESH_MAX_BROKERS", "2");
        let config = Config::from_env();
        assert_eq!(
            config.broker_urls.as_deref(),
            Some(&["wss://a.example/mqtt".to_string(), "wss://b.example/mqtt".to_string()][..])
        );
        assert_eq!(config.max_brokers, 2);
        env::remove_var("CONFMESH_BROKERS");
        env::remove_var("CONFMESH_MAX_BROKERS");
    }
}
