//! Credential Loading
//!
//! ICE servers and broker endpoints come from an external provider,
//! fetched once per process and cached. Provider failures fall back to a
//! public STUN/broker set unless strict mode is enabled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Credential loading errors.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credential request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed credential document: {0}")]
    Malformed(String),

    #[error("credential provider unavailable")]
    Unavailable,
}

/// A single ICE server entry (STUN or TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        Self {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// A broker endpoint with optional credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl BrokerEndpoint {
    /// Endpoint with no credentials.
    pub fn anonymous(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }
}

/// The full credential document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
    pub brokers: Vec<BrokerEndpoint>,
}

impl Credentials {
    /// Built-in public fallback used when no provider is configured or a
    /// provider fails in non-strict mode.
    pub fn public_fallback() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            brokers: vec![
                BrokerEndpoint::anonymous("wss://broker.emqx.io:8084/mqtt"),
                BrokerEndpoint::anonymous("wss://broker.hivemq.com:8884/mqtt"),
                BrokerEndpoint::anonymous("wss://test.mosquitto.org:8081"),
            ],
        }
    }

    /// Engine configuration for a new peer connection.
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Source of ICE and broker credentials.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn fetch(&self) -> Result<Credentials, CredentialsError>;
}

/// Fetches the credential document as JSON over HTTP(S).
pub struct HttpCredentialsProvider {
    url: String,
    client: reqwest::Client,
}

impl HttpCredentialsProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialsProvider for HttpCredentialsProvider {
    async fn fetch(&self) -> Result<Credentials, CredentialsError> {
        debug!(url = %self.url, "Fetching credentials");
        let credentials: Credentials = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if credentials.brokers.is_empty() && credentials.ice_servers.is_empty() {
            return Err(CredentialsError::Malformed(
                "document lists neither brokers nor ice servers".into(),
            ));
        }
        Ok(credentials)
    }
}

/// Serves a fixed credential document; the default when no endpoint is
/// configured, and the injection point for tests.
pub struct StaticCredentialsProvider(pub Credentials);

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn fetch(&self) -> Result<Credentials, CredentialsError> {
        Ok(self.0.clone())
    }
}

/// Always fails; used to exercise the strict-credentials path.
pub struct UnavailableCredentialsProvider;

#[async_trait]
impl CredentialsProvider for UnavailableCredentialsProvider {
    async fn fetch(&self) -> Result<Credentials, CredentialsError> {
        Err(CredentialsError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_has_stun_and_brokers() {
        let creds = Credentials::public_fallback();
        assert!(!creds.ice_servers.is_empty());
        assert!(creds.brokers.len() >= 2);
        assert!(creds.ice_servers[0].urls[0].starts_with("stun:"));
        assert!(creds.brokers.iter().all(|b| b.url.starts_with("wss://")));
    }

    #[test]
    fn document_round_trip() {
        let doc = r#"{
            "iceServers": [
                {"urls": ["turn:turn.example.org:3478"], "username": "u", "credential": "c"}
            ],
            "brokers": [
                {"url": "wss://signal.example.org/mqtt", "username": "guest", "password": "guest"}
            ]
        }"#;
        let creds: Credentials = serde_json::from_str(doc).unwrap();
        assert_eq!(creds.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(creds.brokers[0].url, "wss://signal.example.org/mqtt");

        let rtc = creds.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].username, "u");
    }
}
