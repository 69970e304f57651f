//! Process-Wide Context
//!
//! Owns the pieces that outlive any single room: the local peer identity,
//! the once-per-process credential cache and the same-device discovery
//! bus registry. Constructed once at startup and dropped at teardown;
//! tests build as many as they need.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::Config;
use crate::credentials::{
    Credentials, CredentialsError, CredentialsProvider, HttpCredentialsProvider,
    StaticCredentialsProvider,
};
use crate::room::local_bus::LocalBusRegistry;
use crate::signal::message::PeerId;

/// Length of the generated peer identity.
const PEER_ID_LEN: usize = 16;

/// Mint a random alphanumeric peer ID.
pub fn generate_peer_id() -> PeerId {
    let mut rng = rand::thread_rng();
    (0..PEER_ID_LEN)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

/// Shared state for all rooms of this process.
pub struct CoreContext {
    self_id: PeerId,
    config: Config,
    provider: Arc<dyn CredentialsProvider>,
    credentials: OnceCell<Credentials>,
    local_bus: LocalBusRegistry,
}

impl CoreContext {
    /// Build a context from configuration, with the provider implied by
    /// `credentials_url`.
    pub fn new(config: Config) -> Arc<Self> {
        let provider: Arc<dyn CredentialsProvider> = match &config.credentials_url {
            Some(url) => Arc::new(HttpCredentialsProvider::new(url.clone())),
            None => Arc::new(StaticCredentialsProvider(Credentials::public_fallback())),
        };
        Self::with_provider(config, provider)
    }

    /// Build a context with an explicit credential provider.
    pub fn with_provider(config: Config, provider: Arc<dyn CredentialsProvider>) -> Arc<Self> {
        let self_id = generate_peer_id();
        info!(self_id = %self_id, "Conference context initialized");
        Arc::new(Self {
            self_id,
            config,
            provider,
            credentials: OnceCell::new(),
            local_bus: LocalBusRegistry::new(),
        })
    }

    /// Replace the same-device bus registry. Contexts sharing a registry
    /// discover each other through the local fallback channel.
    pub fn with_shared_bus(self: Arc<Self>, bus: LocalBusRegistry) -> Arc<Self> {
        Arc::new(Self {
            self_id: self.self_id.clone(),
            config: self.config.clone(),
            provider: self.provider.clone(),
            credentials: OnceCell::new(),
            local_bus: bus,
        })
    }

    /// The local peer identity.
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// The context configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The same-device discovery bus registry.
    pub const fn local_bus(&self) -> &LocalBusRegistry {
        &self.local_bus
    }

    /// Load credentials, once per process. Non-strict mode degrades to the
    /// public fallback on provider failure; strict mode propagates the
    /// error so `join_room` can fail.
    pub async fn credentials(&self) -> Result<&Credentials, CredentialsError> {
        self.credentials
            .get_or_try_init(|| async {
                match self.provider.fetch().await {
                    Ok(creds) => Ok(creds),
                    Err(e) if self.config.strict_credentials => Err(e),
                    Err(e) => {
                        warn!(error = %e, "Credential provider failed, using public fallback");
                        Ok(Credentials::public_fallback())
                    }
                }
            })
            .await
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("self_id", &self.self_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::UnavailableCredentialsProvider;

    #[test]
    fn peer_ids_are_sixteen_alphanumerics() {
        let id = generate_peer_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_peer_id());
    }

    #[tokio::test]
    async fn fallback_on_provider_failure() {
        let ctx = CoreContext::with_provider(
            Config::default(),
            Arc::new(UnavailableCredentialsProvider),
        );
        let creds = ctx.credentials().await.unwrap();
        assert_eq!(*creds, Credentials::public_fallback());
    }

    #[tokio::test]
    async fn strict_mode_propagates_failure() {
        let config = Config {
            strict_credentials: true,
            ..Config::default()
        };
        let ctx = CoreContext::with_provider(config, Arc::new(UnavailableCredentialsProvider));
        assert!(ctx.credentials().await.is_err());
    }

    #[tokio::test]
    async fn credentials_cached_after_first_load() {
        let ctx = CoreContext::new(Config::default());
        let first = ctx.credentials().await.unwrap() as *const Credentials;
        let second = ctx.credentials().await.unwrap() as *const Credentials;
        assert_eq!(first, second);
    }
}
