//! Runtime settings for lifecycle operations.

use crate::provider::{ClientCredentials, ProviderKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Tunables for the lifecycle manager.
///
/// Deserialized from the `LIFECYCLE__*` environment section; every field
/// has a default.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Upper bound on any single provider call.
    pub provider_timeout_secs: u64,
    /// Lead time before expiry at which OAuth tokens are refreshed.
    pub refresh_threshold_minutes: i64,
    /// How long a refresh lease is held before others may take over.
    pub refresh_lease_secs: u64,
    /// Lifetime of an OAuth connect state token.
    pub oauth_state_ttl_minutes: i64,
    /// Delay between a successful sync and the next scheduled one.
    pub sync_interval_secs: u64,
    /// Externally reachable base URL for webhook and redirect URLs.
    pub public_base_url: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            provider_timeout_secs: 20,
            refresh_threshold_minutes: crate::lifecycle::DEFAULT_REFRESH_THRESHOLD_MINUTES,
            refresh_lease_secs: 120,
            oauth_state_ttl_minutes: 10,
            sync_interval_secs: 3600,
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

impl LifecycleSettings {
    #[must_use]
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    #[must_use]
    pub fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.refresh_threshold_minutes)
    }

    #[must_use]
    pub fn refresh_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.refresh_lease_secs).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn oauth_state_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.oauth_state_ttl_minutes)
    }

    #[must_use]
    pub fn sync_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.sync_interval_secs).unwrap_or(i64::MAX))
    }

    /// Age after which a running bootstrap job counts as abandoned.
    #[must_use]
    pub fn bootstrap_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.provider_timeout_secs.saturating_mul(2)).unwrap_or(i64::MAX),
        )
    }

    /// URL a provider should deliver webhooks for `key` to.
    #[must_use]
    pub fn webhook_url(&self, key: ProviderKey) -> String {
        format!("{}/webhooks/{key}", self.base())
    }

    /// OAuth redirect URL for `key`.
    #[must_use]
    pub fn oauth_redirect_url(&self, key: ProviderKey) -> String {
        format!("{}/oauth/{key}/callback", self.base())
    }

    fn base(&self) -> &str {
        self.public_base_url.trim_end_matches('/')
    }
}

/// OAuth client credentials per provider.
#[derive(Debug, Clone, Default)]
pub struct ClientCredentialSet {
    clients: HashMap<ProviderKey, ClientCredentials>,
}

impl ClientCredentialSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ProviderKey, credentials: ClientCredentials) {
        self.clients.insert(key, credentials);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, key: ProviderKey, client_id: &str, client_secret: &str) -> Self {
        self.insert(
            key,
            ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            },
        );
        self
    }

    #[must_use]
    pub fn get(&self, key: ProviderKey) -> Option<&ClientCredentials> {
        self.clients.get(&key)
    }
}
