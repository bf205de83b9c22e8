//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested
//! sections use `__` as separator, e.g. `SCHEDULER__BATCH_SIZE`.
//!
//! OAuth client credentials are flat variables named after the provider
//! (`GMAIL_CLIENT_ID`, `GMAIL_CLIENT_SECRET`) and are read from the same
//! source once the enabled providers are known.

use serde::Deserialize;
use std::collections::BTreeMap;
use tether_integration::provider::ClientCredentials;
use tether_integration::{ClientCredentialSet, LifecycleSettings, ProviderKey, ProviderRegistry};
use tether_scheduler::SchedulerSettings;

/// Server configuration composed from library configs.
#[derive(Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Base64 encoding of the 32-byte secret encryption key.
    pub encryption_key: String,

    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Externally reachable base URL, used for webhook and OAuth
    /// redirect URLs.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Comma-separated provider keys to enable. All when unset.
    #[serde(default)]
    pub providers: Option<String>,

    /// Maximum pooled database connections.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Client id/secret pairs found for each provider key.
    #[serde(skip)]
    clients: BTreeMap<ProviderKey, (Option<String>, Option<String>)>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("public_base_url", &self.public_base_url)
            .field("providers", &self.providers)
            .field("database_max_connections", &self.database_max_connections)
            .field("lifecycle", &self.lifecycle)
            .field("scheduler", &self.scheduler)
            .field("bootstrap", &self.bootstrap)
            .finish_non_exhaustive()
    }
}

/// Bootstrap worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// Capacity of the in-process bootstrap queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    256
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::default())
    }

    fn from_environment(env: config::Environment) -> Result<Self, config::ConfigError> {
        let source = config::Config::builder()
            .add_source(env.separator("__").try_parsing(true))
            .build()?;
        let mut config: Self = source.clone().try_deserialize()?;
        config
            .lifecycle
            .public_base_url
            .clone_from(&config.public_base_url);

        for key in config.provider_keys()? {
            let read = |suffix: &str| {
                source
                    .get_string(&format!("{}_{suffix}", key.as_str()))
                    .ok()
                    .filter(|v| !v.trim().is_empty())
            };
            config
                .clients
                .insert(key, (read("client_id"), read("client_secret")));
        }
        Ok(config)
    }

    /// The enabled provider keys.
    ///
    /// # Errors
    ///
    /// Fails on an unknown key in `PROVIDERS`.
    pub fn provider_keys(&self) -> Result<Vec<ProviderKey>, config::ConfigError> {
        let Some(list) = self.providers.as_deref().filter(|l| !l.trim().is_empty()) else {
            return Ok(ProviderKey::ALL.to_vec());
        };
        let mut keys = Vec::new();
        for raw in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            let key = raw
                .parse::<ProviderKey>()
                .map_err(|e| config::ConfigError::Message(format!("PROVIDERS: {e}")))?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// OAuth client credentials for every registered provider that needs
    /// them.
    ///
    /// # Errors
    ///
    /// Names the first provider whose id or secret is missing.
    pub fn client_credentials(
        &self,
        registry: &ProviderRegistry,
    ) -> Result<ClientCredentialSet, config::ConfigError> {
        let mut clients = ClientCredentialSet::new();
        for provider in registry.configs() {
            let found = self.clients.get(&provider.key);
            match found {
                Some((Some(client_id), Some(client_secret))) => clients.insert(
                    provider.key,
                    ClientCredentials {
                        client_id: client_id.clone(),
                        client_secret: client_secret.clone(),
                    },
                ),
                _ if provider.needs_client_credentials() => {
                    let prefix = provider.key.env_prefix();
                    return Err(config::ConfigError::Message(format!(
                        "{prefix}_CLIENT_ID and {prefix}_CLIENT_SECRET are required for {}",
                        provider.key
                    )));
                }
                _ => {}
            }
        }
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, config::ConfigError> {
        let vars: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServerConfig::from_environment(config::Environment::default().source(Some(vars)))
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/tether"),
        ("ENCRYPTION_KEY", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
    ];

    #[test]
    fn defaults_apply() {
        let config = load(&REQUIRED).expect("config");
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.bootstrap.queue_capacity, 256);
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.lifecycle.provider_timeout(), Duration::from_secs(20));
        assert_eq!(config.provider_keys().expect("keys"), ProviderKey::ALL.to_vec());
    }

    #[test]
    fn nested_sections_use_double_underscore() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SCHEDULER__BATCH_SIZE", "25"));
        vars.push(("LIFECYCLE__REFRESH_LEASE_SECS", "30"));
        let config = load(&vars).expect("config");
        assert_eq!(config.scheduler.batch_size, 25);
        assert_eq!(config.lifecycle.refresh_lease_secs, 30);
    }

    #[test]
    fn public_base_url_flows_into_lifecycle() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PUBLIC_BASE_URL", "https://tether.example"));
        let config = load(&vars).expect("config");
        assert_eq!(
            config.lifecycle.webhook_url(ProviderKey::Github),
            "https://tether.example/webhooks/github"
        );
    }

    #[test]
    fn missing_database_url_fails() {
        assert!(load(&REQUIRED[1..]).is_err());
    }

    #[test]
    fn provider_list_is_parsed_and_deduplicated() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PROVIDERS", "slack, GitHub,slack"));
        let config = load(&vars).expect("config");
        assert_eq!(
            config.provider_keys().expect("keys"),
            vec![ProviderKey::Slack, ProviderKey::Github]
        );
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PROVIDERS", "slack,myspace"));
        let config = load(&vars).expect("config");
        assert!(config.provider_keys().is_err());
    }

    #[test]
    fn oauth_providers_need_client_credentials() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PROVIDERS", "slack"));
        let config = load(&vars).expect("config");
        let registry =
            ProviderRegistry::builtin(&[ProviderKey::Slack], Duration::from_secs(1)).expect("registry");
        let err = config.client_credentials(&registry).expect_err("missing");
        assert!(err.to_string().contains("SLACK_CLIENT_ID"));
    }

    #[test]
    fn client_credentials_are_read_per_provider() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PROVIDERS", "slack"));
        vars.push(("SLACK_CLIENT_ID", "abc"));
        vars.push(("SLACK_CLIENT_SECRET", "shh"));
        let config = load(&vars).expect("config");
        let registry =
            ProviderRegistry::builtin(&[ProviderKey::Slack], Duration::from_secs(1)).expect("registry");
        let clients = config.client_credentials(&registry).expect("clients");
        assert_eq!(
            clients.get(ProviderKey::Slack).map(|c| c.client_id.as_str()),
            Some("abc")
        );
    }

    #[test]
    fn debug_hides_secrets() {
        let config = load(&REQUIRED).expect("config");
        let debug = format!("{config:?}");
        assert!(!debug.contains("AAAAAAAA"));
        assert!(!debug.contains("postgres://"));
    }
}
