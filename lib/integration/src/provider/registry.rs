//! Lookup from provider key to plugin.

use super::github::GithubProvider;
use super::gmail::GmailProvider;
use super::instagram::InstagramProvider;
use super::slack::SlackProvider;
use super::{Provider, ProviderConfig, ProviderKey};
use crate::error::{ProviderError, ProviderNotFound};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Registered provider plugins, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKey, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in plugin for each key, all
    /// sharing one HTTP client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn builtin(keys: &[ProviderKey], timeout: Duration) -> Result<Self, ProviderError> {
        let http = super::http::client(timeout)?;
        let mut registry = Self::new();
        for key in keys {
            let provider: Arc<dyn Provider> = match key {
                ProviderKey::Gmail => Arc::new(GmailProvider::new(http.clone())),
                ProviderKey::Slack => Arc::new(SlackProvider::new(http.clone())),
                ProviderKey::Github => Arc::new(GithubProvider::new(http.clone())),
                ProviderKey::Instagram => Arc::new(InstagramProvider::new(http.clone())),
            };
            registry.register(provider);
        }
        Ok(registry)
    }

    /// Registers a plugin, replacing any previous one for the same key.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Option<Arc<dyn Provider>> {
        self.providers.insert(provider.key(), provider)
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Resolves a provider key string to its plugin.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderNotFound`] for unknown or unregistered keys.
    pub fn resolve(&self, key: &str) -> Result<Arc<dyn Provider>, ProviderNotFound> {
        key.parse::<ProviderKey>()
            .ok()
            .and_then(|k| self.get(k))
            .ok_or_else(|| ProviderNotFound {
                key: key.to_string(),
            })
    }

    /// Returns the plugin for a key, if registered.
    #[must_use]
    pub fn get(&self, key: ProviderKey) -> Option<Arc<dyn Provider>> {
        self.providers.get(&key).cloned()
    }

    /// Registered keys, in a stable order.
    pub fn keys(&self) -> impl Iterator<Item = ProviderKey> + '_ {
        self.providers.keys().copied()
    }

    /// Configurations of every registered plugin.
    pub fn configs(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values().map(|p| p.config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;

    #[test]
    fn resolves_registered_provider() {
        let registry = ProviderRegistry::new().with(Arc::new(FakeProvider::new(ProviderKey::Slack)));
        let provider = registry.resolve("slack").expect("registered");
        assert_eq!(provider.key(), ProviderKey::Slack);
    }

    #[test]
    fn unknown_key_is_not_found() {
        let registry = ProviderRegistry::new().with(Arc::new(FakeProvider::new(ProviderKey::Slack)));
        let err = registry.resolve("myspace").err().expect("unknown");
        assert_eq!(err.key, "myspace");
    }

    #[test]
    fn known_but_unregistered_key_is_not_found() {
        let registry = ProviderRegistry::new().with(Arc::new(FakeProvider::new(ProviderKey::Slack)));
        assert!(registry.resolve("gmail").is_err());
    }

    #[test]
    fn builtin_registers_requested_keys() {
        let registry = ProviderRegistry::builtin(
            &[ProviderKey::Github, ProviderKey::Instagram],
            Duration::from_secs(5),
        )
        .expect("registry");
        assert_eq!(
            registry.keys().collect::<Vec<_>>(),
            vec![ProviderKey::Github, ProviderKey::Instagram]
        );
        assert_eq!(
            registry.resolve("github").expect("github").config().display_name,
            "GitHub"
        );
    }

    #[test]
    fn register_replaces_existing_plugin() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.register(Arc::new(FakeProvider::new(ProviderKey::Gmail))).is_none());
        assert!(registry.register(Arc::new(FakeProvider::new(ProviderKey::Gmail))).is_some());
        assert_eq!(registry.keys().count(), 1);
    }
}
