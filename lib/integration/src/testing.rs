//! Test doubles and fixtures, enabled with the `test-utils` feature.

use crate::bootstrap::{BootstrapTask, JobQueue};
use crate::cipher::Cipher;
use crate::credential::{CredentialKind, EncryptedSecrets, Secrets};
use crate::error::QueueClosed;
use crate::integration::Integration;
use crate::manager::{Lifecycle, SaveCredential, SaveReceipt};
use crate::provider::{
    AuthType, BootstrapOutcome, BootstrapRequest, ClientCredentials, Provider, ProviderConfig,
    ProviderKey, ProviderRegistry, RefreshOutcome, RevokeOutcome, RevokeRequest, WebhookGrant,
};
use crate::settings::ClientCredentialSet;
use crate::store::{Datastore, MemoryStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tether_core::{IntegrationId, UserId};

/// Scripted behaviour of [`FakeProvider::refresh_token`].
#[derive(Debug, Clone)]
pub enum FakeRefresh {
    /// Returns `fresh-<refresh token>` expiring after the given duration.
    Succeed { expires_in: Duration },
    Fail(String),
    /// Never completes.
    Hang,
    /// Panics inside the call.
    Panic,
}

impl FakeRefresh {
    #[must_use]
    pub fn succeed() -> Self {
        Self::Succeed {
            expires_in: Duration::hours(1),
        }
    }
}

/// Scripted behaviour of [`FakeProvider::revoke_access`].
#[derive(Debug, Clone)]
pub enum FakeRevoke {
    Succeed,
    Fail(String),
    Hang,
}

#[derive(Debug)]
struct Script {
    bootstrap: BootstrapOutcome,
    refresh: FakeRefresh,
    refresh_by_token: HashMap<String, FakeRefresh>,
    revoke: FakeRevoke,
}

/// A provider whose answers are set by the test.
#[derive(Debug)]
pub struct FakeProvider {
    config: ProviderConfig,
    script: Mutex<Script>,
    bootstrap_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

impl FakeProvider {
    /// An OAuth provider with refresh support registered under `key`.
    #[must_use]
    pub fn new(key: ProviderKey) -> Self {
        let config = ProviderConfig {
            key,
            display_name: "Fake",
            auth_type: AuthType::Oauth2,
            supports_refresh: true,
            supports_webhooks: false,
            default_scopes: &["read"],
            required_scopes: &[],
            base_api_url: "http://fake.invalid",
            authorize_url: Some("https://fake.invalid/authorize"),
            token_url: Some("https://fake.invalid/token"),
            authorize_params: &[],
            webhook_id_header: None,
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert("account".to_string(), serde_json::json!("fake"));
        Self {
            config,
            script: Mutex::new(Script {
                bootstrap: BootstrapOutcome::success(metadata),
                refresh: FakeRefresh::succeed(),
                refresh_by_token: HashMap::new(),
                revoke: FakeRevoke::Succeed,
            }),
            bootstrap_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
        }
    }

    /// Declares webhook support with deliveries identified by `header`.
    #[must_use]
    pub fn with_webhook_header(mut self, header: &'static str) -> Self {
        self.config.supports_webhooks = true;
        self.config.webhook_id_header = Some(header);
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn fail_bootstrap(&self, error: &str) {
        self.script().bootstrap = BootstrapOutcome::failure(error);
    }

    pub fn succeed_bootstrap(&self) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("account".to_string(), serde_json::json!("fake"));
        self.script().bootstrap = BootstrapOutcome::success(metadata);
    }

    /// Makes successful bootstraps return a webhook grant.
    pub fn grant_webhook(&self, webhook_id: &str, secret: &str) {
        let mut script = self.script();
        let outcome = std::mem::take(&mut script.bootstrap);
        script.bootstrap = outcome.with_webhook(WebhookGrant {
            webhook_id: webhook_id.to_string(),
            webhook_secret: Some(secret.to_string()),
            webhook_url: "http://localhost:3000/webhooks/github".to_string(),
            event_types: vec!["push".to_string()],
        });
    }

    pub fn set_refresh(&self, behaviour: FakeRefresh) {
        self.script().refresh = behaviour;
    }

    /// Overrides the refresh behaviour for one refresh token.
    pub fn set_refresh_for(&self, refresh_token: &str, behaviour: FakeRefresh) {
        self.script()
            .refresh_by_token
            .insert(refresh_token.to_string(), behaviour);
    }

    pub fn set_revoke(&self, behaviour: FakeRevoke) {
        self.script().revoke = behaviour;
    }

    pub fn bootstrap_calls(&self) -> usize {
        self.bootstrap_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn bootstrap(&self, _request: BootstrapRequest) -> BootstrapOutcome {
        self.bootstrap_calls.fetch_add(1, Ordering::SeqCst);
        self.script().bootstrap.clone()
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        _client: &ClientCredentials,
    ) -> RefreshOutcome {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = {
            let script = self.script();
            script
                .refresh_by_token
                .get(refresh_token)
                .cloned()
                .unwrap_or_else(|| script.refresh.clone())
        };
        match behaviour {
            FakeRefresh::Succeed { expires_in } => RefreshOutcome::success(
                format!("fresh-{refresh_token}"),
                None,
                Some(Utc::now() + expires_in),
            ),
            FakeRefresh::Fail(error) => RefreshOutcome::failure(error),
            FakeRefresh::Hang => std::future::pending().await,
            FakeRefresh::Panic => panic!("scripted refresh panic"),
        }
    }

    async fn revoke_access(&self, _request: RevokeRequest) -> RevokeOutcome {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.script().revoke.clone();
        match behaviour {
            FakeRevoke::Succeed => RevokeOutcome::success(),
            FakeRevoke::Fail(error) => RevokeOutcome::failure(error),
            FakeRevoke::Hang => std::future::pending().await,
        }
    }
}

/// A queue that only records what was enqueued.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    tasks: tokio::sync::Mutex<Vec<BootstrapTask>>,
}

impl RecordingQueue {
    pub async fn tasks(&self) -> Vec<BootstrapTask> {
        self.tasks.lock().await.clone()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, task: BootstrapTask) -> Result<(), QueueClosed> {
        self.tasks.lock().await.push(task);
        Ok(())
    }
}

/// Fixed key for tests.
#[must_use]
pub fn test_cipher() -> Cipher {
    Cipher::from_key_bytes(&[7u8; 32]).expect("32-byte key")
}

/// A lifecycle over [`MemoryStore`] and a single [`FakeProvider`].
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub queue: Arc<RecordingQueue>,
    pub lifecycle: Lifecycle,
}

impl Harness {
    /// A harness with a Slack-keyed fake provider.
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(FakeProvider::new(ProviderKey::Slack))
    }

    #[must_use]
    pub fn with_provider(provider: FakeProvider) -> Self {
        Self::build(provider, true)
    }

    /// A harness with no OAuth client credentials configured.
    #[must_use]
    pub fn without_clients() -> Self {
        Self::build(FakeProvider::new(ProviderKey::Slack), false)
    }

    fn build(provider: FakeProvider, with_clients: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let queue = Arc::new(RecordingQueue::default());
        let key = provider.config().key;
        let registry = ProviderRegistry::new().with(provider.clone());
        let clients = if with_clients {
            ClientCredentialSet::new().with(key, "client-id", "client-secret")
        } else {
            ClientCredentialSet::new()
        };
        let lifecycle = Lifecycle::new(
            store.clone(),
            Arc::new(test_cipher()),
            Arc::new(registry),
            queue.clone(),
        )
        .with_clients(clients);
        Self {
            store,
            provider,
            queue,
            lifecycle,
        }
    }

    #[must_use]
    pub fn cipher(&self) -> &Cipher {
        &self.lifecycle.cipher
    }

    /// An OAuth save request for the harness provider.
    #[must_use]
    pub fn oauth_request(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> SaveCredential {
        let mut secrets = Secrets::access_token(access_token);
        if let Some(refresh) = refresh_token {
            secrets = secrets.with_refresh_token(refresh);
        }
        SaveCredential {
            user_id,
            platform: self.provider.config().key.as_str().to_string(),
            display_name: None,
            workspace_id: None,
            kind: CredentialKind::Oauth,
            secrets,
            scopes: vec!["read".to_string()],
            expires_at,
            additional_data: serde_json::Map::new(),
        }
    }

    /// Saves a credential and runs its bootstrap.
    ///
    /// # Panics
    ///
    /// When saving or bootstrapping errors.
    pub async fn connect(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> SaveReceipt {
        let receipt = self
            .lifecycle
            .save_credential(self.oauth_request(user_id, access_token, refresh_token, expires_at))
            .await
            .expect("save credential");
        self.lifecycle
            .run_bootstrap(receipt.job_id)
            .await
            .expect("run bootstrap");
        receipt
    }

    /// # Panics
    ///
    /// When the integration does not exist.
    pub async fn integration(&self, id: IntegrationId) -> Integration {
        self.store
            .find_integration(id)
            .await
            .expect("find integration")
            .expect("integration exists")
    }

    /// Replaces the stored access token with bytes no key decrypts.
    ///
    /// # Panics
    ///
    /// When the user has no active credential.
    pub async fn corrupt_access_token(&self, user_id: UserId) {
        self.corrupt(user_id, |secrets| &mut secrets.access_token).await;
    }

    /// Replaces the stored refresh token with ciphertext that does not
    /// decrypt.
    pub async fn corrupt_refresh_token(&self, user_id: UserId) {
        self.corrupt(user_id, |secrets| &mut secrets.refresh_token).await;
    }

    async fn corrupt(
        &self,
        user_id: UserId,
        field: impl FnOnce(&mut EncryptedSecrets) -> &mut Option<String>,
    ) {
        let mut credential = self
            .store
            .find_active_credential(user_id, self.provider.config().key.as_str())
            .await
            .expect("find credential")
            .expect("active credential");
        *field(&mut credential.secrets) = Some("bm90IGEgcmVhbCBjaXBoZXJ0ZXh0IGF0IGFsbA==".to_string());
        self.store.put_credential(credential).await;
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
