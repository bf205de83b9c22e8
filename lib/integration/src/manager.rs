//! The lifecycle manager.
//!
//! [`Lifecycle`] is the context object every operation runs through. It is
//! built once by the process entry point and cloned into handlers, the
//! bootstrap worker and the scheduler.
//!
//! Operation boundaries follow one rule: provider, decryption and
//! provider-lookup failures are recorded (integration status, audit log)
//! and reported in the returned value. Only datastore failures, missing
//! rows and invalid requests come back as `Err`.

use crate::audit::{IntegrationLog, LogAction, LogLevel};
use crate::bootstrap::{BootstrapTask, JobQueue};
use crate::cipher::Cipher;
use crate::credential::{AdditionalData, Credential, CredentialKind, CredentialStatus, Secrets};
use crate::error::{LifecycleError, ProviderError};
use crate::events::{EventBus, LifecycleEvent};
use crate::integration::{Integration, IntegrationStatus};
use crate::job::SyncJob;
use crate::lifecycle::{StatusChange, StatusEvent, TransitionError};
use crate::provider::{ClientCredentials, Provider, ProviderConfig, ProviderRegistry, RevokeRequest};
use crate::settings::{ClientCredentialSet, LifecycleSettings};
use crate::store::{Datastore, RefreshWrite};
use crate::webhook::WebhookRegistration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tether_core::{CredentialId, IntegrationId, SyncJobId, UserId, WorkspaceId};
use tracing::instrument;
use ulid::Ulid;

/// Attempts at a compare-and-swap status write before giving up.
const TRANSITION_ATTEMPTS: usize = 3;

/// Input to [`Lifecycle::save_credential`].
#[derive(Debug, Clone, Deserialize)]
pub struct SaveCredential {
    pub user_id: UserId,
    /// Provider key.
    pub platform: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    pub kind: CredentialKind,
    #[serde(flatten)]
    pub secrets: Secrets,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub additional_data: AdditionalData,
}

/// Returned by [`Lifecycle::save_credential`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveReceipt {
    pub integration_id: IntegrationId,
    pub credential_id: CredentialId,
    pub job_id: SyncJobId,
}

/// Outcome of a refresh attempt on one integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RefreshResult {
    Refreshed { expires_at: Option<DateTime<Utc>> },
    /// The token is not close enough to expiry.
    NotDue,
    /// Refresh was due but there is no refresh token to use.
    NoRefreshToken,
    /// Another worker holds the refresh lease.
    Busy,
    /// The credential was deactivated or replaced while refreshing; the
    /// new tokens were discarded.
    Stale,
    /// The failure was recorded on the integration.
    Failed { error: String },
}

impl RefreshResult {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Returned by [`Lifecycle::deactivate_credential`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectReport {
    pub credential_id: CredentialId,
    pub integration_id: Option<IntegrationId>,
    pub provider_revoked: bool,
    pub revoke_error: Option<String>,
}

/// An integration with its latest job and webhook registration.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationView {
    #[serde(flatten)]
    pub integration: Integration,
    pub latest_job: Option<SyncJob>,
    pub webhook: Option<WebhookRegistration>,
}

/// A credential together with its decrypted secrets.
#[derive(Debug, Clone)]
pub struct OpenCredential {
    pub credential: Credential,
    pub secrets: Secrets,
}

/// Result of a compare-and-swap status transition.
#[derive(Debug)]
pub(crate) enum Transition {
    /// The integration as written.
    Applied(Integration),
    Rejected(TransitionError),
}

/// The credential lifecycle manager.
#[derive(Clone)]
pub struct Lifecycle {
    pub(crate) store: Arc<dyn Datastore>,
    pub(crate) cipher: Arc<Cipher>,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) clients: Arc<ClientCredentialSet>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) events: EventBus,
    pub(crate) settings: LifecycleSettings,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Creates a manager with default settings, no OAuth clients and a
    /// fresh event bus.
    #[must_use]
    pub fn new(
        store: Arc<dyn Datastore>,
        cipher: Arc<Cipher>,
        registry: Arc<ProviderRegistry>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            store,
            cipher,
            registry,
            clients: Arc::new(ClientCredentialSet::new()),
            queue,
            events: EventBus::default(),
            settings: LifecycleSettings::default(),
        }
    }

    #[must_use]
    pub fn with_clients(mut self, clients: ClientCredentialSet) -> Self {
        self.clients = Arc::new(clients);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stores a credential and queues its bootstrap.
    ///
    /// Each present secret is encrypted on its own. The integration is
    /// upserted as `pending` and the credential as active `connected` in
    /// one transaction together with a new bootstrap job. The operation
    /// ends once the job is queued.
    ///
    /// # Errors
    ///
    /// Unknown providers, empty secrets and datastore failures.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, platform = %request.platform))]
    pub async fn save_credential(
        &self,
        request: SaveCredential,
    ) -> Result<SaveReceipt, LifecycleError> {
        let provider = self.registry.resolve(&request.platform)?;
        let config = provider.config();
        if request.secrets.is_empty() {
            return Err(LifecycleError::InvalidState {
                reason: "no secret material supplied".to_string(),
            });
        }
        let encrypted = request.secrets.encrypt(&self.cipher)?;
        let platform = config.key.as_str();
        let display_name = request
            .display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| config.display_name.to_string());
        let now = Utc::now();

        let existing = self
            .store
            .find_integration_by_key(request.user_id, platform, request.workspace_id)
            .await?;
        let (integration, reconnect) = match existing {
            Some(mut integration) => {
                let change = integration.apply(&StatusEvent::Reconnected, now)?;
                integration.provider_name.clone_from(&display_name);
                (integration, Some(change))
            }
            None => (
                Integration::new(request.user_id, request.workspace_id, platform, &display_name),
                None,
            ),
        };

        let mut credential = Credential::new(
            request.user_id,
            platform,
            display_name,
            request.kind,
            encrypted,
        );
        credential.scopes = request.scopes;
        credential.expires_at = request.expires_at;
        credential.additional_data = request.additional_data;

        let saved = self.store.save_connection(&integration, &credential).await?;
        tracing::info!(
            integration_id = %saved.integration_id,
            job_id = %saved.job.id,
            "credential saved"
        );

        self.audit(IntegrationLog::success(
            request.user_id,
            platform,
            LogAction::CredentialSaved,
            format!("{} credential saved", config.display_name),
        ))
        .await;
        if let Some(change) = reconnect {
            let stored = Integration {
                id: saved.integration_id,
                ..integration
            };
            self.record_change(&stored, change).await;
        }

        self.enqueue(saved.integration_id, saved.job.id).await;
        self.events.publish(LifecycleEvent::CredentialSaved {
            user_id: request.user_id,
            platform: platform.to_string(),
            integration_id: saved.integration_id,
            job_id: saved.job.id,
        });

        Ok(SaveReceipt {
            integration_id: saved.integration_id,
            credential_id: saved.credential_id,
            job_id: saved.job.id,
        })
    }

    /// Returns the active credential, bumping its usage counter.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotFound`] when there is no active credential.
    #[instrument(skip(self))]
    pub async fn get_credential(
        &self,
        user_id: UserId,
        platform: &str,
    ) -> Result<Credential, LifecycleError> {
        let platform = normalize_platform(platform);
        self.store
            .touch_active_credential(user_id, &platform, Utc::now())
            .await?
            .ok_or_else(|| LifecycleError::not_found("credential", format!("{user_id}/{platform}")))
    }

    /// Returns the active credential with decrypted secrets.
    ///
    /// A credential that no longer decrypts is unusable: its integration
    /// is moved to `error` before the error is returned.
    ///
    /// # Errors
    ///
    /// Not found, decryption and datastore failures.
    #[instrument(skip(self))]
    pub async fn open_credential(
        &self,
        user_id: UserId,
        platform: &str,
    ) -> Result<OpenCredential, LifecycleError> {
        let credential = self.get_credential(user_id, platform).await?;
        match credential.secrets.decrypt(&self.cipher) {
            Ok(secrets) => Ok(OpenCredential {
                credential,
                secrets,
            }),
            Err(e) => {
                if let Some(integration) = self.linked_integration(&credential).await? {
                    self.fail_integration(&integration, LogAction::HealthCheck, &e.to_string())
                        .await?;
                }
                Err(e.into())
            }
        }
    }

    /// Disconnects a credential.
    ///
    /// Provider-side revocation is attempted first and is best-effort: its
    /// failure is logged and never blocks local deactivation. Deactivation
    /// drops any refresh lease, so a refresh racing with this call has its
    /// result discarded.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotFound`] when there is no active credential.
    #[instrument(skip(self))]
    pub async fn deactivate_credential(
        &self,
        user_id: UserId,
        platform: &str,
    ) -> Result<DisconnectReport, LifecycleError> {
        let platform = normalize_platform(platform);
        let not_found = || LifecycleError::not_found("credential", format!("{user_id}/{platform}"));
        let credential = self
            .store
            .find_active_credential(user_id, &platform)
            .await?
            .ok_or_else(not_found)?;

        let revoke = self.revoke_best_effort(&credential).await;
        match &revoke {
            Ok(()) => {
                self.audit(IntegrationLog::success(
                    user_id,
                    &platform,
                    LogAction::Revoke,
                    "provider access revoked",
                ))
                .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "provider revoke failed; deactivating locally");
                self.audit(
                    IntegrationLog::failure(
                        user_id,
                        &platform,
                        LogAction::Revoke,
                        "provider revoke failed",
                        e,
                    )
                    .with_level(LogLevel::Warn),
                )
                .await;
            }
        }

        let deactivated = self
            .store
            .deactivate_credential(user_id, &platform, Utc::now())
            .await?
            .ok_or_else(not_found)?;

        if let Some(integration_id) = deactivated.integration_id {
            self.store
                .deactivate_webhook_registration(integration_id)
                .await?;
            match self
                .transition_integration(integration_id, &StatusEvent::Revoked, |_| {})
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.audit(IntegrationLog::success(
            user_id,
            &platform,
            LogAction::Disconnect,
            "credential deactivated",
        ))
        .await;
        self.events.publish(LifecycleEvent::Disconnected {
            user_id,
            platform: platform.clone(),
            integration_id: deactivated.integration_id,
        });

        let (provider_revoked, revoke_error) = match revoke {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        };
        Ok(DisconnectReport {
            credential_id: deactivated.id,
            integration_id: deactivated.integration_id,
            provider_revoked,
            revoke_error,
        })
    }

    async fn revoke_best_effort(&self, credential: &Credential) -> Result<(), String> {
        let provider = self
            .registry
            .resolve(&credential.platform)
            .map_err(|e| e.to_string())?;
        let secrets = credential
            .secrets
            .decrypt(&self.cipher)
            .map_err(|e| e.to_string())?;
        let request = RevokeRequest {
            access_token: secrets.access_token,
            refresh_token: secrets.refresh_token,
            client: self.clients.get(provider.key()).cloned(),
        };
        let outcome = self
            .call_provider(provider.revoke_access(request))
            .await
            .map_err(|e| e.to_string())?;
        if outcome.success {
            Ok(())
        } else {
            Err(outcome
                .error
                .unwrap_or_else(|| "provider revoke failed".to_string()))
        }
    }

    /// Refreshes one integration's token on demand.
    ///
    /// With `force` the token is refreshed even when it is not yet due.
    ///
    /// # Errors
    ///
    /// Not found, refreshing an integration that is not `connected` or
    /// `error`, and datastore failures.
    #[instrument(skip(self))]
    pub async fn refresh_integration(
        &self,
        id: IntegrationId,
        force: bool,
    ) -> Result<RefreshResult, LifecycleError> {
        let integration = self
            .store
            .find_integration(id)
            .await?
            .ok_or_else(|| LifecycleError::not_found("integration", id))?;
        if !integration.is_sweepable() {
            return Err(LifecycleError::InvalidState {
                reason: format!("cannot refresh a {} integration", integration.status),
            });
        }
        self.refresh(&integration, force).await
    }

    /// Health check of one swept integration: refreshes it if due.
    ///
    /// # Errors
    ///
    /// Datastore failures only.
    #[instrument(skip(self, integration), fields(integration_id = %integration.id, provider = %integration.provider))]
    pub async fn check_integration(
        &self,
        integration: &Integration,
    ) -> Result<RefreshResult, LifecycleError> {
        self.refresh(integration, false).await
    }

    async fn refresh(
        &self,
        integration: &Integration,
        force: bool,
    ) -> Result<RefreshResult, LifecycleError> {
        let now = Utc::now();
        let Some(credential) = self
            .store
            .find_active_credential(integration.user_id, &integration.provider)
            .await?
        else {
            let message = "no active credential for integration";
            self.fail_integration(integration, LogAction::HealthCheck, message)
                .await?;
            return Ok(RefreshResult::Failed {
                error: message.to_string(),
            });
        };

        if !force && !credential.refresh_due(now, self.settings.refresh_threshold()) {
            return Ok(RefreshResult::NotDue);
        }
        if !credential.has_refresh_token() {
            tracing::warn!("refresh due but no refresh token stored");
            self.audit(IntegrationLog::skipped(
                integration.user_id,
                &integration.provider,
                LogAction::TokenRefresh,
                "refresh due but no refresh token stored",
            ))
            .await;
            return Ok(RefreshResult::NoRefreshToken);
        }

        let provider = match self.registry.resolve(&integration.provider) {
            Ok(provider) => provider,
            Err(e) => return self.refresh_failed(integration, e.to_string()).await,
        };
        let client = match self.client_for(provider.config()) {
            Ok(client) => client,
            Err(e) => return self.refresh_failed(integration, e.to_string()).await,
        };

        let owner = Ulid::new();
        let lease_until = now + self.settings.refresh_lease();
        let Some(leased) = self
            .store
            .acquire_refresh_lease(credential.id, owner, lease_until, now)
            .await?
        else {
            tracing::info!(credential_id = %credential.id, "refresh lease held elsewhere");
            return Ok(RefreshResult::Busy);
        };

        let write = match self.rotate(provider.as_ref(), &leased, &client).await {
            Ok(write) => write,
            Err(message) => {
                self.store
                    .release_refresh_lease(leased.id, owner, CredentialStatus::Error)
                    .await?;
                return self.refresh_failed(integration, message).await;
            }
        };

        if self.update_after_refresh(leased.id, owner, &write).await? {
            Ok(RefreshResult::Refreshed {
                expires_at: write.expires_at,
            })
        } else {
            tracing::warn!(credential_id = %leased.id, "refresh discarded: credential changed while refreshing");
            self.audit(IntegrationLog::skipped(
                integration.user_id,
                &integration.provider,
                LogAction::TokenRefresh,
                "refresh discarded: credential changed while refreshing",
            ))
            .await;
            Ok(RefreshResult::Stale)
        }
    }

    /// Decrypts the leased credential, calls the provider and re-encrypts
    /// the rotated tokens.
    async fn rotate(
        &self,
        provider: &dyn Provider,
        leased: &Credential,
        client: &ClientCredentials,
    ) -> Result<RefreshWrite, String> {
        let secrets = leased
            .secrets
            .decrypt(&self.cipher)
            .map_err(|e| e.to_string())?;
        let Some(refresh_token) = secrets.refresh_token.clone().filter(|t| !t.is_empty()) else {
            return Err("no refresh token stored".to_string());
        };
        let outcome = self
            .call_provider(provider.refresh_token(&refresh_token, client))
            .await
            .map_err(|e| e.to_string())?;
        if !outcome.success {
            return Err(outcome
                .error
                .unwrap_or_else(|| "token refresh failed".to_string()));
        }
        let Some(access_token) = outcome.access_token.filter(|t| !t.is_empty()) else {
            return Err("provider returned no access token".to_string());
        };
        let rotated = Secrets {
            access_token: Some(access_token),
            refresh_token: outcome.refresh_token.or(Some(refresh_token)),
            ..Secrets::default()
        };
        let encrypted = rotated.encrypt(&self.cipher).map_err(|e| e.to_string())?;
        Ok(RefreshWrite::new(encrypted, outcome.expires_at, Utc::now()))
    }

    async fn refresh_failed(
        &self,
        integration: &Integration,
        message: String,
    ) -> Result<RefreshResult, LifecycleError> {
        tracing::warn!(error = %message, "token refresh failed");
        self.fail_integration(integration, LogAction::TokenRefresh, &message)
            .await?;
        self.events.publish(LifecycleEvent::RefreshFailed {
            integration_id: integration.id,
            error: message.clone(),
        });
        Ok(RefreshResult::Failed { error: message })
    }

    /// Persists rotated tokens for a credential whose refresh lease is held
    /// by `owner`, then marks the owning integration healthy.
    ///
    /// Returns false, writing nothing, when the lease was lost to a
    /// deactivation or another refresher.
    ///
    /// # Errors
    ///
    /// Datastore failures.
    #[instrument(skip(self, write))]
    pub async fn update_after_refresh(
        &self,
        credential_id: CredentialId,
        owner: Ulid,
        write: &RefreshWrite,
    ) -> Result<bool, LifecycleError> {
        let Some(credential) = self.store.apply_refresh(credential_id, owner, write).await? else {
            return Ok(false);
        };

        if let Some(integration_id) = credential.integration_id {
            let interval = self.settings.sync_interval();
            let outcome = self
                .transition_integration(integration_id, &StatusEvent::RefreshSucceeded, |i| {
                    i.next_sync_at = i.last_sync_at.map(|at| at + interval);
                })
                .await;
            match outcome {
                Ok(Transition::Rejected(e)) => {
                    tracing::warn!(%integration_id, error = %e, "refreshed credential of an inactive integration");
                }
                Ok(Transition::Applied(_)) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.audit(IntegrationLog::success(
            credential.user_id,
            &credential.platform,
            LogAction::TokenRefresh,
            "access token refreshed",
        ))
        .await;
        if let Some(integration_id) = credential.integration_id {
            self.events.publish(LifecycleEvent::Refreshed {
                integration_id,
                expires_at: credential.expires_at,
            });
        }
        Ok(true)
    }

    /// Records a failed operation on an integration: status `error`,
    /// health penalty, message kept verbatim and an audit entry.
    ///
    /// # Errors
    ///
    /// Not found and datastore failures.
    #[instrument(skip(self))]
    pub async fn record_failure(
        &self,
        integration_id: IntegrationId,
        action: LogAction,
        message: &str,
    ) -> Result<(), LifecycleError> {
        let integration = self
            .store
            .find_integration(integration_id)
            .await?
            .ok_or_else(|| LifecycleError::not_found("integration", integration_id))?;
        self.fail_integration(&integration, action, message).await
    }

    pub(crate) async fn fail_integration(
        &self,
        integration: &Integration,
        action: LogAction,
        message: &str,
    ) -> Result<(), LifecycleError> {
        let event = StatusEvent::OperationFailed {
            message: message.to_string(),
        };
        match self
            .transition_integration(integration.id, &event, |_| {})
            .await
        {
            Ok(Transition::Applied(_)) => {}
            Ok(Transition::Rejected(e)) => {
                tracing::info!(integration_id = %integration.id, error = %e, "failure not applied to integration");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.audit(IntegrationLog::failure(
            integration.user_id,
            &integration.provider,
            action,
            format!("{} failed", action.as_str()),
            &message,
        ))
        .await;
        Ok(())
    }

    /// Queues a fresh bootstrap for an integration ("fix connection").
    ///
    /// # Errors
    ///
    /// Not found; disconnected integrations, integrations without an
    /// active credential and integrations with a bootstrap already running
    /// are refused. A running job older than the stale bound does not
    /// count as running.
    #[instrument(skip(self))]
    pub async fn retry_bootstrap(&self, id: IntegrationId) -> Result<SyncJob, LifecycleError> {
        let integration = self
            .store
            .find_integration(id)
            .await?
            .ok_or_else(|| LifecycleError::not_found("integration", id))?;
        if integration.status == IntegrationStatus::Disconnected {
            return Err(LifecycleError::InvalidState {
                reason: "integration is disconnected; save a new credential to reconnect"
                    .to_string(),
            });
        }
        let stale_before = Utc::now() - self.settings.bootstrap_stale_after();
        if self.store.has_running_job(id, stale_before).await? {
            return Err(LifecycleError::InvalidState {
                reason: "a bootstrap is already running for this integration".to_string(),
            });
        }
        if self
            .store
            .find_active_credential(integration.user_id, &integration.provider)
            .await?
            .is_none()
        {
            return Err(LifecycleError::InvalidState {
                reason: "integration has no active credential".to_string(),
            });
        }

        let job = SyncJob::bootstrap(id);
        self.store.insert_job(&job).await?;
        self.audit(IntegrationLog::success(
            integration.user_id,
            &integration.provider,
            LogAction::BootstrapRetry,
            "bootstrap retry queued",
        ))
        .await;
        self.enqueue(id, job.id).await;
        Ok(job)
    }

    /// Deletes an integration. Its credential stays (unlinked), as do its
    /// jobs and audit history.
    ///
    /// # Errors
    ///
    /// Not found and datastore failures.
    #[instrument(skip(self))]
    pub async fn delete_integration(&self, id: IntegrationId) -> Result<(), LifecycleError> {
        let integration = self
            .store
            .find_integration(id)
            .await?
            .ok_or_else(|| LifecycleError::not_found("integration", id))?;
        if !self.store.delete_integration(id).await? {
            return Err(LifecycleError::not_found("integration", id));
        }
        self.audit(IntegrationLog::success(
            integration.user_id,
            &integration.provider,
            LogAction::IntegrationDeleted,
            "integration deleted",
        ))
        .await;
        self.events
            .publish(LifecycleEvent::IntegrationDeleted { integration_id: id });
        Ok(())
    }

    /// Lists a user's integrations.
    ///
    /// # Errors
    ///
    /// Datastore failures.
    pub async fn list_integrations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Integration>, LifecycleError> {
        Ok(self.store.list_integrations(user_id).await?)
    }

    /// Loads an integration with its latest job and webhook.
    ///
    /// # Errors
    ///
    /// Not found and datastore failures.
    pub async fn integration_view(
        &self,
        id: IntegrationId,
    ) -> Result<IntegrationView, LifecycleError> {
        let integration = self
            .store
            .find_integration(id)
            .await?
            .ok_or_else(|| LifecycleError::not_found("integration", id))?;
        let latest_job = self.store.latest_job(id).await?;
        let webhook = self.store.find_webhook_for_integration(id).await?;
        Ok(IntegrationView {
            integration,
            latest_job,
            webhook,
        })
    }

    /// Most recent audit entries for a user.
    ///
    /// # Errors
    ///
    /// Datastore failures.
    pub async fn recent_logs(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<IntegrationLog>, LifecycleError> {
        Ok(self.store.recent_logs(user_id, limit).await?)
    }

    /// Applies `event` to an integration with a compare-and-swap on its
    /// status, retrying when another writer got there first. `extra` runs
    /// after the event is applied and before the write.
    pub(crate) async fn transition_integration<F>(
        &self,
        id: IntegrationId,
        event: &StatusEvent,
        mut extra: F,
    ) -> Result<Transition, LifecycleError>
    where
        F: FnMut(&mut Integration) + Send,
    {
        for _ in 0..TRANSITION_ATTEMPTS {
            let mut integration = self
                .store
                .find_integration(id)
                .await?
                .ok_or_else(|| LifecycleError::not_found("integration", id))?;
            let expected = integration.status;
            let change = match integration.apply(event, Utc::now()) {
                Ok(change) => change,
                Err(e) => return Ok(Transition::Rejected(e)),
            };
            extra(&mut integration);
            if self.store.update_integration(&integration, expected).await? {
                self.record_change(&integration, change).await;
                return Ok(Transition::Applied(integration));
            }
            tracing::debug!(integration_id = %id, "integration changed concurrently; retrying");
        }
        Err(LifecycleError::InvalidState {
            reason: format!(
                "integration {id} kept changing; {} not applied",
                event.name()
            ),
        })
    }

    /// Writes the status-change log row and notification.
    pub(crate) async fn record_change(&self, integration: &Integration, change: StatusChange) {
        if !change.is_change() {
            return;
        }
        tracing::info!(
            integration_id = %integration.id,
            from = %change.from,
            to = %change.to,
            "integration status changed"
        );
        let level = if change.to == IntegrationStatus::Error {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.audit(
            IntegrationLog::success(
                integration.user_id,
                &integration.provider,
                LogAction::StatusChange,
                format!("status {} -> {}", change.from, change.to),
            )
            .with_level(level),
        )
        .await;
        self.events.publish(LifecycleEvent::StatusChanged {
            integration_id: integration.id,
            from: change.from,
            to: change.to,
        });
    }

    /// Appends an audit row. A failed append is logged, not propagated, so
    /// it never masks the outcome of the operation being audited.
    pub(crate) async fn audit(&self, log: IntegrationLog) {
        if let Err(e) = self.store.append_log(&log).await {
            tracing::error!(action = log.action.as_str(), error = %e, "failed to append integration log");
        }
    }

    pub(crate) async fn enqueue(&self, integration_id: IntegrationId, job_id: SyncJobId) {
        let task = BootstrapTask {
            job_id,
            integration_id,
        };
        if let Err(e) = self.queue.enqueue(task).await {
            // The pending job row survives and is picked up on the next
            // worker start.
            tracing::warn!(%job_id, error = %e, "bootstrap job not queued");
        }
    }

    /// Bounds a provider call by the configured timeout.
    pub(crate) async fn call_provider<T>(
        &self,
        call: impl Future<Output = T> + Send,
    ) -> Result<T, ProviderError> {
        tokio::time::timeout(self.settings.provider_timeout(), call)
            .await
            .map_err(|_| ProviderError::Timeout {
                seconds: self.settings.provider_timeout_secs,
            })
    }

    pub(crate) fn client_for(
        &self,
        config: &ProviderConfig,
    ) -> Result<ClientCredentials, ProviderError> {
        if !config.needs_client_credentials() {
            return Ok(ClientCredentials {
                client_id: String::new(),
                client_secret: String::new(),
            });
        }
        self.clients
            .get(config.key)
            .cloned()
            .ok_or(ProviderError::MissingClientCredentials {
                provider: config.key,
            })
    }

    async fn linked_integration(
        &self,
        credential: &Credential,
    ) -> Result<Option<Integration>, LifecycleError> {
        match credential.integration_id {
            Some(id) => Ok(self.store.find_integration(id).await?),
            None => Ok(None),
        }
    }
}

fn normalize_platform(platform: &str) -> String {
    platform.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogStatus;
    use crate::testing::{FakeRefresh, FakeRevoke, Harness};
    use chrono::Duration;

    #[tokio::test]
    async fn connect_scenario_goes_pending_then_connected() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h
            .lifecycle
            .save_credential(h.oauth_request(user, "tok1", None, None))
            .await
            .expect("save");

        let integration = h.integration(receipt.integration_id).await;
        assert_eq!(integration.status, IntegrationStatus::Pending);
        assert_eq!(h.queue.tasks().await.len(), 1);

        h.lifecycle.run_bootstrap(receipt.job_id).await.expect("bootstrap");
        let integration = h.integration(receipt.integration_id).await;
        assert_eq!(integration.status, IntegrationStatus::Connected);
        assert_eq!(integration.health_score, 100);
    }

    #[tokio::test]
    async fn saving_twice_keeps_one_active_credential() {
        let h = Harness::new();
        let user = UserId::new();
        let first = h
            .lifecycle
            .save_credential(h.oauth_request(user, "tok1", None, None))
            .await
            .expect("first");
        let second = h
            .lifecycle
            .save_credential(h.oauth_request(user, "tok2", None, None))
            .await
            .expect("second");

        assert_eq!(first.credential_id, second.credential_id);
        assert_eq!(first.integration_id, second.integration_id);
        assert_eq!(h.store.credential_count().await, 1);
        let open = h
            .lifecycle
            .open_credential(user, "slack")
            .await
            .expect("open");
        assert_eq!(open.secrets.access_token.as_deref(), Some("tok2"));
    }

    #[tokio::test]
    async fn absent_secret_fields_stay_null() {
        let h = Harness::new();
        let user = UserId::new();
        h.lifecycle
            .save_credential(h.oauth_request(user, "tok1", None, None))
            .await
            .expect("save");
        let credential = h.lifecycle.get_credential(user, "slack").await.expect("get");
        assert!(credential.secrets.access_token.is_some());
        assert!(credential.secrets.refresh_token.is_none());
        assert!(credential.secrets.api_key.is_none());
        assert_ne!(credential.secrets.access_token.as_deref(), Some("tok1"));
    }

    #[tokio::test]
    async fn unknown_platform_is_provider_not_found() {
        let h = Harness::new();
        let mut request = h.oauth_request(UserId::new(), "tok1", None, None);
        request.platform = "myspace".to_string();
        let err = h.lifecycle.save_credential(request).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn empty_secrets_are_rejected() {
        let h = Harness::new();
        let mut request = h.oauth_request(UserId::new(), "", None, None);
        request.secrets = Secrets::default();
        let err = h.lifecycle.save_credential(request).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn get_credential_touches_usage() {
        let h = Harness::new();
        let user = UserId::new();
        h.connect(user, "tok1", None, None).await;
        h.lifecycle.get_credential(user, "slack").await.expect("get");
        let credential = h.lifecycle.get_credential(user, "Slack").await.expect("get");
        assert_eq!(credential.usage_count, 2);
        assert!(credential.last_used_at.is_some());
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let h = Harness::new();
        let err = h
            .lifecycle
            .get_credential(UserId::new(), "slack")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn disconnect_survives_failed_revoke() {
        let h = Harness::new();
        h.provider.set_revoke(FakeRevoke::Fail("token_revoked".to_string()));
        let user = UserId::new();
        let receipt = h.connect(user, "tok1", None, None).await;

        let report = h
            .lifecycle
            .deactivate_credential(user, "slack")
            .await
            .expect("disconnect");
        assert!(!report.provider_revoked);
        assert_eq!(report.revoke_error.as_deref(), Some("token_revoked"));

        let credential = h
            .store
            .find_credential(report.credential_id)
            .await
            .expect("find")
            .expect("kept");
        assert!(!credential.active);
        assert_eq!(credential.status, CredentialStatus::Disconnected);
        assert_eq!(
            h.integration(receipt.integration_id).await.status,
            IntegrationStatus::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_with_revoke_timeout_still_disconnects_and_logs() {
        let h = Harness::new();
        h.provider.set_revoke(FakeRevoke::Hang);
        let user = UserId::new();
        let receipt = h.connect(user, "tok1", None, None).await;

        let report = h
            .lifecycle
            .deactivate_credential(user, "slack")
            .await
            .expect("disconnect");
        assert!(
            report
                .revoke_error
                .as_deref()
                .is_some_and(|e| e.contains("timed out"))
        );
        assert_eq!(
            h.integration(receipt.integration_id).await.status,
            IntegrationStatus::Disconnected
        );
        let logs = h.store.logs().await;
        assert!(logs.iter().any(|l| l.action == LogAction::Revoke
            && l.status == LogStatus::Failure
            && l.level == LogLevel::Warn));
        assert!(h.lifecycle.get_credential(user, "slack").await.is_err());
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_starts_pending_cycle() {
        let h = Harness::new();
        let user = UserId::new();
        let first = h.connect(user, "tok1", None, None).await;
        h.lifecycle
            .deactivate_credential(user, "slack")
            .await
            .expect("disconnect");

        let second = h
            .lifecycle
            .save_credential(h.oauth_request(user, "tok2", None, None))
            .await
            .expect("reconnect");
        assert_eq!(first.integration_id, second.integration_id);
        let integration = h.integration(second.integration_id).await;
        assert_eq!(integration.status, IntegrationStatus::Pending);
        assert_eq!(integration.health_score, 100);
        assert!(h.lifecycle.get_credential(user, "slack").await.expect("active").active);
    }

    #[tokio::test]
    async fn forced_refresh_rotates_tokens() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h
            .connect(user, "tok1", Some("ref1"), Some(Utc::now() + Duration::days(1)))
            .await;

        let result = h
            .lifecycle
            .refresh_integration(receipt.integration_id, true)
            .await
            .expect("refresh");
        assert!(matches!(result, RefreshResult::Refreshed { .. }));

        let open = h.lifecycle.open_credential(user, "slack").await.expect("open");
        assert_eq!(open.secrets.access_token.as_deref(), Some("fresh-ref1"));
        assert_eq!(open.secrets.refresh_token.as_deref(), Some("ref1"));
        assert!(open.credential.last_refreshed_at.is_some());
        let integration = h.integration(receipt.integration_id).await;
        assert_eq!(
            integration.next_sync_at,
            integration
                .last_sync_at
                .map(|at| at + h.lifecycle.settings().sync_interval())
        );
    }

    #[tokio::test]
    async fn refresh_not_due_leaves_credential_alone() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h
            .connect(user, "tok1", Some("ref1"), Some(Utc::now() + Duration::days(1)))
            .await;
        let result = h
            .lifecycle
            .refresh_integration(receipt.integration_id, false)
            .await
            .expect("refresh");
        assert_eq!(result, RefreshResult::NotDue);
        assert_eq!(h.provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn failed_refresh_penalizes_health_then_success_restores_it() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h
            .connect(user, "tok1", Some("ref1"), Some(Utc::now() + Duration::minutes(5)))
            .await;

        h.provider.set_refresh(FakeRefresh::Fail("invalid_grant".to_string()));
        let result = h
            .lifecycle
            .refresh_integration(receipt.integration_id, false)
            .await
            .expect("refresh");
        assert_eq!(
            result,
            RefreshResult::Failed {
                error: "invalid_grant".to_string()
            }
        );
        let integration = h.integration(receipt.integration_id).await;
        assert_eq!(integration.status, IntegrationStatus::Error);
        assert_eq!(integration.health_score, 90);
        assert_eq!(integration.error_message.as_deref(), Some("invalid_grant"));
        let credential = h
            .store
            .find_active_credential(user, "slack")
            .await
            .expect("find")
            .expect("active");
        assert!(credential.lease_owner.is_none());

        h.provider.set_refresh(FakeRefresh::succeed());
        h.lifecycle
            .refresh_integration(receipt.integration_id, false)
            .await
            .expect("refresh");
        let integration = h.integration(receipt.integration_id).await;
        assert_eq!(integration.status, IntegrationStatus::Connected);
        assert_eq!(integration.health_score, 100);
        assert!(integration.error_message.is_none());
    }

    #[tokio::test]
    async fn held_lease_makes_refresh_busy() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h
            .connect(user, "tok1", Some("ref1"), Some(Utc::now() + Duration::minutes(5)))
            .await;
        let credential = h.lifecycle.get_credential(user, "slack").await.expect("get");
        let now = Utc::now();
        h.store
            .acquire_refresh_lease(credential.id, Ulid::new(), now + Duration::minutes(2), now)
            .await
            .expect("lease")
            .expect("acquired");

        let result = h
            .lifecycle
            .refresh_integration(receipt.integration_id, false)
            .await
            .expect("refresh");
        assert_eq!(result, RefreshResult::Busy);
        assert_eq!(h.provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn refresh_after_lost_lease_is_discarded() {
        let h = Harness::new();
        let user = UserId::new();
        h.connect(user, "tok1", Some("ref1"), None).await;
        let credential = h.lifecycle.get_credential(user, "slack").await.expect("get");
        let now = Utc::now();
        let owner = Ulid::new();
        h.store
            .acquire_refresh_lease(credential.id, owner, now + Duration::minutes(2), now)
            .await
            .expect("lease");
        h.lifecycle
            .deactivate_credential(user, "slack")
            .await
            .expect("disconnect");

        let write = RefreshWrite {
            access_token: Some("late".to_string()),
            refresh_token: None,
            expires_at: None,
            refreshed_at: now,
        };
        assert!(!h
            .lifecycle
            .update_after_refresh(credential.id, owner, &write)
            .await
            .expect("update"));
    }

    #[tokio::test]
    async fn refreshing_a_pending_integration_is_invalid() {
        let h = Harness::new();
        let receipt = h
            .lifecycle
            .save_credential(h.oauth_request(UserId::new(), "tok1", Some("ref1"), None))
            .await
            .expect("save");
        let err = h
            .lifecycle
            .refresh_integration(receipt.integration_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn missing_client_credentials_fail_the_refresh() {
        let h = Harness::without_clients();
        let user = UserId::new();
        let receipt = h
            .connect(user, "tok1", Some("ref1"), Some(Utc::now() + Duration::minutes(5)))
            .await;
        let result = h
            .lifecycle
            .refresh_integration(receipt.integration_id, false)
            .await
            .expect("refresh");
        assert!(result.is_failure());
        assert_eq!(h.provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn open_credential_with_corrupt_secret_moves_integration_to_error() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h.connect(user, "tok1", None, None).await;
        h.corrupt_access_token(user).await;

        let err = h.lifecycle.open_credential(user, "slack").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Decryption(_)));
        let integration = h.integration(receipt.integration_id).await;
        assert_eq!(integration.status, IntegrationStatus::Error);
        assert!(
            integration
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("decryption failed"))
        );
    }

    #[tokio::test]
    async fn retry_bootstrap_creates_new_job() {
        let h = Harness::new();
        h.provider.fail_bootstrap("invalid_auth");
        let user = UserId::new();
        let receipt = h.connect(user, "tok1", None, None).await;
        assert_eq!(
            h.integration(receipt.integration_id).await.status,
            IntegrationStatus::Error
        );

        h.provider.succeed_bootstrap();
        let job = h
            .lifecycle
            .retry_bootstrap(receipt.integration_id)
            .await
            .expect("retry");
        assert_ne!(job.id, receipt.job_id);
        h.lifecycle.run_bootstrap(job.id).await.expect("bootstrap");
        assert_eq!(
            h.integration(receipt.integration_id).await.status,
            IntegrationStatus::Connected
        );
        let first = h.store.find_job(receipt.job_id).await.expect("find").expect("job");
        assert_eq!(first.status, crate::job::JobStatus::Failed);
    }

    #[tokio::test]
    async fn retry_bootstrap_refused_for_disconnected_integration() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h.connect(user, "tok1", None, None).await;
        h.lifecycle
            .deactivate_credential(user, "slack")
            .await
            .expect("disconnect");
        let err = h
            .lifecycle
            .retry_bootstrap(receipt.integration_id)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn delete_integration_keeps_history() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h.connect(user, "tok1", None, None).await;
        h.lifecycle
            .delete_integration(receipt.integration_id)
            .await
            .expect("delete");

        assert!(
            h.lifecycle
                .integration_view(receipt.integration_id)
                .await
                .unwrap_err()
                .is_not_found()
        );
        let credential = h.lifecycle.get_credential(user, "slack").await.expect("kept");
        assert_eq!(credential.integration_id, None);
        assert!(h.store.find_job(receipt.job_id).await.expect("find").is_some());
        assert!(
            h.store
                .logs()
                .await
                .iter()
                .any(|l| l.action == LogAction::IntegrationDeleted)
        );
    }

    #[tokio::test]
    async fn status_changes_are_logged_and_published() {
        let h = Harness::new();
        let mut events = h.lifecycle.events().subscribe();
        let user = UserId::new();
        h.connect(user, "tok1", None, None).await;

        let logs = h.store.logs().await;
        assert!(
            logs.iter()
                .any(|l| l.action == LogAction::StatusChange && l.message == "status pending -> connected")
        );
        let mut saw_change = false;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                LifecycleEvent::StatusChanged {
                    to: IntegrationStatus::Connected,
                    ..
                }
            ) {
                saw_change = true;
            }
        }
        assert!(saw_change);
    }

    #[tokio::test]
    async fn integration_view_includes_latest_job() {
        let h = Harness::new();
        let user = UserId::new();
        let receipt = h.connect(user, "tok1", None, None).await;
        let view = h
            .lifecycle
            .integration_view(receipt.integration_id)
            .await
            .expect("view");
        assert_eq!(view.latest_job.map(|j| j.id), Some(receipt.job_id));
        assert_eq!(h.lifecycle.list_integrations(user).await.expect("list").len(), 1);
    }
}
