//! Datastore contract.
//!
//! The datastore is the single source of truth and the arbitration point
//! for concurrent work. Methods that arbitrate (`acquire_refresh_lease`,
//! `apply_refresh`, `update_integration`, `start_job`) are conditional
//! updates and report whether they won.

mod memory;

pub use memory::MemoryStore;

use crate::audit::IntegrationLog;
use crate::credential::{Credential, CredentialStatus, EncryptedSecrets};
use crate::error::StoreError;
use crate::integration::{Integration, IntegrationStatus};
use crate::job::SyncJob;
use crate::oauth::OAuthState;
use crate::webhook::{WebhookEvent, WebhookRegistration};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tether_core::{
    CredentialId, IntegrationId, SyncJobId, UserId, WebhookRegistrationId, WorkspaceId,
};
use ulid::Ulid;

/// Ids written by [`Datastore::save_connection`].
///
/// On upsert the stored rows keep their existing ids, so these may differ
/// from the ids on the records passed in.
#[derive(Debug, Clone)]
pub struct SavedConnection {
    pub integration_id: IntegrationId,
    pub credential_id: CredentialId,
    pub job: SyncJob,
}

/// Token material written by a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshWrite {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refreshed_at: DateTime<Utc>,
}

impl RefreshWrite {
    /// Builds the write from re-encrypted secrets.
    #[must_use]
    pub fn new(
        secrets: EncryptedSecrets,
        expires_at: Option<DateTime<Utc>>,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: secrets.access_token,
            refresh_token: secrets.refresh_token,
            expires_at,
            refreshed_at,
        }
    }
}

/// Result of trying to move a job to `running`.
#[derive(Debug, Clone)]
pub enum JobStart {
    Started(SyncJob),
    /// Another job for the same integration is running.
    AlreadyRunning,
    /// The job is missing or no longer pending.
    NotPending,
}

/// Persistence for the credential lifecycle.
#[async_trait]
pub trait Datastore: Send + Sync {
    // Connections

    /// Upserts the integration (keyed on user, provider and workspace) and
    /// the credential (keyed on user and platform), then inserts a pending
    /// bootstrap job, all in one transaction.
    async fn save_connection(
        &self,
        integration: &Integration,
        credential: &Credential,
    ) -> Result<SavedConnection, StoreError>;

    // Integrations

    async fn find_integration(&self, id: IntegrationId)
    -> Result<Option<Integration>, StoreError>;

    async fn find_integration_by_key(
        &self,
        user_id: UserId,
        provider: &str,
        workspace_id: Option<WorkspaceId>,
    ) -> Result<Option<Integration>, StoreError>;

    /// Writes the integration if its stored status is still `expected`.
    ///
    /// Returns false when another writer changed the status first.
    async fn update_integration(
        &self,
        integration: &Integration,
        expected: IntegrationStatus,
    ) -> Result<bool, StoreError>;

    /// Integrations the health sweep looks at: `connected` or `error`,
    /// least recently updated first.
    async fn list_for_sweep(&self, limit: usize) -> Result<Vec<Integration>, StoreError>;

    async fn list_integrations(&self, user_id: UserId) -> Result<Vec<Integration>, StoreError>;

    /// Deletes the integration, clears any credential reference to it and
    /// deactivates its webhook registration. Logs and jobs are kept.
    async fn delete_integration(&self, id: IntegrationId) -> Result<bool, StoreError>;

    // Credentials

    async fn find_credential(&self, id: CredentialId) -> Result<Option<Credential>, StoreError>;

    async fn find_active_credential(
        &self,
        user_id: UserId,
        platform: &str,
    ) -> Result<Option<Credential>, StoreError>;

    /// Bumps the usage counter of the active credential and returns it.
    async fn touch_active_credential(
        &self,
        user_id: UserId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError>;

    /// Takes the refresh lease on an active credential unless someone else
    /// holds a live one. Returns the credential as of the lease.
    async fn acquire_refresh_lease(
        &self,
        id: CredentialId,
        owner: Ulid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError>;

    /// Writes rotated tokens if `owner` still holds the lease on an active
    /// credential, releasing the lease. Returns the updated credential, or
    /// `None` when the write was stale.
    async fn apply_refresh(
        &self,
        id: CredentialId,
        owner: Ulid,
        write: &RefreshWrite,
    ) -> Result<Option<Credential>, StoreError>;

    /// Releases a lease held by `owner`, recording `status`.
    async fn release_refresh_lease(
        &self,
        id: CredentialId,
        owner: Ulid,
        status: CredentialStatus,
    ) -> Result<(), StoreError>;

    /// Deactivates the active credential and drops any lease on it.
    async fn deactivate_credential(
        &self,
        user_id: UserId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError>;

    // Sync jobs

    async fn insert_job(&self, job: &SyncJob) -> Result<(), StoreError>;

    async fn find_job(&self, id: SyncJobId) -> Result<Option<SyncJob>, StoreError>;

    /// Moves a pending job to `running` unless another job for the same
    /// integration is already running. A running job that started before
    /// `stale_before` is treated as abandoned: it is failed and no longer
    /// blocks the start.
    async fn start_job(
        &self,
        id: SyncJobId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<JobStart, StoreError>;

    /// Fails a job that never started. Returns false if it was not pending.
    async fn fail_pending_job(
        &self,
        id: SyncJobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Writes the terminal state of a running job. Returns false if the
    /// job was not running.
    async fn finish_job(&self, job: &SyncJob) -> Result<bool, StoreError>;

    async fn latest_job(&self, integration_id: IntegrationId)
    -> Result<Option<SyncJob>, StoreError>;

    /// Whether a job for the integration is running and started at or
    /// after `stale_before`.
    async fn has_running_job(
        &self,
        integration_id: IntegrationId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Pending jobs, oldest first.
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError>;

    /// Running jobs, oldest first.
    async fn running_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError>;

    // Audit log

    async fn append_log(&self, log: &IntegrationLog) -> Result<(), StoreError>;

    /// Most recent log entries for a user, newest first.
    async fn recent_logs(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<IntegrationLog>, StoreError>;

    // Webhooks

    /// Upserts the registration keyed on its integration.
    async fn upsert_webhook_registration(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<(), StoreError>;

    async fn find_webhook_for_integration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<WebhookRegistration>, StoreError>;

    /// Looks up an active registration by provider-issued webhook id.
    async fn find_webhook_registration(
        &self,
        provider: &str,
        webhook_id: &str,
    ) -> Result<Option<WebhookRegistration>, StoreError>;

    async fn mark_webhook_triggered(
        &self,
        id: WebhookRegistrationId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn deactivate_webhook_registration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<(), StoreError>;

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    // OAuth state

    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError>;

    /// Removes and returns the state for `token`; a second call for the
    /// same token returns `None`.
    async fn take_oauth_state(&self, token: &str) -> Result<Option<OAuthState>, StoreError>;

    /// Deletes states that expired before `now`.
    async fn purge_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
