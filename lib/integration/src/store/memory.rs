//! In-memory datastore for tests and local runs.

use super::{Datastore, JobStart, RefreshWrite, SavedConnection};
use crate::audit::IntegrationLog;
use crate::credential::{Credential, CredentialStatus};
use crate::error::StoreError;
use crate::integration::{Integration, IntegrationStatus};
use crate::job::{ABANDONED_JOB, JobStatus, SyncJob};
use crate::oauth::OAuthState;
use crate::webhook::{WebhookEvent, WebhookRegistration};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tether_core::{
    CredentialId, IntegrationId, SyncJobId, UserId, WebhookRegistrationId, WorkspaceId,
};
use tokio::sync::Mutex;
use ulid::Ulid;

#[derive(Debug, Default)]
struct Tables {
    integrations: HashMap<IntegrationId, Integration>,
    credentials: HashMap<CredentialId, Credential>,
    jobs: Vec<SyncJob>,
    logs: Vec<IntegrationLog>,
    webhooks: HashMap<IntegrationId, WebhookRegistration>,
    events: Vec<WebhookEvent>,
    oauth_states: HashMap<String, OAuthState>,
}

impl Tables {
    fn credential_by_key_mut(&mut self, user_id: UserId, platform: &str) -> Option<&mut Credential> {
        self.credentials
            .values_mut()
            .find(|c| c.user_id == user_id && c.platform == platform)
    }

    fn active_credential_mut(&mut self, user_id: UserId, platform: &str) -> Option<&mut Credential> {
        self.credential_by_key_mut(user_id, platform)
            .filter(|c| c.active)
    }
}

/// A [`Datastore`] backed by a mutex-guarded set of maps.
///
/// Every method takes the lock once, so each call is atomic in the same
/// way a single conditional statement is in a relational store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a credential row as-is.
    pub async fn put_credential(&self, credential: Credential) {
        self.tables
            .lock()
            .await
            .credentials
            .insert(credential.id, credential);
    }

    /// Inserts or replaces an integration row as-is.
    pub async fn put_integration(&self, integration: Integration) {
        self.tables
            .lock()
            .await
            .integrations
            .insert(integration.id, integration);
    }

    /// Every audit log entry, oldest first.
    pub async fn logs(&self) -> Vec<IntegrationLog> {
        self.tables.lock().await.logs.clone()
    }

    /// Every sync job, in insertion order.
    pub async fn jobs(&self) -> Vec<SyncJob> {
        self.tables.lock().await.jobs.clone()
    }

    /// Every stored webhook event, in arrival order.
    pub async fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.tables.lock().await.events.clone()
    }

    /// Number of credential rows, active or not.
    pub async fn credential_count(&self) -> usize {
        self.tables.lock().await.credentials.len()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn save_connection(
        &self,
        integration: &Integration,
        credential: &Credential,
    ) -> Result<SavedConnection, StoreError> {
        let mut tables = self.tables.lock().await;

        let existing_integration = tables
            .integrations
            .values()
            .find(|i| {
                i.user_id == integration.user_id
                    && i.provider == integration.provider
                    && i.workspace_id == integration.workspace_id
            })
            .map(|i| (i.id, i.created_at));
        let mut stored_integration = integration.clone();
        if let Some((id, created_at)) = existing_integration {
            stored_integration.id = id;
            stored_integration.created_at = created_at;
        }
        let integration_id = stored_integration.id;
        tables.integrations.insert(integration_id, stored_integration);

        let mut stored_credential = credential.clone();
        stored_credential.integration_id = Some(integration_id);
        if let Some(existing) =
            tables.credential_by_key_mut(credential.user_id, &credential.platform)
        {
            stored_credential.id = existing.id;
            stored_credential.created_at = existing.created_at;
            stored_credential.usage_count = existing.usage_count;
            stored_credential.last_used_at = existing.last_used_at;
        }
        let credential_id = stored_credential.id;
        tables.credentials.insert(credential_id, stored_credential);

        let job = SyncJob::bootstrap(integration_id);
        tables.jobs.push(job.clone());

        Ok(SavedConnection {
            integration_id,
            credential_id,
            job,
        })
    }

    async fn find_integration(
        &self,
        id: IntegrationId,
    ) -> Result<Option<Integration>, StoreError> {
        Ok(self.tables.lock().await.integrations.get(&id).cloned())
    }

    async fn find_integration_by_key(
        &self,
        user_id: UserId,
        provider: &str,
        workspace_id: Option<WorkspaceId>,
    ) -> Result<Option<Integration>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .integrations
            .values()
            .find(|i| {
                i.user_id == user_id && i.provider == provider && i.workspace_id == workspace_id
            })
            .cloned())
    }

    async fn update_integration(
        &self,
        integration: &Integration,
        expected: IntegrationStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.integrations.get_mut(&integration.id) {
            Some(stored) if stored.status == expected => {
                *stored = integration.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_sweep(&self, limit: usize) -> Result<Vec<Integration>, StoreError> {
        let tables = self.tables.lock().await;
        let mut due: Vec<Integration> = tables
            .integrations
            .values()
            .filter(|i| i.is_sweepable())
            .cloned()
            .collect();
        due.sort_by_key(|i| (i.updated_at, i.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_integrations(&self, user_id: UserId) -> Result<Vec<Integration>, StoreError> {
        let tables = self.tables.lock().await;
        let mut integrations: Vec<Integration> = tables
            .integrations
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        integrations.sort_by_key(|i| i.created_at);
        Ok(integrations)
    }

    async fn delete_integration(&self, id: IntegrationId) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.integrations.remove(&id).is_none() {
            return Ok(false);
        }
        for credential in tables.credentials.values_mut() {
            if credential.integration_id == Some(id) {
                credential.integration_id = None;
            }
        }
        if let Some(webhook) = tables.webhooks.get_mut(&id) {
            webhook.active = false;
            webhook.updated_at = Utc::now();
        }
        Ok(true)
    }

    async fn find_credential(&self, id: CredentialId) -> Result<Option<Credential>, StoreError> {
        Ok(self.tables.lock().await.credentials.get(&id).cloned())
    }

    async fn find_active_credential(
        &self,
        user_id: UserId,
        platform: &str,
    ) -> Result<Option<Credential>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .active_credential_mut(user_id, platform)
            .map(|c| c.clone()))
    }

    async fn touch_active_credential(
        &self,
        user_id: UserId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.active_credential_mut(user_id, platform).map(|c| {
            c.mark_used(now);
            c.clone()
        }))
    }

    async fn acquire_refresh_lease(
        &self,
        id: CredentialId,
        owner: Ulid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(credential) = tables.credentials.get_mut(&id) else {
            return Ok(None);
        };
        if !credential.active || credential.is_leased(now) {
            return Ok(None);
        }
        credential.lease_owner = Some(owner);
        credential.lease_expires_at = Some(until);
        Ok(Some(credential.clone()))
    }

    async fn apply_refresh(
        &self,
        id: CredentialId,
        owner: Ulid,
        write: &RefreshWrite,
    ) -> Result<Option<Credential>, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(credential) = tables.credentials.get_mut(&id) else {
            return Ok(None);
        };
        if !credential.active || credential.lease_owner != Some(owner) {
            return Ok(None);
        }
        credential.secrets.access_token.clone_from(&write.access_token);
        credential.secrets.refresh_token.clone_from(&write.refresh_token);
        credential.expires_at = write.expires_at;
        credential.last_refreshed_at = Some(write.refreshed_at);
        credential.status = CredentialStatus::Connected;
        credential.lease_owner = None;
        credential.lease_expires_at = None;
        credential.updated_at = write.refreshed_at;
        Ok(Some(credential.clone()))
    }

    async fn release_refresh_lease(
        &self,
        id: CredentialId,
        owner: Ulid,
        status: CredentialStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(credential) = tables.credentials.get_mut(&id)
            && credential.lease_owner == Some(owner)
        {
            credential.lease_owner = None;
            credential.lease_expires_at = None;
            credential.status = status;
            credential.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn deactivate_credential(
        &self,
        user_id: UserId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.active_credential_mut(user_id, platform).map(|c| {
            c.deactivate(now);
            c.clone()
        }))
    }

    async fn insert_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.jobs.iter().any(|j| j.id == job.id) {
            return Err(StoreError::Conflict {
                details: format!("sync job {} already exists", job.id),
            });
        }
        tables.jobs.push(job.clone());
        Ok(())
    }

    async fn find_job(&self, id: SyncJobId) -> Result<Option<SyncJob>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn start_job(
        &self,
        id: SyncJobId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<JobStart, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(integration_id) = tables
            .jobs
            .iter()
            .find(|j| j.id == id && j.status == JobStatus::Pending)
            .map(|j| j.integration_id)
        else {
            return Ok(JobStart::NotPending);
        };
        let mut busy = false;
        for running in tables
            .jobs
            .iter_mut()
            .filter(|j| j.integration_id == integration_id && j.status == JobStatus::Running)
        {
            if running.started_at.is_none_or(|at| at < stale_before) {
                running.fail(ABANDONED_JOB, now);
            } else {
                busy = true;
            }
        }
        if busy {
            return Ok(JobStart::AlreadyRunning);
        }
        let Some(job) = tables.jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(JobStart::NotPending);
        };
        job.start(now);
        Ok(JobStart::Started(job.clone()))
    }

    async fn fail_pending_job(
        &self,
        id: SyncJobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.fail(message, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_job(&self, job: &SyncJob) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(stored) if stored.status == JobStatus::Running => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn latest_job(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<SyncJob>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.integration_id == integration_id)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn has_running_job(
        &self,
        integration_id: IntegrationId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.jobs.iter().any(|j| {
            j.integration_id == integration_id
                && j.status == JobStatus::Running
                && j.started_at.is_some_and(|at| at >= stale_before)
        }))
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn running_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_log(&self, log: &IntegrationLog) -> Result<(), StoreError> {
        self.tables.lock().await.logs.push(log.clone());
        Ok(())
    }

    async fn recent_logs(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<IntegrationLog>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .logs
            .iter()
            .rev()
            .filter(|l| l.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_webhook_registration(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let mut stored = registration.clone();
        if let Some(existing) = tables.webhooks.get(&registration.integration_id) {
            stored.id = existing.id;
            stored.created_at = existing.created_at;
        }
        tables.webhooks.insert(registration.integration_id, stored);
        Ok(())
    }

    async fn find_webhook_for_integration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<WebhookRegistration>, StoreError> {
        Ok(self.tables.lock().await.webhooks.get(&integration_id).cloned())
    }

    async fn find_webhook_registration(
        &self,
        provider: &str,
        webhook_id: &str,
    ) -> Result<Option<WebhookRegistration>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .webhooks
            .values()
            .find(|w| w.active && w.provider == provider && w.webhook_id == webhook_id)
            .cloned())
    }

    async fn mark_webhook_triggered(
        &self,
        id: WebhookRegistrationId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(webhook) = tables.webhooks.values_mut().find(|w| w.id == id) {
            webhook.last_triggered_at = Some(now);
        }
        Ok(())
    }

    async fn deactivate_webhook_registration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(webhook) = tables.webhooks.get_mut(&integration_id) {
            webhook.active = false;
            webhook.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        self.tables.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.oauth_states.contains_key(&state.token) {
            return Err(StoreError::Conflict {
                details: "oauth state token already exists".to_string(),
            });
        }
        tables.oauth_states.insert(state.token.clone(), state.clone());
        Ok(())
    }

    async fn take_oauth_state(&self, token: &str) -> Result<Option<OAuthState>, StoreError> {
        Ok(self.tables.lock().await.oauth_states.remove(token))
    }

    async fn purge_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.oauth_states.len();
        tables.oauth_states.retain(|_, s| s.expires_at > now);
        Ok((before - tables.oauth_states.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialKind, EncryptedSecrets};
    use chrono::Duration;

    fn credential(user_id: UserId, token: &str) -> Credential {
        Credential::new(
            user_id,
            "slack",
            "Slack",
            CredentialKind::Oauth,
            EncryptedSecrets {
                access_token: Some(token.to_string()),
                ..EncryptedSecrets::default()
            },
        )
    }

    async fn saved(store: &MemoryStore, user_id: UserId, token: &str) -> SavedConnection {
        let integration = Integration::new(user_id, None, "slack", "Slack");
        store
            .save_connection(&integration, &credential(user_id, token))
            .await
            .expect("save")
    }

    #[tokio::test]
    async fn save_connection_upserts_on_natural_keys() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let first = saved(&store, user, "enc-1").await;
        let second = saved(&store, user, "enc-2").await;

        assert_eq!(first.integration_id, second.integration_id);
        assert_eq!(first.credential_id, second.credential_id);
        assert_eq!(store.credential_count().await, 1);
        let stored = store
            .find_active_credential(user, "slack")
            .await
            .expect("find")
            .expect("active");
        assert_eq!(stored.secrets.access_token.as_deref(), Some("enc-2"));
        assert_eq!(stored.integration_id, Some(first.integration_id));
        assert_eq!(store.jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let id = saved(&store, user, "enc").await.credential_id;
        let now = Utc::now();

        let a = Ulid::new();
        let b = Ulid::new();
        assert!(store
            .acquire_refresh_lease(id, a, now + Duration::minutes(2), now)
            .await
            .expect("lease")
            .is_some());
        assert!(store
            .acquire_refresh_lease(id, b, now + Duration::minutes(2), now)
            .await
            .expect("lease")
            .is_none());
        let later = now + Duration::minutes(3);
        assert!(store
            .acquire_refresh_lease(id, b, later + Duration::minutes(2), later)
            .await
            .expect("lease")
            .is_some());
    }

    #[tokio::test]
    async fn stale_refresh_is_rejected_after_deactivate() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let id = saved(&store, user, "enc").await.credential_id;
        let now = Utc::now();
        let owner = Ulid::new();
        store
            .acquire_refresh_lease(id, owner, now + Duration::minutes(2), now)
            .await
            .expect("lease");

        store
            .deactivate_credential(user, "slack", now)
            .await
            .expect("deactivate")
            .expect("was active");

        let write = RefreshWrite {
            access_token: Some("new".to_string()),
            refresh_token: None,
            expires_at: None,
            refreshed_at: now,
        };
        assert!(store.apply_refresh(id, owner, &write).await.expect("apply").is_none());
        let stored = store.find_credential(id).await.expect("find").expect("row");
        assert_eq!(stored.secrets.access_token.as_deref(), Some("enc"));
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn update_integration_is_conditional_on_status() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let id = saved(&store, user, "enc").await.integration_id;
        let mut integration = store.find_integration(id).await.expect("find").expect("row");
        integration.status = IntegrationStatus::Connected;

        assert!(!store
            .update_integration(&integration, IntegrationStatus::Error)
            .await
            .expect("update"));
        assert!(store
            .update_integration(&integration, IntegrationStatus::Pending)
            .await
            .expect("update"));
    }

    #[tokio::test]
    async fn only_one_running_job_per_integration() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let first = saved(&store, user, "enc").await;
        let second = saved(&store, user, "enc").await;
        let now = Utc::now();
        let stale_before = now - Duration::minutes(1);

        assert!(matches!(
            store.start_job(first.job.id, now, stale_before).await.expect("start"),
            JobStart::Started(_)
        ));
        assert!(matches!(
            store.start_job(second.job.id, now, stale_before).await.expect("start"),
            JobStart::AlreadyRunning
        ));
        assert!(matches!(
            store.start_job(first.job.id, now, stale_before).await.expect("start"),
            JobStart::NotPending
        ));
        assert!(store
            .has_running_job(first.integration_id, stale_before)
            .await
            .expect("running"));
    }

    #[tokio::test]
    async fn stale_running_job_is_failed_and_stops_blocking() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let first = saved(&store, user, "enc").await;
        let second = saved(&store, user, "enc").await;
        let now = Utc::now();
        let stale_before = now - Duration::minutes(1);

        store
            .start_job(first.job.id, now - Duration::minutes(5), stale_before)
            .await
            .expect("start");
        assert!(!store
            .has_running_job(first.integration_id, stale_before)
            .await
            .expect("running"));
        assert_eq!(store.running_jobs(10).await.expect("list").len(), 1);

        assert!(matches!(
            store.start_job(second.job.id, now, stale_before).await.expect("start"),
            JobStart::Started(_)
        ));
        let abandoned = store
            .find_job(first.job.id)
            .await
            .expect("find")
            .expect("job");
        assert_eq!(abandoned.status, JobStatus::Failed);
        assert_eq!(abandoned.error_message.as_deref(), Some(ABANDONED_JOB));
        assert_eq!(abandoned.completed_at, Some(now));
    }

    #[tokio::test]
    async fn only_pending_jobs_can_be_failed_before_starting() {
        let store = MemoryStore::new();
        let connection = saved(&store, UserId::new(), "enc").await;
        let now = Utc::now();

        assert!(store
            .fail_pending_job(connection.job.id, "superseded", now)
            .await
            .expect("fail"));
        assert!(!store
            .fail_pending_job(connection.job.id, "superseded", now)
            .await
            .expect("fail"));
        assert!(store.pending_jobs(10).await.expect("list").is_empty());
        assert!(matches!(
            store
                .start_job(connection.job.id, now, now)
                .await
                .expect("start"),
            JobStart::NotPending
        ));
    }

    #[tokio::test]
    async fn sweep_lists_sweepable_oldest_first_within_limit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (minutes, status) in [
            (30, IntegrationStatus::Connected),
            (10, IntegrationStatus::Error),
            (20, IntegrationStatus::Pending),
            (40, IntegrationStatus::Disconnected),
            (50, IntegrationStatus::Connected),
        ] {
            let mut integration = Integration::new(UserId::new(), None, "slack", "Slack");
            integration.status = status;
            integration.updated_at = now - Duration::minutes(minutes);
            store.put_integration(integration).await;
        }
        let batch = store.list_for_sweep(2).await.expect("list");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].updated_at, now - Duration::minutes(50));
        assert_eq!(batch[1].updated_at, now - Duration::minutes(30));
    }

    #[tokio::test]
    async fn delete_integration_clears_credential_reference() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let saved = saved(&store, user, "enc").await;
        store
            .upsert_webhook_registration(&WebhookRegistration::new(
                saved.integration_id,
                "slack",
                "https://example.test/hook",
                "W1",
            ))
            .await
            .expect("webhook");

        assert!(store.delete_integration(saved.integration_id).await.expect("delete"));
        let credential = store
            .find_credential(saved.credential_id)
            .await
            .expect("find")
            .expect("kept");
        assert_eq!(credential.integration_id, None);
        assert!(store
            .find_webhook_registration("slack", "W1")
            .await
            .expect("find")
            .is_none());
        assert!(!store.delete_integration(saved.integration_id).await.expect("delete"));
    }
}
