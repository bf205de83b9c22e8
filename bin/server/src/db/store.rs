//! Postgres implementation of the lifecycle datastore.
//!
//! Every arbitrating method is a single conditional statement, so the
//! row-level guarantees `MemoryStore` gets from its mutex come from
//! Postgres here: `WHERE` guards on status and lease owner, the natural-key
//! unique constraints behind `ON CONFLICT`, and the partial unique index
//! that allows one running job per integration.

use super::rows::{
    CREDENTIAL_COLUMNS, CredentialRow, INTEGRATION_COLUMNS, IntegrationRow, JOB_COLUMNS, JobRow,
    LOG_COLUMNS, LogRow, OAUTH_STATE_COLUMNS, OAuthStateRow, WEBHOOK_COLUMNS, WebhookRow,
    headers_json,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tether_core::{
    CredentialId, IntegrationId, SyncJobId, UserId, WebhookRegistrationId, WorkspaceId,
};
use tether_integration::audit::IntegrationLog;
use tether_integration::credential::{AdditionalData, Credential, CredentialStatus};
use tether_integration::integration::{Integration, IntegrationStatus};
use tether_integration::job::{ABANDONED_JOB, JobStatus, SyncJob};
use tether_integration::oauth::OAuthState;
use tether_integration::store::{JobStart, RefreshWrite, SavedConnection};
use tether_integration::webhook::{WebhookEvent, WebhookRegistration};
use tether_integration::{Datastore, StoreError};
use ulid::Ulid;

fn db_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
            details: db.message().to_string(),
        },
        _ => StoreError::Backend {
            details: e.to_string(),
        },
    }
}

fn json(map: &AdditionalData) -> serde_json::Value {
    serde_json::Value::Object(map.clone())
}

fn credential(row: Option<CredentialRow>) -> Result<Option<Credential>, StoreError> {
    row.map(CredentialRow::try_into_credential).transpose()
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// A [`Datastore`] over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Datastore for PgStore {
    async fn save_connection(
        &self,
        integration: &Integration,
        credential: &Credential,
    ) -> Result<SavedConnection, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let (integration_id,): (String,) = sqlx::query_as(
            r#"
            INSERT INTO integrations
                (id, user_id, workspace_id, provider, provider_name, status, last_sync_at,
                 next_sync_at, health_score, error_message, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT ON CONSTRAINT integrations_natural_key
            DO UPDATE SET provider_name = EXCLUDED.provider_name,
                          status = EXCLUDED.status,
                          last_sync_at = EXCLUDED.last_sync_at,
                          next_sync_at = EXCLUDED.next_sync_at,
                          health_score = EXCLUDED.health_score,
                          error_message = EXCLUDED.error_message,
                          metadata = EXCLUDED.metadata,
                          updated_at = EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(integration.id.to_string())
        .bind(integration.user_id.to_string())
        .bind(integration.workspace_id.map(|w| w.to_string()))
        .bind(&integration.provider)
        .bind(&integration.provider_name)
        .bind(integration.status.as_str())
        .bind(integration.last_sync_at)
        .bind(integration.next_sync_at)
        .bind(i16::from(integration.health_score))
        .bind(&integration.error_message)
        .bind(json(&integration.metadata))
        .bind(integration.created_at)
        .bind(integration.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let secrets = &credential.secrets;
        let (credential_id,): (String,) = sqlx::query_as(
            r#"
            INSERT INTO credentials
                (id, user_id, platform, platform_name, kind, access_token, refresh_token,
                 api_key, api_secret, additional_data, scopes, expires_at, last_refreshed_at,
                 status, active, usage_count, last_used_at, integration_id, lease_owner,
                 lease_expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, NULL, NULL, $19, $20)
            ON CONFLICT ON CONSTRAINT credentials_natural_key
            DO UPDATE SET platform_name = EXCLUDED.platform_name,
                          kind = EXCLUDED.kind,
                          access_token = EXCLUDED.access_token,
                          refresh_token = EXCLUDED.refresh_token,
                          api_key = EXCLUDED.api_key,
                          api_secret = EXCLUDED.api_secret,
                          additional_data = EXCLUDED.additional_data,
                          scopes = EXCLUDED.scopes,
                          expires_at = EXCLUDED.expires_at,
                          last_refreshed_at = EXCLUDED.last_refreshed_at,
                          status = EXCLUDED.status,
                          active = EXCLUDED.active,
                          integration_id = EXCLUDED.integration_id,
                          lease_owner = NULL,
                          lease_expires_at = NULL,
                          updated_at = EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(credential.id.to_string())
        .bind(credential.user_id.to_string())
        .bind(&credential.platform)
        .bind(&credential.platform_name)
        .bind(credential.kind.as_str())
        .bind(&secrets.access_token)
        .bind(&secrets.refresh_token)
        .bind(&secrets.api_key)
        .bind(&secrets.api_secret)
        .bind(json(&credential.additional_data))
        .bind(&credential.scopes)
        .bind(credential.expires_at)
        .bind(credential.last_refreshed_at)
        .bind(credential.status.as_str())
        .bind(credential.active)
        .bind(credential.usage_count)
        .bind(credential.last_used_at)
        .bind(&integration_id)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let integration_id: IntegrationId = integration_id
            .parse()
            .map_err(|e: tether_core::ParseIdError| super::rows::corrupt(e.to_string()))?;
        let credential_id: CredentialId = credential_id
            .parse()
            .map_err(|e: tether_core::ParseIdError| super::rows::corrupt(e.to_string()))?;

        let job = SyncJob::bootstrap(integration_id);
        insert_job(&mut *tx, &job).await?;

        tx.commit().await.map_err(db_error)?;
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
        let sql = format!("SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = $1");
        let row: Option<IntegrationRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(IntegrationRow::try_into_integration).transpose()
    }

    async fn find_integration_by_key(
        &self,
        user_id: UserId,
        provider: &str,
        workspace_id: Option<WorkspaceId>,
    ) -> Result<Option<Integration>, StoreError> {
        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations \
             WHERE user_id = $1 AND provider = $2 AND workspace_id IS NOT DISTINCT FROM $3"
        );
        let row: Option<IntegrationRow> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .bind(provider)
            .bind(workspace_id.map(|w| w.to_string()))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(IntegrationRow::try_into_integration).transpose()
    }

    async fn update_integration(
        &self,
        integration: &Integration,
        expected: IntegrationStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integrations
            SET provider_name = $3, status = $4, last_sync_at = $5, next_sync_at = $6,
                health_score = $7, error_message = $8, metadata = $9, updated_at = $10
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(integration.id.to_string())
        .bind(expected.as_str())
        .bind(&integration.provider_name)
        .bind(integration.status.as_str())
        .bind(integration.last_sync_at)
        .bind(integration.next_sync_at)
        .bind(i16::from(integration.health_score))
        .bind(&integration.error_message)
        .bind(json(&integration.metadata))
        .bind(integration.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_for_sweep(&self, max: usize) -> Result<Vec<Integration>, StoreError> {
        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations \
             WHERE status IN ('connected', 'error') \
             ORDER BY updated_at ASC, id ASC LIMIT $1"
        );
        let rows: Vec<IntegrationRow> = sqlx::query_as(&sql)
            .bind(limit(max))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter()
            .map(IntegrationRow::try_into_integration)
            .collect()
    }

    async fn list_integrations(&self, user_id: UserId) -> Result<Vec<Integration>, StoreError> {
        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations \
             WHERE user_id = $1 ORDER BY created_at ASC"
        );
        let rows: Vec<IntegrationRow> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter()
            .map(IntegrationRow::try_into_integration)
            .collect()
    }

    async fn delete_integration(&self, id: IntegrationId) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let id = id.to_string();

        let deleted = sqlx::query("DELETE FROM integrations WHERE id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        if deleted.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("UPDATE credentials SET integration_id = NULL WHERE integration_id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query(
            "UPDATE webhook_registrations SET active = FALSE, updated_at = $2 \
             WHERE integration_id = $1",
        )
        .bind(&id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn find_credential(&self, id: CredentialId) -> Result<Option<Credential>, StoreError> {
        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = $1");
        let row: Option<CredentialRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        credential(row)
    }

    async fn find_active_credential(
        &self,
        user_id: UserId,
        platform: &str,
    ) -> Result<Option<Credential>, StoreError> {
        let sql = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials \
             WHERE user_id = $1 AND platform = $2 AND active"
        );
        let row: Option<CredentialRow> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .bind(platform)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        credential(row)
    }

    async fn touch_active_credential(
        &self,
        user_id: UserId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError> {
        let sql = format!(
            "UPDATE credentials SET usage_count = usage_count + 1, last_used_at = $3 \
             WHERE user_id = $1 AND platform = $2 AND active \
             RETURNING {CREDENTIAL_COLUMNS}"
        );
        let row: Option<CredentialRow> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .bind(platform)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        credential(row)
    }

    async fn acquire_refresh_lease(
        &self,
        id: CredentialId,
        owner: Ulid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError> {
        let sql = format!(
            "UPDATE credentials SET lease_owner = $2, lease_expires_at = $3 \
             WHERE id = $1 AND active \
               AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $4) \
             RETURNING {CREDENTIAL_COLUMNS}"
        );
        let row: Option<CredentialRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(owner.to_string())
            .bind(until)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        credential(row)
    }

    async fn apply_refresh(
        &self,
        id: CredentialId,
        owner: Ulid,
        write: &RefreshWrite,
    ) -> Result<Option<Credential>, StoreError> {
        let sql = format!(
            "UPDATE credentials \
             SET access_token = $3, refresh_token = $4, expires_at = $5, \
                 last_refreshed_at = $6, status = 'connected', lease_owner = NULL, \
                 lease_expires_at = NULL, updated_at = $6 \
             WHERE id = $1 AND active AND lease_owner = $2 \
             RETURNING {CREDENTIAL_COLUMNS}"
        );
        let row: Option<CredentialRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(owner.to_string())
            .bind(write.access_token.clone())
            .bind(write.refresh_token.clone())
            .bind(write.expires_at)
            .bind(write.refreshed_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        credential(row)
    }

    async fn release_refresh_lease(
        &self,
        id: CredentialId,
        owner: Ulid,
        status: CredentialStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET lease_owner = NULL, lease_expires_at = NULL, status = $3, updated_at = $4
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id.to_string())
        .bind(owner.to_string())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn deactivate_credential(
        &self,
        user_id: UserId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, StoreError> {
        let sql = format!(
            "UPDATE credentials \
             SET active = FALSE, status = 'disconnected', lease_owner = NULL, \
                 lease_expires_at = NULL, updated_at = $3 \
             WHERE user_id = $1 AND platform = $2 AND active \
             RETURNING {CREDENTIAL_COLUMNS}"
        );
        let row: Option<CredentialRow> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .bind(platform)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        credential(row)
    }

    async fn insert_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        insert_job(&self.pool, job).await
    }

    async fn find_job(&self, id: SyncJobId) -> Result<Option<SyncJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn start_job(
        &self,
        id: SyncJobId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<JobStart, StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', completed_at = $2, error_message = $3
            WHERE status = 'running'
              AND (started_at IS NULL OR started_at < $4)
              AND integration_id = (SELECT integration_id FROM sync_jobs
                                    WHERE id = $1 AND status = 'pending')
            "#,
        )
        .bind(id.to_string())
        .bind(now)
        .bind(ABANDONED_JOB)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let sql = format!(
            "UPDATE sync_jobs SET status = 'running', started_at = $2 \
             WHERE id = $1 AND status = 'pending' \
               AND NOT EXISTS (SELECT 1 FROM sync_jobs r \
                               WHERE r.integration_id = sync_jobs.integration_id \
                                 AND r.status = 'running') \
             RETURNING {JOB_COLUMNS}"
        );
        let started: Result<Option<JobRow>, sqlx::Error> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(now)
            .fetch_optional(&self.pool)
            .await;
        match started {
            Ok(Some(row)) => return Ok(JobStart::Started(row.try_into_job()?)),
            Ok(None) => {}
            // Lost a race with another starter on the one-running index.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Ok(JobStart::AlreadyRunning);
            }
            Err(e) => return Err(db_error(e)),
        }

        let pending: Option<(bool,)> = sqlx::query_as(
            "SELECT status = 'pending' FROM sync_jobs WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(match pending {
            Some((true,)) => JobStart::AlreadyRunning,
            _ => JobStart::NotPending,
        })
    }

    async fn fail_pending_job(
        &self,
        id: SyncJobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'failed', completed_at = $2, error_message = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.to_string())
        .bind(now)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_job(&self, job: &SyncJob) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = $2, started_at = $3, completed_at = $4, error_message = $5,
                result_summary = $6
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(json(&job.result_summary))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn latest_job(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<SyncJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE integration_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(integration_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn has_running_job(
        &self,
        integration_id: IntegrationId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (running,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM sync_jobs \
             WHERE integration_id = $1 AND status = $2 AND started_at >= $3)",
        )
        .bind(integration_id.to_string())
        .bind(JobStatus::Running.as_str())
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(running)
    }

    async fn pending_jobs(&self, max: usize) -> Result<Vec<SyncJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = 'pending' \
             ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(limit(max))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn running_jobs(&self, max: usize) -> Result<Vec<SyncJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = 'running' \
             ORDER BY started_at ASC, id ASC LIMIT $1"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(limit(max))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn append_log(&self, log: &IntegrationLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO integration_logs
                (id, user_id, platform, action, status, level, message, error_details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.user_id.to_string())
        .bind(&log.platform)
        .bind(log.action.as_str())
        .bind(log.status.as_str())
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.error_details)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn recent_logs(
        &self,
        user_id: UserId,
        max: usize,
    ) -> Result<Vec<IntegrationLog>, StoreError> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM integration_logs WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        let rows: Vec<LogRow> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .bind(limit(max))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter().map(LogRow::try_into_log).collect()
    }

    async fn upsert_webhook_registration(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_registrations
                (id, integration_id, provider, webhook_url, webhook_id, webhook_secret, active,
                 event_types, last_triggered_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (integration_id)
            DO UPDATE SET provider = EXCLUDED.provider,
                          webhook_url = EXCLUDED.webhook_url,
                          webhook_id = EXCLUDED.webhook_id,
                          webhook_secret = EXCLUDED.webhook_secret,
                          active = EXCLUDED.active,
                          event_types = EXCLUDED.event_types,
                          last_triggered_at = EXCLUDED.last_triggered_at,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(registration.id.to_string())
        .bind(registration.integration_id.to_string())
        .bind(&registration.provider)
        .bind(&registration.webhook_url)
        .bind(&registration.webhook_id)
        .bind(&registration.webhook_secret)
        .bind(registration.active)
        .bind(&registration.event_types)
        .bind(registration.last_triggered_at)
        .bind(registration.created_at)
        .bind(registration.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_webhook_for_integration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<WebhookRegistration>, StoreError> {
        let sql =
            format!("SELECT {WEBHOOK_COLUMNS} FROM webhook_registrations WHERE integration_id = $1");
        let row: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(integration_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(WebhookRow::try_into_registration).transpose()
    }

    async fn find_webhook_registration(
        &self,
        provider: &str,
        webhook_id: &str,
    ) -> Result<Option<WebhookRegistration>, StoreError> {
        let sql = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_registrations \
             WHERE provider = $1 AND webhook_id = $2 AND active \
             ORDER BY updated_at DESC LIMIT 1"
        );
        let row: Option<WebhookRow> = sqlx::query_as(&sql)
            .bind(provider)
            .bind(webhook_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(WebhookRow::try_into_registration).transpose()
    }

    async fn mark_webhook_triggered(
        &self,
        id: WebhookRegistrationId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE webhook_registrations SET last_triggered_at = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn deactivate_webhook_registration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE webhook_registrations SET active = FALSE, updated_at = $2 \
             WHERE integration_id = $1",
        )
        .bind(integration_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events
                (id, provider, webhook_id, integration_id, headers, payload, processed, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.provider)
        .bind(&event.webhook_id)
        .bind(event.integration_id.map(|id| id.to_string()))
        .bind(headers_json(&event.headers))
        .bind(&event.payload)
        .bind(event.processed)
        .bind(event.received_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_states
                (token, user_id, platform, workspace_id, pkce_verifier, redirect_uri, scopes,
                 created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&state.token)
        .bind(state.user_id.to_string())
        .bind(&state.platform)
        .bind(state.workspace_id.map(|w| w.to_string()))
        .bind(&state.pkce_verifier)
        .bind(&state.redirect_uri)
        .bind(&state.scopes)
        .bind(state.created_at)
        .bind(state.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn take_oauth_state(&self, token: &str) -> Result<Option<OAuthState>, StoreError> {
        let sql = format!("DELETE FROM oauth_states WHERE token = $1 RETURNING {OAUTH_STATE_COLUMNS}");
        let row: Option<OAuthStateRow> = sqlx::query_as(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(OAuthStateRow::try_into_state).transpose()
    }

    async fn purge_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

async fn insert_job<'e, E>(executor: E, job: &SyncJob) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO sync_jobs
            (id, integration_id, job_type, status, created_at, started_at, completed_at,
             error_message, result_summary)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.integration_id.to_string())
    .bind(job.job_type.as_str())
    .bind(job.status.as_str())
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(&job.error_message)
    .bind(json(&job.result_summary))
    .execute(executor)
    .await
    .map_err(db_error)?;
    Ok(())
}
