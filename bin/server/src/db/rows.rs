//! Row types for datastore queries and their conversion to domain records.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::str::FromStr;
use tether_core::ParseIdError;
use tether_integration::audit::{IntegrationLog, LogAction, LogLevel, LogStatus};
use tether_integration::credential::{
    AdditionalData, Credential, CredentialKind, CredentialStatus, EncryptedSecrets,
};
use tether_integration::integration::{Integration, IntegrationStatus};
use tether_integration::job::{JobStatus, JobType, SyncJob};
use tether_integration::oauth::OAuthState;
use tether_integration::webhook::WebhookRegistration;
use tether_integration::StoreError;
use ulid::Ulid;

/// Column lists matching the row structs below.
pub(crate) const INTEGRATION_COLUMNS: &str = "id, user_id, workspace_id, provider, provider_name, \
     status, last_sync_at, next_sync_at, health_score, error_message, metadata, created_at, \
     updated_at";

pub(crate) const CREDENTIAL_COLUMNS: &str = "id, user_id, platform, platform_name, kind, \
     access_token, refresh_token, api_key, api_secret, additional_data, scopes, expires_at, \
     last_refreshed_at, status, active, usage_count, last_used_at, integration_id, lease_owner, \
     lease_expires_at, created_at, updated_at";

pub(crate) const JOB_COLUMNS: &str = "id, integration_id, job_type, status, created_at, \
     started_at, completed_at, error_message, result_summary";

pub(crate) const LOG_COLUMNS: &str =
    "id, user_id, platform, action, status, level, message, error_details, created_at";

pub(crate) const WEBHOOK_COLUMNS: &str = "id, integration_id, provider, webhook_url, webhook_id, \
     webhook_secret, active, event_types, last_triggered_at, created_at, updated_at";

pub(crate) const OAUTH_STATE_COLUMNS: &str = "token, user_id, platform, workspace_id, \
     pkce_verifier, redirect_uri, scopes, created_at, expires_at";

pub(crate) fn corrupt(details: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        details: details.into(),
    }
}

fn id<T: FromStr<Err = ParseIdError>>(raw: &str) -> Result<T, StoreError> {
    raw.parse().map_err(|e: ParseIdError| corrupt(e.to_string()))
}

fn opt_id<T: FromStr<Err = ParseIdError>>(raw: Option<&str>) -> Result<Option<T>, StoreError> {
    raw.map(id::<T>).transpose()
}

fn enum_value<T>(column: &str, raw: &str, parse: fn(&str) -> Option<T>) -> Result<T, StoreError> {
    parse(raw).ok_or_else(|| corrupt(format!("unknown {column} '{raw}'")))
}

fn object(column: &str, value: serde_json::Value) -> Result<AdditionalData, StoreError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(AdditionalData::new()),
        other => Err(corrupt(format!("{column} is not an object: {other}"))),
    }
}

#[derive(FromRow)]
pub(crate) struct IntegrationRow {
    id: String,
    user_id: String,
    workspace_id: Option<String>,
    provider: String,
    provider_name: String,
    status: String,
    last_sync_at: Option<DateTime<Utc>>,
    next_sync_at: Option<DateTime<Utc>>,
    health_score: i16,
    error_message: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IntegrationRow {
    pub(crate) fn try_into_integration(self) -> Result<Integration, StoreError> {
        Ok(Integration {
            id: id(&self.id)?,
            user_id: id(&self.user_id)?,
            workspace_id: opt_id(self.workspace_id.as_deref())?,
            provider: self.provider,
            provider_name: self.provider_name,
            status: enum_value("integration status", &self.status, IntegrationStatus::parse)?,
            last_sync_at: self.last_sync_at,
            next_sync_at: self.next_sync_at,
            health_score: u8::try_from(self.health_score.clamp(0, 100)).unwrap_or(0),
            error_message: self.error_message,
            metadata: object("metadata", self.metadata)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct CredentialRow {
    id: String,
    user_id: String,
    platform: String,
    platform_name: String,
    kind: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    api_key: Option<String>,
    api_secret: Option<String>,
    additional_data: serde_json::Value,
    scopes: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
    last_refreshed_at: Option<DateTime<Utc>>,
    status: String,
    active: bool,
    usage_count: i64,
    last_used_at: Option<DateTime<Utc>>,
    integration_id: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CredentialRow {
    pub(crate) fn try_into_credential(self) -> Result<Credential, StoreError> {
        let lease_owner = self
            .lease_owner
            .as_deref()
            .map(Ulid::from_string)
            .transpose()
            .map_err(|e| corrupt(format!("invalid lease owner: {e}")))?;
        Ok(Credential {
            id: id(&self.id)?,
            user_id: id(&self.user_id)?,
            platform: self.platform,
            platform_name: self.platform_name,
            kind: enum_value("credential kind", &self.kind, CredentialKind::parse)?,
            secrets: EncryptedSecrets {
                access_token: self.access_token,
                refresh_token: self.refresh_token,
                api_key: self.api_key,
                api_secret: self.api_secret,
            },
            additional_data: object("additional_data", self.additional_data)?,
            scopes: self.scopes,
            expires_at: self.expires_at,
            last_refreshed_at: self.last_refreshed_at,
            status: enum_value("credential status", &self.status, CredentialStatus::parse)?,
            active: self.active,
            usage_count: self.usage_count,
            last_used_at: self.last_used_at,
            integration_id: opt_id(self.integration_id.as_deref())?,
            lease_owner,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct JobRow {
    id: String,
    integration_id: String,
    job_type: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    result_summary: serde_json::Value,
}

impl JobRow {
    pub(crate) fn try_into_job(self) -> Result<SyncJob, StoreError> {
        Ok(SyncJob {
            id: id(&self.id)?,
            integration_id: id(&self.integration_id)?,
            job_type: enum_value("job type", &self.job_type, JobType::parse)?,
            status: enum_value("job status", &self.status, JobStatus::parse)?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            result_summary: object("result_summary", self.result_summary)?,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct LogRow {
    id: String,
    user_id: String,
    platform: String,
    action: String,
    status: String,
    level: String,
    message: String,
    error_details: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl LogRow {
    pub(crate) fn try_into_log(self) -> Result<IntegrationLog, StoreError> {
        Ok(IntegrationLog {
            id: id(&self.id)?,
            user_id: id(&self.user_id)?,
            platform: self.platform,
            action: enum_value("log action", &self.action, LogAction::parse)?,
            status: enum_value("log status", &self.status, LogStatus::parse)?,
            level: enum_value("log level", &self.level, LogLevel::parse)?,
            message: self.message,
            error_details: self.error_details,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct WebhookRow {
    id: String,
    integration_id: String,
    provider: String,
    webhook_url: String,
    webhook_id: String,
    webhook_secret: Option<String>,
    active: bool,
    event_types: Vec<String>,
    last_triggered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WebhookRow {
    pub(crate) fn try_into_registration(self) -> Result<WebhookRegistration, StoreError> {
        Ok(WebhookRegistration {
            id: id(&self.id)?,
            integration_id: id(&self.integration_id)?,
            provider: self.provider,
            webhook_url: self.webhook_url,
            webhook_id: self.webhook_id,
            webhook_secret: self.webhook_secret,
            active: self.active,
            event_types: self.event_types,
            last_triggered_at: self.last_triggered_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct OAuthStateRow {
    token: String,
    user_id: String,
    platform: String,
    workspace_id: Option<String>,
    pkce_verifier: String,
    redirect_uri: String,
    scopes: Vec<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl OAuthStateRow {
    pub(crate) fn try_into_state(self) -> Result<OAuthState, StoreError> {
        Ok(OAuthState {
            token: self.token,
            user_id: id(&self.user_id)?,
            platform: self.platform,
            workspace_id: opt_id(self.workspace_id.as_deref())?,
            pkce_verifier: self.pkce_verifier,
            redirect_uri: self.redirect_uri,
            scopes: self.scopes,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

/// Headers are stored as a JSON object of strings.
pub(crate) fn headers_json(headers: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{IntegrationId, UserId};

    fn integration_row(status: &str, metadata: serde_json::Value) -> IntegrationRow {
        let now = Utc::now();
        IntegrationRow {
            id: IntegrationId::new().to_string(),
            user_id: UserId::new().to_string(),
            workspace_id: None,
            provider: "slack".to_string(),
            provider_name: "Slack".to_string(),
            status: status.to_string(),
            last_sync_at: None,
            next_sync_at: None,
            health_score: 90,
            error_message: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn integration_row_converts() {
        let integration = integration_row("error", json!({"team": "T1"}))
            .try_into_integration()
            .expect("convert");
        assert_eq!(integration.status, IntegrationStatus::Error);
        assert_eq!(integration.health_score, 90);
        assert_eq!(integration.metadata.get("team"), Some(&json!("T1")));
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let err = integration_row("archived", json!({}))
            .try_into_integration()
            .expect_err("unknown status");
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.to_string().contains("archived"));
    }

    #[test]
    fn non_object_metadata_is_corrupt() {
        let err = integration_row("pending", json!([1, 2]))
            .try_into_integration()
            .expect_err("array metadata");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn bad_id_is_corrupt() {
        let mut row = integration_row("pending", json!({}));
        row.user_id = "not-a-ulid".to_string();
        assert!(matches!(
            row.try_into_integration(),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn headers_become_string_object() {
        let mut headers = BTreeMap::new();
        headers.insert("x-github-hook-id".to_string(), "42".to_string());
        assert_eq!(headers_json(&headers), json!({"x-github-hook-id": "42"}));
    }
}
