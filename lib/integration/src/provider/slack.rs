//! Slack provider.
//!
//! Slack answers most failures with HTTP 200 and `"ok": false`, so every
//! response goes through [`Envelope::into_result`].

use super::http::ensure_success;
use super::{
    AuthType, BootstrapOutcome, BootstrapRequest, ClientCredentials, Provider, ProviderConfig,
    ProviderKey, RefreshOutcome, RevokeOutcome, RevokeRequest,
};
use crate::credential::AdditionalData;
use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

pub static CONFIG: ProviderConfig = ProviderConfig {
    key: ProviderKey::Slack,
    display_name: "Slack",
    auth_type: AuthType::Oauth2,
    supports_refresh: true,
    supports_webhooks: false,
    default_scopes: &["channels:read", "chat:write", "users:read"],
    required_scopes: &["chat:write"],
    base_api_url: "https://slack.com/api",
    authorize_url: Some("https://slack.com/oauth/v2/authorize"),
    token_url: Some("https://slack.com/api/oauth.v2.access"),
    authorize_params: &[],
    webhook_id_header: None,
};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: Option<T>,
}

impl<T> Envelope<T> {
    fn into_result(self) -> Result<T, ProviderError> {
        match (self.ok, self.body) {
            (true, Some(body)) => Ok(body),
            _ => Err(ProviderError::Rejected {
                status: None,
                reason: self.error.unwrap_or_else(|| "unknown_error".to_string()),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthTest {
    url: String,
    team: String,
    team_id: String,
    user_id: String,
    #[serde(default)]
    bot_id: Option<String>,
}

impl AuthTest {
    fn into_metadata(self) -> AdditionalData {
        let mut metadata = AdditionalData::new();
        metadata.insert("team".into(), json!(self.team));
        metadata.insert("team_id".into(), json!(self.team_id));
        metadata.insert("user_id".into(), json!(self.user_id));
        metadata.insert("url".into(), json!(self.url));
        if let Some(bot_id) = self.bot_id {
            metadata.insert("bot_id".into(), json!(bot_id));
        }
        metadata
    }
}

#[derive(Debug, Deserialize)]
struct RotatedToken {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl RotatedToken {
    fn into_outcome(self) -> RefreshOutcome {
        let expires_at = self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs));
        RefreshOutcome::success(self.access_token, self.refresh_token, expires_at)
    }
}

#[derive(Debug, Deserialize)]
struct Revoked {
    #[serde(default)]
    revoked: bool,
}

/// Slack plugin.
#[derive(Debug, Clone)]
pub struct SlackProvider {
    http: reqwest::Client,
}

impl SlackProvider {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn read<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        ensure_success(response)
            .await?
            .json::<Envelope<T>>()
            .await?
            .into_result()
    }

    async fn auth_test(&self, token: &str) -> Result<AuthTest, ProviderError> {
        let response = self
            .http
            .post(format!("{}/auth.test", CONFIG.base_api_url))
            .bearer_auth(token)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn rotate(
        &self,
        refresh_token: &str,
        client: &ClientCredentials,
    ) -> Result<RotatedToken, ProviderError> {
        let response = self
            .http
            .post(format!("{}/oauth.v2.access", CONFIG.base_api_url))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
            ])
            .send()
            .await?;
        Self::read(response).await
    }

    async fn revoke(&self, token: &str) -> Result<bool, ProviderError> {
        let response = self
            .http
            .post(format!("{}/auth.revoke", CONFIG.base_api_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::read::<Revoked>(response).await?.revoked)
    }
}

#[async_trait]
impl Provider for SlackProvider {
    fn config(&self) -> &ProviderConfig {
        &CONFIG
    }

    async fn bootstrap(&self, request: BootstrapRequest) -> BootstrapOutcome {
        let token = match request.bearer() {
            Ok(token) => token,
            Err(e) => return BootstrapOutcome::failure(e),
        };
        match self.auth_test(token).await {
            Ok(identity) => BootstrapOutcome::success(identity.into_metadata()),
            Err(e) => BootstrapOutcome::failure(e),
        }
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        client: &ClientCredentials,
    ) -> RefreshOutcome {
        match self.rotate(refresh_token, client).await {
            Ok(token) => token.into_outcome(),
            Err(e) => RefreshOutcome::failure(e),
        }
    }

    async fn revoke_access(&self, request: RevokeRequest) -> RevokeOutcome {
        let Some(token) = request.access_token else {
            return RevokeOutcome::failure("no access token to revoke");
        };
        match self.revoke(&token).await {
            Ok(true) => RevokeOutcome::success(),
            Ok(false) => RevokeOutcome::failure("slack did not revoke the token"),
            Err(e) => RevokeOutcome::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_is_rejected_with_slack_code() {
        let envelope: Envelope<AuthTest> =
            serde_json::from_value(json!({"ok": false, "error": "invalid_auth"}))
                .expect("envelope");
        let err = envelope.into_result().unwrap_err();
        assert_eq!(
            err,
            ProviderError::Rejected {
                status: None,
                reason: "invalid_auth".to_string()
            }
        );
    }

    #[test]
    fn auth_test_becomes_metadata() {
        let envelope: Envelope<AuthTest> = serde_json::from_value(json!({
            "ok": true,
            "url": "https://acme.slack.com/",
            "team": "Acme",
            "user": "bot",
            "team_id": "T123",
            "user_id": "U456",
            "bot_id": "B789"
        }))
        .expect("envelope");
        let metadata = envelope.into_result().expect("ok").into_metadata();
        assert_eq!(metadata["team_id"], json!("T123"));
        assert_eq!(metadata["bot_id"], json!("B789"));
    }

    #[test]
    fn rotated_token_carries_new_refresh_token_and_expiry() {
        let token: RotatedToken = serde_json::from_value(json!({
            "access_token": "xoxe.xoxp-new",
            "refresh_token": "xoxe-1-new",
            "expires_in": 43200
        }))
        .expect("token");
        let before = Utc::now();
        let outcome = token.into_outcome();
        assert!(outcome.success);
        assert_eq!(outcome.refresh_token.as_deref(), Some("xoxe-1-new"));
        let expires_at = outcome.expires_at.expect("expiry");
        assert!(expires_at >= before + Duration::hours(12));
    }
}
