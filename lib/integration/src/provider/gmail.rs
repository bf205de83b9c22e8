//! Gmail provider.
//!
//! Bootstrap validates the token against the mailbox profile endpoint.
//! Push notifications need a Pub/Sub topic and are not registered here.

use super::http::{ensure_success, refresh_with_token_endpoint};
use super::{
    AuthType, BootstrapOutcome, BootstrapRequest, ClientCredentials, Provider, ProviderConfig,
    ProviderKey, RefreshOutcome, RevokeOutcome, RevokeRequest,
};
use crate::credential::AdditionalData;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

pub static CONFIG: ProviderConfig = ProviderConfig {
    key: ProviderKey::Gmail,
    display_name: "Gmail",
    auth_type: AuthType::Oauth2,
    supports_refresh: true,
    supports_webhooks: false,
    default_scopes: &[
        "https://www.googleapis.com/auth/gmail.readonly",
        "https://www.googleapis.com/auth/gmail.send",
        "https://www.googleapis.com/auth/gmail.modify",
    ],
    required_scopes: &["https://www.googleapis.com/auth/gmail.readonly"],
    base_api_url: "https://gmail.googleapis.com/gmail/v1",
    authorize_url: Some("https://accounts.google.com/o/oauth2/v2/auth"),
    token_url: Some("https://oauth2.googleapis.com/token"),
    // Offline access with forced consent so Google always issues a refresh token.
    authorize_params: &[("access_type", "offline"), ("prompt", "consent")],
    webhook_id_header: None,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
    #[serde(default)]
    messages_total: Option<u64>,
    #[serde(default)]
    history_id: Option<String>,
}

impl Profile {
    fn into_metadata(self) -> AdditionalData {
        let mut metadata = AdditionalData::new();
        metadata.insert("email_address".into(), json!(self.email_address));
        if let Some(total) = self.messages_total {
            metadata.insert("messages_total".into(), json!(total));
        }
        if let Some(history_id) = self.history_id {
            metadata.insert("history_id".into(), json!(history_id));
        }
        metadata
    }
}

/// Gmail plugin.
#[derive(Debug, Clone)]
pub struct GmailProvider {
    http: reqwest::Client,
}

impl GmailProvider {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn profile(&self, token: &str) -> Result<Profile, ProviderError> {
        let response = self
            .http
            .get(format!("{}/users/me/profile", CONFIG.base_api_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn revoke(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(REVOKE_URL)
            .form(&[("token", token)])
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Provider for GmailProvider {
    fn config(&self) -> &ProviderConfig {
        &CONFIG
    }

    async fn bootstrap(&self, request: BootstrapRequest) -> BootstrapOutcome {
        let token = match request.bearer() {
            Ok(token) => token,
            Err(e) => return BootstrapOutcome::failure(e),
        };
        match self.profile(token).await {
            Ok(profile) => BootstrapOutcome::success(profile.into_metadata()),
            Err(e) => BootstrapOutcome::failure(e),
        }
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        client: &ClientCredentials,
    ) -> RefreshOutcome {
        let Some(token_url) = CONFIG.token_url else {
            return RefreshOutcome::failure(ProviderError::Unsupported {
                operation: "token refresh",
            });
        };
        refresh_with_token_endpoint(&self.http, token_url, refresh_token, client)
            .await
            .unwrap_or_else(RefreshOutcome::failure)
    }

    async fn revoke_access(&self, request: RevokeRequest) -> RevokeOutcome {
        // Revoking the refresh token also kills every access token minted from it.
        let Some(token) = request.refresh_token.or(request.access_token) else {
            return RevokeOutcome::failure("no token to revoke");
        };
        match self.revoke(&token).await {
            Ok(()) => RevokeOutcome::success(),
            Err(e) => RevokeOutcome::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_becomes_metadata() {
        let profile: Profile = serde_json::from_value(json!({
            "emailAddress": "ada@example.com",
            "messagesTotal": 1200,
            "threadsTotal": 800,
            "historyId": "98765"
        }))
        .expect("profile");
        let metadata = profile.into_metadata();
        assert_eq!(metadata["email_address"], json!("ada@example.com"));
        assert_eq!(metadata["messages_total"], json!(1200));
        assert_eq!(metadata["history_id"], json!("98765"));
        assert!(!metadata.contains_key("threadsTotal"));
    }

    #[test]
    fn config_requests_offline_access() {
        assert!(CONFIG.supports_refresh);
        assert!(CONFIG.needs_client_credentials());
        assert!(CONFIG.authorize_params.contains(&("access_type", "offline")));
    }

    #[tokio::test]
    async fn bootstrap_without_token_fails_without_network() {
        let provider = GmailProvider::new(reqwest::Client::new());
        let outcome = provider
            .bootstrap(BootstrapRequest {
                user_id: tether_core::UserId::new(),
                integration_id: tether_core::IntegrationId::new(),
                access_token: None,
                refresh_token: None,
                api_key: None,
                api_secret: None,
                hints: Default::default(),
                webhook_url: None,
            })
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap_or_default().contains("no access token"));
    }
}
