//! Instagram provider.
//!
//! Instagram issues long-lived tokens that cannot be refreshed with a
//! refresh token and offers no revocation endpoint. An expiring token is
//! replaced by reconnecting.

use super::http::ensure_success;
use super::{
    AuthType, BootstrapOutcome, BootstrapRequest, ClientCredentials, Provider, ProviderConfig,
    ProviderKey, RefreshOutcome, RevokeOutcome, RevokeRequest,
};
use crate::credential::AdditionalData;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

pub static CONFIG: ProviderConfig = ProviderConfig {
    key: ProviderKey::Instagram,
    display_name: "Instagram",
    auth_type: AuthType::LongLivedToken,
    supports_refresh: false,
    supports_webhooks: false,
    default_scopes: &["instagram_business_basic"],
    required_scopes: &["instagram_business_basic"],
    base_api_url: "https://graph.instagram.com",
    authorize_url: None,
    token_url: None,
    authorize_params: &[],
    webhook_id_header: None,
};

#[derive(Debug, Deserialize)]
struct Account {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    account_type: Option<String>,
}

impl Account {
    fn into_metadata(self) -> AdditionalData {
        let mut metadata = AdditionalData::new();
        metadata.insert("account_id".into(), json!(self.id));
        if let Some(username) = self.username {
            metadata.insert("username".into(), json!(username));
        }
        if let Some(account_type) = self.account_type {
            metadata.insert("account_type".into(), json!(account_type));
        }
        metadata
    }
}

/// Instagram plugin.
#[derive(Debug, Clone)]
pub struct InstagramProvider {
    http: reqwest::Client,
}

impl InstagramProvider {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn me(&self, token: &str) -> Result<Account, ProviderError> {
        let response = self
            .http
            .get(format!("{}/me", CONFIG.base_api_url))
            .query(&[("fields", "id,username,account_type"), ("access_token", token)])
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

#[async_trait]
impl Provider for InstagramProvider {
    fn config(&self) -> &ProviderConfig {
        &CONFIG
    }

    async fn bootstrap(&self, request: BootstrapRequest) -> BootstrapOutcome {
        let token = match request.bearer() {
            Ok(token) => token,
            Err(e) => return BootstrapOutcome::failure(e),
        };
        match self.me(token).await {
            Ok(account) => BootstrapOutcome::success(account.into_metadata()),
            Err(e) => BootstrapOutcome::failure(e),
        }
    }

    async fn refresh_token(
        &self,
        _refresh_token: &str,
        _client: &ClientCredentials,
    ) -> RefreshOutcome {
        RefreshOutcome::failure(
            "instagram long-lived tokens cannot be refreshed; reconnect the account",
        )
    }

    async fn revoke_access(&self, _request: RevokeRequest) -> RevokeOutcome {
        RevokeOutcome::failure(ProviderError::Unsupported {
            operation: "access revocation",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_need_client_credentials() {
        assert!(!CONFIG.needs_client_credentials());
        assert!(CONFIG.authorize_url.is_none());
    }

    #[test]
    fn account_becomes_metadata() {
        let account: Account = serde_json::from_value(json!({
            "id": "17841400000000000",
            "username": "ada"
        }))
        .expect("account");
        let metadata = account.into_metadata();
        assert_eq!(metadata["account_id"], json!("17841400000000000"));
        assert_eq!(metadata["username"], json!("ada"));
        assert!(!metadata.contains_key("account_type"));
    }

    #[tokio::test]
    async fn refresh_and_revoke_report_failure() {
        let provider = InstagramProvider::new(reqwest::Client::new());
        let creds = ClientCredentials {
            client_id: String::new(),
            client_secret: String::new(),
        };
        let refreshed = provider.refresh_token("x", &creds).await;
        assert!(!refreshed.success);
        assert!(refreshed.error.unwrap_or_default().contains("reconnect"));

        let revoked = provider.revoke_access(RevokeRequest::default()).await;
        assert!(!revoked.success);
    }
}
