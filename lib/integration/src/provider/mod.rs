//! Provider plugin contract.
//!
//! Every external service implements [`Provider`]. Plugin calls return
//! outcome structs instead of `Result`: a provider-side failure is data
//! (`success: false` plus a readable error), never an error raised across
//! the plugin boundary.

pub mod github;
pub mod gmail;
pub(crate) mod http;
pub mod instagram;
pub mod registry;
pub mod slack;

pub use registry::ProviderRegistry;

use crate::credential::AdditionalData;
use crate::error::{ProviderError, ProviderNotFound};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tether_core::{IntegrationId, UserId};

/// The fixed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKey {
    Gmail,
    Slack,
    Github,
    Instagram,
}

impl ProviderKey {
    /// Every provider key, in registration order.
    pub const ALL: [Self; 4] = [Self::Gmail, Self::Slack, Self::Github, Self::Instagram];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Slack => "slack",
            Self::Github => "github",
            Self::Instagram => "instagram",
        }
    }

    /// Environment variable prefix for this provider's OAuth client,
    /// e.g. `GMAIL` for `GMAIL_CLIENT_ID`.
    #[must_use]
    pub fn env_prefix(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKey {
    type Err = ProviderNotFound;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ProviderNotFound { key: s.to_string() })
    }
}

/// How a provider authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Oauth2,
    ApiKey,
    /// A long-lived token that is replaced by reconnecting, not refreshed.
    LongLivedToken,
}

/// Static configuration declared by a provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderConfig {
    pub key: ProviderKey,
    pub display_name: &'static str,
    pub auth_type: AuthType,
    pub supports_refresh: bool,
    pub supports_webhooks: bool,
    pub default_scopes: &'static [&'static str],
    pub required_scopes: &'static [&'static str],
    pub base_api_url: &'static str,
    /// OAuth authorization endpoint, for the connect flow.
    pub authorize_url: Option<&'static str>,
    /// OAuth token endpoint, for code exchange.
    pub token_url: Option<&'static str>,
    /// Extra query parameters for the authorization URL.
    pub authorize_params: &'static [(&'static str, &'static str)],
    /// Header carrying the provider-issued webhook id on deliveries.
    pub webhook_id_header: Option<&'static str>,
}

impl ProviderConfig {
    /// Returns true if OAuth client credentials are needed at runtime.
    #[must_use]
    pub fn needs_client_credentials(&self) -> bool {
        self.auth_type == AuthType::Oauth2
    }
}

/// OAuth client id and secret for one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Typed fields narrowed out of a credential's additional data.
///
/// Providers receive these instead of the raw map so no decision is made
/// on the shape of an untyped blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderHints {
    /// `owner/name` of a repository to register a webhook on.
    pub repository: Option<String>,
    /// Event types to subscribe a webhook to.
    pub webhook_events: Vec<String>,
    /// Provider-side account id, when the caller already knows it.
    pub account_id: Option<String>,
}

impl ProviderHints {
    /// Extracts known fields, ignoring anything with an unexpected shape.
    #[must_use]
    pub fn from_additional_data(data: &AdditionalData) -> Self {
        let string = |key: &str| {
            data.get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        let webhook_events = data
            .get("webhook_events")
            .and_then(serde_json::Value::as_array)
            .map(|events| {
                events
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            repository: string("repository").filter(|r| r.split('/').count() == 2),
            webhook_events,
            account_id: string("account_id"),
        }
    }
}

/// Input to [`Provider::bootstrap`].
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub hints: ProviderHints,
    /// URL deliveries should be sent to, if the provider registers webhooks.
    pub webhook_url: Option<String>,
}

impl BootstrapRequest {
    /// Returns the access token or API key, whichever authenticates calls.
    pub(crate) fn bearer(&self) -> Result<&str, ProviderError> {
        self.access_token
            .as_deref()
            .or(self.api_key.as_deref())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::Rejected {
                status: None,
                reason: "no access token or API key supplied".to_string(),
            })
    }
}

/// A webhook the provider registered during bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookGrant {
    pub webhook_id: String,
    pub webhook_secret: Option<String>,
    pub webhook_url: String,
    pub event_types: Vec<String>,
}

/// Result of [`Provider::bootstrap`].
#[derive(Debug, Clone, Default)]
pub struct BootstrapOutcome {
    pub success: bool,
    pub webhook: Option<WebhookGrant>,
    pub initial_sync_completed: bool,
    pub metadata: AdditionalData,
    pub error: Option<String>,
}

impl BootstrapOutcome {
    /// A successful bootstrap with provider metadata.
    #[must_use]
    pub fn success(metadata: AdditionalData) -> Self {
        Self {
            success: true,
            metadata,
            ..Self::default()
        }
    }

    /// A failed bootstrap.
    #[must_use]
    pub fn failure(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    /// Attaches a registered webhook.
    #[must_use]
    pub fn with_webhook(mut self, webhook: WebhookGrant) -> Self {
        self.webhook = Some(webhook);
        self
    }
}

/// Result of [`Provider::refresh_token`].
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub success: bool,
    pub access_token: Option<String>,
    /// A rotated refresh token; `None` keeps the current one.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RefreshOutcome {
    /// A successful refresh.
    #[must_use]
    pub fn success(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            success: true,
            access_token: Some(access_token.into()),
            refresh_token,
            expires_at,
            error: None,
        }
    }

    /// A failed refresh.
    #[must_use]
    pub fn failure(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Input to [`Provider::revoke_access`].
#[derive(Debug, Clone, Default)]
pub struct RevokeRequest {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client: Option<ClientCredentials>,
}

/// Result of [`Provider::revoke_access`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevokeOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl RevokeOutcome {
    #[must_use]
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// A provider plugin.
///
/// Implementations must catch every failure and report it in the
/// returned outcome.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static provider configuration.
    fn config(&self) -> &ProviderConfig;

    /// Validates the credential with the cheapest read call and performs
    /// first-contact setup such as webhook registration.
    async fn bootstrap(&self, request: BootstrapRequest) -> BootstrapOutcome;

    /// Exchanges a refresh token for a new access token.
    async fn refresh_token(
        &self,
        refresh_token: &str,
        client: &ClientCredentials,
    ) -> RefreshOutcome;

    /// Revokes access on the provider side, best-effort.
    async fn revoke_access(&self, request: RevokeRequest) -> RevokeOutcome;

    /// Shorthand for the provider key.
    fn key(&self) -> ProviderKey {
        self.config().key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_key_parses_case_insensitively() {
        assert_eq!("Gmail".parse::<ProviderKey>(), Ok(ProviderKey::Gmail));
        assert_eq!(" slack ".parse::<ProviderKey>(), Ok(ProviderKey::Slack));
        let err = "myspace".parse::<ProviderKey>().unwrap_err();
        assert_eq!(err.key, "myspace");
    }

    #[test]
    fn env_prefix_is_upper_case_key() {
        assert_eq!(ProviderKey::Instagram.env_prefix(), "INSTAGRAM");
    }

    #[test]
    fn hints_narrow_known_fields_only() {
        let mut data = AdditionalData::new();
        data.insert("repository".into(), json!("octo/hello"));
        data.insert("webhook_events".into(), json!(["push", 7, "issues"]));
        data.insert("account_id".into(), json!(42));
        data.insert("anything".into(), json!({"nested": true}));

        let hints = ProviderHints::from_additional_data(&data);
        assert_eq!(hints.repository.as_deref(), Some("octo/hello"));
        assert_eq!(hints.webhook_events, vec!["push", "issues"]);
        assert_eq!(hints.account_id, None);
    }

    #[test]
    fn malformed_repository_is_dropped() {
        let mut data = AdditionalData::new();
        data.insert("repository".into(), json!("not-a-repo"));
        assert_eq!(ProviderHints::from_additional_data(&data).repository, None);
    }

    #[test]
    fn client_credentials_debug_hides_secret() {
        let creds = ClientCredentials {
            client_id: "id".to_string(),
            client_secret: "shh".to_string(),
        };
        assert!(!format!("{creds:?}").contains("shh"));
    }

    #[test]
    fn outcome_constructors() {
        let failed = BootstrapOutcome::failure("invalid_auth");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("invalid_auth"));

        let refreshed = RefreshOutcome::success("new", None, None);
        assert!(refreshed.success);
        assert!(refreshed.refresh_token.is_none());

        assert!(RevokeOutcome::success().success);
    }
}
