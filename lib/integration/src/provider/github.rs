//! GitHub provider.
//!
//! OAuth app tokens do not expire, so there is no refresh. When the
//! credential names a repository, bootstrap registers a repository
//! webhook pointing back at this service.

use super::http::ensure_success;
use super::{
    AuthType, BootstrapOutcome, BootstrapRequest, ClientCredentials, Provider, ProviderConfig,
    ProviderKey, RefreshOutcome, RevokeOutcome, RevokeRequest, WebhookGrant,
};
use crate::credential::AdditionalData;
use crate::error::ProviderError;
use async_trait::async_trait;
use oauth2::CsrfToken;
use serde::{Deserialize, Serialize};
use serde_json::json;

const API_VERSION: &str = "2022-11-28";
const ACCEPT: &str = "application/vnd.github+json";

/// Events subscribed to when the credential does not name any.
const DEFAULT_EVENTS: &[&str] = &["push", "pull_request", "issues"];

pub static CONFIG: ProviderConfig = ProviderConfig {
    key: ProviderKey::Github,
    display_name: "GitHub",
    auth_type: AuthType::Oauth2,
    supports_refresh: false,
    supports_webhooks: true,
    default_scopes: &["read:user", "repo", "admin:repo_hook"],
    required_scopes: &["read:user"],
    base_api_url: "https://api.github.com",
    authorize_url: Some("https://github.com/login/oauth/authorize"),
    token_url: Some("https://github.com/login/oauth/access_token"),
    authorize_params: &[],
    webhook_id_header: Some("x-github-hook-id"),
};

#[derive(Debug, Deserialize)]
struct User {
    login: String,
    id: u64,
    #[serde(default)]
    html_url: Option<String>,
}

impl User {
    fn into_metadata(self) -> AdditionalData {
        let mut metadata = AdditionalData::new();
        metadata.insert("login".into(), json!(self.login));
        metadata.insert("account_id".into(), json!(self.id));
        if let Some(url) = self.html_url {
            metadata.insert("profile_url".into(), json!(url));
        }
        metadata
    }
}

#[derive(Debug, Serialize)]
struct HookConfig<'a> {
    url: &'a str,
    content_type: &'static str,
    secret: &'a str,
    insecure_ssl: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateHook<'a> {
    name: &'static str,
    active: bool,
    events: &'a [String],
    config: HookConfig<'a>,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: u64,
}

/// GitHub plugin.
#[derive(Debug, Clone)]
pub struct GithubProvider {
    http: reqwest::Client,
}

impl GithubProvider {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn get(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", CONFIG.base_api_url))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn user(&self, token: &str) -> Result<User, ProviderError> {
        let response = self.get("/user", token).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn create_hook(
        &self,
        token: &str,
        repository: &str,
        url: &str,
        events: &[String],
    ) -> Result<WebhookGrant, ProviderError> {
        let secret = CsrfToken::new_random().secret().clone();
        let body = CreateHook {
            name: "web",
            active: true,
            events,
            config: HookConfig {
                url,
                content_type: "json",
                secret: &secret,
                insecure_ssl: "0",
            },
        };
        let response = self
            .http
            .post(format!("{}/repos/{repository}/hooks", CONFIG.base_api_url))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let hook: Hook = ensure_success(response).await?.json().await?;
        Ok(WebhookGrant {
            webhook_id: hook.id.to_string(),
            webhook_secret: Some(secret),
            webhook_url: url.to_string(),
            event_types: events.to_vec(),
        })
    }

    async fn delete_grant(
        &self,
        token: &str,
        client: &ClientCredentials,
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(format!(
                "{}/applications/{}/grant",
                CONFIG.base_api_url, client.client_id
            ))
            .basic_auth(&client.client_id, Some(&client.client_secret))
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .json(&json!({ "access_token": token }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn subscribed_events(requested: &[String]) -> Vec<String> {
    if requested.is_empty() {
        DEFAULT_EVENTS.iter().map(ToString::to_string).collect()
    } else {
        requested.to_vec()
    }
}

#[async_trait]
impl Provider for GithubProvider {
    fn config(&self) -> &ProviderConfig {
        &CONFIG
    }

    async fn bootstrap(&self, request: BootstrapRequest) -> BootstrapOutcome {
        let token = match request.bearer() {
            Ok(token) => token,
            Err(e) => return BootstrapOutcome::failure(e),
        };
        let user = match self.user(token).await {
            Ok(user) => user,
            Err(e) => return BootstrapOutcome::failure(e),
        };
        let mut outcome = BootstrapOutcome::success(user.into_metadata());

        let (Some(repository), Some(url)) = (&request.hints.repository, &request.webhook_url)
        else {
            return outcome;
        };
        let events = subscribed_events(&request.hints.webhook_events);
        match self.create_hook(token, repository, url, &events).await {
            Ok(grant) => {
                outcome
                    .metadata
                    .insert("repository".into(), json!(repository));
                outcome.with_webhook(grant)
            }
            Err(e) => {
                // The token is valid; a hook that cannot be created (for
                // example one that already exists) must not fail the connection.
                tracing::warn!(repository = %repository, error = %e, "github webhook registration failed");
                outcome
                    .metadata
                    .insert("webhook_error".into(), json!(e.to_string()));
                outcome
            }
        }
    }

    async fn refresh_token(
        &self,
        _refresh_token: &str,
        _client: &ClientCredentials,
    ) -> RefreshOutcome {
        RefreshOutcome::failure(ProviderError::Unsupported {
            operation: "token refresh",
        })
    }

    async fn revoke_access(&self, request: RevokeRequest) -> RevokeOutcome {
        let Some(client) = request.client else {
            return RevokeOutcome::failure(ProviderError::MissingClientCredentials {
                provider: ProviderKey::Github,
            });
        };
        let Some(token) = request.access_token else {
            return RevokeOutcome::failure("no access token to revoke");
        };
        match self.delete_grant(&token, &client).await {
            Ok(()) => RevokeOutcome::success(),
            Err(e) => RevokeOutcome::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_events_when_none_requested() {
        assert_eq!(subscribed_events(&[]), vec!["push", "pull_request", "issues"]);
        let requested = vec!["release".to_string()];
        assert_eq!(subscribed_events(&requested), requested);
    }

    #[test]
    fn hook_payload_shape() {
        let events = vec!["push".to_string()];
        let body = CreateHook {
            name: "web",
            active: true,
            events: &events,
            config: HookConfig {
                url: "https://tether.example/webhooks/github",
                content_type: "json",
                secret: "s3cret",
                insecure_ssl: "0",
            },
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["name"], json!("web"));
        assert_eq!(value["events"], json!(["push"]));
        assert_eq!(value["config"]["content_type"], json!("json"));
    }

    #[test]
    fn user_becomes_metadata() {
        let user: User = serde_json::from_value(json!({
            "login": "octocat",
            "id": 583231,
            "html_url": "https://github.com/octocat"
        }))
        .expect("user");
        let metadata = user.into_metadata();
        assert_eq!(metadata["login"], json!("octocat"));
        assert_eq!(metadata["account_id"], json!(583231));
    }

    #[tokio::test]
    async fn refresh_is_unsupported() {
        let provider = GithubProvider::new(reqwest::Client::new());
        let creds = ClientCredentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        };
        let outcome = provider.refresh_token("r", &creds).await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("provider does not support token refresh")
        );
    }

    #[tokio::test]
    async fn revoke_requires_client_credentials() {
        let provider = GithubProvider::new(reqwest::Client::new());
        let outcome = provider
            .revoke_access(RevokeRequest {
                access_token: Some("gho_x".to_string()),
                ..RevokeRequest::default()
            })
            .await;
        assert!(!outcome.success);
    }
}
