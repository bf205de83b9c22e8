//! OAuth connect flow.
//!
//! `begin` stores a short-lived [`OAuthState`] and hands back the provider
//! authorization URL. `complete` consumes that state exactly once,
//! exchanges the code and saves the resulting credential.

use crate::credential::{CredentialKind, Secrets};
use crate::error::LifecycleError;
use crate::manager::{Lifecycle, SaveCredential, SaveReceipt};
use crate::provider::http;
use chrono::{DateTime, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tether_core::{UserId, WorkspaceId};
use tracing::instrument;

/// A pending authorization, keyed by its CSRF token.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub token: String,
    pub user_id: UserId,
    pub platform: String,
    pub workspace_id: Option<WorkspaceId>,
    pub pkce_verifier: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for OAuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthState")
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("workspace_id", &self.workspace_id)
            .field("pkce_verifier", &"[redacted]")
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl OAuthState {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Where to send the user to authorize.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStart {
    pub authorize_url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// Tokens returned by a code exchange.
#[derive(Clone)]
pub(crate) struct ExchangedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<Vec<String>>,
}

fn invalid_url(what: &str, e: impl fmt::Display) -> LifecycleError {
    LifecycleError::InvalidState {
        reason: format!("invalid {what} URL: {e}"),
    }
}

impl Lifecycle {
    /// Starts an OAuth connect for `platform`.
    ///
    /// Requested scopes default to the provider's defaults; required scopes
    /// are always added. Expired states are purged on the way.
    ///
    /// # Errors
    ///
    /// Unknown providers, providers without an authorization endpoint,
    /// missing client credentials and datastore failures.
    #[instrument(skip(self, scopes))]
    pub async fn begin_oauth(
        &self,
        user_id: UserId,
        platform: &str,
        workspace_id: Option<WorkspaceId>,
        scopes: Option<Vec<String>>,
    ) -> Result<AuthorizationStart, LifecycleError> {
        let provider = self.registry.resolve(platform)?;
        let config = provider.config();
        let Some(authorize_url) = config.authorize_url else {
            return Err(LifecycleError::InvalidState {
                reason: format!("{} does not use an OAuth connect flow", config.key),
            });
        };
        let client = self.client_for(config)?;
        let redirect_uri = self.settings.oauth_redirect_url(config.key);

        let now = Utc::now();
        let purged = self.store.purge_oauth_states(now).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged expired OAuth states");
        }

        let mut scopes = scopes
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| config.default_scopes.iter().map(ToString::to_string).collect());
        for required in config.required_scopes {
            if !scopes.iter().any(|s| s == required) {
                scopes.push((*required).to_string());
            }
        }

        let oauth = BasicClient::new(ClientId::new(client.client_id))
            .set_client_secret(ClientSecret::new(client.client_secret))
            .set_auth_uri(
                AuthUrl::new(authorize_url.to_string()).map_err(|e| invalid_url("authorize", e))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri.clone()).map_err(|e| invalid_url("redirect", e))?,
            );
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = oauth
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(challenge)
            .add_scopes(scopes.iter().cloned().map(Scope::new));
        for (name, value) in config.authorize_params {
            request = request.add_extra_param(*name, *value);
        }
        let (url, csrf) = request.url();

        let state = OAuthState {
            token: csrf.secret().clone(),
            user_id,
            platform: config.key.as_str().to_string(),
            workspace_id,
            pkce_verifier: verifier.secret().clone(),
            redirect_uri,
            scopes,
            created_at: now,
            expires_at: now + self.settings.oauth_state_ttl(),
        };
        self.store.insert_oauth_state(&state).await?;

        Ok(AuthorizationStart {
            authorize_url: url.to_string(),
            state: state.token,
            expires_at: state.expires_at,
        })
    }

    /// Finishes an OAuth connect: consumes the state, exchanges the code
    /// and saves the credential.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::OAuthState`] for unknown, reused, expired or
    /// mismatched states; provider and datastore failures.
    #[instrument(skip(self, code, state))]
    pub async fn complete_oauth(
        &self,
        platform: &str,
        code: &str,
        state: &str,
    ) -> Result<SaveReceipt, LifecycleError> {
        let state = self.take_valid_state(platform, state).await?;
        let provider = self.registry.resolve(&state.platform)?;
        let config = provider.config();
        let Some(token_url) = config.token_url else {
            return Err(LifecycleError::InvalidState {
                reason: format!("{} does not use an OAuth connect flow", config.key),
            });
        };
        let client = self.client_for(config)?;
        let http = http::client(self.settings.provider_timeout())?;

        let oauth = BasicClient::new(ClientId::new(client.client_id))
            .set_client_secret(ClientSecret::new(client.client_secret))
            .set_token_uri(TokenUrl::new(token_url.to_string()).map_err(|e| invalid_url("token", e))?)
            .set_redirect_uri(
                RedirectUrl::new(state.redirect_uri.clone())
                    .map_err(|e| invalid_url("redirect", e))?,
            );
        let exchange = oauth
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(state.pkce_verifier.clone()))
            .request_async(&http);
        let token = self
            .call_provider(exchange)
            .await?
            .map_err(http::token_error)
            .inspect_err(|e| tracing::warn!(error = %e, "OAuth code exchange failed"))?;

        let tokens = ExchangedTokens {
            access_token: token.access_token().secret().clone(),
            refresh_token: token.refresh_token().map(|t| t.secret().clone()),
            expires_at: token
                .expires_in()
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| Utc::now() + d),
            scopes: token
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.to_string()).collect()),
        };
        self.finish_oauth(state, tokens).await
    }

    async fn take_valid_state(
        &self,
        platform: &str,
        token: &str,
    ) -> Result<OAuthState, LifecycleError> {
        let Some(state) = self.store.take_oauth_state(token).await? else {
            return Err(LifecycleError::OAuthState {
                reason: "unknown or already used state".to_string(),
            });
        };
        if state.is_expired(Utc::now()) {
            return Err(LifecycleError::OAuthState {
                reason: "state expired".to_string(),
            });
        }
        if !state.platform.eq_ignore_ascii_case(platform.trim()) {
            return Err(LifecycleError::OAuthState {
                reason: "state was issued for another provider".to_string(),
            });
        }
        Ok(state)
    }

    pub(crate) async fn finish_oauth(
        &self,
        state: OAuthState,
        tokens: ExchangedTokens,
    ) -> Result<SaveReceipt, LifecycleError> {
        let mut secrets = Secrets::access_token(tokens.access_token);
        secrets.refresh_token = tokens.refresh_token;
        self.save_credential(SaveCredential {
            user_id: state.user_id,
            platform: state.platform,
            display_name: None,
            workspace_id: state.workspace_id,
            kind: CredentialKind::Oauth,
            secrets,
            scopes: tokens.scopes.unwrap_or(state.scopes),
            expires_at: tokens.expires_at,
            additional_data: serde_json::Map::new(),
        })
        .await
    }
}
