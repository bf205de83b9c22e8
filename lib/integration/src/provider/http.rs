//! HTTP plumbing shared by the built-in providers.

use super::{ClientCredentials, RefreshOutcome};
use crate::error::ProviderError;
use chrono::Utc;
use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::{
    ClientId, ClientSecret, HttpClientError, RefreshToken, RequestTokenError, TokenResponse,
    TokenUrl,
};
use std::time::Duration;

const USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

/// Builds the HTTP client providers share.
///
/// Redirects are disabled so token endpoints cannot bounce credentials
/// to another host.
pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ProviderError::RequestFailed {
            reason: format!("HTTP client error: {e}"),
        })
}

/// Turns a non-2xx response into [`ProviderError::Rejected`].
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Rejected {
        status: Some(status.as_u16()),
        reason: truncate(body.trim(), MAX_ERROR_BODY),
    })
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Error type of token requests sent through the shared client.
pub(crate) type TokenError =
    RequestTokenError<HttpClientError<reqwest::Error>, BasicErrorResponse>;

/// Maps a token endpoint failure; an OAuth error response is a rejection.
pub(crate) fn token_error(e: TokenError) -> ProviderError {
    match e {
        RequestTokenError::ServerResponse(response) => ProviderError::Rejected {
            status: None,
            reason: response.to_string(),
        },
        other => ProviderError::RequestFailed {
            reason: other.to_string(),
        },
    }
}

/// Runs a standard OAuth 2.0 refresh-token grant against `token_url`.
pub(crate) async fn refresh_with_token_endpoint(
    http: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
    client: &ClientCredentials,
) -> Result<RefreshOutcome, ProviderError> {
    let token_url = TokenUrl::new(token_url.to_string()).map_err(|e| ProviderError::RequestFailed {
        reason: format!("invalid token URL: {e}"),
    })?;
    let oauth = BasicClient::new(ClientId::new(client.client_id.clone()))
        .set_client_secret(ClientSecret::new(client.client_secret.clone()))
        .set_token_uri(token_url);

    let token = oauth
        .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
        .request_async(http)
        .await
        .map_err(token_error)?;

    let expires_at = token
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);

    Ok(RefreshOutcome::success(
        token.access_token().secret().clone(),
        token.refresh_token().map(|t| t.secret().clone()),
        expires_at,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_bodies() {
        assert_eq!(truncate("invalid_auth", 200), "invalid_auth");
    }

    #[test]
    fn truncate_cuts_on_char_boundary() {
        let body = "é".repeat(10);
        assert_eq!(truncate(&body, 3), "ééé...");
    }

    #[test]
    fn client_builds() {
        assert!(client(Duration::from_secs(5)).is_ok());
    }
}
