//! HTTP routes.
//!
//! Every response body is a JSON object with a `success` flag; failures
//! carry an `error` message (see [`ApiError`]).

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tether_core::{IntegrationId, ParseIdError, UserId, WorkspaceId};
use tether_integration::{
    Credential, Integration, IntegrationLog, Lifecycle, LifecycleError, RawWebhook,
    SaveCredential, Secrets, SyncJob, WebhookIngestor,
};
use tether_scheduler::{HealthSweeper, SchedulerError};
use tower_http::trace::TraceLayer;

/// Default and maximum number of audit entries returned by the log route.
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Lifecycle,
    pub sweeper: HealthSweeper,
    pub ingestor: WebhookIngestor,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/credentials", post(save_credential))
        .route(
            "/credentials/{user_id}/{platform}",
            get(open_credential).delete(deactivate_credential),
        )
        .route(
            "/integrations/{id}",
            get(integration_view).delete(delete_integration),
        )
        .route("/integrations/{id}/refresh", post(refresh_integration))
        .route("/integrations/{id}/bootstrap", post(retry_bootstrap))
        .route("/users/{user_id}/integrations", get(list_integrations))
        .route("/users/{user_id}/logs", get(recent_logs))
        .route("/health-check", post(health_check))
        .route("/webhooks/{provider}", post(receive_webhook))
        .route("/oauth/{provider}/start", get(oauth_start))
        .route("/oauth/{provider}/callback", get(oauth_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A successful response: `body` serialized alongside `success`.
#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn ok<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        body,
    })
}

fn parse_id<T: FromStr<Err = ParseIdError>>(raw: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|e: ParseIdError| ApiError::bad_request(e.to_string()))
}

#[derive(Serialize)]
struct CredentialBody {
    credential: Credential,
    secrets: Secrets,
}

#[derive(Serialize)]
struct Integrations {
    integrations: Vec<Integration>,
}

#[derive(Serialize)]
struct Logs {
    logs: Vec<IntegrationLog>,
}

#[derive(Serialize)]
struct Job {
    job: SyncJob,
}

#[derive(Serialize)]
struct Deleted {
    integration_id: IntegrationId,
}

async fn save_credential(
    State(state): State<AppState>,
    body: Result<Json<SaveCredential>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let receipt = state.lifecycle.save_credential(request).await?;
    Ok((StatusCode::CREATED, ok(receipt)))
}

async fn open_credential(
    State(state): State<AppState>,
    Path((user_id, platform)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_id(&user_id)?;
    let open = state.lifecycle.open_credential(user_id, &platform).await?;
    Ok(ok(CredentialBody {
        credential: open.credential,
        secrets: open.secrets,
    }))
}

async fn deactivate_credential(
    State(state): State<AppState>,
    Path((user_id, platform)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_id(&user_id)?;
    let report = state
        .lifecycle
        .deactivate_credential(user_id, &platform)
        .await?;
    Ok(ok(report))
}

#[derive(Debug, Default, Deserialize)]
struct RefreshQuery {
    #[serde(default)]
    force: bool,
}

async fn refresh_integration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RefreshQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id: IntegrationId = parse_id(&id)?;
    let result = state.lifecycle.refresh_integration(id, query.force).await?;
    Ok(Json(Envelope {
        success: !result.is_failure(),
        body: result,
    }))
}

async fn retry_bootstrap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: IntegrationId = parse_id(&id)?;
    let job = state.lifecycle.retry_bootstrap(id).await?;
    Ok((StatusCode::ACCEPTED, ok(Job { job })))
}

async fn integration_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: IntegrationId = parse_id(&id)?;
    Ok(ok(state.lifecycle.integration_view(id).await?))
}

async fn delete_integration(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let integration_id: IntegrationId = parse_id(&id)?;
    state.lifecycle.delete_integration(integration_id).await?;
    Ok(ok(Deleted { integration_id }))
}

async fn list_integrations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_id(&user_id)?;
    let integrations = state.lifecycle.list_integrations(user_id).await?;
    Ok(ok(Integrations { integrations }))
}

#[derive(Debug, Default, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

async fn recent_logs(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_id(&user_id)?;
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let logs = state.lifecycle.recent_logs(user_id, limit).await?;
    Ok(ok(Logs { logs }))
}

async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.sweeper.sweep().await.map_err(|e| match e {
        SchedulerError::ListFailed(store) => ApiError::from(LifecycleError::Store(store)),
        SchedulerError::InvalidSettings { reason } => ApiError::bad_request(reason),
    })?;
    Ok(ok(report))
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let headers = headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    });
    let delivery = RawWebhook::new(headers, body.to_vec());
    let receipt = state.ingestor.ingest(&provider, delivery).await?;
    Ok((StatusCode::ACCEPTED, ok(receipt)))
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    user_id: String,
    workspace_id: Option<String>,
    /// Comma or space separated.
    scopes: Option<String>,
    /// Answer with a redirect to the provider instead of JSON.
    #[serde(default)]
    redirect: bool,
}

async fn oauth_start(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<StartQuery>,
) -> Result<Response, ApiError> {
    let user_id: UserId = parse_id(&query.user_id)?;
    let workspace_id = query
        .workspace_id
        .as_deref()
        .map(parse_id::<WorkspaceId>)
        .transpose()?;
    let scopes = query.scopes.as_deref().map(|raw| {
        raw.split([',', ' '])
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    });

    let start = state
        .lifecycle
        .begin_oauth(user_id, &provider, workspace_id, scopes)
        .await?;
    if query.redirect {
        Ok(Redirect::to(&start.authorize_url).into_response())
    } else {
        Ok(ok(start).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(error) = query.error {
        let reason = match query.error_description {
            Some(description) => format!("authorization denied: {error}: {description}"),
            None => format!("authorization denied: {error}"),
        };
        return Err(ApiError::bad_request(reason));
    }
    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return Err(ApiError::bad_request("code and state are required"));
    };
    let receipt = state
        .lifecycle
        .complete_oauth(&provider, &code, &oauth_state)
        .await?;
    Ok((StatusCode::CREATED, ok(receipt)))
}
