//! API routes
//!
//! OAuth endpoints (token, device authorization, introspection, revocation,
//! dynamic client registration) plus device approval and health. Tenant
//! scope and acting principal arrive as headers; transports in front of
//! this service are expected to authenticate and fill them.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{AddOidcApp, Commands, UpdateOidcApp};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::oauth::codes;
use crate::oauth::grants::{GrantFailure, GrantHandler, RequestFacts, TokenRequest};
use crate::oauth::registration::{self, ClientMetadata};
use crate::oauth::{OAuthError, OAuthErrorCode};
use crate::projection::Projector;
use crate::query::{Page, Queries};

/// Header carrying the tenant; a deployment terminating multi-tenant
/// routing in front of this service sets it per request.
const HEADER_INSTANCE: &str = "x-instance-id";
const HEADER_ORG: &str = "x-org-id";
const HEADER_USER: &str = "x-user-id";
const HEADER_REQUEST_ID: &str = "x-request-id";
const HEADER_DPOP: &str = "dpop";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub commands: Commands,
    pub grants: GrantHandler,
    pub queries: Queries,
    pub projector: Arc<Projector>,
    pub issuer: String,
}

/// Build the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/oauth/token", post(token))
        .route("/oauth/device_authorization", post(device_authorization))
        .route("/oauth/introspect", post(introspect))
        .route("/oauth/revoke", post(revoke))
        .route("/oauth/register", post(register_client))
        .route(
            "/oauth/register/:client_id",
            get(read_client).put(update_client).delete(delete_client),
        )
        .route("/device/approve", post(approve_device))
        .route("/device/deny", post(deny_device))
        .route("/device/:user_code", get(get_device_auth))
        .route("/users", get(list_users))
        .route("/users/:user_id", get(get_user))
        .route("/clients/:client_id", get(get_client))
        .route("/idps", get(list_idps))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Build the command context from request headers
fn context_from_headers(headers: &HeaderMap) -> Context {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };

    let mut ctx = Context::new(header(HEADER_INSTANCE).unwrap_or_else(|| "default".to_string()));
    if let Some(org_id) = header(HEADER_ORG) {
        ctx = ctx.with_org(org_id);
    }
    if let Some(user_id) = header(HEADER_USER) {
        ctx = ctx.with_user(user_id);
    }
    let request_id = header(HEADER_REQUEST_ID)
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(Uuid::new_v4);
    ctx.with_request_id(request_id)
}

/// OAuth error body, `{error, error_description}`
#[derive(Debug, Serialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
}

fn oauth_error_response(err: OAuthError) -> Response {
    let status = match err.code {
        OAuthErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_REQUEST,
    };
    let body = OAuthErrorBody {
        error: err.code.as_str().to_string(),
        error_description: err.description,
    };
    (status, Json(body)).into_response()
}

fn grant_failure_response(failure: GrantFailure) -> Response {
    match failure {
        GrantFailure::Protocol(err) => oauth_error_response(err),
        GrantFailure::Internal(err) => err.into_response(),
    }
}

// =========================================================================
// Token endpoint
// =========================================================================

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    let ctx = context_from_headers(&headers);
    let mut facts = RequestFacts::post(&format!("{}/oauth/token", state.issuer));
    if let Some(proof) = headers.get(HEADER_DPOP).and_then(|v| v.to_str().ok()) {
        facts = facts.with_proof(proof);
    }

    match state.grants.token(&ctx, request, facts).await {
        Ok(response) => Json(response).into_response(),
        Err(failure) => grant_failure_response(failure),
    }
}

// =========================================================================
// Device authorization endpoint (RFC 8628)
// =========================================================================

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationRequest {
    client_id: String,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: String,
    expires_in: i64,
    interval: i64,
}

async fn device_authorization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(request): Form<DeviceAuthorizationRequest>,
) -> Response {
    let ctx = context_from_headers(&headers);
    let scope = request
        .scope
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();

    match state
        .commands
        .add_device_auth(&ctx, &request.client_id, scope, None)
        .await
    {
        Ok(added) => Json(DeviceAuthorizationResponse {
            device_code: added.device_code,
            user_code: added.user_code,
            verification_uri: added.verification_uri,
            verification_uri_complete: added.verification_uri_complete,
            expires_in: added.expires_in,
            interval: added.interval,
        })
        .into_response(),
        Err(AppError::InvalidInput(msg)) => {
            oauth_error_response(OAuthError::with_description(OAuthErrorCode::InvalidRequest, msg))
        }
        Err(AppError::PermissionDenied(msg)) => oauth_error_response(OAuthError::with_description(
            OAuthErrorCode::UnauthorizedClient,
            msg,
        )),
        Err(err) => err.into_response(),
    }
}

// =========================================================================
// Introspection and revocation (RFC 7662, RFC 7009)
// =========================================================================

#[derive(Debug, Deserialize)]
struct TokenForm {
    token: String,
}

async fn introspect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match state.grants.engine().introspect(&ctx, &form.token).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Response {
    let ctx = context_from_headers(&headers);
    let revoked_by = ctx.creator();
    match state
        .grants
        .engine()
        .revoke(&ctx, &form.token, &revoked_by)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

// =========================================================================
// Dynamic client registration (RFC 7591/7592)
// =========================================================================

const HEADER_PROJECT: &str = "x-project-id";

#[derive(Debug, Serialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    client_id_issued_at: i64,
    client_secret_expires_at: i64,
    redirect_uris: Vec<String>,
    grant_types: Vec<String>,
    response_types: Vec<String>,
    token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_client_uri: Option<String>,
}

async fn register_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(metadata): Json<ClientMetadata>,
) -> Response {
    let ctx = context_from_headers(&headers);
    let Some(project_id) = headers
        .get(HEADER_PROJECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
    else {
        return oauth_error_response(OAuthError::with_description(
            OAuthErrorCode::InvalidClientMetadata,
            "x-project-id header is required",
        ));
    };

    let validated = match registration::validate(metadata) {
        Ok(validated) => validated,
        Err(err) => return oauth_error_response(err),
    };

    let add = AddOidcApp {
        project_id,
        name: validated.client_name.clone(),
        redirect_uris: validated.redirect_uris.clone(),
        response_types: validated.response_types.clone(),
        grant_types: validated.grant_types.clone(),
        auth_method: validated.token_endpoint_auth_method.clone(),
        with_registration_token: true,
    };

    match state.commands.add_oidc_app(&ctx, add).await {
        Ok(added) => {
            let response = RegistrationResponse {
                client_id: added.client_id.clone(),
                client_secret: added.client_secret,
                client_id_issued_at: added.created_at.timestamp(),
                client_secret_expires_at: 0,
                redirect_uris: validated.redirect_uris,
                grant_types: validated.grant_types,
                response_types: validated.response_types,
                token_endpoint_auth_method: validated.token_endpoint_auth_method,
                registration_access_token: added.registration_token,
                registration_client_uri: Some(format!(
                    "{}/oauth/register/{}",
                    state.issuer, added.client_id
                )),
            };
            (StatusCode::CREATED, Json(response)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// Authorize an RFC 7592 management call against the registration token
async fn manage_client(
    commands: &Commands,
    ctx: &Context,
    headers: &HeaderMap,
    client_id: &str,
) -> AppResult<crate::aggregate::AppWriteModel> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::PermissionDenied("registration token required".to_string()))?;

    let app = commands.app_by_client_id(ctx, client_id).await?;
    let valid = app
        .oidc
        .as_ref()
        .and_then(|c| c.registration_token_hash.as_deref())
        .map(|hash| codes::verify_secret(token, hash))
        .unwrap_or(false);
    if !valid {
        return Err(AppError::PermissionDenied("invalid registration token".to_string()));
    }
    Ok(app)
}

async fn read_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match manage_client(&state.commands, &ctx, &headers, &client_id).await {
        Ok(app) => {
            let config = app.oidc.as_ref();
            let response = RegistrationResponse {
                client_id,
                client_secret: None,
                client_id_issued_at: app
                    .created_at
                    .map(|t: DateTime<Utc>| t.timestamp())
                    .unwrap_or_default(),
                client_secret_expires_at: 0,
                redirect_uris: config.map(|c| c.redirect_uris.clone()).unwrap_or_default(),
                grant_types: config.map(|c| c.grant_types.clone()).unwrap_or_default(),
                response_types: config.map(|c| c.response_types.clone()).unwrap_or_default(),
                token_endpoint_auth_method: config
                    .map(|c| c.auth_method.clone())
                    .unwrap_or_default(),
                registration_access_token: None,
                registration_client_uri: None,
            };
            Json(response).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn update_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
    Json(metadata): Json<ClientMetadata>,
) -> Response {
    let ctx = context_from_headers(&headers);
    let app = match manage_client(&state.commands, &ctx, &headers, &client_id).await {
        Ok(app) => app,
        Err(err) => return err.into_response(),
    };
    let validated = match registration::validate(metadata) {
        Ok(validated) => validated,
        Err(err) => return oauth_error_response(err),
    };

    let update = UpdateOidcApp {
        redirect_uris: Some(validated.redirect_uris),
        response_types: Some(validated.response_types),
        grant_types: Some(validated.grant_types),
        auth_method: Some(validated.token_endpoint_auth_method),
    };
    match state.commands.update_oidc_app(&ctx, &app.id, update).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> Response {
    let ctx = context_from_headers(&headers);
    let app = match manage_client(&state.commands, &ctx, &headers, &client_id).await {
        Ok(app) => app,
        Err(err) => return err.into_response(),
    };
    match state.commands.remove_app(&ctx, &app.id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

// =========================================================================
// Device approval (user-facing side of RFC 8628)
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct DeviceDecisionRequest {
    pub user_code: String,
    pub user_id: String,
}

async fn approve_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeviceDecisionRequest>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match state
        .commands
        .approve_device_auth(&ctx, &request.user_code, &request.user_id)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn deny_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeviceDecisionRequest>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match state
        .commands
        .deny_device_auth(&ctx, &request.user_code, &request.user_id)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

// =========================================================================
// Read-side lookups (projection tables; eventually consistent)
// =========================================================================

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

impl PageQuery {
    fn page(&self) -> Page {
        let default = Page::default();
        Page {
            limit: self.limit.unwrap_or(default.limit).clamp(1, 1000),
            offset: self.offset.unwrap_or(default.offset).max(0),
        }
    }
}

async fn get_device_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_code): Path<String>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match state
        .queries
        .device_auth_by_user_code(&ctx.instance_id, &user_code)
        .await
    {
        Ok(view) => Json(view).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match state
        .queries
        .search_users(&ctx.instance_id, ctx.org_id.as_deref(), page.page())
        .await
    {
        Ok(users) => Json(users).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match state.queries.user_by_id(&ctx.instance_id, &user_id).await {
        Ok(user) => Json(user).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> Response {
    let ctx = context_from_headers(&headers);
    match state
        .queries
        .application_by_client_id(&ctx.instance_id, &client_id)
        .await
    {
        Ok(app) => Json(app).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn list_idps(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response {
    let ctx = context_from_headers(&headers);
    let owner = ctx
        .org_id
        .clone()
        .unwrap_or_else(|| ctx.instance_id.clone());
    match state
        .queries
        .idps_by_owner(&ctx.instance_id, &owner, page.page())
        .await
    {
        Ok(idps) => Json(idps).into_response(),
        Err(err) => err.into_response(),
    }
}

// =========================================================================
// Health
// =========================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    projections: Vec<ProjectionHealthBody>,
}

#[derive(Debug, Serialize)]
struct ProjectionHealthBody {
    projection: String,
    instance_id: String,
    lag: i64,
    healthy: bool,
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.projector.health().await {
        Ok(report) => {
            let healthy = report.iter().all(|h| h.healthy);
            let body = HealthResponse {
                status: if healthy { "ok" } else { "unhealthy" },
                projections: report
                    .into_iter()
                    .map(|h| ProjectionHealthBody {
                        projection: h.projection,
                        instance_id: h.instance_id,
                        lag: h.lag,
                        healthy: h.healthy,
                    })
                    .collect(),
            };
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(body)).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "Health check failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
