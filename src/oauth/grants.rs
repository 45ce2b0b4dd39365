//! Token-endpoint grant handling
//!
//! Authenticates the client, validates DPoP proofs, and dispatches to the
//! grant-specific flows. Domain errors are translated into the standard
//! OAuth error codes here; anything infrastructural stays an internal
//! failure for the transport to map to a 5xx.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::aggregate::idp::IdpKind;
use crate::aggregate::token::TokenType;
use crate::aggregate::AppWriteModel;
use crate::command::{Commands, DevicePoll};
use crate::domain::Context;
use crate::error::AppError;
use crate::oauth::registration::AUTH_METHOD_NONE;

use super::codes;
use super::dpop::DpopValidator;
use super::tokens::{TokenEngine, TokenResponse};
use super::{
    OAuthError, OAuthErrorCode, GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS,
    GRANT_DEVICE_CODE, GRANT_JWT_BEARER, GRANT_REFRESH_TOKEN,
};

/// Token endpoint request (form-encoded)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub device_code: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub assertion: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Failure of a token request: a protocol error for the client, or an
/// internal error for the operator
#[derive(Debug)]
pub enum GrantFailure {
    Protocol(OAuthError),
    Internal(AppError),
}

impl From<OAuthError> for GrantFailure {
    fn from(err: OAuthError) -> Self {
        GrantFailure::Protocol(err)
    }
}

fn protocol(code: OAuthErrorCode, description: impl Into<String>) -> GrantFailure {
    GrantFailure::Protocol(OAuthError::with_description(code, description))
}

/// Map a domain error from a grant flow to the wire; infrastructure errors
/// pass through as internal.
fn map_domain(err: AppError, code: OAuthErrorCode) -> GrantFailure {
    match err {
        AppError::InvalidInput(msg) => protocol(OAuthErrorCode::InvalidRequest, msg),
        AppError::NotFound(msg)
        | AppError::Precondition(msg)
        | AppError::PermissionDenied(msg) => protocol(code, msg),
        other => GrantFailure::Internal(other),
    }
}

/// HTTP facts about the request, needed for DPoP validation
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub method: String,
    pub url: String,
    pub dpop_proof: Option<String>,
}

impl RequestFacts {
    pub fn post(url: &str) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.to_string(),
            dpop_proof: None,
        }
    }

    pub fn with_proof(mut self, proof: &str) -> Self {
        self.dpop_proof = Some(proof.to_string());
        self
    }
}

/// The token endpoint
#[derive(Clone)]
pub struct GrantHandler {
    commands: Commands,
    engine: TokenEngine,
    dpop: Arc<DpopValidator>,
}

impl GrantHandler {
    pub fn new(commands: Commands, engine: TokenEngine, dpop: Arc<DpopValidator>) -> Self {
        Self {
            commands,
            engine,
            dpop,
        }
    }

    pub fn engine(&self) -> &TokenEngine {
        &self.engine
    }

    pub async fn token(
        &self,
        ctx: &Context,
        request: TokenRequest,
        facts: RequestFacts,
    ) -> Result<TokenResponse, GrantFailure> {
        // A DPoP proof, when present, binds every grant's tokens
        let dpop_jkt = match &facts.dpop_proof {
            Some(proof) => Some(
                self.dpop
                    .verify(
                        &ctx.instance_id,
                        proof,
                        &facts.method,
                        &facts.url,
                        None,
                        None,
                        Utc::now(),
                    )
                    .await
                    .map_err(|err| {
                        protocol(OAuthErrorCode::InvalidDpopProof, err.to_string())
                    })?
                    .jkt,
            ),
            None => None,
        };

        match request.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => self.authorization_code(ctx, request, dpop_jkt).await,
            GRANT_REFRESH_TOKEN => self.refresh_token(ctx, request, dpop_jkt).await,
            GRANT_CLIENT_CREDENTIALS => self.client_credentials(ctx, request, dpop_jkt).await,
            GRANT_DEVICE_CODE => self.device_code(ctx, request, dpop_jkt).await,
            GRANT_JWT_BEARER => self.jwt_bearer(ctx, request, dpop_jkt).await,
            other => Err(protocol(
                OAuthErrorCode::UnsupportedGrantType,
                format!("grant_type {other:?} is not supported"),
            )),
        }
    }

    /// Authenticate the requesting client against its registered secret
    async fn authenticate_client(
        &self,
        ctx: &Context,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        grant_type: &str,
    ) -> Result<AppWriteModel, GrantFailure> {
        let client_id = client_id.ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidRequest, "client_id is required")
        })?;
        let app = self
            .commands
            .app_by_client_id(ctx, client_id)
            .await
            .map_err(|err| map_domain(err, OAuthErrorCode::InvalidClient))?;
        if !app.is_active() {
            return Err(protocol(OAuthErrorCode::InvalidClient, "client is not active"));
        }

        let config = app.oidc.as_ref().ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidClient, "client has no OIDC configuration")
        })?;
        if config.auth_method != AUTH_METHOD_NONE {
            let presented = client_secret.ok_or_else(|| {
                protocol(OAuthErrorCode::InvalidClient, "client authentication required")
            })?;
            let valid = config
                .client_secret_hash
                .as_deref()
                .map(|hash| codes::verify_secret(presented, hash))
                .unwrap_or(false);
            if !valid {
                return Err(protocol(OAuthErrorCode::InvalidClient, "invalid client secret"));
            }
        }

        if !app.supports_grant(grant_type) {
            return Err(protocol(
                OAuthErrorCode::UnauthorizedClient,
                format!("client may not use {grant_type}"),
            ));
        }
        Ok(app)
    }

    async fn authorization_code(
        &self,
        ctx: &Context,
        request: TokenRequest,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, GrantFailure> {
        let app = self
            .authenticate_client(
                ctx,
                request.client_id.as_deref(),
                request.client_secret.as_deref(),
                GRANT_AUTHORIZATION_CODE,
            )
            .await?;
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| protocol(OAuthErrorCode::InvalidRequest, "code is required"))?;

        let client_id = app
            .oidc
            .as_ref()
            .map(|c| c.client_id.clone())
            .unwrap_or_default();
        let auth_request = self
            .commands
            .exchange_auth_code(
                ctx,
                code,
                &client_id,
                request.redirect_uri.as_deref(),
                request.code_verifier.as_deref(),
            )
            .await
            .map_err(|err| map_domain(err, OAuthErrorCode::InvalidGrant))?;

        let user_id = auth_request.selected_user_id.clone().ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidGrant, "authorization has no user")
        })?;
        let mut grant_ctx = ctx.clone();
        grant_ctx.org_id = auth_request.selected_org_id.clone();

        self.engine
            .issue(
                &grant_ctx,
                &client_id,
                Some(&user_id),
                &auth_request.scope,
                dpop_jkt,
            )
            .await
            .map_err(GrantFailure::Internal)
    }

    async fn refresh_token(
        &self,
        ctx: &Context,
        request: TokenRequest,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, GrantFailure> {
        let app = self
            .authenticate_client(
                ctx,
                request.client_id.as_deref(),
                request.client_secret.as_deref(),
                GRANT_REFRESH_TOKEN,
            )
            .await?;
        let presented = request.refresh_token.as_deref().ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidRequest, "refresh_token is required")
        })?;

        let (token_id, secret) = codes::split_opaque(presented).ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidGrant, "malformed refresh token")
        })?;
        let token = self
            .commands
            .token_by_id(ctx, token_id)
            .await
            .map_err(|err| map_domain(err, OAuthErrorCode::InvalidGrant))?;

        let secret_ok = token
            .token_hash
            .as_deref()
            .map(|hash| codes::verify_secret(secret, hash))
            .unwrap_or(false);
        if !secret_ok
            || token.token_type != Some(TokenType::Refresh)
            || !token.is_active(Utc::now())
        {
            return Err(protocol(OAuthErrorCode::InvalidGrant, "refresh token is not valid"));
        }
        let client_id = app
            .oidc
            .as_ref()
            .map(|c| c.client_id.clone())
            .unwrap_or_default();
        if token.client_id != client_id {
            return Err(protocol(OAuthErrorCode::InvalidGrant, "refresh token client mismatch"));
        }

        // A bound refresh token demands a proof signed with the same key
        // (RFC 9449 §5); the proof itself was validated before dispatch.
        if let Some(bound_jkt) = token.dpop_jkt.as_deref() {
            match dpop_jkt.as_deref() {
                Some(jkt) if jkt == bound_jkt => {}
                Some(_) => {
                    return Err(protocol(
                        OAuthErrorCode::InvalidDpopProof,
                        "proof key does not match the bound key",
                    ))
                }
                None => {
                    return Err(protocol(OAuthErrorCode::InvalidDpopProof, "DPoP proof required"))
                }
            }
        }

        // Rotate: the old refresh token is revoked, a fresh set issued
        self.commands
            .revoke_token(ctx, token_id, "token-endpoint")
            .await
            .map_err(|err| map_domain(err, OAuthErrorCode::InvalidGrant))?;

        self.engine
            .issue(
                ctx,
                &client_id,
                token.user_id.as_deref(),
                &token.scope,
                dpop_jkt,
            )
            .await
            .map_err(GrantFailure::Internal)
    }

    async fn client_credentials(
        &self,
        ctx: &Context,
        request: TokenRequest,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, GrantFailure> {
        let app = self
            .authenticate_client(
                ctx,
                request.client_id.as_deref(),
                request.client_secret.as_deref(),
                GRANT_CLIENT_CREDENTIALS,
            )
            .await?;
        let config = app.oidc.as_ref().ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidClient, "client has no OIDC configuration")
        })?;
        if config.auth_method == AUTH_METHOD_NONE {
            return Err(protocol(
                OAuthErrorCode::UnauthorizedClient,
                "public clients may not use client_credentials",
            ));
        }

        let scope = parse_scope(request.scope.as_deref());
        self.engine
            .issue(ctx, &config.client_id, None, &scope, dpop_jkt)
            .await
            .map_err(GrantFailure::Internal)
    }

    async fn device_code(
        &self,
        ctx: &Context,
        request: TokenRequest,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, GrantFailure> {
        let client_id = request.client_id.as_deref().ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidRequest, "client_id is required")
        })?;
        let device_code = request.device_code.as_deref().ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidRequest, "device_code is required")
        })?;

        let poll = self
            .commands
            .poll_device_auth(ctx, device_code, client_id)
            .await
            .map_err(|err| match err {
                AppError::NotFound(msg) => protocol(OAuthErrorCode::InvalidGrant, msg),
                AppError::PermissionDenied(msg) => protocol(OAuthErrorCode::InvalidClient, msg),
                other => GrantFailure::Internal(other),
            })?;

        let approved = match poll {
            DevicePoll::Pending => {
                return Err(GrantFailure::Protocol(OAuthError::new(
                    OAuthErrorCode::AuthorizationPending,
                )))
            }
            DevicePoll::SlowDown => {
                return Err(GrantFailure::Protocol(OAuthError::new(OAuthErrorCode::SlowDown)))
            }
            DevicePoll::Denied => {
                return Err(GrantFailure::Protocol(OAuthError::new(
                    OAuthErrorCode::AccessDenied,
                )))
            }
            DevicePoll::Expired => {
                return Err(GrantFailure::Protocol(OAuthError::new(
                    OAuthErrorCode::ExpiredToken,
                )))
            }
            DevicePoll::AlreadyRedeemed => {
                return Err(protocol(
                    OAuthErrorCode::InvalidGrant,
                    "device code already redeemed",
                ))
            }
            DevicePoll::Approved(model) => model,
        };

        let user_id = approved.approved_user_id.clone().ok_or_else(|| {
            GrantFailure::Internal(AppError::Fatal("approved grant without user".to_string()))
        })?;

        let response = self
            .engine
            .issue(ctx, client_id, Some(&user_id), &approved.scope, dpop_jkt)
            .await
            .map_err(GrantFailure::Internal)?;

        // Mark the device code spent and release the user code
        self.commands
            .complete_device_auth(ctx, &approved.id)
            .await
            .map_err(GrantFailure::Internal)?;

        Ok(response)
    }

    async fn jwt_bearer(
        &self,
        ctx: &Context,
        request: TokenRequest,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, GrantFailure> {
        let assertion = request.assertion.as_deref().ok_or_else(|| {
            protocol(OAuthErrorCode::InvalidRequest, "assertion is required")
        })?;

        // First pass without signature verification, to learn the issuer
        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|err| protocol(OAuthErrorCode::InvalidGrant, err.to_string()))?;
        let mut insecure = Validation::new(header.alg);
        insecure.insecure_disable_signature_validation();
        insecure.required_spec_claims.clear();
        insecure.validate_exp = false;
        insecure.validate_aud = false;
        let unverified = decode::<AssertionClaims>(
            assertion,
            &DecodingKey::from_secret(&[]),
            &insecure,
        )
        .map_err(|err| protocol(OAuthErrorCode::InvalidGrant, err.to_string()))?
        .claims;

        let idp = self
            .commands
            .jwt_idp_by_issuer(ctx, &unverified.iss)
            .await
            .map_err(|err| map_domain(err, OAuthErrorCode::InvalidGrant))?;
        let key_pem = match idp.kind {
            Some(IdpKind::Jwt(config)) => config.public_key_pem,
            _ => None,
        };
        let key_pem = key_pem.ok_or_else(|| {
            protocol(
                OAuthErrorCode::InvalidGrant,
                "issuer has no verification key configured",
            )
        })?;

        let key = decoding_key_for(header.alg, key_pem.as_bytes())
            .map_err(|err| protocol(OAuthErrorCode::InvalidGrant, err.to_string()))?;
        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[self.engine.issuer()]);
        let verified = decode::<AssertionClaims>(assertion, &key, &validation)
            .map_err(|err| protocol(OAuthErrorCode::InvalidGrant, err.to_string()))?
            .claims;

        let scope = parse_scope(request.scope.as_deref());
        self.engine
            .issue(
                ctx,
                request.client_id.as_deref().unwrap_or(&verified.iss),
                Some(&verified.sub),
                &scope,
                dpop_jkt,
            )
            .await
            .map_err(GrantFailure::Internal)
    }
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    #[allow(dead_code)]
    #[serde(default)]
    exp: Option<i64>,
}

fn decoding_key_for(
    alg: Algorithm,
    pem: &[u8],
) -> Result<DecodingKey, jsonwebtoken::errors::Error> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(DecodingKey::from_secret(pem)),
    }
}

fn parse_scope(scope: Option<&str>) -> Vec<String> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AddHumanUser, AddOidcApp, CommandConfig};
    use crate::event_store::MemoryEventStore;

    struct Fixture {
        handler: GrantHandler,
        ctx: Context,
        org_id: String,
        client_id: String,
        client_secret: String,
        user_id: String,
    }

    async fn setup() -> Fixture {
        let commands = Commands::new(Arc::new(MemoryEventStore::new()), CommandConfig::default());
        let ctx = Context::new("inst-1").with_user("admin");
        let org_id = commands.add_org(&ctx, "acme", None).await.unwrap().aggregate_id;
        let project_id = commands
            .add_project(&ctx, &org_id, "crm")
            .await
            .unwrap()
            .aggregate_id;
        let mut app = AddOidcApp::new(&project_id, "tv", vec!["https://a/cb".to_string()]);
        app.grant_types = vec![
            GRANT_AUTHORIZATION_CODE.to_string(),
            GRANT_REFRESH_TOKEN.to_string(),
            GRANT_CLIENT_CREDENTIALS.to_string(),
            GRANT_DEVICE_CODE.to_string(),
        ];
        let app = commands.add_oidc_app(&ctx, app).await.unwrap();
        let user = commands
            .add_human_user(
                &ctx,
                AddHumanUser::new("alice", "alice@ex.com")
                    .with_org(&org_id)
                    .with_password("hunter2"),
            )
            .await
            .unwrap();

        let engine = TokenEngine::new(commands.clone(), "https://iam.example.com", "key");
        let handler = GrantHandler::new(commands, engine, Arc::new(DpopValidator::new()));
        Fixture {
            handler,
            ctx,
            org_id,
            client_id: app.client_id,
            client_secret: app.client_secret.unwrap(),
            user_id: user.aggregate_id,
        }
    }

    fn facts() -> RequestFacts {
        RequestFacts::post("https://iam.example.com/oauth/token")
    }

    #[tokio::test]
    async fn test_unsupported_grant_type() {
        let f = setup().await;
        let err = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    grant_type: "implicit".to_string(),
                    ..Default::default()
                },
                facts(),
            )
            .await
            .unwrap_err();
        match err {
            GrantFailure::Protocol(e) => {
                assert_eq!(e.code, OAuthErrorCode::UnsupportedGrantType)
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_credentials_happy_path() {
        let f = setup().await;
        let response = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    grant_type: GRANT_CLIENT_CREDENTIALS.to_string(),
                    client_id: Some(f.client_id.clone()),
                    client_secret: Some(f.client_secret.clone()),
                    scope: Some("api:read api:write".to_string()),
                    ..Default::default()
                },
                facts(),
            )
            .await
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.scope.as_deref(), Some("api:read api:write"));
        assert!(response.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_client_credentials_wrong_secret() {
        let f = setup().await;
        let err = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    grant_type: GRANT_CLIENT_CREDENTIALS.to_string(),
                    client_id: Some(f.client_id.clone()),
                    client_secret: Some("wrong".to_string()),
                    ..Default::default()
                },
                facts(),
            )
            .await
            .unwrap_err();
        match err {
            GrantFailure::Protocol(e) => assert_eq!(e.code, OAuthErrorCode::InvalidClient),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_authorization_code_flow_end_to_end() {
        let f = setup().await;
        let commands = f.handler.commands.clone();

        let request_id = commands
            .add_auth_request(
                &f.ctx,
                crate::command::AddAuthRequest::new(&f.client_id, "https://a/cb").with_scope(vec![
                    "openid".to_string(),
                    "offline_access".to_string(),
                ]),
            )
            .await
            .unwrap()
            .aggregate_id;
        commands
            .select_user(&f.ctx, &request_id, &f.user_id, &f.org_id)
            .await
            .unwrap();
        commands
            .check_password(&f.ctx, &request_id, "hunter2")
            .await
            .unwrap();
        let succeeded = commands.succeed_auth_request(&f.ctx, &request_id).await.unwrap();

        let response = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    grant_type: GRANT_AUTHORIZATION_CODE.to_string(),
                    code: Some(succeeded.code),
                    client_id: Some(f.client_id.clone()),
                    client_secret: Some(f.client_secret.clone()),
                    ..Default::default()
                },
                facts(),
            )
            .await
            .unwrap();
        assert!(response.id_token.is_some());
        assert!(response.refresh_token.is_some());

        // Refresh rotates the refresh token
        let refreshed = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    grant_type: GRANT_REFRESH_TOKEN.to_string(),
                    refresh_token: response.refresh_token.clone(),
                    client_id: Some(f.client_id.clone()),
                    client_secret: Some(f.client_secret.clone()),
                    ..Default::default()
                },
                facts(),
            )
            .await
            .unwrap();
        assert!(refreshed.refresh_token.is_some());
        assert_ne!(refreshed.refresh_token, response.refresh_token);

        // The old refresh token is dead
        let err = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    grant_type: GRANT_REFRESH_TOKEN.to_string(),
                    refresh_token: response.refresh_token.clone(),
                    client_id: Some(f.client_id.clone()),
                    client_secret: Some(f.client_secret.clone()),
                    ..Default::default()
                },
                facts(),
            )
            .await
            .unwrap_err();
        match err {
            GrantFailure::Protocol(e) => assert_eq!(e.code, OAuthErrorCode::InvalidGrant),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_device_flow_outcomes() {
        let f = setup().await;
        let commands = f.handler.commands.clone();

        let added = commands
            .add_device_auth(&f.ctx, &f.client_id, vec!["openid".to_string()], None)
            .await
            .unwrap();

        let poll_request = TokenRequest {
            grant_type: GRANT_DEVICE_CODE.to_string(),
            device_code: Some(added.device_code.clone()),
            client_id: Some(f.client_id.clone()),
            ..Default::default()
        };

        // Pending while nobody decided
        let err = f
            .handler
            .token(&f.ctx, poll_request.clone(), facts())
            .await
            .unwrap_err();
        match err {
            GrantFailure::Protocol(e) => {
                assert_eq!(e.code, OAuthErrorCode::AuthorizationPending)
            }
            other => panic!("unexpected failure: {other:?}"),
        }

        // Unknown device code
        let err = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    device_code: Some("bogus".to_string()),
                    ..poll_request.clone()
                },
                facts(),
            )
            .await
            .unwrap_err();
        match err {
            GrantFailure::Protocol(e) => assert_eq!(e.code, OAuthErrorCode::InvalidGrant),
            other => panic!("unexpected failure: {other:?}"),
        }

        // Approve, then the poll succeeds
        let user_ctx = Context::new("inst-1").with_user(f.user_id.clone());
        commands
            .approve_device_auth(&user_ctx, &added.user_code, &f.user_id)
            .await
            .unwrap();
        let response = f
            .handler
            .token(&f.ctx, poll_request.clone(), facts())
            .await
            .unwrap();
        assert_eq!(response.expires_in, 3600);
        assert!(response.id_token.is_some());

        // A second redemption is refused
        let err = f
            .handler
            .token(&f.ctx, poll_request, facts())
            .await
            .unwrap_err();
        match err {
            GrantFailure::Protocol(e) => assert_eq!(e.code, OAuthErrorCode::InvalidGrant),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_device_flow_denied() {
        let f = setup().await;
        let commands = f.handler.commands.clone();
        let added = commands
            .add_device_auth(&f.ctx, &f.client_id, vec![], None)
            .await
            .unwrap();

        let user_ctx = Context::new("inst-1").with_user(f.user_id.clone());
        commands
            .deny_device_auth(&user_ctx, &added.user_code, &f.user_id)
            .await
            .unwrap();

        let err = f
            .handler
            .token(
                &f.ctx,
                TokenRequest {
                    grant_type: GRANT_DEVICE_CODE.to_string(),
                    device_code: Some(added.device_code),
                    client_id: Some(f.client_id.clone()),
                    ..Default::default()
                },
                facts(),
            )
            .await
            .unwrap_err();
        match err {
            GrantFailure::Protocol(e) => assert_eq!(e.code, OAuthErrorCode::AccessDenied),
            other => panic!("unexpected failure: {other:?}"),
        }
    }
}
