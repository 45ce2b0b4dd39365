//! Token engine
//!
//! Issues opaque access/refresh tokens (events carry only secret hashes),
//! mints id tokens for `openid` scope, answers RFC 7662 introspection and
//! drives revocation.

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::aggregate::token::TokenType;
use crate::command::{AddToken, CommandResult, Commands};
use crate::domain::Context;
use crate::error::{AppError, AppResult};

use super::codes;
use super::{SCOPE_OFFLINE_ACCESS, SCOPE_OPENID};

/// Token endpoint success response (RFC 6749 §5.1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// RFC 7662 introspection response; inactive tokens carry nothing else
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// id-token claims (OIDC core §2)
#[derive(Debug, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
}

/// The token engine; thin over the command layer
#[derive(Clone)]
pub struct TokenEngine {
    commands: Commands,
    issuer: String,
    signing_key: String,
}

impl TokenEngine {
    pub fn new(commands: Commands, issuer: &str, signing_key: &str) -> Self {
        Self {
            commands,
            issuer: issuer.to_string(),
            signing_key: signing_key.to_string(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Issue the token set for a grant: access token, refresh token when
    /// `offline_access` was granted, id token when `openid` was granted
    /// and a user is present.
    pub async fn issue(
        &self,
        ctx: &Context,
        client_id: &str,
        user_id: Option<&str>,
        scope: &[String],
        dpop_jkt: Option<String>,
    ) -> AppResult<TokenResponse> {
        let config = self.commands.config();
        let access_lifetime = config.access_token_lifetime;
        let refresh_lifetime = config.refresh_token_lifetime;

        let mut add = AddToken::access(client_id, access_lifetime)
            .with_scope(scope.to_vec())
            .bound_to(dpop_jkt.clone());
        if let Some(user_id) = user_id {
            add = add.for_user(user_id);
        }
        let access = self.commands.add_token(ctx, add).await?;

        let refresh_token = if scope.iter().any(|s| s == SCOPE_OFFLINE_ACCESS) {
            let mut add = AddToken::refresh(client_id, refresh_lifetime)
                .with_scope(scope.to_vec())
                .bound_to(dpop_jkt.clone());
            if let Some(user_id) = user_id {
                add = add.for_user(user_id);
            }
            Some(self.commands.add_token(ctx, add).await?.token)
        } else {
            None
        };

        let id_token = match user_id {
            Some(user_id) if scope.iter().any(|s| s == SCOPE_OPENID) => {
                Some(self.mint_id_token(client_id, user_id)?)
            }
            _ => None,
        };

        Ok(TokenResponse {
            access_token: access.token,
            token_type: if dpop_jkt.is_some() {
                "DPoP".to_string()
            } else {
                "Bearer".to_string()
            },
            expires_in: access_lifetime.num_seconds(),
            refresh_token,
            id_token,
            scope: Some(scope.join(" ")),
        })
    }

    fn mint_id_token(&self, client_id: &str, user_id: &str) -> AppResult<String> {
        let now = Utc::now();
        let claims = IdTokenClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            aud: client_id.to_string(),
            exp: (now + self.commands.config().access_token_lifetime).timestamp(),
            iat: now.timestamp(),
            azp: Some(client_id.to_string()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.signing_key.as_bytes()),
        )
        .map_err(|err| AppError::Fatal(format!("id token signing failed: {err}")))
    }

    /// RFC 7662: `active` plus metadata for live tokens, bare `active:false`
    /// for anything else, including malformed or unknown input.
    pub async fn introspect(&self, ctx: &Context, token: &str) -> AppResult<IntrospectionResponse> {
        let Some((token_id, secret)) = codes::split_opaque(token) else {
            return Ok(IntrospectionResponse::inactive());
        };
        let model = match self.commands.token_by_id(ctx, token_id).await {
            Ok(model) => model,
            Err(AppError::NotFound(_)) => return Ok(IntrospectionResponse::inactive()),
            Err(err) => return Err(err),
        };
        let secret_ok = model
            .token_hash
            .as_deref()
            .map(|hash| codes::verify_secret(secret, hash))
            .unwrap_or(false);
        if !secret_ok || !model.is_active(Utc::now()) {
            return Ok(IntrospectionResponse::inactive());
        }

        Ok(IntrospectionResponse {
            active: true,
            scope: Some(model.scope.join(" ")),
            client_id: Some(model.client_id.clone()),
            token_type: Some(
                match model.token_type {
                    Some(TokenType::Refresh) => "refresh_token",
                    _ => "Bearer",
                }
                .to_string(),
            ),
            exp: model.expires_at.map(|t| t.timestamp()),
            iat: model.issued_at.map(|t| t.timestamp()),
            sub: model.user_id.clone(),
            aud: Some(model.audience.clone()),
            iss: Some(self.issuer.clone()),
            jti: Some(model.id),
        })
    }

    /// Revoke an opaque token presented by value
    pub async fn revoke(
        &self,
        ctx: &Context,
        token: &str,
        revoked_by: &str,
    ) -> AppResult<CommandResult> {
        let (token_id, secret) = codes::split_opaque(token)
            .ok_or_else(|| AppError::InvalidInput("malformed token".to_string()))?;
        let model = self.commands.token_by_id(ctx, token_id).await?;
        match model.token_hash.as_deref() {
            Some(hash) if codes::verify_secret(secret, hash) => {}
            _ => return Err(AppError::NotFound("token".to_string())),
        }
        self.commands.revoke_token(ctx, token_id, revoked_by).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandConfig;
    use crate::event_store::MemoryEventStore;
    use std::sync::Arc;

    fn engine() -> TokenEngine {
        let commands = Commands::new(Arc::new(MemoryEventStore::new()), CommandConfig::default());
        TokenEngine::new(commands, "https://iam.example.com", "test-signing-key")
    }

    #[tokio::test]
    async fn test_issue_token_set() {
        let engine = engine();
        let ctx = Context::new("inst-1");

        let scope = vec![
            SCOPE_OPENID.to_string(),
            "profile".to_string(),
            SCOPE_OFFLINE_ACCESS.to_string(),
        ];
        let response = engine
            .issue(&ctx, "web", Some("u1"), &scope, None)
            .await
            .unwrap();

        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, 3600);
        assert!(response.refresh_token.is_some());
        assert!(response.id_token.is_some());
        assert_eq!(response.scope.as_deref(), Some("openid profile offline_access"));
    }

    #[tokio::test]
    async fn test_no_refresh_without_offline_access() {
        let engine = engine();
        let ctx = Context::new("inst-1");
        let response = engine
            .issue(&ctx, "web", Some("u1"), &["profile".to_string()], None)
            .await
            .unwrap();
        assert!(response.refresh_token.is_none());
        assert!(response.id_token.is_none());
    }

    #[tokio::test]
    async fn test_introspection_roundtrip() {
        let engine = engine();
        let ctx = Context::new("inst-1");
        let response = engine
            .issue(
                &ctx,
                "web",
                Some("u1"),
                &[SCOPE_OPENID.to_string(), "profile".to_string()],
                None,
            )
            .await
            .unwrap();

        let introspection = engine.introspect(&ctx, &response.access_token).await.unwrap();
        assert!(introspection.active);
        assert_eq!(introspection.sub.as_deref(), Some("u1"));
        assert_eq!(introspection.scope.as_deref(), Some("openid profile"));
        assert_eq!(introspection.iss.as_deref(), Some("https://iam.example.com"));
        assert!(introspection.jti.is_some());

        // Revoke, then the same token reads inactive with no metadata
        engine.revoke(&ctx, &response.access_token, "admin").await.unwrap();
        let introspection = engine.introspect(&ctx, &response.access_token).await.unwrap();
        assert!(!introspection.active);
        assert!(introspection.sub.is_none());
        assert!(introspection.scope.is_none());

        // Double revocation surfaces
        let err = engine
            .revoke(&ctx, &response.access_token, "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_introspection_of_garbage_is_inactive() {
        let engine = engine();
        let ctx = Context::new("inst-1");
        assert!(!engine.introspect(&ctx, "not-a-token").await.unwrap().active);
        assert!(
            !engine
                .introspect(&ctx, "deadbeef.wrongsecret")
                .await
                .unwrap()
                .active
        );
    }

    #[tokio::test]
    async fn test_wrong_secret_reads_inactive() {
        let engine = engine();
        let ctx = Context::new("inst-1");
        let response = engine
            .issue(&ctx, "web", Some("u1"), &["profile".to_string()], None)
            .await
            .unwrap();
        let (id, _) = codes::split_opaque(&response.access_token).unwrap();
        let forged = codes::compose_opaque(id, "forged-secret");
        assert!(!engine.introspect(&ctx, &forged).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_dpop_bound_issue() {
        let engine = engine();
        let ctx = Context::new("inst-1");
        let response = engine
            .issue(
                &ctx,
                "web",
                None,
                &["profile".to_string()],
                Some("jkt-thumbprint".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(response.token_type, "DPoP");
    }
}
