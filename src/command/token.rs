//! Token commands
//!
//! Issue and revoke access/refresh tokens. Revocation is deliberately not
//! idempotent: revoking a revoked token fails so double revocations stay
//! visible.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::aggregate::token::{self, TokenAddedPayload, TokenRevokedPayload, TokenType};
use crate::aggregate::{TokenWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::oauth::codes;

use super::{CommandResult, Commands, Decision, EventDraft};

/// Command to issue a token
#[derive(Debug, Clone)]
pub struct AddToken {
    pub token_type: TokenType,
    pub client_id: String,
    pub user_id: Option<String>,
    pub scope: Vec<String>,
    pub audience: Vec<String>,
    pub lifetime: chrono::Duration,
    pub dpop_jkt: Option<String>,
    pub refreshed_from: Option<String>,
}

impl AddToken {
    pub fn access(client_id: &str, lifetime: chrono::Duration) -> Self {
        Self {
            token_type: TokenType::Access,
            client_id: client_id.to_string(),
            user_id: None,
            scope: Vec::new(),
            audience: vec![client_id.to_string()],
            lifetime,
            dpop_jkt: None,
            refreshed_from: None,
        }
    }

    pub fn refresh(client_id: &str, lifetime: chrono::Duration) -> Self {
        Self {
            token_type: TokenType::Refresh,
            ..Self::access(client_id, lifetime)
        }
    }

    pub fn for_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn bound_to(mut self, dpop_jkt: Option<String>) -> Self {
        self.dpop_jkt = dpop_jkt;
        self
    }
}

/// An issued token; the opaque value exists only in this result
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub result: CommandResult,
    pub token_id: String,
    /// Opaque `id.secret` value handed to the client
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Commands {
    pub async fn add_token(&self, ctx: &Context, data: AddToken) -> AppResult<IssuedToken> {
        if data.client_id.trim().is_empty() {
            return Err(AppError::InvalidInput("client_id must not be empty".to_string()));
        }

        let token_id = Uuid::new_v4().to_string();
        let secret = codes::generate_secret();
        let issued_at = Utc::now();
        let expires_at = issued_at + data.lifetime;
        let owner = ctx
            .org_id
            .clone()
            .unwrap_or_else(|| ctx.instance_id.clone());

        let payload = TokenAddedPayload {
            token_type: data.token_type,
            client_id: data.client_id.clone(),
            user_id: data.user_id.clone(),
            scope: data.scope.clone(),
            audience: data.audience.clone(),
            issued_at,
            expires_at,
            token_hash: codes::hash_secret(&secret),
            dpop_jkt: data.dpop_jkt.clone(),
            refreshed_from: data.refreshed_from.clone(),
        };

        let result = self
            .execute::<TokenWriteModel, _>(ctx, &token_id, |model| {
                if model.exists() {
                    return Err(AppError::Precondition("token already exists".to_string()));
                }
                Ok(Decision::single(EventDraft::new(
                    token::ADDED,
                    &payload,
                    &owner,
                )?))
            })
            .await?;

        Ok(IssuedToken {
            result,
            token: codes::compose_opaque(&token_id, &secret),
            token_id,
            issued_at,
            expires_at,
        })
    }

    pub async fn revoke_token(
        &self,
        ctx: &Context,
        token_id: &str,
        revoked_by: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<TokenWriteModel, _>(ctx, token_id, |model| {
            if !model.exists() {
                return Err(AppError::NotFound("token".to_string()));
            }
            if model.is_revoked() {
                return Err(AppError::Precondition("token already revoked".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                token::REVOKED,
                &TokenRevokedPayload {
                    revoked_by: revoked_by.to_string(),
                    revoked_at: Utc::now(),
                },
                &model.resource_owner,
            )?))
        })
        .await
    }

    /// Load a token's fold; used by introspection and bound-token checks
    pub async fn token_by_id(&self, ctx: &Context, token_id: &str) -> AppResult<TokenWriteModel> {
        let model: TokenWriteModel = self.load(ctx, token_id).await?;
        if !model.exists() {
            return Err(AppError::NotFound("token".to_string()));
        }
        Ok(model)
    }
}
