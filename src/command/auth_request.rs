//! Auth-request commands
//!
//! The interactive authorization flow: create, select a user, check factors,
//! then finish in a terminal state. Success mints the single-use
//! authorization code; the token endpoint redeems it through
//! `exchange_auth_code`.

use chrono::Utc;
use uuid::Uuid;

use crate::aggregate::auth_request::{
    self, AuthRequestAddedPayload, AuthRequestState, CodeChallengeMethod, FactorCheckedPayload,
    FailedPayload, FailureReason, SucceededPayload, UserSelectedPayload,
};
use crate::aggregate::user::UserState;
use crate::aggregate::{AuthRequestWriteModel, UserWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::oauth::codes;
use crate::oauth::pkce;

use super::{CommandResult, Commands, Decision, EventDraft};

/// Command to open an authorization flow
#[derive(Debug, Clone)]
pub struct AddAuthRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub response_type: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub state: Option<String>,
    pub org_id: Option<String>,
}

impl AddAuthRequest {
    pub fn new(client_id: &str, redirect_uri: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scope: vec![crate::oauth::SCOPE_OPENID.to_string()],
            response_type: crate::oauth::RESPONSE_TYPE_CODE.to_string(),
            code_challenge: None,
            code_challenge_method: None,
            state: None,
            org_id: None,
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_pkce(mut self, challenge: &str, method: CodeChallengeMethod) -> Self {
        self.code_challenge = Some(challenge.to_string());
        self.code_challenge_method = Some(method);
        self
    }
}

/// Outcome of a factor check; failures are recorded as events, not errors
#[derive(Debug, Clone)]
pub struct FactorCheck {
    pub result: CommandResult,
    pub succeeded: bool,
}

/// Outcome of a successful flow; `code` is shown to the client exactly once
#[derive(Debug, Clone)]
pub struct SucceededAuthRequest {
    pub result: CommandResult,
    pub code: String,
}

impl Commands {
    pub async fn add_auth_request(
        &self,
        ctx: &Context,
        data: AddAuthRequest,
    ) -> AppResult<CommandResult> {
        if data.client_id.trim().is_empty() {
            return Err(AppError::InvalidInput("client_id must not be empty".to_string()));
        }
        if data.redirect_uri.trim().is_empty() {
            return Err(AppError::InvalidInput("redirect_uri must not be empty".to_string()));
        }
        if data.code_challenge_method.is_some() && data.code_challenge.is_none() {
            return Err(AppError::InvalidInput(
                "code_challenge_method without code_challenge".to_string(),
            ));
        }

        // The client must be registered, live, and the redirect URI exact
        let app = self
            .app_by_client_id(ctx, &data.client_id)
            .await
            .map_err(|_| AppError::InvalidInput("unknown client".to_string()))?;
        if !app.is_active() {
            return Err(AppError::Precondition("client is not active".to_string()));
        }
        if !app.has_redirect_uri(&data.redirect_uri) {
            return Err(AppError::InvalidInput("redirect_uri is not registered".to_string()));
        }

        // A challenge without a method is treated as plain (RFC 7636 §4.3)
        let method = match (&data.code_challenge, data.code_challenge_method) {
            (Some(_), None) => Some(CodeChallengeMethod::Plain),
            (_, method) => method,
        };

        let auth_request_id = Uuid::new_v4().to_string();
        let owner = data
            .org_id
            .clone()
            .unwrap_or_else(|| app.resource_owner.clone());
        let payload = AuthRequestAddedPayload {
            client_id: data.client_id.clone(),
            redirect_uri: data.redirect_uri.clone(),
            scope: data.scope.clone(),
            response_type: data.response_type.clone(),
            code_challenge: data.code_challenge.clone(),
            code_challenge_method: method,
            state: data.state.clone(),
            org_id: data.org_id.clone(),
        };

        self.execute::<AuthRequestWriteModel, _>(ctx, &auth_request_id, |model| {
            if model.exists() {
                return Err(AppError::Precondition("auth request already exists".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                auth_request::ADDED,
                &payload,
                &owner,
            )?))
        })
        .await
    }

    pub async fn select_user(
        &self,
        ctx: &Context,
        auth_request_id: &str,
        user_id: &str,
        org_id: &str,
    ) -> AppResult<CommandResult> {
        let user: UserWriteModel = self.load(ctx, user_id).await?;
        if !user.exists() || user.resource_owner != org_id {
            return Err(AppError::NotFound("user".to_string()));
        }
        if user.state != UserState::Active {
            return Err(AppError::Precondition("user is not active".to_string()));
        }

        self.execute::<AuthRequestWriteModel, _>(ctx, auth_request_id, |model| {
            ensure_open(model)?;
            Ok(Decision::single(EventDraft::new(
                auth_request::USER_SELECTED,
                &UserSelectedPayload {
                    user_id: user_id.to_string(),
                    org_id: org_id.to_string(),
                },
                &model.resource_owner,
            )?))
        })
        .await
    }

    /// Verify the password of the selected user; the outcome is recorded as
    /// an event either way.
    pub async fn check_password(
        &self,
        ctx: &Context,
        auth_request_id: &str,
        password: &str,
    ) -> AppResult<FactorCheck> {
        let request: AuthRequestWriteModel = self.load(ctx, auth_request_id).await?;
        ensure_open(&request)?;
        let user_id = request
            .selected_user_id
            .clone()
            .ok_or_else(|| AppError::Precondition("no user selected".to_string()))?;

        let user: UserWriteModel = self.load(ctx, &user_id).await?;
        let succeeded = match user.password_hash.as_deref() {
            Some(hash) => self.password_hasher().verify(password, hash),
            None => false,
        };

        self.record_factor(
            ctx,
            auth_request_id,
            succeeded,
            auth_request::PASSWORD_CHECKED,
            auth_request::PASSWORD_CHECK_FAILED,
        )
        .await
    }

    /// Verify a second-factor code for the selected user
    pub async fn check_totp(
        &self,
        ctx: &Context,
        auth_request_id: &str,
        code: &str,
    ) -> AppResult<FactorCheck> {
        let request: AuthRequestWriteModel = self.load(ctx, auth_request_id).await?;
        ensure_open(&request)?;
        let user_id = request
            .selected_user_id
            .clone()
            .ok_or_else(|| AppError::Precondition("no user selected".to_string()))?;

        let user: UserWriteModel = self.load(ctx, &user_id).await?;
        let succeeded = match user.totp_secret.as_deref() {
            Some(secret) => self.otp_verifier().verify(secret, code, Utc::now()),
            None => false,
        };

        self.record_factor(
            ctx,
            auth_request_id,
            succeeded,
            auth_request::TOTP_CHECKED,
            auth_request::TOTP_CHECK_FAILED,
        )
        .await
    }

    async fn record_factor(
        &self,
        ctx: &Context,
        auth_request_id: &str,
        succeeded: bool,
        success_type: &str,
        failure_type: &str,
    ) -> AppResult<FactorCheck> {
        let result = self
            .execute::<AuthRequestWriteModel, _>(ctx, auth_request_id, |model| {
                ensure_open(model)?;
                if model.selected_user_id.is_none() {
                    return Err(AppError::Precondition("no user selected".to_string()));
                }
                let draft = if succeeded {
                    EventDraft::new(
                        success_type,
                        &FactorCheckedPayload {
                            checked_at: Utc::now(),
                        },
                        &model.resource_owner,
                    )?
                } else {
                    EventDraft::new(failure_type, &serde_json::json!({}), &model.resource_owner)?
                };
                Ok(Decision::single(draft))
            })
            .await?;

        Ok(FactorCheck { result, succeeded })
    }

    /// Finish the flow successfully and mint the authorization code. All
    /// factors required by the selected org's login policy must be checked.
    pub async fn succeed_auth_request(
        &self,
        ctx: &Context,
        auth_request_id: &str,
    ) -> AppResult<SucceededAuthRequest> {
        let request: AuthRequestWriteModel = self.load(ctx, auth_request_id).await?;
        ensure_open(&request)?;
        let org_id = request
            .selected_org_id
            .clone()
            .ok_or_else(|| AppError::Precondition("no user selected".to_string()))?;
        let policy = self.effective_login_policy(ctx, &org_id).await?;

        let secret = codes::generate_secret();
        let code_hash = codes::hash_secret(&secret);
        let expires_at = Utc::now() + self.config().auth_code_lifetime;

        let result = self
            .execute::<AuthRequestWriteModel, _>(ctx, auth_request_id, |model| {
                ensure_open(model)?;
                if model.selected_user_id.is_none() {
                    return Err(AppError::Precondition("no user selected".to_string()));
                }
                if !model.factors_satisfied(policy.require_mfa) {
                    return Err(AppError::Precondition(
                        "required factors are not satisfied".to_string(),
                    ));
                }
                Ok(Decision::single(EventDraft::new(
                    auth_request::SUCCEEDED,
                    &SucceededPayload {
                        code_hash: code_hash.clone(),
                        code_expires_at: expires_at,
                    },
                    &model.resource_owner,
                )?))
            })
            .await?;

        Ok(SucceededAuthRequest {
            result,
            code: codes::compose_opaque(auth_request_id, &secret),
        })
    }

    pub async fn fail_auth_request(
        &self,
        ctx: &Context,
        auth_request_id: &str,
        reason: FailureReason,
    ) -> AppResult<CommandResult> {
        self.execute::<AuthRequestWriteModel, _>(ctx, auth_request_id, |model| {
            ensure_open(model)?;
            Ok(Decision::single(EventDraft::new(
                auth_request::FAILED,
                &FailedPayload { reason },
                &model.resource_owner,
            )?))
        })
        .await
    }

    /// Redeem an authorization code at the token endpoint. Verifies the
    /// secret, expiry, single use, client binding, redirect URI and PKCE,
    /// and marks the code spent. Returns the request for token issuance.
    pub async fn exchange_auth_code(
        &self,
        ctx: &Context,
        code: &str,
        client_id: &str,
        redirect_uri: Option<&str>,
        code_verifier: Option<&str>,
    ) -> AppResult<AuthRequestWriteModel> {
        let (auth_request_id, secret) = codes::split_opaque(code)
            .ok_or_else(|| AppError::InvalidInput("malformed authorization code".to_string()))?;

        let model: AuthRequestWriteModel = self.load(ctx, auth_request_id).await?;
        if !model.exists() {
            return Err(AppError::NotFound("authorization code".to_string()));
        }
        if model.state != AuthRequestState::Succeeded {
            return Err(AppError::Precondition("authorization code is not valid".to_string()));
        }
        if model.code_exchanged {
            return Err(AppError::Precondition("authorization code already used".to_string()));
        }
        match model.code_expires_at {
            Some(expires_at) if Utc::now() < expires_at => {}
            _ => return Err(AppError::Precondition("authorization code expired".to_string())),
        }
        match model.code_hash.as_deref() {
            Some(hash) if codes::verify_secret(secret, hash) => {}
            _ => return Err(AppError::PermissionDenied("authorization code mismatch".to_string())),
        }
        if model.client_id != client_id {
            return Err(AppError::PermissionDenied("client mismatch".to_string()));
        }
        if let Some(uri) = redirect_uri {
            if model.redirect_uri != uri {
                return Err(AppError::PermissionDenied("redirect_uri mismatch".to_string()));
            }
        }
        if let Some(challenge) = &model.code_challenge {
            let method = model
                .code_challenge_method
                .unwrap_or(CodeChallengeMethod::Plain);
            let verifier = code_verifier.ok_or_else(|| {
                AppError::PermissionDenied("code_verifier required".to_string())
            })?;
            if !pkce::verify(challenge, method, verifier) {
                return Err(AppError::PermissionDenied("code_verifier mismatch".to_string()));
            }
        }

        self.execute::<AuthRequestWriteModel, _>(ctx, auth_request_id, |model| {
            if model.code_exchanged {
                return Err(AppError::Precondition("authorization code already used".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                auth_request::CODE_EXCHANGED,
                &serde_json::json!({}),
                &model.resource_owner,
            )?))
        })
        .await?;

        Ok(model)
    }
}

fn ensure_open(model: &AuthRequestWriteModel) -> AppResult<()> {
    if !model.exists() {
        return Err(AppError::NotFound("auth request".to_string()));
    }
    if model.is_terminal() {
        return Err(AppError::Precondition("auth request already finished".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AddHumanUser, AddOidcApp, CommandConfig};
    use crate::event_store::MemoryEventStore;
    use std::sync::Arc;

    struct Fixture {
        commands: Commands,
        ctx: Context,
        org_id: String,
        client_id: String,
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
        let app = commands
            .add_oidc_app(
                &ctx,
                AddOidcApp::new(&project_id, "web", vec!["https://a/cb".to_string()]),
            )
            .await
            .unwrap();
        let user = commands
            .add_human_user(
                &ctx,
                AddHumanUser::new("alice", "alice@ex.com")
                    .with_org(&org_id)
                    .with_password("hunter2")
                    .with_totp_secret("otp-secret"),
            )
            .await
            .unwrap();
        Fixture {
            commands,
            ctx,
            org_id,
            client_id: app.client_id,
            user_id: user.aggregate_id,
        }
    }

    async fn open_request(f: &Fixture) -> String {
        f.commands
            .add_auth_request(
                &f.ctx,
                AddAuthRequest::new(&f.client_id, "https://a/cb"),
            )
            .await
            .unwrap()
            .aggregate_id
    }

    #[tokio::test]
    async fn test_happy_path_with_code_exchange() {
        let f = setup().await;
        let request_id = open_request(&f).await;

        f.commands
            .select_user(&f.ctx, &request_id, &f.user_id, &f.org_id)
            .await
            .unwrap();
        let check = f
            .commands
            .check_password(&f.ctx, &request_id, "hunter2")
            .await
            .unwrap();
        assert!(check.succeeded);

        let succeeded = f
            .commands
            .succeed_auth_request(&f.ctx, &request_id)
            .await
            .unwrap();

        let exchanged = f
            .commands
            .exchange_auth_code(&f.ctx, &succeeded.code, &f.client_id, None, None)
            .await
            .unwrap();
        assert_eq!(exchanged.selected_user_id.as_deref(), Some(f.user_id.as_str()));

        // The code is single-use
        let err = f
            .commands
            .exchange_auth_code(&f.ctx, &succeeded.code, &f.client_id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_wrong_password_recorded_not_fatal() {
        let f = setup().await;
        let request_id = open_request(&f).await;
        f.commands
            .select_user(&f.ctx, &request_id, &f.user_id, &f.org_id)
            .await
            .unwrap();

        let check = f
            .commands
            .check_password(&f.ctx, &request_id, "wrong")
            .await
            .unwrap();
        assert!(!check.succeeded);

        // Success is blocked until the factor passes
        let err = f
            .commands
            .succeed_auth_request(&f.ctx, &request_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_mfa_policy_blocks_until_totp() {
        let f = setup().await;
        f.commands
            .change_login_policy(
                &f.ctx,
                &f.org_id,
                crate::aggregate::org::LoginPolicy { require_mfa: true },
            )
            .await
            .unwrap();

        let request_id = open_request(&f).await;
        f.commands
            .select_user(&f.ctx, &request_id, &f.user_id, &f.org_id)
            .await
            .unwrap();
        f.commands
            .check_password(&f.ctx, &request_id, "hunter2")
            .await
            .unwrap();

        let err = f
            .commands
            .succeed_auth_request(&f.ctx, &request_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));

        let check = f
            .commands
            .check_totp(&f.ctx, &request_id, "otp-secret")
            .await
            .unwrap();
        assert!(check.succeeded);
        f.commands.succeed_auth_request(&f.ctx, &request_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pkce_enforced_on_exchange() {
        let f = setup().await;
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let request_id = f
            .commands
            .add_auth_request(
                &f.ctx,
                AddAuthRequest::new(&f.client_id, "https://a/cb")
                    .with_pkce(&pkce::s256_challenge(verifier), CodeChallengeMethod::S256),
            )
            .await
            .unwrap()
            .aggregate_id;

        f.commands
            .select_user(&f.ctx, &request_id, &f.user_id, &f.org_id)
            .await
            .unwrap();
        f.commands
            .check_password(&f.ctx, &request_id, "hunter2")
            .await
            .unwrap();
        let succeeded = f
            .commands
            .succeed_auth_request(&f.ctx, &request_id)
            .await
            .unwrap();

        let err = f
            .commands
            .exchange_auth_code(&f.ctx, &succeeded.code, &f.client_id, None, Some("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));

        f.commands
            .exchange_auth_code(&f.ctx, &succeeded.code, &f.client_id, None, Some(verifier))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminal_requests_reject_commands() {
        let f = setup().await;
        let request_id = open_request(&f).await;
        f.commands
            .fail_auth_request(&f.ctx, &request_id, FailureReason::AccessDenied)
            .await
            .unwrap();

        let err = f
            .commands
            .select_user(&f.ctx, &request_id, &f.user_id, &f.org_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_empty_inputs_rejected() {
        let f = setup().await;
        assert!(matches!(
            f.commands
                .add_auth_request(&f.ctx, AddAuthRequest::new("", "https://a/cb"))
                .await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            f.commands
                .add_auth_request(&f.ctx, AddAuthRequest::new(&f.client_id, ""))
                .await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
