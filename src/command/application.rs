//! Application commands
//!
//! OIDC clients live here: creation (used directly and by dynamic client
//! registration), redirect URI management, secret rotation and lifecycle.
//! Client secrets and registration tokens are generated once, returned to
//! the caller, and only their hashes are ever persisted.

use serde_json::json;
use uuid::Uuid;

use crate::aggregate::application::{
    self, AppAddedPayload, AppState, OidcConfigAddedPayload, OidcConfigChangedPayload,
    RedirectUriPayload, SecretChangedPayload,
};
use crate::aggregate::{AppWriteModel, ProjectWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::event_store::UniqueConstraintOp;
use crate::oauth::codes;
use crate::oauth::registration::{self, AUTH_METHOD_NONE};

use super::{CommandResult, Commands, Decision, EventDraft};

/// Command to create an OIDC application
#[derive(Debug, Clone)]
pub struct AddOidcApp {
    pub project_id: String,
    pub name: String,
    pub redirect_uris: Vec<String>,
    pub response_types: Vec<String>,
    pub grant_types: Vec<String>,
    pub auth_method: String,
    /// Issue a registration access token (dynamic client registration)
    pub with_registration_token: bool,
}

impl AddOidcApp {
    pub fn new(project_id: &str, name: &str, redirect_uris: Vec<String>) -> Self {
        Self {
            project_id: project_id.to_string(),
            name: name.to_string(),
            redirect_uris,
            response_types: vec![crate::oauth::RESPONSE_TYPE_CODE.to_string()],
            grant_types: vec![crate::oauth::GRANT_AUTHORIZATION_CODE.to_string()],
            auth_method: registration::AUTH_METHOD_BASIC.to_string(),
            with_registration_token: false,
        }
    }
}

/// Result of creating an OIDC application; secrets appear here once and are
/// never recoverable afterwards
#[derive(Debug, Clone)]
pub struct AddedOidcApp {
    pub result: CommandResult,
    pub app_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub registration_token: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Changes to an existing OIDC configuration
#[derive(Debug, Clone, Default)]
pub struct UpdateOidcApp {
    pub redirect_uris: Option<Vec<String>>,
    pub response_types: Option<Vec<String>>,
    pub grant_types: Option<Vec<String>>,
    pub auth_method: Option<String>,
}

impl Commands {
    pub async fn add_oidc_app(&self, ctx: &Context, data: AddOidcApp) -> AppResult<AddedOidcApp> {
        if data.name.trim().is_empty() {
            return Err(AppError::InvalidInput("application name must not be empty".to_string()));
        }
        for uri in &data.redirect_uris {
            validate_redirect_uri(uri)?;
        }

        let project: ProjectWriteModel = self.load(ctx, &data.project_id).await?;
        if !project.exists() {
            return Err(AppError::NotFound("project".to_string()));
        }
        if !project.is_active() {
            return Err(AppError::Precondition("project is not active".to_string()));
        }

        let app_id = Uuid::new_v4().to_string();
        let client_id = Uuid::new_v4().to_string();
        let client_secret = if data.auth_method == AUTH_METHOD_NONE {
            None
        } else {
            Some(codes::generate_secret())
        };
        let registration_token = data
            .with_registration_token
            .then(codes::generate_secret);

        let owner = project.resource_owner.clone();
        let config_payload = OidcConfigAddedPayload {
            client_id: client_id.clone(),
            redirect_uris: data.redirect_uris.clone(),
            response_types: data.response_types.clone(),
            grant_types: data.grant_types.clone(),
            auth_method: data.auth_method.clone(),
            client_secret_hash: client_secret.as_deref().map(codes::hash_secret),
            registration_token_hash: registration_token.as_deref().map(codes::hash_secret),
        };

        let result = self
            .execute::<AppWriteModel, _>(ctx, &app_id, |model| {
                if model.exists() {
                    return Err(AppError::Precondition("application already exists".to_string()));
                }
                Ok(Decision::single(EventDraft::new(
                    application::ADDED,
                    &AppAddedPayload {
                        project_id: data.project_id.clone(),
                        name: data.name.clone(),
                    },
                    &owner,
                )?)
                .and(EventDraft::new(
                    application::OIDC_CONFIG_ADDED,
                    &config_payload,
                    &owner,
                )?)
                .with_constraint(UniqueConstraintOp::add(
                    application::CLIENT_ID_CONSTRAINT,
                    &client_id,
                )))
            })
            .await?;

        Ok(AddedOidcApp {
            result,
            app_id,
            client_id,
            client_secret,
            registration_token,
            created_at: chrono::Utc::now(),
        })
    }

    pub async fn update_oidc_app(
        &self,
        ctx: &Context,
        app_id: &str,
        data: UpdateOidcApp,
    ) -> AppResult<CommandResult> {
        if let Some(uris) = &data.redirect_uris {
            for uri in uris {
                validate_redirect_uri(uri)?;
            }
        }

        self.execute::<AppWriteModel, _>(ctx, app_id, |model| {
            let config = ensure_oidc_app(model)?;
            let payload = OidcConfigChangedPayload {
                redirect_uris: data
                    .redirect_uris
                    .clone()
                    .filter(|v| *v != config.redirect_uris),
                response_types: data
                    .response_types
                    .clone()
                    .filter(|v| *v != config.response_types),
                grant_types: data
                    .grant_types
                    .clone()
                    .filter(|v| *v != config.grant_types),
                auth_method: data
                    .auth_method
                    .clone()
                    .filter(|v| *v != config.auth_method),
            };
            if payload.is_empty() {
                return Ok(Decision::noop());
            }
            if let Some(uris) = &payload.redirect_uris {
                if uris.is_empty() {
                    return Err(AppError::Precondition(
                        "cannot remove all redirect URIs".to_string(),
                    ));
                }
            }
            Ok(Decision::single(EventDraft::new(
                application::OIDC_CONFIG_CHANGED,
                &payload,
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn add_redirect_uri(
        &self,
        ctx: &Context,
        app_id: &str,
        uri: &str,
    ) -> AppResult<CommandResult> {
        validate_redirect_uri(uri)?;
        self.execute::<AppWriteModel, _>(ctx, app_id, |model| {
            ensure_oidc_app(model)?;
            if model.has_redirect_uri(uri) {
                return Err(AppError::Precondition("already exists".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                application::REDIRECT_URI_ADDED,
                &RedirectUriPayload {
                    uri: uri.to_string(),
                },
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn remove_redirect_uri(
        &self,
        ctx: &Context,
        app_id: &str,
        uri: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<AppWriteModel, _>(ctx, app_id, |model| {
            let config = ensure_oidc_app(model)?;
            if !model.has_redirect_uri(uri) {
                return Err(AppError::NotFound(format!("redirect URI {uri}")));
            }
            if config.redirect_uris.len() == 1 {
                return Err(AppError::Precondition(
                    "cannot remove last redirect URI".to_string(),
                ));
            }
            Ok(Decision::single(EventDraft::new(
                application::REDIRECT_URI_REMOVED,
                &RedirectUriPayload {
                    uri: uri.to_string(),
                },
                &model.resource_owner,
            )?))
        })
        .await
    }

    /// Rotate the client secret; returns the new secret exactly once
    pub async fn regenerate_client_secret(
        &self,
        ctx: &Context,
        app_id: &str,
    ) -> AppResult<(CommandResult, String)> {
        let secret = codes::generate_secret();
        let hash = codes::hash_secret(&secret);

        let result = self
            .execute::<AppWriteModel, _>(ctx, app_id, |model| {
                ensure_oidc_app(model)?;
                Ok(Decision::single(EventDraft::new(
                    application::SECRET_CHANGED,
                    &SecretChangedPayload {
                        client_secret_hash: hash.clone(),
                    },
                    &model.resource_owner,
                )?))
            })
            .await?;

        Ok((result, secret))
    }

    pub async fn deactivate_app(&self, ctx: &Context, app_id: &str) -> AppResult<CommandResult> {
        self.execute::<AppWriteModel, _>(ctx, app_id, |model| {
            ensure_app(model)?;
            if model.state == AppState::Inactive {
                return Err(AppError::Precondition("application already inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                application::DEACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn reactivate_app(&self, ctx: &Context, app_id: &str) -> AppResult<CommandResult> {
        self.execute::<AppWriteModel, _>(ctx, app_id, |model| {
            ensure_app(model)?;
            if model.state != AppState::Inactive {
                return Err(AppError::Precondition("application is not inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                application::REACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn remove_app(&self, ctx: &Context, app_id: &str) -> AppResult<CommandResult> {
        self.execute::<AppWriteModel, _>(ctx, app_id, |model| {
            ensure_app(model)?;
            let mut decision = Decision::single(EventDraft::new(
                application::REMOVED,
                &json!({}),
                &model.resource_owner,
            )?);
            if let Some(config) = &model.oidc {
                decision = decision.with_constraint(UniqueConstraintOp::remove(
                    application::CLIENT_ID_CONSTRAINT,
                    &config.client_id,
                ));
            }
            Ok(decision)
        })
        .await
    }
}

fn ensure_app(model: &AppWriteModel) -> AppResult<()> {
    if !model.exists() {
        return Err(AppError::NotFound("application".to_string()));
    }
    if model.state == AppState::Removed {
        return Err(AppError::Precondition("deleted".to_string()));
    }
    Ok(())
}

fn ensure_oidc_app(model: &AppWriteModel) -> AppResult<&application::OidcConfigState> {
    ensure_app(model)?;
    model
        .oidc
        .as_ref()
        .ok_or_else(|| AppError::Precondition("application has no OIDC configuration".to_string()))
}

fn validate_redirect_uri(uri: &str) -> AppResult<()> {
    registration::validate(registration::ClientMetadata {
        redirect_uris: vec![uri.to_string()],
        ..Default::default()
    })
    .map(|_| ())
    .map_err(|err| {
        AppError::InvalidInput(
            err.description
                .unwrap_or_else(|| format!("redirect URI {uri} is not valid")),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandConfig;
    use crate::event_store::MemoryEventStore;
    use std::sync::Arc;

    async fn setup() -> (Commands, Context, String) {
        let commands = Commands::new(Arc::new(MemoryEventStore::new()), CommandConfig::default());
        let ctx = Context::new("inst-1").with_user("admin");
        let org_id = commands.add_org(&ctx, "acme", None).await.unwrap().aggregate_id;
        let project_id = commands
            .add_project(&ctx, &org_id, "crm")
            .await
            .unwrap()
            .aggregate_id;
        (commands, ctx, project_id)
    }

    #[tokio::test]
    async fn test_redirect_uri_management() {
        let (commands, ctx, project_id) = setup().await;
        let app = commands
            .add_oidc_app(
                &ctx,
                AddOidcApp::new(&project_id, "web", vec!["https://a/cb".to_string()]),
            )
            .await
            .unwrap();

        let err = commands
            .add_redirect_uri(&ctx, &app.app_id, "https://a/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(msg) if msg == "already exists"));

        commands
            .add_redirect_uri(&ctx, &app.app_id, "https://a/cb2")
            .await
            .unwrap();
        commands
            .remove_redirect_uri(&ctx, &app.app_id, "https://a/cb2")
            .await
            .unwrap();

        let err = commands
            .remove_redirect_uri(&ctx, &app.app_id, "https://a/cb")
            .await
            .unwrap_err();
        assert!(
            matches!(err, AppError::Precondition(msg) if msg == "cannot remove last redirect URI")
        );
    }

    #[tokio::test]
    async fn test_secret_only_for_confidential_clients() {
        let (commands, ctx, project_id) = setup().await;

        let confidential = commands
            .add_oidc_app(
                &ctx,
                AddOidcApp::new(&project_id, "web", vec!["https://a/cb".to_string()]),
            )
            .await
            .unwrap();
        assert!(confidential.client_secret.is_some());

        let mut public = AddOidcApp::new(&project_id, "spa", vec!["https://b/cb".to_string()]);
        public.auth_method = AUTH_METHOD_NONE.to_string();
        let public = commands.add_oidc_app(&ctx, public).await.unwrap();
        assert!(public.client_secret.is_none());
    }

    #[tokio::test]
    async fn test_client_id_lookup_and_removal() {
        let (commands, ctx, project_id) = setup().await;
        let app = commands
            .add_oidc_app(
                &ctx,
                AddOidcApp::new(&project_id, "web", vec!["https://a/cb".to_string()]),
            )
            .await
            .unwrap();

        let model = commands.app_by_client_id(&ctx, &app.client_id).await.unwrap();
        assert_eq!(model.id, app.app_id);

        commands.remove_app(&ctx, &app.app_id).await.unwrap();
        let err = commands.app_by_client_id(&ctx, &app.client_id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_secret_rotation_changes_hash() {
        let (commands, ctx, project_id) = setup().await;
        let app = commands
            .add_oidc_app(
                &ctx,
                AddOidcApp::new(&project_id, "web", vec!["https://a/cb".to_string()]),
            )
            .await
            .unwrap();

        let (_, new_secret) = commands
            .regenerate_client_secret(&ctx, &app.app_id)
            .await
            .unwrap();
        assert_ne!(Some(&new_secret), app.client_secret.as_ref());

        let model = commands.app_by_client_id(&ctx, &app.client_id).await.unwrap();
        let hash = model.oidc.unwrap().client_secret_hash.unwrap();
        assert!(codes::verify_secret(&new_secret, &hash));
    }
}
