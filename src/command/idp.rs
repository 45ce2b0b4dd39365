//! Identity-provider commands
//!
//! Generic add/change/remove per kind plus the provider façades, which
//! synthesize a full OIDC configuration from a smaller input.

use serde_json::json;
use uuid::Uuid;

use crate::aggregate::idp::{
    self, IdpAddedPayload, IdpChangedPayload, IdpCommon, IdpKind, IdpState, JwtIdpConfig,
    OAuth2IdpConfig, OidcIdpConfig, SamlIdpConfig,
};
use crate::aggregate::{IdpWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::oauth::idp_config;

use super::{CommandResult, Commands, Decision, EventDraft};

/// Owner scope of an identity provider
#[derive(Debug, Clone)]
pub enum IdpOwner {
    Instance,
    Org(String),
}

impl IdpOwner {
    fn owner_id(&self, ctx: &Context) -> String {
        match self {
            IdpOwner::Instance => ctx.instance_id.clone(),
            IdpOwner::Org(org_id) => org_id.clone(),
        }
    }
}

/// Shared input of every add-idp command
#[derive(Debug, Clone)]
pub struct AddIdpData {
    pub name: String,
    pub owner: IdpOwner,
    pub is_creation_allowed: bool,
    pub is_linking_allowed: bool,
    pub is_auto_creation: bool,
    pub is_auto_update: bool,
}

impl AddIdpData {
    pub fn new(name: &str, owner: IdpOwner) -> Self {
        Self {
            name: name.to_string(),
            owner,
            is_creation_allowed: true,
            is_linking_allowed: true,
            is_auto_creation: false,
            is_auto_update: false,
        }
    }

    fn common(&self) -> IdpCommon {
        IdpCommon {
            name: self.name.clone(),
            is_creation_allowed: self.is_creation_allowed,
            is_linking_allowed: self.is_linking_allowed,
            is_auto_creation: self.is_auto_creation,
            is_auto_update: self.is_auto_update,
        }
    }
}

impl Commands {
    async fn add_idp(
        &self,
        ctx: &Context,
        data: &AddIdpData,
        event_type: &str,
        kind: IdpKind,
    ) -> AppResult<CommandResult> {
        if data.name.trim().is_empty() {
            return Err(AppError::InvalidInput("idp name must not be empty".to_string()));
        }
        let idp_id = Uuid::new_v4().to_string();
        let owner = data.owner.owner_id(ctx);
        let payload = IdpAddedPayload {
            common: data.common(),
            kind,
        };

        self.execute::<IdpWriteModel, _>(ctx, &idp_id, |model| {
            if model.exists() {
                return Err(AppError::Precondition("idp already exists".to_string()));
            }
            Ok(Decision::single(EventDraft::new(event_type, &payload, &owner)?))
        })
        .await
    }

    pub async fn add_oidc_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        config: OidcIdpConfig,
    ) -> AppResult<CommandResult> {
        if config.issuer.trim().is_empty() {
            return Err(AppError::InvalidInput("issuer must not be empty".to_string()));
        }
        self.add_idp(ctx, &data, idp::OIDC_ADDED, IdpKind::Oidc(config))
            .await
    }

    pub async fn add_oauth2_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        config: OAuth2IdpConfig,
    ) -> AppResult<CommandResult> {
        if config.authorization_endpoint.trim().is_empty()
            || config.token_endpoint.trim().is_empty()
        {
            return Err(AppError::InvalidInput(
                "authorization and token endpoints are required".to_string(),
            ));
        }
        self.add_idp(ctx, &data, idp::OAUTH2_ADDED, IdpKind::OAuth2(config))
            .await
    }

    pub async fn add_saml_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        config: SamlIdpConfig,
    ) -> AppResult<CommandResult> {
        if config.entity_id.trim().is_empty() || config.sso_url.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "entity_id and sso_url are required".to_string(),
            ));
        }
        self.add_idp(ctx, &data, idp::SAML_ADDED, IdpKind::Saml(config))
            .await
    }

    pub async fn add_jwt_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        config: JwtIdpConfig,
    ) -> AppResult<CommandResult> {
        if config.issuer.trim().is_empty() {
            return Err(AppError::InvalidInput("issuer must not be empty".to_string()));
        }
        self.add_idp(ctx, &data, idp::JWT_ADDED, IdpKind::Jwt(config))
            .await
    }

    // Provider façades

    pub async fn add_google_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        client_id: &str,
        client_secret: &str,
    ) -> AppResult<CommandResult> {
        let config = idp_config::google(client_id, client_secret);
        self.add_idp(ctx, &data, idp::GOOGLE_ADDED, IdpKind::Oidc(config))
            .await
    }

    pub async fn add_azure_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        client_id: &str,
        client_secret: &str,
        tenant: Option<&str>,
    ) -> AppResult<CommandResult> {
        let config = idp_config::azure_ad(client_id, client_secret, tenant);
        self.add_idp(ctx, &data, idp::AZURE_ADDED, IdpKind::Oidc(config))
            .await
    }

    pub async fn add_apple_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        client_id: &str,
        team_id: &str,
        key_id: &str,
        private_key_pem: &[u8],
    ) -> AppResult<CommandResult> {
        let config = idp_config::apple(client_id, team_id, key_id, private_key_pem)
            .map_err(|err| AppError::InvalidInput(err.to_string()))?;
        self.add_idp(ctx, &data, idp::APPLE_ADDED, IdpKind::Oidc(config))
            .await
    }

    pub async fn add_github_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        client_id: &str,
        client_secret: &str,
    ) -> AppResult<CommandResult> {
        let config = idp_config::github(client_id, client_secret);
        self.add_idp(ctx, &data, idp::GITHUB_ADDED, IdpKind::Oidc(config))
            .await
    }

    pub async fn add_gitlab_idp(
        &self,
        ctx: &Context,
        data: AddIdpData,
        client_id: &str,
        client_secret: &str,
    ) -> AppResult<CommandResult> {
        let config = idp_config::gitlab(client_id, client_secret);
        self.add_idp(ctx, &data, idp::GITLAB_ADDED, IdpKind::Oidc(config))
            .await
    }

    pub async fn change_idp(
        &self,
        ctx: &Context,
        idp_id: &str,
        changes: IdpChangedPayload,
    ) -> AppResult<CommandResult> {
        self.execute::<IdpWriteModel, _>(ctx, idp_id, |model| {
            ensure_idp(model)?;

            let effective = IdpChangedPayload {
                name: changes
                    .name
                    .clone()
                    .filter(|name| *name != model.common.name),
                is_creation_allowed: changes
                    .is_creation_allowed
                    .filter(|v| *v != model.common.is_creation_allowed),
                is_linking_allowed: changes
                    .is_linking_allowed
                    .filter(|v| *v != model.common.is_linking_allowed),
                is_auto_creation: changes
                    .is_auto_creation
                    .filter(|v| *v != model.common.is_auto_creation),
                is_auto_update: changes
                    .is_auto_update
                    .filter(|v| *v != model.common.is_auto_update),
                config: changes.config.clone(),
            };
            if effective.is_empty() {
                return Ok(Decision::noop());
            }
            Ok(Decision::single(EventDraft::new(
                idp::CHANGED,
                &effective,
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn deactivate_idp(&self, ctx: &Context, idp_id: &str) -> AppResult<CommandResult> {
        self.execute::<IdpWriteModel, _>(ctx, idp_id, |model| {
            ensure_idp(model)?;
            if model.state == IdpState::Inactive {
                return Err(AppError::Precondition("idp already inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                idp::DEACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn reactivate_idp(&self, ctx: &Context, idp_id: &str) -> AppResult<CommandResult> {
        self.execute::<IdpWriteModel, _>(ctx, idp_id, |model| {
            ensure_idp(model)?;
            if model.state != IdpState::Inactive {
                return Err(AppError::Precondition("idp is not inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                idp::REACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn remove_idp(&self, ctx: &Context, idp_id: &str) -> AppResult<CommandResult> {
        self.execute::<IdpWriteModel, _>(ctx, idp_id, |model| {
            ensure_idp(model)?;
            Ok(Decision::single(EventDraft::new(
                idp::REMOVED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    /// Find an active JWT IDP for an assertion issuer; used by the
    /// jwt-bearer grant.
    pub async fn jwt_idp_by_issuer(
        &self,
        ctx: &Context,
        issuer: &str,
    ) -> AppResult<IdpWriteModel> {
        ctx.check_deadline()?;
        let added = self
            .store()
            .filter(
                &crate::event_store::EventFilter::instance(&ctx.instance_id)
                    .with_aggregate_types(&[idp::AGGREGATE_TYPE])
                    .with_event_types(&[idp::JWT_ADDED]),
            )
            .await?;

        for event in added.iter().rev() {
            if event.payload.get("issuer").and_then(|v| v.as_str()) == Some(issuer) {
                let model: IdpWriteModel = self.load(ctx, &event.aggregate_id).await?;
                if model.is_active() {
                    return Ok(model);
                }
            }
        }
        Err(AppError::NotFound(format!("jwt idp for issuer {issuer}")))
    }
}

fn ensure_idp(model: &IdpWriteModel) -> AppResult<()> {
    if !model.exists() {
        return Err(AppError::NotFound("idp".to_string()));
    }
    if model.state == IdpState::Removed {
        return Err(AppError::Precondition("deleted".to_string()));
    }
    Ok(())
}
