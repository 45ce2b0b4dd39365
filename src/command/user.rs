//! User commands

use serde_json::json;
use uuid::Uuid;

use crate::aggregate::user::{
    self, HumanAddedPayload, ProfileChangedPayload, UserState, UsernameChangedPayload,
};
use crate::aggregate::{UserWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::event_store::UniqueConstraintOp;

use super::{CommandResult, Commands, Decision, EventDraft};

/// Command to create a human user
#[derive(Debug, Clone)]
pub struct AddHumanUser {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub password: Option<String>,
    pub totp_secret: Option<String>,
}

impl AddHumanUser {
    pub fn new(username: &str, email: &str) -> Self {
        Self {
            user_id: None,
            org_id: None,
            username: username.to_string(),
            email: email.to_string(),
            first_name: None,
            last_name: None,
            display_name: None,
            password: None,
            totp_secret: None,
        }
    }

    pub fn with_org(mut self, org_id: &str) -> Self {
        self.org_id = Some(org_id.to_string());
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_totp_secret(mut self, secret: &str) -> Self {
        self.totp_secret = Some(secret.to_string());
        self
    }
}

impl Commands {
    pub async fn add_human_user(
        &self,
        ctx: &Context,
        data: AddHumanUser,
    ) -> AppResult<CommandResult> {
        if data.username.trim().is_empty() {
            return Err(AppError::InvalidInput("username must not be empty".to_string()));
        }
        if data.email.trim().is_empty() || !data.email.contains('@') {
            return Err(AppError::InvalidInput("email is not valid".to_string()));
        }
        let org_id = data
            .org_id
            .clone()
            .or_else(|| ctx.org_id.clone())
            .ok_or_else(|| AppError::InvalidInput("org_id is required".to_string()))?;

        let user_id = data
            .user_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let username = data.username.clone();
        let password_hash = data
            .password
            .as_deref()
            .map(|password| self.password_hasher().hash(password));

        self.execute::<UserWriteModel, _>(ctx, &user_id, move |model| {
            if model.exists() {
                return Err(AppError::Precondition("user already exists".to_string()));
            }
            let payload = HumanAddedPayload {
                username: data.username.clone(),
                email: data.email.clone(),
                first_name: data.first_name.clone(),
                last_name: data.last_name.clone(),
                display_name: data.display_name.clone(),
                password_hash: password_hash.clone(),
                totp_secret: data.totp_secret.clone(),
            };
            Ok(
                Decision::single(EventDraft::new(user::HUMAN_ADDED, &payload, &org_id)?)
                    .with_constraint(UniqueConstraintOp::add(
                        user::USERNAME_CONSTRAINT,
                        &user::username_constraint_value(&org_id, &data.username),
                    )),
            )
        })
        .await
        .map_err(|err| match err {
            AppError::UniqueConstraint { name, .. } if name == user::USERNAME_CONSTRAINT => {
                AppError::UniqueConstraint {
                    name,
                    message: format!("username {username:?} is already taken"),
                }
            }
            other => other,
        })
    }

    pub async fn change_profile(
        &self,
        ctx: &Context,
        user_id: &str,
        changes: ProfileChangedPayload,
    ) -> AppResult<CommandResult> {
        if let Some(email) = &changes.email {
            if !email.contains('@') {
                return Err(AppError::InvalidInput("email is not valid".to_string()));
            }
        }

        self.execute::<UserWriteModel, _>(ctx, user_id, move |model| {
            ensure_exists_and_owned(model, ctx)?;

            // Drop fields that equal the current state; an all-identical
            // change is a no-op.
            let effective = ProfileChangedPayload {
                email: changes.email.clone().filter(|v| *v != model.email),
                first_name: changes
                    .first_name
                    .clone()
                    .filter(|v| Some(v.as_str()) != model.first_name.as_deref()),
                last_name: changes
                    .last_name
                    .clone()
                    .filter(|v| Some(v.as_str()) != model.last_name.as_deref()),
                display_name: changes
                    .display_name
                    .clone()
                    .filter(|v| Some(v.as_str()) != model.display_name.as_deref()),
            };
            if effective.is_empty() {
                return Ok(Decision::noop());
            }
            Ok(Decision::single(EventDraft::new(
                user::PROFILE_CHANGED,
                &effective,
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn change_username(
        &self,
        ctx: &Context,
        user_id: &str,
        username: &str,
    ) -> AppResult<CommandResult> {
        if username.trim().is_empty() {
            return Err(AppError::InvalidInput("username must not be empty".to_string()));
        }

        self.execute::<UserWriteModel, _>(ctx, user_id, move |model| {
            ensure_exists_and_owned(model, ctx)?;
            if model.username == username {
                return Ok(Decision::noop());
            }
            let payload = UsernameChangedPayload {
                username: username.to_string(),
            };
            Ok(
                Decision::single(EventDraft::new(
                    user::USERNAME_CHANGED,
                    &payload,
                    &model.resource_owner,
                )?)
                .with_constraint(UniqueConstraintOp::remove(
                    user::USERNAME_CONSTRAINT,
                    &user::username_constraint_value(&model.resource_owner, &model.username),
                ))
                .with_constraint(UniqueConstraintOp::add(
                    user::USERNAME_CONSTRAINT,
                    &user::username_constraint_value(&model.resource_owner, username),
                )),
            )
        })
        .await
    }

    pub async fn deactivate_user(&self, ctx: &Context, user_id: &str) -> AppResult<CommandResult> {
        self.execute::<UserWriteModel, _>(ctx, user_id, |model| {
            ensure_exists_and_owned(model, ctx)?;
            if model.state == UserState::Inactive {
                return Err(AppError::Precondition("user already inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                user::DEACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn reactivate_user(&self, ctx: &Context, user_id: &str) -> AppResult<CommandResult> {
        self.execute::<UserWriteModel, _>(ctx, user_id, |model| {
            ensure_exists_and_owned(model, ctx)?;
            if model.state != UserState::Inactive {
                return Err(AppError::Precondition("user is not inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                user::REACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn remove_user(&self, ctx: &Context, user_id: &str) -> AppResult<CommandResult> {
        self.execute::<UserWriteModel, _>(ctx, user_id, |model| {
            ensure_exists_and_owned(model, ctx)?;
            Ok(Decision::single(EventDraft::new(
                user::REMOVED,
                &json!({}),
                &model.resource_owner,
            )?)
            .with_constraint(UniqueConstraintOp::remove(
                user::USERNAME_CONSTRAINT,
                &user::username_constraint_value(&model.resource_owner, &model.username),
            )))
        })
        .await
    }
}

/// Shared guard: the user must exist, must not be deleted, and a command
/// scoped to an organization that does not own the user is rejected instead
/// of written with the wrong owner.
fn ensure_exists_and_owned(model: &UserWriteModel, ctx: &Context) -> AppResult<()> {
    if !model.exists() {
        return Err(AppError::NotFound("user".to_string()));
    }
    if model.is_removed() {
        return Err(AppError::Precondition("deleted".to_string()));
    }
    if let Some(org_id) = &ctx.org_id {
        if *org_id != model.resource_owner {
            return Err(AppError::NotFound("user".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandConfig;
    use crate::event_store::MemoryEventStore;
    use std::sync::Arc;

    fn commands() -> Commands {
        Commands::new(Arc::new(MemoryEventStore::new()), CommandConfig::default())
    }

    fn ctx() -> Context {
        Context::new("inst-1").with_org("org-1").with_user("admin")
    }

    #[tokio::test]
    async fn test_user_lifecycle_event_sequence() {
        let commands = commands();
        let ctx = ctx();

        let added = commands
            .add_human_user(
                &ctx,
                AddHumanUser::new("alice", "alice@ex.com").with_password("secret"),
            )
            .await
            .unwrap();
        let user_id = added.aggregate_id.clone();
        assert_eq!(added.sequence, 1);

        assert_eq!(commands.deactivate_user(&ctx, &user_id).await.unwrap().sequence, 2);
        assert_eq!(commands.reactivate_user(&ctx, &user_id).await.unwrap().sequence, 3);
        assert_eq!(
            commands
                .change_username(&ctx, &user_id, "alice2")
                .await
                .unwrap()
                .sequence,
            4
        );
        assert_eq!(commands.remove_user(&ctx, &user_id).await.unwrap().sequence, 5);

        // Any further command on the removed user fails as deleted
        let err = commands.deactivate_user(&ctx, &user_id).await.unwrap_err();
        assert!(matches!(err, AppError::Precondition(msg) if msg == "deleted"));
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected_same_org() {
        let commands = commands();
        let ctx = ctx();

        commands
            .add_human_user(&ctx, AddHumanUser::new("bob", "bob@ex.com"))
            .await
            .unwrap();
        let err = commands
            .add_human_user(&ctx, AddHumanUser::new("bob", "bob2@ex.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UniqueConstraint { .. }));

        // Same username in another org is unrelated
        commands
            .add_human_user(
                &ctx,
                AddHumanUser::new("bob", "bob3@ex.com").with_org("org-2"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_username_freed_after_removal() {
        let commands = commands();
        let ctx = ctx();

        let added = commands
            .add_human_user(&ctx, AddHumanUser::new("carol", "carol@ex.com"))
            .await
            .unwrap();
        commands.remove_user(&ctx, &added.aggregate_id).await.unwrap();

        commands
            .add_human_user(&ctx, AddHumanUser::new("carol", "carol2@ex.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_noop_profile_change_emits_nothing() {
        let commands = commands();
        let ctx = ctx();

        let added = commands
            .add_human_user(&ctx, AddHumanUser::new("dave", "dave@ex.com"))
            .await
            .unwrap();

        let result = commands
            .change_profile(
                &ctx,
                &added.aggregate_id,
                ProfileChangedPayload {
                    email: Some("dave@ex.com".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.sequence, 1);
        assert!(result.position.is_none());
    }

    #[tokio::test]
    async fn test_cross_org_deactivation_rejected() {
        let commands = commands();
        let ctx = ctx();

        let added = commands
            .add_human_user(&ctx, AddHumanUser::new("erin", "erin@ex.com"))
            .await
            .unwrap();

        let foreign_ctx = Context::new("inst-1").with_org("org-2").with_user("admin");
        let err = commands
            .deactivate_user(&foreign_ctx, &added.aggregate_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_double_deactivation_rejected() {
        let commands = commands();
        let ctx = ctx();
        let added = commands
            .add_human_user(&ctx, AddHumanUser::new("frank", "frank@ex.com"))
            .await
            .unwrap();
        commands.deactivate_user(&ctx, &added.aggregate_id).await.unwrap();
        let err = commands
            .deactivate_user(&ctx, &added.aggregate_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_invalid_input() {
        let commands = commands();
        let ctx = ctx();
        assert!(matches!(
            commands
                .add_human_user(&ctx, AddHumanUser::new("", "a@ex.com"))
                .await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            commands
                .add_human_user(&ctx, AddHumanUser::new("gina", "not-an-email"))
                .await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
