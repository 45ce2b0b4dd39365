//! Project commands

use serde_json::json;
use uuid::Uuid;

use crate::aggregate::project::{
    self, ProjectAddedPayload, ProjectState, RoleAddedPayload, RoleRemovedPayload,
};
use crate::aggregate::{ProjectWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::event_store::UniqueConstraintOp;

use super::{CommandResult, Commands, Decision, EventDraft};

impl Commands {
    pub async fn add_project(
        &self,
        ctx: &Context,
        org_id: &str,
        name: &str,
    ) -> AppResult<CommandResult> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidInput("project name must not be empty".to_string()));
        }
        let project_id = Uuid::new_v4().to_string();

        self.execute::<ProjectWriteModel, _>(ctx, &project_id, |model| {
            if model.exists() {
                return Err(AppError::Precondition("project already exists".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                project::ADDED,
                &ProjectAddedPayload {
                    name: name.to_string(),
                },
                org_id,
            )?))
        })
        .await
    }

    pub async fn deactivate_project(
        &self,
        ctx: &Context,
        project_id: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<ProjectWriteModel, _>(ctx, project_id, |model| {
            ensure_project(model)?;
            if model.state == ProjectState::Inactive {
                return Err(AppError::Precondition("project already inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                project::DEACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn reactivate_project(
        &self,
        ctx: &Context,
        project_id: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<ProjectWriteModel, _>(ctx, project_id, |model| {
            ensure_project(model)?;
            if model.state != ProjectState::Inactive {
                return Err(AppError::Precondition("project is not inactive".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                project::REACTIVATED,
                &json!({}),
                &model.resource_owner,
            )?))
        })
        .await
    }

    pub async fn add_project_role(
        &self,
        ctx: &Context,
        project_id: &str,
        key: &str,
        display_name: Option<String>,
    ) -> AppResult<CommandResult> {
        if key.trim().is_empty() {
            return Err(AppError::InvalidInput("role key must not be empty".to_string()));
        }
        self.execute::<ProjectWriteModel, _>(ctx, project_id, |model| {
            ensure_project(model)?;
            if model.role(key).is_some() {
                return Err(AppError::Precondition("role already exists".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                project::ROLE_ADDED,
                &RoleAddedPayload {
                    key: key.to_string(),
                    display_name: display_name.clone(),
                },
                &model.resource_owner,
            )?)
            .with_constraint(UniqueConstraintOp::add(
                project::ROLE_CONSTRAINT,
                &project::role_constraint_value(project_id, key),
            )))
        })
        .await
    }

    pub async fn remove_project_role(
        &self,
        ctx: &Context,
        project_id: &str,
        key: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<ProjectWriteModel, _>(ctx, project_id, |model| {
            ensure_project(model)?;
            if model.role(key).is_none() {
                return Err(AppError::NotFound(format!("role {key}")));
            }
            Ok(Decision::single(EventDraft::new(
                project::ROLE_REMOVED,
                &RoleRemovedPayload {
                    key: key.to_string(),
                },
                &model.resource_owner,
            )?)
            .with_constraint(UniqueConstraintOp::remove(
                project::ROLE_CONSTRAINT,
                &project::role_constraint_value(project_id, key),
            )))
        })
        .await
    }
}

fn ensure_project(model: &ProjectWriteModel) -> AppResult<()> {
    if !model.exists() {
        return Err(AppError::NotFound("project".to_string()));
    }
    Ok(())
}
