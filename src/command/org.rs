//! Organization commands
//!
//! Domains, members and the org-scoped login policy. Instance-level policy
//! has no write path of its own: defaults are read from configuration and
//! every policy write lands at org scope.

use uuid::Uuid;

use crate::aggregate::org::{
    self, DomainPayload, LoginPolicy, MemberPayload, MemberRemovedPayload, OrgAddedPayload,
    OrgChangedPayload,
};
use crate::aggregate::{OrgWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::event_store::UniqueConstraintOp;

use super::{CommandResult, Commands, Decision, EventDraft};

/// Role granted to the creator of an organization
pub const ROLE_ORG_OWNER: &str = "ORG_OWNER";

impl Commands {
    pub async fn add_org(
        &self,
        ctx: &Context,
        name: &str,
        org_id: Option<String>,
    ) -> AppResult<CommandResult> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidInput("org name must not be empty".to_string()));
        }
        let org_id = org_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        self.execute::<OrgWriteModel, _>(ctx, &org_id, |model| {
            if model.exists() {
                return Err(AppError::Precondition("org already exists".to_string()));
            }
            let mut decision = Decision::single(EventDraft::new(
                org::ADDED,
                &OrgAddedPayload {
                    name: name.to_string(),
                },
                &org_id,
            )?);
            // The creating user becomes the first owner
            if let Some(user_id) = &ctx.user_id {
                decision = decision.and(EventDraft::new(
                    org::MEMBER_ADDED,
                    &MemberPayload {
                        user_id: user_id.clone(),
                        roles: vec![ROLE_ORG_OWNER.to_string()],
                    },
                    &org_id,
                )?);
            }
            Ok(decision)
        })
        .await
    }

    pub async fn change_org(&self, ctx: &Context, org_id: &str, name: &str) -> AppResult<CommandResult> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidInput("org name must not be empty".to_string()));
        }
        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            if model.name == name {
                return Ok(Decision::noop());
            }
            Ok(Decision::single(EventDraft::new(
                org::CHANGED,
                &OrgChangedPayload {
                    name: name.to_string(),
                },
                org_id,
            )?))
        })
        .await
    }

    pub async fn add_org_domain(
        &self,
        ctx: &Context,
        org_id: &str,
        domain: &str,
    ) -> AppResult<CommandResult> {
        if domain.trim().is_empty() || domain.contains(char::is_whitespace) {
            return Err(AppError::InvalidInput("domain is not valid".to_string()));
        }

        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            if model.domain(domain).is_some() {
                return Err(AppError::Precondition("domain already exists".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                org::DOMAIN_ADDED,
                &DomainPayload {
                    domain: domain.to_string(),
                },
                org_id,
            )?)
            .with_constraint(UniqueConstraintOp::add(
                org::DOMAIN_CONSTRAINT,
                &org::domain_constraint_value(org_id, domain),
            )))
        })
        .await
    }

    pub async fn set_primary_org_domain(
        &self,
        ctx: &Context,
        org_id: &str,
        domain: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            let entry = model
                .domain(domain)
                .ok_or_else(|| AppError::NotFound(format!("domain {domain}")))?;
            if entry.is_primary {
                return Ok(Decision::noop());
            }
            Ok(Decision::single(EventDraft::new(
                org::DOMAIN_PRIMARY_SET,
                &DomainPayload {
                    domain: domain.to_string(),
                },
                org_id,
            )?))
        })
        .await
    }

    pub async fn remove_org_domain(
        &self,
        ctx: &Context,
        org_id: &str,
        domain: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            let entry = model
                .domain(domain)
                .ok_or_else(|| AppError::NotFound(format!("domain {domain}")))?;
            if entry.is_primary {
                return Err(AppError::Precondition(
                    "cannot remove the primary domain".to_string(),
                ));
            }
            Ok(Decision::single(EventDraft::new(
                org::DOMAIN_REMOVED,
                &DomainPayload {
                    domain: domain.to_string(),
                },
                org_id,
            )?)
            .with_constraint(UniqueConstraintOp::remove(
                org::DOMAIN_CONSTRAINT,
                &org::domain_constraint_value(org_id, domain),
            )))
        })
        .await
    }

    pub async fn add_org_member(
        &self,
        ctx: &Context,
        org_id: &str,
        user_id: &str,
        roles: Vec<String>,
    ) -> AppResult<CommandResult> {
        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            if model.has_member(user_id) {
                return Err(AppError::Precondition("user is already a member".to_string()));
            }
            Ok(Decision::single(EventDraft::new(
                org::MEMBER_ADDED,
                &MemberPayload {
                    user_id: user_id.to_string(),
                    roles: roles.clone(),
                },
                org_id,
            )?))
        })
        .await
    }

    pub async fn change_org_member(
        &self,
        ctx: &Context,
        org_id: &str,
        user_id: &str,
        roles: Vec<String>,
    ) -> AppResult<CommandResult> {
        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            let current = model
                .members
                .get(user_id)
                .ok_or_else(|| AppError::NotFound(format!("member {user_id}")))?;
            if *current == roles {
                return Ok(Decision::noop());
            }
            Ok(Decision::single(EventDraft::new(
                org::MEMBER_CHANGED,
                &MemberPayload {
                    user_id: user_id.to_string(),
                    roles: roles.clone(),
                },
                org_id,
            )?))
        })
        .await
    }

    pub async fn remove_org_member(
        &self,
        ctx: &Context,
        org_id: &str,
        user_id: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            if !model.has_member(user_id) {
                return Err(AppError::NotFound(format!("member {user_id}")));
            }
            Ok(Decision::single(EventDraft::new(
                org::MEMBER_REMOVED,
                &MemberRemovedPayload {
                    user_id: user_id.to_string(),
                },
                org_id,
            )?))
        })
        .await
    }

    pub async fn change_login_policy(
        &self,
        ctx: &Context,
        org_id: &str,
        policy: LoginPolicy,
    ) -> AppResult<CommandResult> {
        self.execute::<OrgWriteModel, _>(ctx, org_id, |model| {
            ensure_org(model)?;
            if let Some(current) = model.login_policy {
                if current.require_mfa == policy.require_mfa {
                    return Ok(Decision::noop());
                }
            }
            Ok(Decision::single(EventDraft::new(
                org::LOGIN_POLICY_CHANGED,
                &policy,
                org_id,
            )?))
        })
        .await
    }

    /// Effective login policy for an org: its own, or the instance default
    pub async fn effective_login_policy(&self, ctx: &Context, org_id: &str) -> AppResult<LoginPolicy> {
        let model: OrgWriteModel = self.load(ctx, org_id).await?;
        Ok(model
            .login_policy
            .unwrap_or(self.config().default_login_policy))
    }
}

fn ensure_org(model: &OrgWriteModel) -> AppResult<()> {
    if !model.exists() {
        return Err(AppError::NotFound("org".to_string()));
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
        Context::new("inst-1").with_user("admin")
    }

    #[tokio::test]
    async fn test_add_org_grants_creator_ownership() {
        let commands = commands();
        let result = commands.add_org(&ctx(), "acme", None).await.unwrap();
        assert_eq!(result.sequence, 2);

        let model: OrgWriteModel = commands.load(&ctx(), &result.aggregate_id).await.unwrap();
        assert_eq!(model.members["admin"], vec![ROLE_ORG_OWNER.to_string()]);
    }

    #[tokio::test]
    async fn test_primary_domain_cannot_be_removed() {
        let commands = commands();
        let ctx = ctx();
        let org = commands.add_org(&ctx, "acme", None).await.unwrap();
        let org_id = org.aggregate_id;

        commands.add_org_domain(&ctx, &org_id, "acme.com").await.unwrap();
        commands
            .set_primary_org_domain(&ctx, &org_id, "acme.com")
            .await
            .unwrap();

        let err = commands
            .remove_org_domain(&ctx, &org_id, "acme.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_same_domain_distinct_orgs_allowed() {
        let commands = commands();
        let ctx = ctx();
        let org_a = commands.add_org(&ctx, "a", None).await.unwrap().aggregate_id;
        let org_b = commands.add_org(&ctx, "b", None).await.unwrap().aggregate_id;

        commands.add_org_domain(&ctx, &org_a, "shared.com").await.unwrap();
        commands.add_org_domain(&ctx, &org_b, "shared.com").await.unwrap();

        // Duplicate within the same org is refused by the write model
        let err = commands
            .add_org_domain(&ctx, &org_a, "shared.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_member_roundtrip() {
        let commands = commands();
        let ctx = ctx();
        let org_id = commands.add_org(&ctx, "acme", None).await.unwrap().aggregate_id;

        commands
            .add_org_member(&ctx, &org_id, "u1", vec!["ORG_MEMBER".to_string()])
            .await
            .unwrap();
        let err = commands
            .add_org_member(&ctx, &org_id, "u1", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));

        // Unchanged roles are a no-op
        let result = commands
            .change_org_member(&ctx, &org_id, "u1", vec!["ORG_MEMBER".to_string()])
            .await
            .unwrap();
        assert!(result.position.is_none());

        commands.remove_org_member(&ctx, &org_id, "u1").await.unwrap();
        let err = commands
            .remove_org_member(&ctx, &org_id, "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_login_policy_written_at_org_scope() {
        let commands = commands();
        let ctx = ctx();
        let org_id = commands.add_org(&ctx, "acme", None).await.unwrap().aggregate_id;

        // Instance default applies while the org has no policy
        let policy = commands.effective_login_policy(&ctx, &org_id).await.unwrap();
        assert!(!policy.require_mfa);

        commands
            .change_login_policy(&ctx, &org_id, LoginPolicy { require_mfa: true })
            .await
            .unwrap();
        let policy = commands.effective_login_policy(&ctx, &org_id).await.unwrap();
        assert!(policy.require_mfa);

        // Setting the same value again writes nothing
        let result = commands
            .change_login_policy(&ctx, &org_id, LoginPolicy { require_mfa: true })
            .await
            .unwrap();
        assert!(result.position.is_none());
    }
}
