//! Instance setup
//!
//! Seeds a fresh tenant: the instance aggregate plus its default
//! organization, written in one atomic push across both aggregates.

use uuid::Uuid;

use crate::aggregate::instance::{self, DefaultOrgSetPayload, InstanceAddedPayload};
use crate::aggregate::org::{self, OrgAddedPayload};
use crate::aggregate::{InstanceWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::event_store::{PendingEvent, Push};

use super::Commands;

/// Result of instance setup
#[derive(Debug, Clone)]
pub struct SetupInstance {
    pub instance_id: String,
    pub default_org_id: String,
}

impl Commands {
    pub async fn setup_instance(
        &self,
        ctx: &Context,
        instance_name: &str,
        default_org_name: &str,
    ) -> AppResult<SetupInstance> {
        if instance_name.trim().is_empty() || default_org_name.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "instance and org names must not be empty".to_string(),
            ));
        }

        let existing: InstanceWriteModel = self.load(ctx, &ctx.instance_id).await?;
        if existing.exists() {
            return Err(AppError::Precondition("instance already set up".to_string()));
        }

        let org_id = Uuid::new_v4().to_string();
        let creator = ctx.creator();

        let events = vec![
            PendingEvent::new(
                instance::AGGREGATE_TYPE,
                &ctx.instance_id,
                1,
                instance::ADDED,
                &InstanceAddedPayload {
                    name: instance_name.to_string(),
                },
                &creator,
                &ctx.instance_id,
            )?,
            PendingEvent::new(
                org::AGGREGATE_TYPE,
                &org_id,
                1,
                org::ADDED,
                &OrgAddedPayload {
                    name: default_org_name.to_string(),
                },
                &creator,
                &org_id,
            )?,
            PendingEvent::new(
                instance::AGGREGATE_TYPE,
                &ctx.instance_id,
                2,
                instance::DEFAULT_ORG_SET,
                &DefaultOrgSetPayload {
                    org_id: org_id.clone(),
                },
                &creator,
                &ctx.instance_id,
            )?,
        ];

        ctx.check_deadline()?;
        self.store()
            .push(Push::new(&ctx.instance_id, events))
            .await?;

        Ok(SetupInstance {
            instance_id: ctx.instance_id.clone(),
            default_org_id: org_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandConfig;
    use crate::event_store::{EventFilter, EventStore, MemoryEventStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_setup_writes_both_aggregates_atomically() {
        let store = Arc::new(MemoryEventStore::new());
        let commands = Commands::new(store.clone(), CommandConfig::default());
        let ctx = Context::new("inst-1");

        let setup = commands.setup_instance(&ctx, "acme", "acme-org").await.unwrap();
        assert_eq!(setup.instance_id, "inst-1");

        let events = store.filter(&EventFilter::instance("inst-1")).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["instance.added", "org.added", "instance.default_org.set"]
        );
        // One commit position for the whole setup
        assert!(events.windows(2).all(|w| w[0].position.position == w[1].position.position));

        let err = commands.setup_instance(&ctx, "acme", "again").await.unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }
}
