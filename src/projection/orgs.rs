//! Orgs projection
//!
//! Owns three tables: `orgs`, `org_domains` and `org_members`.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::org;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct OrgsProjection {
    pool: PgPool,
}

impl OrgsProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Projection for OrgsProjection {
    fn name(&self) -> &'static str {
        "orgs"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orgs (
                instance_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                primary_domain TEXT,
                state TEXT NOT NULL,
                require_mfa BOOLEAN NOT NULL DEFAULT FALSE,
                sequence BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS org_domains (
                instance_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                is_primary BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (instance_id, org_id, domain)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS org_members (
                instance_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                roles JSONB NOT NULL DEFAULT '[]',
                PRIMARY KEY (instance_id, org_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != org::AGGREGATE_TYPE {
            return Ok(());
        }
        let org_id = event.aggregate_id.as_str();
        match event.event_type.as_str() {
            org::ADDED => {
                let payload: org::OrgAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO orgs (instance_id, id, name, state, sequence, updated_at)
                    VALUES ($1, $2, $3, 'active', $4, $5)
                    ON CONFLICT (instance_id, id) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(&payload.name)
                .bind(event.aggregate_version)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            org::CHANGED => {
                let payload: org::OrgChangedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE orgs SET name = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(event.aggregate_version)
                .bind(&payload.name)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            org::LOGIN_POLICY_CHANGED => {
                let policy: org::LoginPolicy = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE orgs SET require_mfa = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(event.aggregate_version)
                .bind(policy.require_mfa)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            org::DOMAIN_ADDED => {
                let payload: org::DomainPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO org_domains (instance_id, org_id, domain)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (instance_id, org_id, domain) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(&payload.domain)
                .execute(&self.pool)
                .await?;
                self.touch(event).await?;
            }
            org::DOMAIN_PRIMARY_SET => {
                let payload: org::DomainPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE org_domains SET is_primary = (domain = $3)
                    WHERE instance_id = $1 AND org_id = $2
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(&payload.domain)
                .execute(&self.pool)
                .await?;
                sqlx::query(
                    r#"
                    UPDATE orgs SET primary_domain = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(event.aggregate_version)
                .bind(&payload.domain)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            org::DOMAIN_REMOVED => {
                let payload: org::DomainPayload = decode(event)?;
                sqlx::query(
                    r#"
                    DELETE FROM org_domains
                    WHERE instance_id = $1 AND org_id = $2 AND domain = $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(&payload.domain)
                .execute(&self.pool)
                .await?;
                self.touch(event).await?;
            }
            org::MEMBER_ADDED | org::MEMBER_CHANGED => {
                let payload: org::MemberPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO org_members (instance_id, org_id, user_id, roles)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (instance_id, org_id, user_id) DO UPDATE SET roles = EXCLUDED.roles
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(&payload.user_id)
                .bind(serde_json::to_value(&payload.roles)?)
                .execute(&self.pool)
                .await?;
                self.touch(event).await?;
            }
            org::MEMBER_REMOVED => {
                let payload: org::MemberRemovedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    DELETE FROM org_members
                    WHERE instance_id = $1 AND org_id = $2 AND user_id = $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(org_id)
                .bind(&payload.user_id)
                .execute(&self.pool)
                .await?;
                self.touch(event).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        for table in ["org_members", "org_domains", "orgs"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE instance_id = $1"))
                .bind(instance_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

impl OrgsProjection {
    /// Advance the org row's sequence without changing columns
    async fn touch(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE orgs SET sequence = $3, updated_at = $4
            WHERE instance_id = $1 AND id = $2 AND sequence < $3
            "#,
        )
        .bind(&event.instance_id)
        .bind(&event.aggregate_id)
        .bind(event.aggregate_version)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
