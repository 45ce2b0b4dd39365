//! Projects projection: `projects` and `project_roles`

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::project;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct ProjectsProjection {
    pool: PgPool,
}

impl ProjectsProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_state(&self, event: &StoredEvent, state: &str) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE projects SET state = $4, sequence = $3, updated_at = $5
            WHERE instance_id = $1 AND id = $2 AND sequence < $3
            "#,
        )
        .bind(&event.instance_id)
        .bind(&event.aggregate_id)
        .bind(event.aggregate_version)
        .bind(state)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Projection for ProjectsProjection {
    fn name(&self) -> &'static str {
        "projects"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                instance_id TEXT NOT NULL,
                id TEXT NOT NULL,
                resource_owner TEXT NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
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
            CREATE TABLE IF NOT EXISTS project_roles (
                instance_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                role_key TEXT NOT NULL,
                display_name TEXT,
                PRIMARY KEY (instance_id, project_id, role_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != project::AGGREGATE_TYPE {
            return Ok(());
        }
        match event.event_type.as_str() {
            project::ADDED => {
                let payload: project::ProjectAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO projects (instance_id, id, resource_owner, name, state, sequence, updated_at)
                    VALUES ($1, $2, $3, $4, 'active', $5, $6)
                    ON CONFLICT (instance_id, id) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&event.owner)
                .bind(&payload.name)
                .bind(event.aggregate_version)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            project::CHANGED => {
                let payload: project::ProjectAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE projects SET name = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(&payload.name)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            project::DEACTIVATED => self.set_state(event, "inactive").await?,
            project::REACTIVATED => self.set_state(event, "active").await?,
            project::ROLE_ADDED => {
                let payload: project::RoleAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO project_roles (instance_id, project_id, role_key, display_name)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (instance_id, project_id, role_key) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&payload.key)
                .bind(&payload.display_name)
                .execute(&self.pool)
                .await?;
            }
            project::ROLE_REMOVED => {
                let payload: project::RoleRemovedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    DELETE FROM project_roles
                    WHERE instance_id = $1 AND project_id = $2 AND role_key = $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&payload.key)
                .execute(&self.pool)
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        for table in ["project_roles", "projects"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE instance_id = $1"))
                .bind(instance_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}
