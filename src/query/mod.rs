//! Query layer
//!
//! Thin, read-only lookups over the projection tables. Consistency is
//! eventual; callers that need the current truth (token introspection,
//! code exchange) go through the write models instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};

/// Paging for searches
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Users read row
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub id: String,
    pub resource_owner: String,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub state: String,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Device-authorization read row
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAuthView {
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub state: String,
    pub approved_user_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Application read row
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationView {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub client_id: Option<String>,
    pub redirect_uris: Vec<String>,
    pub state: String,
}

/// IDP read row
#[derive(Debug, Clone, Serialize)]
pub struct IdpView {
    pub id: String,
    pub resource_owner: String,
    pub name: String,
    pub provider: String,
    pub kind: String,
    pub state: String,
}

/// Read-side accessor
#[derive(Debug, Clone)]
pub struct Queries {
    pool: PgPool,
}

impl Queries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn user_by_id(&self, instance_id: &str, user_id: &str) -> AppResult<UserView> {
        let row = sqlx::query(
            r#"
            SELECT id, resource_owner, username, email, display_name, state,
                   sequence, created_at, updated_at
            FROM users
            WHERE instance_id = $1 AND id = $2
            "#,
        )
        .bind(instance_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;

        Ok(user_view(&row))
    }

    /// Users of an org, newest first, limit/offset paging
    pub async fn search_users(
        &self,
        instance_id: &str,
        resource_owner: Option<&str>,
        page: Page,
    ) -> AppResult<Vec<UserView>> {
        let rows = match resource_owner {
            Some(owner) => {
                sqlx::query(
                    r#"
                    SELECT id, resource_owner, username, email, display_name, state,
                           sequence, created_at, updated_at
                    FROM users
                    WHERE instance_id = $1 AND resource_owner = $2
                    ORDER BY created_at DESC, id
                    LIMIT $3 OFFSET $4
                    "#,
                )
                .bind(instance_id)
                .bind(owner)
                .bind(page.limit)
                .bind(page.offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, resource_owner, username, email, display_name, state,
                           sequence, created_at, updated_at
                    FROM users
                    WHERE instance_id = $1
                    ORDER BY created_at DESC, id
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(instance_id)
                .bind(page.limit)
                .bind(page.offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(user_view).collect())
    }

    pub async fn device_auth_by_user_code(
        &self,
        instance_id: &str,
        user_code: &str,
    ) -> AppResult<DeviceAuthView> {
        let row = sqlx::query(
            r#"
            SELECT device_code, user_code, client_id, state, approved_user_id, expires_at
            FROM device_auths
            WHERE instance_id = $1 AND user_code = $2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .bind(user_code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("device authorization {user_code}")))?;

        Ok(DeviceAuthView {
            device_code: row.get("device_code"),
            user_code: row.get("user_code"),
            client_id: row.get("client_id"),
            state: row.get("state"),
            approved_user_id: row.get("approved_user_id"),
            expires_at: row.get("expires_at"),
        })
    }

    pub async fn application_by_client_id(
        &self,
        instance_id: &str,
        client_id: &str,
    ) -> AppResult<ApplicationView> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name, client_id, redirect_uris, state
            FROM applications
            WHERE instance_id = $1 AND client_id = $2 AND state <> 'removed'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("client {client_id}")))?;

        let redirect_uris: serde_json::Value = row.get("redirect_uris");
        Ok(ApplicationView {
            id: row.get("id"),
            project_id: row.get("project_id"),
            name: row.get("name"),
            client_id: row.get("client_id"),
            redirect_uris: serde_json::from_value(redirect_uris).unwrap_or_default(),
            state: row.get("state"),
        })
    }

    pub async fn idps_by_owner(
        &self,
        instance_id: &str,
        resource_owner: &str,
        page: Page,
    ) -> AppResult<Vec<IdpView>> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_owner, name, provider, kind, state
            FROM idps
            WHERE instance_id = $1 AND resource_owner = $2 AND state <> 'removed'
            ORDER BY name, id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(instance_id)
        .bind(resource_owner)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| IdpView {
                id: row.get("id"),
                resource_owner: row.get("resource_owner"),
                name: row.get("name"),
                provider: row.get("provider"),
                kind: row.get("kind"),
                state: row.get("state"),
            })
            .collect())
    }
}

fn user_view(row: &sqlx::postgres::PgRow) -> UserView {
    UserView {
        id: row.get("id"),
        resource_owner: row.get("resource_owner"),
        username: row.get("username"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        state: row.get("state"),
        sequence: row.get("sequence"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
