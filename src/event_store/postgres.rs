//! PostgreSQL event store
//!
//! Durable implementation of the event store contract. A push runs in one
//! transaction holding a per-instance advisory lock, so commit positions
//! within an instance are assigned and become visible strictly in order:
//! a projection that has processed position `p` can never observe a later
//! commit with a smaller position.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

use super::{
    EventFilter, EventPosition, EventStore, EventStoreError, Push, StoredEvent,
    UniqueConstraintOp,
};

/// Event store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn stored_version(
        tx: &mut Transaction<'_, Postgres>,
        instance_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(aggregate_version) FROM events
            WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
            "#,
        )
        .bind(instance_id)
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(&mut **tx)
        .await?
        .flatten();

        Ok(version.unwrap_or(0))
    }

    async fn apply_constraint(
        tx: &mut Transaction<'_, Postgres>,
        instance_id: &str,
        op: &UniqueConstraintOp,
    ) -> Result<(), EventStoreError> {
        match op {
            UniqueConstraintOp::Add { name, value } => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO unique_constraints (instance_id, constraint_name, constraint_value)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(instance_id)
                .bind(name)
                .bind(value)
                .execute(&mut **tx)
                .await;

                match result {
                    Ok(_) => Ok(()),
                    Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                        Err(EventStoreError::UniqueConstraintViolation {
                            name: name.clone(),
                            value: value.clone(),
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            UniqueConstraintOp::Remove { name, value } => {
                // Removing an unheld constraint is a no-op
                sqlx::query(
                    r#"
                    DELETE FROM unique_constraints
                    WHERE instance_id = $1 AND constraint_name = $2 AND constraint_value = $3
                    "#,
                )
                .bind(instance_id)
                .bind(name)
                .bind(value)
                .execute(&mut **tx)
                .await?;
                Ok(())
            }
        }
    }
}

type EventRow = (
    String,
    String,
    String,
    i64,
    String,
    serde_json::Value,
    String,
    String,
    i64,
    i64,
    DateTime<Utc>,
    i16,
);

fn row_to_event(row: EventRow) -> StoredEvent {
    let (
        instance_id,
        aggregate_type,
        aggregate_id,
        aggregate_version,
        event_type,
        payload,
        creator,
        owner,
        position,
        in_tx_order,
        created_at,
        revision,
    ) = row;
    StoredEvent {
        instance_id,
        aggregate_type,
        aggregate_id,
        aggregate_version,
        event_type,
        payload,
        creator,
        owner,
        position: EventPosition::new(position, in_tx_order),
        created_at,
        revision,
    }
}

const EVENT_COLUMNS: &str = "instance_id, aggregate_type, aggregate_id, aggregate_version, \
     event_type, payload, creator, owner, position, in_tx_order, created_at, revision";

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn push(&self, push: Push) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialize commits per instance; released at commit/rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&push.instance_id)
            .execute(&mut *tx)
            .await?;

        // Intended versions must continue each aggregate's stored head
        // contiguously; under the advisory lock this check cannot race.
        let mut heads: HashMap<(String, String), i64> = HashMap::new();
        for event in &push.events {
            let key = (event.aggregate_type.clone(), event.aggregate_id.clone());
            let head = match heads.get(&key) {
                Some(head) => *head,
                None => {
                    Self::stored_version(
                        &mut tx,
                        &push.instance_id,
                        &event.aggregate_type,
                        &event.aggregate_id,
                    )
                    .await?
                }
            };
            if event.aggregate_version != head + 1 {
                return Err(EventStoreError::OptimisticConcurrency {
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_id: event.aggregate_id.clone(),
                    expected: event.aggregate_version,
                    actual: head,
                });
            }
            heads.insert(key, event.aggregate_version);
        }

        let position: i64 = sqlx::query_scalar("SELECT nextval('events_position_seq')")
            .fetch_one(&mut *tx)
            .await?;
        let created_at: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await?;

        let mut stored = Vec::with_capacity(push.events.len());
        for (idx, event) in push.events.into_iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO events (
                    instance_id, aggregate_type, aggregate_id, aggregate_version,
                    event_type, payload, creator, owner,
                    position, in_tx_order, created_at, revision
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(&push.instance_id)
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(event.aggregate_version)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(&event.creator)
            .bind(&event.owner)
            .bind(position)
            .bind(idx as i64)
            .bind(created_at)
            .bind(event.revision)
            .execute(&mut *tx)
            .await?;

            stored.push(StoredEvent {
                instance_id: push.instance_id.clone(),
                aggregate_type: event.aggregate_type,
                aggregate_id: event.aggregate_id,
                aggregate_version: event.aggregate_version,
                event_type: event.event_type,
                payload: event.payload,
                creator: event.creator,
                owner: event.owner,
                position: EventPosition::new(position, idx as i64),
                created_at,
                revision: event.revision,
            });
        }

        for op in &push.constraints {
            Self::apply_constraint(&mut tx, &push.instance_id, op).await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn filter(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE instance_id = "
        ));
        qb.push_bind(&filter.instance_id);

        if !filter.aggregate_types.is_empty() {
            qb.push(" AND aggregate_type = ANY(");
            qb.push_bind(&filter.aggregate_types);
            qb.push(")");
        }
        if !filter.aggregate_ids.is_empty() {
            qb.push(" AND aggregate_id = ANY(");
            qb.push_bind(&filter.aggregate_ids);
            qb.push(")");
        }
        if !filter.event_types.is_empty() {
            qb.push(" AND event_type = ANY(");
            qb.push_bind(&filter.event_types);
            qb.push(")");
        }
        if !filter.owners.is_empty() {
            qb.push(" AND owner = ANY(");
            qb.push_bind(&filter.owners);
            qb.push(")");
        }
        if let Some(after) = filter.position_after {
            qb.push(" AND (position > ");
            qb.push_bind(after.position);
            qb.push(" OR (position = ");
            qb.push_bind(after.position);
            qb.push(" AND in_tx_order > ");
            qb.push_bind(after.in_tx_order);
            qb.push("))");
        }
        if let Some(created_after) = filter.created_after {
            qb.push(" AND created_at >= ");
            qb.push_bind(created_after);
        }
        qb.push(" ORDER BY position ASC, in_tx_order ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }

        let rows: Vec<EventRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_event).collect())
    }

    async fn latest_version(
        &self,
        instance_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(aggregate_version) FROM events
            WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
            "#,
        )
        .bind(instance_id)
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(version.unwrap_or(0))
    }

    async fn max_position(
        &self,
        instance_id: &str,
    ) -> Result<Option<EventPosition>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT position, in_tx_order FROM events
            WHERE instance_id = $1
            ORDER BY position DESC, in_tx_order DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| EventPosition::new(r.get::<i64, _>("position"), r.get::<i64, _>("in_tx_order"))))
    }

    async fn instances(&self) -> Result<Vec<String>, EventStoreError> {
        let instances: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT instance_id FROM events ORDER BY instance_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(instances)
    }
}
