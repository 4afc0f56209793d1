//! PgPrimaryStore: users table plus idempotency records, backed by Postgres.
//!
//! Same-key serialization comes from the row lock `UPDATE` takes. Same-token
//! serialization comes from a transaction-scoped advisory lock on the token, so
//! two concurrent retries of one mutation cannot both write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::{CommitError, Entity, EntityId, Mutation, UserPayload};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::store::{CommitOutcome, PrimaryStore};

#[derive(Clone)]
pub struct PgPrimaryStore {
    pool: PgPool,
}

impl PgPrimaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the workspace migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    id: i64,
    handle: String,
    address: String,
    revision: i64,
    committed_at: DateTime<Utc>,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Entity {
            id: row.id,
            payload: UserPayload {
                handle: row.handle,
                address: row.address,
            },
            revision: row.revision,
            committed_at: row.committed_at,
        }
    }
}

#[async_trait]
impl PrimaryStore for PgPrimaryStore {
    async fn commit(&self, mutation: Mutation) -> Result<CommitOutcome, CommitError> {
        mutation.validate()?;
        let Mutation {
            key,
            payload,
            token,
        } = mutation;

        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(token.as_str())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let prior = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT entity_id AS id, handle, address, revision, committed_at
            FROM idempotency_records
            WHERE token = $1
            "#,
        )
        .bind(token.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        if let Some(prior) = prior {
            debug!(token = %token, entity_id = prior.id, revision = prior.revision, "Idempotent replay");
            return Ok(CommitOutcome::Replayed(prior.into()));
        }

        let row = match key {
            None => sqlx::query_as::<_, EntityRow>(
                r#"
                INSERT INTO users (handle, address)
                VALUES ($1, $2)
                RETURNING id, handle, address, revision, committed_at
                "#,
            )
            .bind(&payload.handle)
            .bind(&payload.address)
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?,
            Some(id) => sqlx::query_as::<_, EntityRow>(
                r#"
                UPDATE users
                SET handle = $1, address = $2, revision = revision + 1, committed_at = now()
                WHERE id = $3
                RETURNING id, handle, address, revision, committed_at
                "#,
            )
            .bind(&payload.handle)
            .bind(&payload.address)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or(CommitError::NotFound(id))?,
        };

        sqlx::query(
            r#"
            INSERT INTO idempotency_records (token, entity_id, revision, handle, address, committed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.as_str())
        .bind(row.id)
        .bind(row.revision)
        .bind(&row.handle)
        .bind(&row.address)
        .bind(row.committed_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;

        debug!(entity_id = row.id, revision = row.revision, "Committed");
        Ok(CommitOutcome::Committed(row.into()))
    }

    async fn get(&self, id: EntityId) -> Result<Option<Entity>, CommitError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT id, handle, address, revision, committed_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(Entity::from))
    }
}

/// Constraint and data errors (SQLSTATE classes 22, 23) are the caller's fault.
/// Everything else means the store could not do its job.
fn classify(err: sqlx::Error) -> CommitError {
    if let sqlx::Error::Database(db) = &err {
        if db
            .code()
            .is_some_and(|code| code.starts_with("22") || code.starts_with("23"))
        {
            return CommitError::Invalid(db.message().to_string());
        }
    }
    warn!(error = %err, "Primary store error");
    CommitError::Unavailable(err.to_string())
}
