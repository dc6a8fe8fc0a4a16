//! Durable session store on PostgreSQL.
//!
//! The `session_records` table is created on the first successful
//! [`SessionStore::connect`], so the store can be constructed before the
//! database is reachable.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bastion_core::Clock;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{
    error::Result,
    store::{validate_key, SessionStore},
};

/// PostgreSQL implementation of [`SessionStore`].
#[derive(Debug, Clone)]
pub struct PostgresSessionStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresSessionStore {
    /// Creates a store over `pool`. Nothing is contacted until `connect`.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock, schema_ready: Arc::new(OnceCell::new()) }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl?).ok()?;
        self.clock.now_utc().checked_add_signed(ttl)
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r"
                    CREATE TABLE IF NOT EXISTS session_records (
                        key TEXT PRIMARY KEY,
                        value JSONB NOT NULL,
                        expires_at TIMESTAMPTZ,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                    )
                    ",
                )
                .execute(&self.pool)
                .await?;
                debug!("session_records table ready");
                Ok::<(), crate::StoreError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn connect(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        self.ensure_schema().await
    }

    async fn save(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        sqlx::query(
            r"
            INSERT INTO session_records (key, value, expires_at, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(key)
        .bind(value)
        .bind(self.expiry(ttl))
        .bind(self.clock.now_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let value = sqlx::query_scalar(
            r"
            SELECT value FROM session_records
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)
            ",
        )
        .bind(key)
        .bind(self.clock.now_utc())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: Option<bool> = sqlx::query_scalar(
            r"
            DELETE FROM session_records WHERE key = $1
            RETURNING (expires_at IS NULL OR expires_at > $2)
            ",
        )
        .bind(key)
        .bind(self.clock.now_utc())
        .fetch_optional(&self.pool)
        .await?;
        Ok(removed.unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM session_records
                WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)
            )
            ",
        )
        .bind(key)
        .bind(self.clock.now_utc())
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn cleanup(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session_records WHERE expires_at <= $1")
            .bind(self.clock.now_utc())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar(
            r"
            SELECT key FROM session_records
            WHERE starts_with(key, $1) AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY key
            ",
        )
        .bind(prefix)
        .bind(self.clock.now_utc())
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }
}
