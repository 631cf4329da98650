//! Postgres reservation store
//!
//! Issues the protocol queries against the schema created by the embedded
//! migrations. The pool is owned by the embedder and shared with
//! [`crate::bus::PgBus`].

use super::{OwnReservation, Reservation, ShardStore};
use crate::common::Result;
use crate::migrate::{Migration, MigrationTarget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::time::Duration;

const UPSERT_CLUSTER: &str = r#"
INSERT INTO "ShardReservationCluster" ("cluster")
  VALUES ($1)
  ON CONFLICT ("cluster") DO NOTHING"#;

const REGISTER: &str = r#"
INSERT INTO "ShardReservation" ("cluster", "holder", "expiresAt")
  VALUES ($1, $2, CURRENT_TIMESTAMP + make_interval(secs => $3))
  ON CONFLICT ("holder") DO UPDATE
    SET "expiresAt" = CURRENT_TIMESTAMP + make_interval(secs => $3),
      "shard" = CASE
        WHEN "ShardReservation"."expiresAt" <= CURRENT_TIMESTAMP THEN NULL
        ELSE "ShardReservation"."shard"
      END"#;

const IS_COORDINATOR: &str = r#"
SELECT $1 = (
  SELECT "holder" FROM "ShardReservation"
    WHERE "cluster" = $2
      AND "expiresAt" > CURRENT_TIMESTAMP
    ORDER BY "shard" NULLS LAST, "holder"
    LIMIT 1
  ) AS "isCoordinator""#;

const RESHARD: &str = r#"
SELECT "reshard_ShardReservations"($1, make_interval(secs => $2))
  AT TIME ZONE current_setting('TimeZone') AS "reshardAt""#;

const SELECT_OWN: &str = r#"
SELECT
  "shard",
  (
    SELECT COUNT(*)::int
    FROM "ShardReservation"
    WHERE "cluster" = $1
      AND "shard" IS NOT NULL
      AND "expiresAt" > CURRENT_TIMESTAMP
  ) AS "numShards"
FROM "ShardReservation"
WHERE "cluster" = $1
  AND "holder" = $2"#;

const UNREGISTER: &str = r#"
DELETE FROM "ShardReservation"
  WHERE "cluster" = $1 AND "holder" = $2"#;

const RESET_CLUSTER: &str = r#"
UPDATE "ShardReservationCluster" c
  SET "reshardedAt" = NULL
  WHERE c."cluster" = $1
  AND NOT EXISTS (SELECT FROM "ShardReservation" r WHERE r."cluster" = c."cluster")"#;

const SELECT_ALL: &str = r#"
SELECT "cluster", "holder", "shard",
    "expiresAt" AT TIME ZONE current_setting('TimeZone') AS "expiresAt"
  FROM "ShardReservation"
  WHERE "cluster" = $1
  ORDER BY "shard" NULLS LAST, "holder""#;

const CREATE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS "ShardRegistrarMigrations" (
  "name" VARCHAR(255) PRIMARY KEY
)"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool for `url`; callers usually share it with a [`crate::bus::PgBus`]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ShardStore for PgStore {
    async fn upsert_cluster(&self, cluster: &str) -> Result<()> {
        sqlx::query(UPSERT_CLUSTER)
            .bind(cluster)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register(&self, cluster: &str, holder: &str, lease: Duration) -> Result<()> {
        sqlx::query(REGISTER)
            .bind(cluster)
            .bind(holder)
            .bind(lease.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_coordinator(&self, cluster: &str, holder: &str) -> Result<bool> {
        let is_coordinator: Option<bool> = sqlx::query_scalar(IS_COORDINATOR)
            .bind(holder)
            .bind(cluster)
            .fetch_one(&self.pool)
            .await?;
        Ok(is_coordinator.unwrap_or(false))
    }

    async fn reshard(
        &self,
        cluster: &str,
        min_interval: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let reshard_at: Option<DateTime<Utc>> = sqlx::query_scalar(RESHARD)
            .bind(cluster)
            .bind(min_interval.as_secs_f64())
            .fetch_one(&self.pool)
            .await?;
        Ok(reshard_at)
    }

    async fn own_reservation(
        &self,
        cluster: &str,
        holder: &str,
    ) -> Result<Option<OwnReservation>> {
        let row: Option<(Option<i32>, i32)> = sqlx::query_as(SELECT_OWN)
            .bind(cluster)
            .bind(holder)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(shard, num_shards)| OwnReservation { shard, num_shards }))
    }

    async fn unregister(&self, cluster: &str, holder: &str) -> Result<()> {
        sqlx::query(UNREGISTER)
            .bind(cluster)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        sqlx::query(RESET_CLUSTER)
            .bind(cluster)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reservations(&self, cluster: &str) -> Result<Vec<Reservation>> {
        let rows: Vec<(String, String, Option<i32>, DateTime<Utc>)> = sqlx::query_as(SELECT_ALL)
            .bind(cluster)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(cluster, holder, shard, expires_at)| Reservation {
                cluster,
                holder,
                shard,
                expires_at,
            })
            .collect())
    }
}

#[async_trait]
impl MigrationTarget for PgStore {
    async fn ensure_ledger(&self) -> Result<()> {
        sqlx::query(CREATE_LEDGER).execute(&self.pool).await?;
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar(r#"SELECT "name" FROM "ShardRegistrarMigrations" ORDER BY "name""#)
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    async fn apply(&self, migration: &Migration) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        (&mut *tx).execute(migration.up.as_str()).await?;
        sqlx::query(r#"INSERT INTO "ShardRegistrarMigrations" ("name") VALUES ($1)"#)
            .bind(&migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revert(&self, migration: &Migration) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        (&mut *tx).execute(migration.down.as_str()).await?;
        sqlx::query(r#"DELETE FROM "ShardRegistrarMigrations" WHERE "name" = $1"#)
            .bind(&migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
