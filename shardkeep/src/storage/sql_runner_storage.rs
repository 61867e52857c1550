use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::error::Error;
use super::runner_storage::{RunnerRecord, RunnerStorage, LOCK_EXPIRATION_MS};
use crate::model::{Runner, RunnerAddress, ShardId};

/// `RunnerStorage` backed by Postgres: one row per live runner, one row per
/// held shard lock.
pub struct SqlRunnerStorage {
    pool: PgPool,
    runners: String,
    locks: String,
    assignments: String,
}

impl SqlRunnerStorage {
    pub async fn connect(database_url: &str, pool_size: u32, table_prefix: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await?;
        let storage = Self::from_pool(pool, table_prefix);
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool, table_prefix: &str) -> Self {
        Self {
            pool,
            runners: format!("{table_prefix}_runners"),
            locks: format!("{table_prefix}_locks"),
            assignments: format!("{table_prefix}_assignments"),
        }
    }

    async fn ensure_schema(&self) -> Result<(), Error> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {runners} (
                machine_id BIGINT PRIMARY KEY,
                address TEXT UNIQUE NOT NULL,
                runner TEXT NOT NULL,
                healthy BOOLEAN NOT NULL DEFAULT TRUE,
                last_heartbeat BIGINT NOT NULL
            );
            CREATE SEQUENCE IF NOT EXISTS {runners}_machine_id_seq;
            CREATE TABLE IF NOT EXISTS {locks} (
                shard_group TEXT NOT NULL,
                shard_id INT NOT NULL,
                address TEXT NOT NULL,
                acquired_at BIGINT NOT NULL,
                PRIMARY KEY (shard_group, shard_id)
            );
            CREATE TABLE IF NOT EXISTS {assignments} (
                shard_group TEXT NOT NULL,
                shard_id INT NOT NULL,
                address TEXT,
                PRIMARY KEY (shard_group, shard_id)
            );",
            runners = self.runners,
            locks = self.locks,
            assignments = self.assignments,
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RunnerStorage for SqlRunnerStorage {
    async fn register(&self, runner: Runner, now_ms: i64) -> Result<u64, Error> {
        let addr_text = runner.address.to_string();
        let runner_json = serde_json::to_string(&runner)
            .map_err(|e| Error::Malformed(format!("runner encode failed: {e}")))?;

        if let Some(row) = sqlx::query(&format!(
            "SELECT machine_id FROM {runners} WHERE address = $1",
            runners = self.runners
        ))
        .bind(&addr_text)
        .fetch_optional(&self.pool)
        .await?
        {
            let machine_id: i64 = row.try_get("machine_id")?;
            sqlx::query(&format!(
                "UPDATE {runners} SET runner = $1 WHERE address = $2",
                runners = self.runners
            ))
            .bind(&runner_json)
            .bind(&addr_text)
            .execute(&self.pool)
            .await?;
            return Ok(machine_id as u64);
        }

        let machine_id: i64 = sqlx::query(&format!(
            "SELECT nextval('{runners}_machine_id_seq')",
            runners = self.runners
        ))
        .fetch_one(&self.pool)
        .await?
        .try_get(0)?;

        sqlx::query(&format!(
            "INSERT INTO {runners} (machine_id, address, runner, healthy, last_heartbeat)
             VALUES ($1, $2, $3, TRUE, $4)
             ON CONFLICT (address) DO NOTHING",
            runners = self.runners
        ))
        .bind(machine_id)
        .bind(&addr_text)
        .bind(&runner_json)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(machine_id as u64)
    }

    async fn mark_heartbeat(&self, address: &RunnerAddress, now_ms: i64) -> Result<(), Error> {
        sqlx::query(&format!(
            "UPDATE {runners} SET last_heartbeat = $1 WHERE address = $2",
            runners = self.runners
        ))
        .bind(now_ms)
        .bind(address.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_healthy(&self, address: &RunnerAddress, healthy: bool) -> Result<(), Error> {
        sqlx::query(&format!(
            "UPDATE {runners} SET healthy = $1 WHERE address = $2",
            runners = self.runners
        ))
        .bind(healthy)
        .bind(address.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, address: &RunnerAddress) -> Result<(), Error> {
        sqlx::query(&format!(
            "DELETE FROM {runners} WHERE address = $1",
            runners = self.runners
        ))
        .bind(address.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<RunnerRecord>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT machine_id, address, runner, healthy, last_heartbeat FROM {runners}",
            runners = self.runners
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let address_text: String = row.try_get("address")?;
                let address = address_text
                    .parse()
                    .map_err(|_| Error::Malformed(format!("bad stored address: {address_text}")))?;
                let runner_text: String = row.try_get("runner")?;
                let runner: Runner = serde_json::from_str(&runner_text)
                    .map_err(|e| Error::Malformed(format!("bad stored runner: {e}")))?;
                Ok(RunnerRecord {
                    machine_id: row.try_get::<i64, _>("machine_id")? as u64,
                    address,
                    groups: runner.groups,
                    weight: runner.weight,
                    healthy: row.try_get("healthy")?,
                    last_heartbeat_ms: row.try_get("last_heartbeat")?,
                })
            })
            .collect()
    }

    async fn acquire_lock(
        &self,
        shard_id: &ShardId,
        address: &RunnerAddress,
        now_ms: i64,
    ) -> Result<bool, Error> {
        let addr_text = address.to_string();
        let result = sqlx::query(&format!(
            "INSERT INTO {locks} (shard_group, shard_id, address, acquired_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (shard_group, shard_id) DO UPDATE
                SET address = excluded.address, acquired_at = excluded.acquired_at
                WHERE {locks}.address = excluded.address
                   OR $4 - {locks}.acquired_at > $5",
            locks = self.locks
        ))
        .bind(&shard_id.group)
        .bind(shard_id.id as i32)
        .bind(&addr_text)
        .bind(now_ms)
        .bind(LOCK_EXPIRATION_MS)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, shard_id: &ShardId, address: &RunnerAddress) -> Result<(), Error> {
        sqlx::query(&format!(
            "DELETE FROM {locks} WHERE shard_group = $1 AND shard_id = $2 AND address = $3",
            locks = self.locks
        ))
        .bind(&shard_id.group)
        .bind(shard_id.id as i32)
        .bind(address.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lock_owner(&self, shard_id: &ShardId) -> Result<Option<RunnerAddress>, Error> {
        let row = sqlx::query(&format!(
            "SELECT address FROM {locks} WHERE shard_group = $1 AND shard_id = $2",
            locks = self.locks
        ))
        .bind(&shard_id.group)
        .bind(shard_id.id as i32)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let address_text: String = row.try_get("address")?;
        Ok(Some(address_text.parse().map_err(|_| {
            Error::Malformed(format!("bad stored address: {address_text}"))
        })?))
    }

    async fn save_assignments(&self, assignments: &HashMap<ShardId, Option<RunnerAddress>>) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for (shard_id, owner) in assignments {
            sqlx::query(&format!(
                "INSERT INTO {assignments} (shard_group, shard_id, address)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (shard_group, shard_id) DO UPDATE
                    SET address = excluded.address",
                assignments = self.assignments
            ))
            .bind(&shard_id.group)
            .bind(shard_id.id as i32)
            .bind(owner.map(|a| a.to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_assignments(&self) -> Result<HashMap<ShardId, Option<RunnerAddress>>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT shard_group, shard_id, address FROM {assignments}",
            assignments = self.assignments
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let group: String = row.try_get("shard_group")?;
            let id: i32 = row.try_get("shard_id")?;
            let address_text: Option<String> = row.try_get("address")?;
            let address = address_text
                .map(|text| {
                    text.parse()
                        .map_err(|_| Error::Malformed(format!("bad stored address: {text}")))
                })
                .transpose()?;
            out.insert(ShardId::new(&group, id as u32), address);
        }
        Ok(out)
    }
}
