use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use tracing::warn;

use super::error::Error;
use super::message::{MessageStorage, UnprocessedMessage};
use crate::model::{Envelope, EntityAddress, Exit, Reply, SaveResult, ShardId};

/// `MessageStorage` backed by Postgres. Table names are built from a
/// configurable prefix, so schema setup runs ad-hoc `CREATE TABLE IF NOT
/// EXISTS` statements at connect time rather than `sqlx::migrate!`'s
/// compile-time-embedded migrations, which can't see a runtime prefix.
pub struct SqlMessageStorage {
    pool: PgPool,
    requests: String,
    replies: String,
    acks: String,
    interrupts: String,
}

impl SqlMessageStorage {
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
            requests: format!("{table_prefix}_requests"),
            replies: format!("{table_prefix}_replies"),
            acks: format!("{table_prefix}_acks"),
            interrupts: format!("{table_prefix}_interrupts"),
        }
    }

    async fn ensure_schema(&self) -> Result<(), Error> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {requests} (
                request_id BIGINT PRIMARY KEY,
                primary_key TEXT NOT NULL UNIQUE,
                envelope JSONB NOT NULL,
                shard_group TEXT NOT NULL,
                shard_id INT NOT NULL,
                deliver_at BIGINT,
                exited BOOLEAN NOT NULL DEFAULT FALSE
            );
            CREATE INDEX IF NOT EXISTS {requests}_shard_deliver_idx
                ON {requests} (shard_group, shard_id, deliver_at);
            CREATE TABLE IF NOT EXISTS {replies} (
                request_id BIGINT NOT NULL,
                reply_id BIGINT NOT NULL,
                sequence BIGINT,
                reply JSONB NOT NULL,
                PRIMARY KEY (request_id, reply_id)
            );
            CREATE INDEX IF NOT EXISTS {replies}_seq_idx ON {replies} (request_id, sequence);
            CREATE TABLE IF NOT EXISTS {acks} (
                request_id BIGINT PRIMARY KEY,
                reply_id BIGINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {interrupts} (
                request_id BIGINT NOT NULL,
                id BIGINT NOT NULL,
                envelope JSONB NOT NULL,
                PRIMARY KEY (request_id, id)
            );",
            requests = self.requests,
            replies = self.replies,
            acks = self.acks,
            interrupts = self.interrupts,
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn last_reply(&self, request_id: i64) -> Result<Option<Reply>, Error> {
        let row = sqlx::query(&format!(
            "SELECT reply FROM {replies} WHERE request_id = $1 ORDER BY reply_id DESC LIMIT 1",
            replies = self.replies
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let value: serde_json::Value = row.try_get("reply")?;
        match serde_json::from_value::<Reply>(value) {
            Ok(reply) => Ok(Some(reply)),
            Err(err) => {
                warn!(request_id, "stored reply decode failed, treating as no reply yet: {err}");
                Ok(None)
            }
        }
    }

    async fn acked_sequence(&self, request_id: i64) -> Result<Option<i64>, Error> {
        let row = sqlx::query(&format!(
            "SELECT r.sequence FROM {acks} a JOIN {replies} r
                ON r.request_id = a.request_id AND r.reply_id = a.reply_id
             WHERE a.request_id = $1",
            acks = self.acks,
            replies = self.replies
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.try_get::<Option<i64>, _>("sequence").ok().flatten()))
    }

    async fn interrupts_for(&self, request_id: i64) -> Result<Vec<Envelope>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT envelope FROM {interrupts} WHERE request_id = $1 ORDER BY id",
            interrupts = self.interrupts
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.try_get("envelope")?;
            match serde_json::from_value::<Envelope>(value) {
                Ok(envelope) => out.push(envelope),
                Err(err) => warn!(request_id, "stored interrupt decode failed, skipping row: {err}"),
            }
        }
        Ok(out)
    }

    async fn last_ack(&self, request_id: i64) -> Result<Option<Envelope>, Error> {
        let row = sqlx::query(&format!(
            "SELECT reply_id FROM {acks} WHERE request_id = $1",
            acks = self.acks
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let reply_id: i64 = row.try_get("reply_id")?;

        let address_row = sqlx::query(&format!(
            "SELECT envelope FROM {requests} WHERE request_id = $1",
            requests = self.requests
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(address_row) = address_row else {
            return Ok(None);
        };
        let value: serde_json::Value = address_row.try_get("envelope")?;
        let request: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::Malformed(format!("stored request decode failed: {e}")))?;

        Ok(Some(Envelope::AckChunk {
            id: reply_id,
            address: request.address().clone(),
            request_id,
            reply_id,
        }))
    }
}

#[async_trait]
impl MessageStorage for SqlMessageStorage {
    async fn save_request(&self, envelope: Envelope) -> Result<SaveResult, Error> {
        let request_id = envelope.request_id();
        let pk = envelope
            .primary_key()
            .ok_or_else(|| Error::Malformed("request payload missing `key`".into()))?;
        let pk_text = serde_json::to_string(&pk)
            .map_err(|e| Error::Malformed(format!("primary key encode failed: {e}")))?;
        let envelope_json = serde_json::to_value(&envelope)
            .map_err(|e| Error::Malformed(format!("envelope encode failed: {e}")))?;
        let shard = envelope.address().shard_id.clone();
        let deliver_at = match &envelope {
            Envelope::Request { deliver_at, .. } => *deliver_at,
            _ => None,
        };

        let result = sqlx::query(&format!(
            "INSERT INTO {requests} (request_id, primary_key, envelope, shard_group, shard_id, deliver_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (primary_key) DO NOTHING",
            requests = self.requests
        ))
        .bind(request_id)
        .bind(&pk_text)
        .bind(&envelope_json)
        .bind(&shard.group)
        .bind(shard.id as i32)
        .bind(deliver_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(SaveResult::Success);
        }

        let row = sqlx::query(&format!(
            "SELECT request_id FROM {requests} WHERE primary_key = $1",
            requests = self.requests
        ))
        .bind(&pk_text)
        .fetch_one(&self.pool)
        .await?;
        let original_id: i64 = row.try_get("request_id")?;

        Ok(SaveResult::Duplicate {
            original_id,
            last_reply: self.last_reply(original_id).await?,
        })
    }

    async fn save_envelope(&self, envelope: Envelope) -> Result<(), Error> {
        match &envelope {
            Envelope::AckChunk {
                request_id,
                reply_id,
                ..
            } => {
                sqlx::query(&format!(
                    "INSERT INTO {acks} (request_id, reply_id) VALUES ($1, $2)
                     ON CONFLICT (request_id) DO UPDATE SET reply_id = GREATEST({acks}.reply_id, excluded.reply_id)",
                    acks = self.acks
                ))
                .bind(request_id)
                .bind(reply_id)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            Envelope::Interrupt { request_id, id, .. } => {
                let value = serde_json::to_value(&envelope)
                    .map_err(|e| Error::Malformed(format!("interrupt encode failed: {e}")))?;
                sqlx::query(&format!(
                    "INSERT INTO {interrupts} (request_id, id, envelope) VALUES ($1, $2, $3)
                     ON CONFLICT (request_id, id) DO NOTHING",
                    interrupts = self.interrupts
                ))
                .bind(request_id)
                .bind(id)
                .bind(&value)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            Envelope::Request { .. } => Err(Error::Malformed(
                "save_envelope called with a Request envelope".into(),
            )),
        }
    }

    async fn save_reply(&self, reply: Reply) -> Result<(), Error> {
        let request_id = reply.request_id();

        let exited: Option<bool> = sqlx::query(&format!(
            "SELECT exited FROM {requests} WHERE request_id = $1",
            requests = self.requests
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get("exited"))
        .transpose()?;

        if exited == Some(true) {
            return Ok(());
        }

        let reply_id = match &reply {
            Reply::Chunk { id, .. } => *id,
            Reply::WithExit { id, .. } => *id,
        };
        let sequence = reply.sequence().map(|s| s as i64);
        let value = serde_json::to_value(&reply)
            .map_err(|e| Error::Malformed(format!("reply encode failed: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO {replies} (request_id, reply_id, sequence, reply) VALUES ($1, $2, $3, $4)
             ON CONFLICT (request_id, reply_id) DO NOTHING",
            replies = self.replies
        ))
        .bind(request_id)
        .bind(reply_id)
        .bind(sequence)
        .bind(&value)
        .execute(&self.pool)
        .await?;

        if reply.is_exit() {
            sqlx::query(&format!(
                "UPDATE {requests} SET exited = TRUE WHERE request_id = $1",
                requests = self.requests
            ))
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn replies_for(&self, request_ids: &[i64]) -> Result<HashMap<i64, Vec<Reply>>, Error> {
        let mut out = HashMap::with_capacity(request_ids.len());
        for &id in request_ids {
            let floor = self.acked_sequence(id).await?;
            let rows = sqlx::query(&format!(
                "SELECT reply, sequence FROM {replies}
                 WHERE request_id = $1 AND (sequence IS NULL OR sequence > $2)
                 ORDER BY reply_id",
                replies = self.replies
            ))
            .bind(id)
            .bind(floor.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

            let mut replies = Vec::with_capacity(rows.len());
            for row in rows {
                let value: serde_json::Value = row.try_get("reply")?;
                match serde_json::from_value::<Reply>(value) {
                    Ok(reply) => replies.push(reply),
                    Err(err) => warn!(request_id = id, "stored reply decode failed, skipping row: {err}"),
                }
            }
            if !replies.is_empty() {
                out.insert(id, replies);
            }
        }
        Ok(out)
    }

    async fn unprocessed_messages(
        &self,
        shard_ids: &[ShardId],
        now_ms: i64,
    ) -> Result<Vec<UnprocessedMessage>, Error> {
        if shard_ids.is_empty() {
            return Ok(Vec::new());
        }

        let groups: Vec<String> = shard_ids.iter().map(|s| s.group.clone()).collect();
        let ids: Vec<i32> = shard_ids.iter().map(|s| s.id as i32).collect();

        let rows = sqlx::query(&format!(
            "SELECT request_id, envelope FROM {requests}
             WHERE NOT exited
               AND (deliver_at IS NULL OR deliver_at <= $1)
               AND (shard_group, shard_id) IN (SELECT * FROM UNNEST($2::text[], $3::int[]))",
            requests = self.requests
        ))
        .bind(now_ms)
        .bind(&groups)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let request_id: i64 = row.try_get("request_id")?;
            let value: serde_json::Value = row.try_get("envelope")?;
            let request: Envelope = match serde_json::from_value(value) {
                Ok(request) => request,
                Err(err) => {
                    warn!(request_id, "stored request decode failed, excluding from poll: {err}");
                    let reply = Reply::WithExit {
                        id: request_id,
                        request_id,
                        exit: Exit::die(format!("malformed stored request: {err}")),
                    };
                    if let Err(save_err) = self.save_reply(reply).await {
                        warn!(request_id, "failed to persist die reply for malformed request: {save_err}");
                    }
                    continue;
                }
            };

            out.push(UnprocessedMessage {
                request,
                interrupts: self.interrupts_for(request_id).await?,
                last_ack: self.last_ack(request_id).await?,
            });
        }
        Ok(out)
    }

    async fn clear_address(&self, address: &EntityAddress) -> Result<(), Error> {
        let rows = sqlx::query(&format!(
            "SELECT request_id, envelope FROM {requests}
             WHERE shard_group = $1 AND shard_id = $2",
            requests = self.requests
        ))
        .bind(&address.shard_id.group)
        .bind(address.shard_id.id as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut matching = Vec::new();
        for row in rows {
            let request_id: i64 = row.try_get("request_id")?;
            let value: serde_json::Value = row.try_get("envelope")?;
            match serde_json::from_value::<Envelope>(value) {
                Ok(request) if request.address() == address => matching.push(request_id),
                Ok(_) => {}
                Err(err) => warn!(request_id, "stored request decode failed, skipping row: {err}"),
            }
        }

        self.delete_requests(&matching).await
    }

    async fn reset_shards(&self, shard_ids: &[ShardId]) -> Result<(), Error> {
        if shard_ids.is_empty() {
            return Ok(());
        }
        let groups: Vec<String> = shard_ids.iter().map(|s| s.group.clone()).collect();
        let ids: Vec<i32> = shard_ids.iter().map(|s| s.id as i32).collect();

        let rows = sqlx::query(&format!(
            "SELECT request_id FROM {requests}
             WHERE (shard_group, shard_id) IN (SELECT * FROM UNNEST($1::text[], $2::int[]))",
            requests = self.requests
        ))
        .bind(&groups)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let matching: Vec<i64> = rows
            .into_iter()
            .map(|row| row.try_get("request_id"))
            .collect::<Result<_, _>>()?;

        self.delete_requests(&matching).await
    }
}

impl SqlMessageStorage {
    async fn delete_requests(&self, request_ids: &[i64]) -> Result<(), Error> {
        if request_ids.is_empty() {
            return Ok(());
        }
        for table in [&self.requests, &self.replies, &self.acks, &self.interrupts] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE request_id = ANY($1)"
            ))
            .bind(request_ids)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
