use std::collections::HashMap;

use async_trait::async_trait;

use super::error::Error;
use crate::model::{Envelope, EntityAddress, Reply, SaveResult, ShardId};

/// Everything `unprocessedMessages` hands back for one outstanding request:
/// the request itself, any interrupts filed against it, and the most recent
/// ack the caller has sent (used to resume a streaming reply cheaply).
#[derive(Debug, Clone, PartialEq)]
pub struct UnprocessedMessage {
    pub request: Envelope,
    pub interrupts: Vec<Envelope>,
    pub last_ack: Option<Envelope>,
}

/// Durable, idempotent request/reply log. One instance is shared by every
/// entity hosted on a runner; implementations must be safe under concurrent
/// `save_request` calls racing on the same primary key.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Persist a `Request` envelope. Returns `Success` the first time a
    /// primary key is seen; `Duplicate` (with the original request id and
    /// its most recent reply, if any) on every subsequent attempt.
    async fn save_request(&self, envelope: Envelope) -> Result<SaveResult, Error>;

    /// Persist an `AckChunk` or `Interrupt` envelope. Idempotent on
    /// `(id, requestId)`.
    async fn save_envelope(&self, envelope: Envelope) -> Result<(), Error>;

    /// Append a reply. A no-op if the request already has a `WithExit`
    /// reply recorded.
    async fn save_reply(&self, reply: Reply) -> Result<(), Error>;

    /// For each request id, the replies the caller hasn't acked yet (or all
    /// of them, if no ack was ever recorded), always including `WithExit`
    /// if present.
    async fn replies_for(&self, request_ids: &[i64]) -> Result<HashMap<i64, Vec<Reply>>, Error>;

    /// Requests assigned to one of `shard_ids` that are due (`deliverAt <=
    /// now_ms`) and have no terminal reply yet, bundled with their
    /// interrupts and latest ack.
    async fn unprocessed_messages(
        &self,
        shard_ids: &[ShardId],
        now_ms: i64,
    ) -> Result<Vec<UnprocessedMessage>, Error>;

    /// Drop all stored state for one entity address. Used when an entity is
    /// permanently removed.
    async fn clear_address(&self, address: &EntityAddress) -> Result<(), Error>;

    /// Drop all stored state for the given shards. Used on shard reset.
    async fn reset_shards(&self, shard_ids: &[ShardId]) -> Result<(), Error>;
}
