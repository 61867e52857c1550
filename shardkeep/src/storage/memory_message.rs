use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::error::Error;
use super::message::{MessageStorage, UnprocessedMessage};
use crate::model::{Envelope, EntityAddress, PrimaryKey, Reply, SaveResult, ShardId};

/// In-memory `MessageStorage`, backed by `dashmap` for lock-striped
/// concurrent access. Intended for tests and single-process deployments; no
/// data survives a restart.
#[derive(Default)]
pub struct MemoryMessageStorage {
    requests: DashMap<i64, Envelope>,
    primary_keys: DashMap<PrimaryKey, i64>,
    interrupts: DashMap<i64, Vec<Envelope>>,
    acks: DashMap<i64, Envelope>,
    replies: DashMap<i64, Vec<Reply>>,
    exited: DashSet<i64>,
}

impl MemoryMessageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn last_reply(&self, request_id: i64) -> Option<Reply> {
        self.replies.get(&request_id).and_then(|v| v.last().cloned())
    }

    /// The sequence number acked for `request_id`, resolved from the
    /// AckChunk's `replyId` against the stored replies.
    fn acked_sequence(&self, request_id: i64) -> Option<u64> {
        let ack = self.acks.get(&request_id)?;
        let reply_id = match ack.value() {
            Envelope::AckChunk { reply_id, .. } => *reply_id,
            _ => return None,
        };
        self.replies
            .get(&request_id)?
            .iter()
            .find(|r| matches!(r, Reply::Chunk { id, .. } if *id == reply_id))
            .and_then(|r| r.sequence())
    }
}

#[async_trait]
impl MessageStorage for MemoryMessageStorage {
    async fn save_request(&self, envelope: Envelope) -> Result<SaveResult, Error> {
        let request_id = envelope.request_id();
        let pk = envelope
            .primary_key()
            .ok_or_else(|| Error::Malformed("request payload missing `key`".into()))?;

        match self.primary_keys.entry(pk) {
            Entry::Occupied(existing) => {
                let original_id = *existing.get();
                Ok(SaveResult::Duplicate {
                    original_id,
                    last_reply: self.last_reply(original_id),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(request_id);
                self.requests.insert(request_id, envelope);
                Ok(SaveResult::Success)
            }
        }
    }

    async fn save_envelope(&self, envelope: Envelope) -> Result<(), Error> {
        match &envelope {
            Envelope::AckChunk { request_id, .. } => {
                self.acks
                    .entry(*request_id)
                    .and_modify(|current| {
                        let current_seq = match current {
                            Envelope::AckChunk { reply_id, .. } => *reply_id,
                            _ => 0,
                        };
                        let new_seq = match &envelope {
                            Envelope::AckChunk { reply_id, .. } => *reply_id,
                            _ => 0,
                        };
                        if new_seq > current_seq {
                            *current = envelope.clone();
                        }
                    })
                    .or_insert(envelope);
                Ok(())
            }
            Envelope::Interrupt { request_id, .. } => {
                self.interrupts.entry(*request_id).or_default().push(envelope);
                Ok(())
            }
            Envelope::Request { .. } => Err(Error::Malformed(
                "save_envelope called with a Request envelope".into(),
            )),
        }
    }

    async fn save_reply(&self, reply: Reply) -> Result<(), Error> {
        let request_id = reply.request_id();
        if self.exited.contains(&request_id) {
            return Ok(());
        }
        if reply.is_exit() {
            self.exited.insert(request_id);
        }
        self.replies.entry(request_id).or_default().push(reply);
        Ok(())
    }

    async fn replies_for(&self, request_ids: &[i64]) -> Result<HashMap<i64, Vec<Reply>>, Error> {
        let mut out = HashMap::with_capacity(request_ids.len());
        for &id in request_ids {
            let Some(all) = self.replies.get(&id) else {
                continue;
            };
            let floor = self.acked_sequence(id);
            let filtered: Vec<Reply> = all
                .iter()
                .filter(|r| match r {
                    Reply::Chunk { sequence, .. } => floor.map_or(true, |floor| *sequence > floor),
                    Reply::WithExit { .. } => true,
                })
                .cloned()
                .collect();
            if !filtered.is_empty() {
                out.insert(id, filtered);
            }
        }
        Ok(out)
    }

    async fn unprocessed_messages(
        &self,
        shard_ids: &[ShardId],
        now_ms: i64,
    ) -> Result<Vec<UnprocessedMessage>, Error> {
        let shards: HashSet<&ShardId> = shard_ids.iter().collect();
        let mut out = Vec::new();

        for entry in self.requests.iter() {
            let request_id = *entry.key();
            let request = entry.value();

            if !shards.contains(&request.address().shard_id) {
                continue;
            }
            if self.exited.contains(&request_id) {
                continue;
            }
            if let Envelope::Request {
                deliver_at: Some(at),
                ..
            } = request
            {
                if *at > now_ms {
                    continue;
                }
            }

            out.push(UnprocessedMessage {
                request: request.clone(),
                interrupts: self
                    .interrupts
                    .get(&request_id)
                    .map(|v| v.clone())
                    .unwrap_or_default(),
                last_ack: self.acks.get(&request_id).map(|v| v.clone()),
            });
        }

        Ok(out)
    }

    async fn clear_address(&self, address: &EntityAddress) -> Result<(), Error> {
        let ids: Vec<i64> = self
            .requests
            .iter()
            .filter(|e| e.value().address() == address)
            .map(|e| *e.key())
            .collect();
        self.drop_requests(&ids);
        Ok(())
    }

    async fn reset_shards(&self, shard_ids: &[ShardId]) -> Result<(), Error> {
        let shards: HashSet<&ShardId> = shard_ids.iter().collect();
        let ids: Vec<i64> = self
            .requests
            .iter()
            .filter(|e| shards.contains(&e.value().address().shard_id))
            .map(|e| *e.key())
            .collect();
        self.drop_requests(&ids);
        Ok(())
    }
}

impl MemoryMessageStorage {
    fn drop_requests(&self, ids: &[i64]) {
        for id in ids {
            if let Some((_, envelope)) = self.requests.remove(id) {
                if let Some(pk) = envelope.primary_key() {
                    self.primary_keys.remove(&pk);
                }
            }
            self.interrupts.remove(id);
            self.acks.remove(id);
            self.replies.remove(id);
            self.exited.remove(id);
        }
    }
}
