use std::collections::HashMap;

use async_trait::async_trait;

use super::error::Error;
use crate::model::{Runner, RunnerAddress, ShardId};

/// Liveness-table row: everything the shard manager knows about one runner.
/// Carries `groups`/`weight` alongside the liveness fields so a restart can
/// reconstruct the full `Runner` a process announced, not just its address.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerRecord {
    pub machine_id: u64,
    pub address: RunnerAddress,
    pub groups: Vec<String>,
    pub weight: u32,
    pub healthy: bool,
    pub last_heartbeat_ms: i64,
}

impl RunnerRecord {
    pub fn runner(&self) -> Runner {
        Runner::new(self.address, self.groups.clone(), self.weight)
    }
}

/// The shard lock TTL past which a stale lease may be stolen by another
/// runner (§5 "Shared-resource policy").
pub const LOCK_EXPIRATION_MS: i64 = 5_000;

/// Liveness table plus shard-lock lease table, plus the durable copy of the
/// shard manager's assignment map. Bundled together because all three are
/// small, frequently-touched, fencing-sensitive tables that every runner and
/// the shard manager share.
#[async_trait]
pub trait RunnerStorage: Send + Sync {
    /// Insert or update a runner's liveness row, returning its machine id.
    /// Idempotent by address: re-registering an already-known address
    /// returns the same machine id rather than minting a new one, though its
    /// `groups`/`weight` are refreshed to the latest announcement.
    async fn register(&self, runner: Runner, now_ms: i64) -> Result<u64, Error>;

    async fn mark_heartbeat(&self, address: &RunnerAddress, now_ms: i64) -> Result<(), Error>;

    async fn set_healthy(&self, address: &RunnerAddress, healthy: bool) -> Result<(), Error>;

    async fn remove(&self, address: &RunnerAddress) -> Result<(), Error>;

    /// All runners, without any staleness filtering — staleness is a
    /// shard-manager policy decision (`runnerHealthCheckInterval`), not a
    /// storage-layer one.
    async fn all(&self) -> Result<Vec<RunnerRecord>, Error>;

    /// Attempt to acquire or renew the lease on `shard_id` for `address`.
    /// Succeeds if the shard has no lease, the lease is already held by
    /// `address`, or the existing lease is older than
    /// [`LOCK_EXPIRATION_MS`].
    async fn acquire_lock(
        &self,
        shard_id: &ShardId,
        address: &RunnerAddress,
        now_ms: i64,
    ) -> Result<bool, Error>;

    async fn release_lock(&self, shard_id: &ShardId, address: &RunnerAddress) -> Result<(), Error>;

    async fn lock_owner(&self, shard_id: &ShardId) -> Result<Option<RunnerAddress>, Error>;

    /// Persist the full current assignment map, overwriting whatever was
    /// stored before. Called by the shard manager after every rebalance
    /// cycle so a restart can recover ownership instead of starting blank.
    async fn save_assignments(&self, assignments: &HashMap<ShardId, Option<RunnerAddress>>) -> Result<(), Error>;

    /// The last persisted assignment map, empty if none was ever saved.
    async fn load_assignments(&self) -> Result<HashMap<ShardId, Option<RunnerAddress>>, Error>;
}
