use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::Error;
use super::runner_storage::{RunnerRecord, RunnerStorage, LOCK_EXPIRATION_MS};
use crate::model::{Runner, RunnerAddress, ShardId};

#[derive(Debug, Clone, Copy)]
struct Lock {
    address: RunnerAddress,
    acquired_at: i64,
}

/// In-memory `RunnerStorage`. Machine ids are handed out from a simple
/// monotonic counter, matching the spec's "monotonically increasing" rule
/// without needing a sequence table.
pub struct MemoryRunnerStorage {
    runners: DashMap<RunnerAddress, RunnerRecord>,
    locks: DashMap<ShardId, Lock>,
    assignments: std::sync::Mutex<HashMap<ShardId, Option<RunnerAddress>>>,
    next_machine_id: AtomicU64,
}

impl MemoryRunnerStorage {
    pub fn new() -> Self {
        Self {
            runners: DashMap::new(),
            locks: DashMap::new(),
            assignments: std::sync::Mutex::new(HashMap::new()),
            next_machine_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryRunnerStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerStorage for MemoryRunnerStorage {
    async fn register(&self, runner: Runner, now_ms: i64) -> Result<u64, Error> {
        if let Some(mut existing) = self.runners.get_mut(&runner.address) {
            existing.groups = runner.groups;
            existing.weight = runner.weight;
            return Ok(existing.machine_id);
        }
        let machine_id = self.next_machine_id.fetch_add(1, Ordering::SeqCst);
        self.runners.insert(
            runner.address,
            RunnerRecord {
                machine_id,
                address: runner.address,
                groups: runner.groups,
                weight: runner.weight,
                healthy: true,
                last_heartbeat_ms: now_ms,
            },
        );
        Ok(machine_id)
    }

    async fn mark_heartbeat(&self, address: &RunnerAddress, now_ms: i64) -> Result<(), Error> {
        if let Some(mut record) = self.runners.get_mut(address) {
            record.last_heartbeat_ms = now_ms;
        }
        Ok(())
    }

    async fn set_healthy(&self, address: &RunnerAddress, healthy: bool) -> Result<(), Error> {
        if let Some(mut record) = self.runners.get_mut(address) {
            record.healthy = healthy;
        }
        Ok(())
    }

    async fn remove(&self, address: &RunnerAddress) -> Result<(), Error> {
        self.runners.remove(address);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<RunnerRecord>, Error> {
        Ok(self.runners.iter().map(|e| e.value().clone()).collect())
    }

    async fn acquire_lock(
        &self,
        shard_id: &ShardId,
        address: &RunnerAddress,
        now_ms: i64,
    ) -> Result<bool, Error> {
        use dashmap::mapref::entry::Entry;

        match self.locks.entry(shard_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Lock {
                    address: *address,
                    acquired_at: now_ms,
                });
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let held = *slot.get();
                if held.address == *address {
                    slot.get_mut().acquired_at = now_ms;
                    Ok(true)
                } else if now_ms - held.acquired_at > LOCK_EXPIRATION_MS {
                    slot.insert(Lock {
                        address: *address,
                        acquired_at: now_ms,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn release_lock(&self, shard_id: &ShardId, address: &RunnerAddress) -> Result<(), Error> {
        if let Some(held) = self.locks.get(shard_id) {
            if held.address == *address {
                drop(held);
                self.locks.remove(shard_id);
            }
        }
        Ok(())
    }

    async fn lock_owner(&self, shard_id: &ShardId) -> Result<Option<RunnerAddress>, Error> {
        Ok(self.locks.get(shard_id).map(|l| l.address))
    }

    async fn save_assignments(&self, assignments: &HashMap<ShardId, Option<RunnerAddress>>) -> Result<(), Error> {
        *self.assignments.lock().expect("assignments lock poisoned") = assignments.clone();
        Ok(())
    }

    async fn load_assignments(&self) -> Result<HashMap<ShardId, Option<RunnerAddress>>, Error> {
        Ok(self.assignments.lock().expect("assignments lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> RunnerAddress {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn runner(port: u16) -> Runner {
        Runner::new(addr(port), vec!["default".into()], 1)
    }

    #[tokio::test]
    async fn test_register_idempotent() {
        let storage = MemoryRunnerStorage::new();
        let a = storage.register(runner(1), 0).await.unwrap();
        let b = storage.register(runner(1), 100).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_register_monotonic_ids() {
        let storage = MemoryRunnerStorage::new();
        let a = storage.register(runner(1), 0).await.unwrap();
        let b = storage.register(runner(2), 0).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_save_and_load_assignments_roundtrip() {
        let storage = MemoryRunnerStorage::new();
        let shard = ShardId::new("default", 0);
        let mut assignments = HashMap::new();
        assignments.insert(shard.clone(), Some(addr(1)));

        storage.save_assignments(&assignments).await.unwrap();
        assert_eq!(storage.load_assignments().await.unwrap(), assignments);
    }

    #[tokio::test]
    async fn test_lock_fencing() {
        let storage = MemoryRunnerStorage::new();
        let shard = ShardId::new("default", 1);

        assert!(storage.acquire_lock(&shard, &addr(1), 0).await.unwrap());
        assert!(!storage.acquire_lock(&shard, &addr(2), 100).await.unwrap());
        assert_eq!(storage.lock_owner(&shard).await.unwrap(), Some(addr(1)));
    }

    #[tokio::test]
    async fn test_lock_steal_after_expiration() {
        let storage = MemoryRunnerStorage::new();
        let shard = ShardId::new("default", 1);

        storage.acquire_lock(&shard, &addr(1), 0).await.unwrap();
        assert!(storage
            .acquire_lock(&shard, &addr(2), LOCK_EXPIRATION_MS + 1)
            .await
            .unwrap());
        assert_eq!(storage.lock_owner(&shard).await.unwrap(), Some(addr(2)));
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let storage = MemoryRunnerStorage::new();
        let shard = ShardId::new("default", 1);

        storage.acquire_lock(&shard, &addr(1), 0).await.unwrap();
        storage.release_lock(&shard, &addr(2)).await.unwrap();
        assert_eq!(storage.lock_owner(&shard).await.unwrap(), Some(addr(1)));

        storage.release_lock(&shard, &addr(1)).await.unwrap();
        assert_eq!(storage.lock_owner(&shard).await.unwrap(), None);
    }
}
