//! The authoritative `ShardId -> RunnerAddress?` mapping and the rebalance
//! loop that keeps it balanced as runners come and go.

pub mod error;
pub mod events;
pub mod rebalance;
pub mod server;

pub use error::Error;
pub use events::{EventBus, ShardingEvent};
pub use rebalance::RebalancePlan;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use shardkeep_config::Sharding;

use crate::clock::SynchronizedClock;
use crate::model::{Runner, RunnerAddress, ShardId};
use crate::storage::RunnerStorage;

/// Liveness check used to decide whether a touched runner survives into a
/// rebalance plan. Implemented by the runners transport (`Ping`); kept as a
/// trait here to avoid a dependency on the transport layer.
#[async_trait]
pub trait RunnerHealth: Send + Sync {
    async fn is_alive(&self, address: &RunnerAddress) -> bool;
}

/// Single authoritative decision-maker for shard ownership.
pub struct ShardManager {
    config: Sharding,
    runner_storage: Arc<dyn RunnerStorage>,
    health: Arc<dyn RunnerHealth>,
    clock: Arc<SynchronizedClock>,
    runners: DashMap<RunnerAddress, Runner>,
    assignments: DashMap<ShardId, Option<RunnerAddress>>,
    /// Runners whose assignment persistence failed on the last rebalance
    /// cycle, keyed to the time of that failure. Drained once a later
    /// persist attempt for the same runner succeeds.
    failed_runners: DashMap<RunnerAddress, i64>,
    persist_retry_count: usize,
    persist_retry_interval: Duration,
    events: EventBus,
    rebalance_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    health_check_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    runners_evicted: AtomicUsize,
    rebalance_cycles: AtomicUsize,
    shards_assigned_total: AtomicUsize,
    shards_unassigned_total: AtomicUsize,
    rebalance_retries: AtomicUsize,
}

impl ShardManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Sharding,
        runner_storage: Arc<dyn RunnerStorage>,
        health: Arc<dyn RunnerHealth>,
        clock: Arc<SynchronizedClock>,
        persist_retry_count: usize,
        persist_retry_interval: Duration,
    ) -> Arc<Self> {
        let assignments = DashMap::new();
        for group in &config.shard_groups {
            for id in 0..config.shards_per_group {
                assignments.insert(ShardId::new(group.clone(), id), None);
            }
        }

        Arc::new(Self {
            config,
            runner_storage,
            health,
            clock,
            runners: DashMap::new(),
            assignments,
            failed_runners: DashMap::new(),
            persist_retry_count,
            persist_retry_interval,
            events: EventBus::new(),
            rebalance_task: std::sync::Mutex::new(None),
            health_check_task: std::sync::Mutex::new(None),
            runners_evicted: AtomicUsize::new(0),
            rebalance_cycles: AtomicUsize::new(0),
            shards_assigned_total: AtomicUsize::new(0),
            shards_unassigned_total: AtomicUsize::new(0),
            rebalance_retries: AtomicUsize::new(0),
        })
    }

    /// Snapshot of the counters surfaced over the admin `SHOW STATS`
    /// command and the OpenMetrics endpoint.
    pub fn counts(&self) -> shardkeep_stats::ShardManagerCounts {
        shardkeep_stats::ShardManagerCounts {
            runners_registered: self.runners.len(),
            runners_evicted: self.runners_evicted.load(Ordering::Relaxed),
            rebalance_cycles: self.rebalance_cycles.load(Ordering::Relaxed),
            shards_assigned: self.shards_assigned_total.load(Ordering::Relaxed),
            shards_unassigned: self.shards_unassigned_total.load(Ordering::Relaxed),
            rebalance_retries: self.rebalance_retries.load(Ordering::Relaxed),
            shards_unassigned_current: self.assignments.iter().filter(|e| e.value().is_none()).count(),
        }
    }

    pub fn persist_retry_interval(&self) -> Duration {
        self.persist_retry_interval
    }

    /// Reload the assignment map and the runner roster from storage. Called
    /// once at startup so a shard-manager restart recovers ownership
    /// instead of starting with every shard unassigned.
    pub async fn restore(&self) -> Result<(), Error> {
        let saved = self.runner_storage.load_assignments().await?;
        for (shard, owner) in saved {
            if self.assignments.contains_key(&shard) {
                self.assignments.insert(shard, owner);
            }
        }

        for record in self.runner_storage.all().await? {
            if record.healthy {
                self.runners.insert(record.address, record.runner());
            }
        }

        Ok(())
    }

    /// Register a runner, returning its assigned machine id. Idempotent:
    /// re-registering the same address returns its existing machine id.
    pub async fn register(&self, runner: Runner) -> Result<u64, Error> {
        let now = self.clock.now_ms();
        let machine_id = self.runner_storage.register(runner.clone(), now).await?;
        self.runners.insert(runner.address, runner.clone());
        self.failed_runners.remove(&runner.address);
        self.events.publish(ShardingEvent::RunnerRegistered { runner });
        self.trigger_rebalance();
        Ok(machine_id)
    }

    /// Remove a runner and release every shard it held.
    pub async fn unregister(&self, address: RunnerAddress) -> Result<(), Error> {
        self.runner_storage.remove(&address).await?;
        self.runners.remove(&address);
        self.failed_runners.remove(&address);

        let mut freed = Vec::new();
        for mut entry in self.assignments.iter_mut() {
            if *entry.value() == Some(address) {
                *entry.value_mut() = None;
                freed.push(entry.key().clone());
            }
        }
        if !freed.is_empty() {
            self.events.publish(ShardingEvent::ShardsUnassigned { shard_ids: freed });
        }
        self.events
            .publish(ShardingEvent::RunnerUnregistered { address });
        self.trigger_rebalance();
        Ok(())
    }

    /// Ping a runner; unregister it if it doesn't answer. This is the only
    /// path that removes a runner from the roster on liveness grounds - a
    /// shard stays `Assigned(r)` through ordinary rebalance cycles until
    /// this unregisters `r`.
    pub async fn notify_unhealthy_runner(&self, address: RunnerAddress) -> Result<(), Error> {
        if self.health.is_alive(&address).await {
            return Ok(());
        }
        warn!(%address, "runner failed health check, unregistering");
        self.runners_evicted.fetch_add(1, Ordering::Relaxed);
        self.unregister(address).await
    }

    pub fn get_assignments(&self) -> HashMap<ShardId, Option<RunnerAddress>> {
        self.assignments
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn sharding_events(&self) -> mpsc::Receiver<ShardingEvent> {
        self.events.subscribe()
    }

    pub fn get_time(&self) -> i64 {
        self.clock.now_ms()
    }

    fn trigger_rebalance(&self) {
        // Debounced by the caller's scheduling (the background loop waits
        // `rebalance_debounce` after the last membership change); here we
        // just mark intent by letting the next scheduled tick pick it up.
    }

    /// Run one rebalance cycle across every shard group, then persist the
    /// resulting assignment map. Idempotent: safe to call repeatedly,
    /// including concurrently with itself.
    pub async fn rebalance(&self) {
        let mut touched = HashSet::new();
        for group in self.config.shard_groups.clone() {
            touched.extend(self.rebalance_group(&group).await);
        }
        if !touched.is_empty() {
            self.persist_assignments(&touched).await;
        }
        self.rebalance_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Persist the full assignment map, retrying up to `persist_retry_count`
    /// times with `persist_retry_interval` between attempts. A runner whose
    /// shards were part of this cycle is recorded in `failed_runners` if
    /// every attempt fails, and cleared once a later attempt succeeds.
    async fn persist_assignments(&self, touched: &HashSet<RunnerAddress>) {
        let snapshot = self.get_assignments();
        let mut attempt = 0;
        loop {
            match self.runner_storage.save_assignments(&snapshot).await {
                Ok(()) => {
                    for address in touched {
                        self.failed_runners.remove(address);
                    }
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.persist_retry_count {
                        warn!(
                            %err,
                            attempts = attempt,
                            "failed to persist assignment map, degrading touched runners"
                        );
                        let now = self.clock.now_ms();
                        for address in touched {
                            self.failed_runners.insert(*address, now);
                        }
                        return;
                    }
                    self.rebalance_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.persist_retry_interval).await;
                }
            }
        }
    }

    /// Compute and apply the plan for one shard group, returning the
    /// runners that received newly-assigned shards. `runners` is every
    /// registered runner hosting `group`, liveness filtering excluded -
    /// a runner only leaves this set via `notify_unhealthy_runner`.
    async fn rebalance_group(&self, group: &str) -> HashSet<RunnerAddress> {
        let shard_ids: Vec<ShardId> = (0..self.config.shards_per_group)
            .map(|id| ShardId::new(group, id))
            .collect();

        let candidates: Vec<Runner> = self
            .runners
            .iter()
            .map(|e| e.value().clone())
            .filter(|r| r.hosts_group(group))
            .collect();

        let snapshot: HashMap<ShardId, Option<RunnerAddress>> = shard_ids
            .iter()
            .map(|s| (s.clone(), self.assignments.get(s).and_then(|v| *v)))
            .collect();

        let budget = self.config.rebalance_budget(self.config.shards_per_group);
        let plan = rebalance::compute(&shard_ids, &snapshot, &candidates, budget);

        if !plan.unassign.is_empty() {
            for shard in &plan.unassign {
                self.assignments.insert(shard.clone(), None);
            }
            self.shards_unassigned_total.fetch_add(plan.unassign.len(), Ordering::Relaxed);
            self.events.publish(ShardingEvent::ShardsUnassigned {
                shard_ids: plan.unassign.clone(),
            });
        }

        let mut touched = HashSet::new();
        let mut by_recipient: HashMap<RunnerAddress, Vec<ShardId>> = HashMap::new();
        for (shard, recipient) in &plan.assign {
            self.assignments.insert(shard.clone(), Some(*recipient));
            by_recipient.entry(*recipient).or_default().push(shard.clone());
            touched.insert(*recipient);
        }
        if !plan.assign.is_empty() {
            self.shards_assigned_total.fetch_add(plan.assign.len(), Ordering::Relaxed);
        }
        for (address, shard_ids) in by_recipient {
            self.events
                .publish(ShardingEvent::ShardsAssigned { shard_ids, address });
        }

        if plan.touched() > 0 {
            info!(group, touched = plan.touched(), "rebalance cycle applied");
        }

        touched
    }

    /// Spawn the background rebalance loop and the independent health-check
    /// loop. The rebalance loop ticks every `rebalance_interval`, or
    /// `rebalance_retry_interval` while any runner is degraded in
    /// `failed_runners`, so a persistence failure is retried sooner than
    /// the next ordinary cycle. The health-check loop ticks every
    /// `runner_health_check_interval` and pings every registered runner,
    /// unregistering any that fails to answer.
    pub fn launch(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let rebalance_handle = tokio::spawn(async move {
            loop {
                manager.rebalance().await;
                let delay = if manager.failed_runners.is_empty() {
                    manager.config.rebalance_interval()
                } else {
                    manager.config.rebalance_retry_interval()
                };
                tokio::time::sleep(delay).await;
            }
        });
        *self.rebalance_task.lock().expect("rebalance task lock poisoned") = Some(rebalance_handle);

        let manager = Arc::clone(self);
        let health_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.runner_health_check_interval());
            loop {
                ticker.tick().await;
                let addresses: Vec<RunnerAddress> = manager.runners.iter().map(|e| *e.key()).collect();
                for address in addresses {
                    if let Err(err) = manager.notify_unhealthy_runner(address).await {
                        warn!(%address, %err, "health check failed to update runner state");
                    }
                }
            }
        });
        *self
            .health_check_task
            .lock()
            .expect("health check task lock poisoned") = Some(health_handle);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self
            .rebalance_task
            .lock()
            .expect("rebalance task lock poisoned")
            .take()
        {
            handle.abort();
        }
        if let Some(handle) = self
            .health_check_task
            .lock()
            .expect("health check task lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRunnerStorage;

    struct AlwaysAlive;

    #[async_trait]
    impl RunnerHealth for AlwaysAlive {
        async fn is_alive(&self, _address: &RunnerAddress) -> bool {
            true
        }
    }

    struct AlwaysDead;

    #[async_trait]
    impl RunnerHealth for AlwaysDead {
        async fn is_alive(&self, _address: &RunnerAddress) -> bool {
            false
        }
    }

    fn manager(health: Arc<dyn RunnerHealth>) -> Arc<ShardManager> {
        let config = Sharding {
            shards_per_group: 8,
            ..Sharding::default()
        };
        ShardManager::new(
            config,
            Arc::new(MemoryRunnerStorage::new()),
            health,
            Arc::new(SynchronizedClock::new()),
            3,
            Duration::from_millis(10),
        )
    }

    fn runner(port: u16) -> Runner {
        Runner::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            vec!["default".into()],
            1,
        )
    }

    #[tokio::test]
    async fn test_register_assigns_machine_id() {
        let manager = manager(Arc::new(AlwaysAlive));
        let a = manager.register(runner(1)).await.unwrap();
        let b = manager.register(runner(1)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_rebalance_assigns_all_shards_to_sole_runner() {
        let manager = manager(Arc::new(AlwaysAlive));
        manager.register(runner(1)).await.unwrap();
        manager.rebalance().await;

        let assignments = manager.get_assignments();
        let owner: RunnerAddress = "127.0.0.1:1".parse().unwrap();
        assert!(assignments.values().all(|v| *v == Some(owner)));
    }

    #[tokio::test]
    async fn test_dead_runner_keeps_shards_until_unregistered() {
        let manager = manager(Arc::new(AlwaysDead));
        manager.register(runner(1)).await.unwrap();
        manager.rebalance().await;

        let owner: RunnerAddress = "127.0.0.1:1".parse().unwrap();
        let assignments = manager.get_assignments();
        assert!(assignments.values().all(|v| *v == Some(owner)));

        manager.notify_unhealthy_runner(owner).await.unwrap();
        manager.rebalance().await;

        let assignments = manager.get_assignments();
        assert!(assignments.values().all(|v| v.is_none()));
    }

    #[tokio::test]
    async fn test_persist_failure_degrades_touched_runner_then_recovers() {
        struct FlakyStorage {
            inner: MemoryRunnerStorage,
            fails_remaining: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl RunnerStorage for FlakyStorage {
            async fn register(&self, runner: Runner, now_ms: i64) -> Result<u64, crate::storage::Error> {
                self.inner.register(runner, now_ms).await
            }
            async fn mark_heartbeat(&self, address: &RunnerAddress, now_ms: i64) -> Result<(), crate::storage::Error> {
                self.inner.mark_heartbeat(address, now_ms).await
            }
            async fn set_healthy(&self, address: &RunnerAddress, healthy: bool) -> Result<(), crate::storage::Error> {
                self.inner.set_healthy(address, healthy).await
            }
            async fn remove(&self, address: &RunnerAddress) -> Result<(), crate::storage::Error> {
                self.inner.remove(address).await
            }
            async fn all(&self) -> Result<Vec<crate::storage::RunnerRecord>, crate::storage::Error> {
                self.inner.all().await
            }
            async fn acquire_lock(
                &self,
                shard_id: &ShardId,
                address: &RunnerAddress,
                now_ms: i64,
            ) -> Result<bool, crate::storage::Error> {
                self.inner.acquire_lock(shard_id, address, now_ms).await
            }
            async fn release_lock(&self, shard_id: &ShardId, address: &RunnerAddress) -> Result<(), crate::storage::Error> {
                self.inner.release_lock(shard_id, address).await
            }
            async fn lock_owner(&self, shard_id: &ShardId) -> Result<Option<RunnerAddress>, crate::storage::Error> {
                self.inner.lock_owner(shard_id).await
            }
            async fn save_assignments(
                &self,
                assignments: &HashMap<ShardId, Option<RunnerAddress>>,
            ) -> Result<(), crate::storage::Error> {
                use std::sync::atomic::Ordering;
                if self.fails_remaining.load(Ordering::SeqCst) > 0 {
                    self.fails_remaining.fetch_sub(1, Ordering::SeqCst);
                    return Err(crate::storage::Error::Persistence("injected failure".into()));
                }
                self.inner.save_assignments(assignments).await
            }
            async fn load_assignments(&self) -> Result<HashMap<ShardId, Option<RunnerAddress>>, crate::storage::Error> {
                self.inner.load_assignments().await
            }
        }

        let storage = Arc::new(FlakyStorage {
            inner: MemoryRunnerStorage::new(),
            fails_remaining: std::sync::atomic::AtomicUsize::new(5),
        });
        let manager = ShardManager::new(
            Sharding {
                shards_per_group: 8,
                ..Sharding::default()
            },
            storage.clone(),
            Arc::new(AlwaysAlive),
            Arc::new(SynchronizedClock::new()),
            2,
            Duration::from_millis(1),
        );

        manager.register(runner(1)).await.unwrap();
        manager.rebalance().await;

        let owner: RunnerAddress = "127.0.0.1:1".parse().unwrap();
        assert!(manager.failed_runners.contains_key(&owner));

        manager.rebalance().await;
        assert!(!manager.failed_runners.contains_key(&owner));
    }

    #[tokio::test]
    async fn test_unregister_frees_shards() {
        let manager = manager(Arc::new(AlwaysAlive));
        manager.register(runner(1)).await.unwrap();
        manager.rebalance().await;

        manager
            .unregister("127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();

        let assignments = manager.get_assignments();
        assert!(assignments.values().all(|v| v.is_none()));
    }

    #[tokio::test]
    async fn test_notify_unhealthy_runner_unregisters_on_death() {
        let manager = manager(Arc::new(AlwaysDead));
        manager.register(runner(1)).await.unwrap();
        manager
            .notify_unhealthy_runner("127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();

        assert!(manager.runners.is_empty());
    }

    #[tokio::test]
    async fn test_uniqueness_of_ownership() {
        let manager = manager(Arc::new(AlwaysAlive));
        manager.register(runner(1)).await.unwrap();
        manager.register(runner(2)).await.unwrap();
        manager.rebalance().await;
        manager.rebalance().await;

        let assignments = manager.get_assignments();
        let mut owners_per_shard: HashMap<ShardId, usize> = HashMap::new();
        for (shard, owner) in assignments {
            if owner.is_some() {
                *owners_per_shard.entry(shard).or_insert(0) += 1;
            }
        }
        assert!(owners_per_shard.values().all(|&n| n <= 1));
    }
}
