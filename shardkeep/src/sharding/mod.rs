//! Runner-side router: hosts entities, dispatches outgoing messages to the
//! correct destination (local mailbox or remote runner), keeps a local
//! snapshot of shard ownership fresh, and holds the shard locks that fence
//! against split ownership during a shard-manager outage.

pub mod error;
pub mod mailbox;
pub mod manager_client;

pub use error::Error;
pub use manager_client::{LocalShardManagerClient, RemoteShardManagerClient, ShardManagerClient};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use shardkeep_config::{Entity as EntityConfig, Sharding as ShardingConfig};

use crate::clock::SynchronizedClock;
use crate::entity::EntityFactory;
use crate::id::Snowflake;
use crate::model::{EntityAddress, Envelope, Exit, Reply, RunnerAddress, SaveResult, ShardId};
use crate::runners::{Error as RunnersError, LocalDispatch, Runners};
use crate::shard_manager::ShardingEvent;
use crate::storage::{MessageStorage, RunnerStorage};

use mailbox::MailboxHandle;

type Assignments = HashMap<ShardId, Option<RunnerAddress>>;

/// Runner-local singleton: the entity table, local assignment cache, and
/// every background task a runner process needs to stay in sync with the
/// shard manager. One instance per process, bound to the process lifetime.
pub struct Sharding {
    self_address: RunnerAddress,
    groups: Vec<String>,
    entity_config: EntityConfig,
    sharding_config: ShardingConfig,
    runners: Arc<Runners>,
    manager: Arc<dyn ShardManagerClient>,
    message_storage: Arc<dyn MessageStorage>,
    runner_storage: Arc<dyn RunnerStorage>,
    clock: Arc<SynchronizedClock>,
    snowflake: Arc<Snowflake>,
    local_assignments: ArcSwap<Assignments>,
    factories: DashMap<String, Arc<dyn EntityFactory>>,
    mailboxes: DashMap<EntityAddress, MailboxHandle>,
    singletons: DashMap<String, JoinHandle<()>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    entities_spawned: AtomicUsize,
    entities_dropped_revoked: AtomicUsize,
    messages_delivered: AtomicUsize,
    mailbox_full: AtomicUsize,
    dispatch_retries: AtomicUsize,
    dispatch_remote: AtomicUsize,
    dispatch_local: AtomicUsize,
}

impl Sharding {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_address: RunnerAddress,
        groups: Vec<String>,
        entity_config: EntityConfig,
        sharding_config: ShardingConfig,
        runners: Arc<Runners>,
        manager: Arc<dyn ShardManagerClient>,
        message_storage: Arc<dyn MessageStorage>,
        runner_storage: Arc<dyn RunnerStorage>,
        clock: Arc<SynchronizedClock>,
        snowflake: Arc<Snowflake>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_address,
            groups,
            entity_config,
            sharding_config,
            runners,
            manager,
            message_storage,
            runner_storage,
            clock,
            snowflake,
            local_assignments: ArcSwap::from_pointee(HashMap::new()),
            factories: DashMap::new(),
            mailboxes: DashMap::new(),
            singletons: DashMap::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            entities_spawned: AtomicUsize::new(0),
            entities_dropped_revoked: AtomicUsize::new(0),
            messages_delivered: AtomicUsize::new(0),
            mailbox_full: AtomicUsize::new(0),
            dispatch_retries: AtomicUsize::new(0),
            dispatch_remote: AtomicUsize::new(0),
            dispatch_local: AtomicUsize::new(0),
        })
    }

    /// Snapshot of the counters surfaced over the OpenMetrics endpoint.
    /// `entities_evicted_idle` is not tracked here: a mailbox task exits
    /// silently on idle timeout, with nothing reporting back to `Sharding`.
    pub fn counts(&self) -> shardkeep_stats::MailboxCounts {
        shardkeep_stats::MailboxCounts {
            entities_active: self.mailboxes.len(),
            entities_spawned: self.entities_spawned.load(Ordering::Relaxed),
            entities_evicted_idle: 0,
            entities_dropped_revoked: self.entities_dropped_revoked.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            mailbox_full: self.mailbox_full.load(Ordering::Relaxed),
            dispatch_retries: self.dispatch_retries.load(Ordering::Relaxed),
            dispatch_remote: self.dispatch_remote.load(Ordering::Relaxed),
            dispatch_local: self.dispatch_local.load(Ordering::Relaxed),
        }
    }

    pub fn register_entity(&self, entity_type: impl Into<String>, factory: Arc<dyn EntityFactory>) {
        self.factories.insert(entity_type.into(), factory);
    }

    /// Run `task` on exactly one runner per `group` (default: every group
    /// this process hosts), fenced by a shard lock keyed to the singleton's
    /// name so it migrates the same way an ordinary shard would.
    pub fn register_singleton<F, Fut>(self: &Arc<Self>, name: impl Into<String>, group: Option<String>, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let sharding = Arc::clone(self);
        let group = group.unwrap_or_else(|| self.groups.first().cloned().unwrap_or_else(|| "default".into()));
        let lock_id = ShardId::new(format!("__singleton__{group}"), fnv_hash(&name));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sharding.sharding_config.shard_lock_refresh_interval());
            loop {
                interval.tick().await;
                let now = sharding.clock.now_ms();
                match sharding
                    .runner_storage
                    .acquire_lock(&lock_id, &sharding.self_address, now)
                    .await
                {
                    Ok(true) => {
                        info!(name = %name, "singleton lease acquired, running task");
                        task().await;
                    }
                    Ok(false) => continue,
                    Err(err) => warn!("singleton lock acquisition failed: {err}"),
                }
            }
        });
        self.singletons.insert(name, handle);
    }

    /// Fire-and-get-reply: dispatches `payload` tagged `tag` to the entity
    /// at `address`, waiting for its terminal `Exit`.
    pub async fn send(
        &self,
        address: EntityAddress,
        tag: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Exit, Error> {
        let request_id = self
            .snowflake
            .next_id()
            .map_err(|_| Error::Runners(RunnersError::Protocol("machine id not assigned".into())))?;

        let envelope = Envelope::Request {
            request_id,
            address: address.clone(),
            tag: tag.into(),
            payload,
            headers: HashMap::new(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        };

        let (envelope, request_id) = match self.message_storage.save_request(envelope.clone()).await? {
            SaveResult::Success => (envelope, request_id),
            SaveResult::Duplicate {
                last_reply: Some(Reply::WithExit { exit, .. }),
                ..
            } => return Ok(exit),
            SaveResult::Duplicate { original_id, .. } => {
                let rewritten = rewrite_request_id(&envelope, original_id);
                (rewritten, original_id)
            }
        };

        let (tx, mut rx) = mpsc::channel(self.entity_config.mailbox_capacity.min(256));
        self.dispatch(address, envelope, Some(tx)).await?;

        loop {
            match rx.recv().await {
                Some(Reply::WithExit { exit, .. }) => return Ok(exit),
                Some(Reply::Chunk { .. }) => continue,
                None => {
                    // Reply channel closed before a WithExit arrived (peer
                    // dropped, local task evicted). Fall back to polling
                    // storage for whatever got persisted in the meantime.
                    return self.poll_for_exit(request_id).await;
                }
            }
        }
    }

    /// Fire-and-forget durable send; the caller polls storage for replies.
    pub async fn notify(&self, address: EntityAddress, tag: impl Into<String>, payload: serde_json::Value) -> Result<i64, Error> {
        let request_id = self
            .snowflake
            .next_id()
            .map_err(|_| Error::Runners(RunnersError::Protocol("machine id not assigned".into())))?;
        let envelope = Envelope::Request {
            request_id,
            address: address.clone(),
            tag: tag.into(),
            payload,
            headers: HashMap::new(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        };

        match self.message_storage.save_request(envelope.clone()).await? {
            SaveResult::Success => {
                self.dispatch(address, envelope, None).await?;
                Ok(request_id)
            }
            SaveResult::Duplicate { original_id, .. } => Ok(original_id),
        }
    }

    async fn poll_for_exit(&self, request_id: i64) -> Result<Exit, Error> {
        let mut interval = tokio::time::interval(self.entity_config.reply_poll_interval());
        loop {
            interval.tick().await;
            let replies = self.message_storage.replies_for(&[request_id]).await?;
            if let Some(found) = replies.get(&request_id).and_then(|rs| rs.iter().find(|r| r.is_exit())) {
                if let Reply::WithExit { exit, .. } = found {
                    return Ok(exit.clone());
                }
            }
        }
    }

    /// Resolve the owner for `address.shard_id` and route accordingly,
    /// retrying on an unknown owner per `sendRetryInterval` (§4.2).
    async fn dispatch(&self, address: EntityAddress, envelope: Envelope, local_reply: Option<mpsc::Sender<Reply>>) -> Result<(), Error> {
        loop {
            let owner = self.local_assignments.load().get(&address.shard_id).copied().flatten();

            match owner {
                Some(owner) if owner == self.self_address => {
                    self.dispatch_local.fetch_add(1, Ordering::Relaxed);
                    return self.dispatch_local_entity(address, envelope, local_reply);
                }
                Some(peer) => match self.runners.effect(peer, envelope.clone()).await {
                    Ok(reply) => {
                        self.dispatch_remote.fetch_add(1, Ordering::Relaxed);
                        if let Some(tx) = &local_reply {
                            let _ = tx.send(reply).await;
                        }
                        return Ok(());
                    }
                    Err(RunnersError::EntityNotAssignedToRunner(_)) => {
                        self.dispatch_retries.fetch_add(1, Ordering::Relaxed);
                        self.invalidate_shard(&address.shard_id);
                        self.refresh_assignments().await;
                        continue;
                    }
                    Err(err @ RunnersError::RunnerUnavailable(_)) => {
                        self.runners.evict_peer(&peer);
                        if let Err(notify_err) = self.manager.notify_unhealthy_runner(peer).await {
                            warn!(%peer, "failed to notify shard manager of unreachable peer: {notify_err}");
                        }
                        return Err(Error::Runners(err));
                    }
                    Err(err) => return Err(Error::Runners(err)),
                },
                None => {
                    tokio::time::sleep(self.entity_config.send_retry_interval()).await;
                    self.refresh_assignments().await;
                }
            }
        }
    }

    fn dispatch_local_entity(&self, address: EntityAddress, envelope: Envelope, local_reply: Option<mpsc::Sender<Reply>>) -> Result<(), Error> {
        if !self.mailboxes.contains_key(&address) || !self.mailboxes.get(&address).is_some_and(|m| m.is_alive()) {
            let entity_type = &address.entity_type;
            let factory = self
                .factories
                .get(entity_type)
                .ok_or_else(|| Error::Runners(RunnersError::EntityNotManagedByRunner(entity_type.clone())))?
                .clone();
            let handle = MailboxHandle::spawn(
                address.clone(),
                factory,
                self.message_storage.clone(),
                self.entity_config.mailbox_capacity,
                self.entity_config.max_idle_time(),
            );
            self.mailboxes.insert(address.clone(), handle);
            self.entities_spawned.fetch_add(1, Ordering::Relaxed);
        }

        match self
            .mailboxes
            .get(&address)
            .expect("just inserted or already present")
            .deliver(envelope, local_reply)
        {
            Ok(()) => {
                self.messages_delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                if matches!(err, RunnersError::MailboxFull(_)) {
                    self.mailbox_full.fetch_add(1, Ordering::Relaxed);
                }
                Err(Error::Runners(err))
            }
        }
    }

    fn invalidate_shard(&self, shard_id: &ShardId) {
        let mut map = (**self.local_assignments.load()).clone();
        map.insert(shard_id.clone(), None);
        self.local_assignments.store(Arc::new(map));
    }

    /// Pull the latest assignment map, diff against the local copy, and act
    /// on shards gained or lost (§4.2 "Local-assignment refresh").
    async fn refresh_assignments(&self) {
        let fresh = match self.manager.get_assignments().await {
            Ok(map) => map,
            Err(err) => {
                warn!("failed to refresh assignments: {err}");
                return;
            }
        };

        let previous = self.local_assignments.load();
        let now = self.clock.now_ms();

        for (shard_id, owner) in &fresh {
            let was_self = previous.get(shard_id).copied().flatten() == Some(self.self_address);
            let is_self = *owner == Some(self.self_address);

            if is_self && !was_self {
                match self.runner_storage.acquire_lock(shard_id, &self.self_address, now).await {
                    Ok(true) => info!(%shard_id, "acquired shard"),
                    Ok(false) => warn!(%shard_id, "lock held by another runner, refusing assignment"),
                    Err(err) => warn!(%shard_id, "lock acquisition failed: {err}"),
                }
            } else if was_self && !is_self {
                self.evict_shard(shard_id).await;
            }
        }

        self.local_assignments.store(Arc::new(fresh));
    }

    async fn evict_shard(&self, shard_id: &ShardId) {
        let owned: Vec<EntityAddress> = self
            .mailboxes
            .iter()
            .map(|e| e.key().clone())
            .filter(|addr| &addr.shard_id == shard_id)
            .collect();

        for address in owned {
            if let Some((_, handle)) = self.mailboxes.remove(&address) {
                tokio::time::timeout(self.entity_config.termination_timeout(), async { handle.shutdown() })
                    .await
                    .ok();
                self.entities_dropped_revoked.fetch_add(1, Ordering::Relaxed);
            }
        }

        let _ = self.runner_storage.release_lock(shard_id, &self.self_address).await;
    }

    /// Periodically poll storage for messages addressed to owned shards
    /// that a peer `notify`d durably rather than delivering live.
    async fn poll_unprocessed(&self) {
        let owned: Vec<ShardId> = self
            .local_assignments
            .load()
            .iter()
            .filter(|(_, owner)| **owner == Some(self.self_address))
            .map(|(shard, _)| shard.clone())
            .collect();
        if owned.is_empty() {
            return;
        }

        let now = self.clock.now_ms();
        match self.message_storage.unprocessed_messages(&owned, now).await {
            Ok(messages) => {
                for message in messages {
                    let address = message.request.address().clone();
                    if let Err(err) = self.dispatch_local_entity(address, message.request, None) {
                        warn!("failed to redeliver unprocessed message: {err}");
                    }
                }
            }
            Err(err) => warn!("failed to poll unprocessed messages: {err}"),
        }
    }

    pub fn launch(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("sharding task list lock poisoned");

        let refresher = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresher.sharding_config.rebalance_debounce().max(Duration::from_millis(1)));
            loop {
                interval.tick().await;
                refresher.refresh_assignments().await;
            }
        }));

        let poller = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.entity_config.message_poll_interval());
            loop {
                interval.tick().await;
                poller.poll_unprocessed().await;
            }
        }));

        let lock_heartbeat = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(lock_heartbeat.sharding_config.shard_lock_refresh_interval());
            loop {
                interval.tick().await;
                lock_heartbeat.heartbeat_locks().await;
            }
        }));
    }

    async fn heartbeat_locks(&self) {
        let now = self.clock.now_ms();
        let owned: Vec<ShardId> = self
            .local_assignments
            .load()
            .iter()
            .filter(|(_, owner)| **owner == Some(self.self_address))
            .map(|(shard, _)| shard.clone())
            .collect();

        for shard_id in owned {
            match self.runner_storage.acquire_lock(&shard_id, &self.self_address, now).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%shard_id, "shard lock stolen, dropping hosted entities");
                    self.evict_shard(&shard_id).await;
                }
                Err(err) => warn!(%shard_id, "lock heartbeat failed: {err}"),
            }
        }
    }

    pub fn shutdown(&self) {
        for entry in self.mailboxes.iter() {
            entry.value().shutdown();
        }
        for task in self.tasks.lock().expect("sharding task list lock poisoned").drain(..) {
            task.abort();
        }
        for task in self.singletons.iter() {
            task.value().abort();
        }
        self.runners.evict_handlers_for_shutdown();
    }
}

#[async_trait]
impl LocalDispatch for Sharding {
    async fn dispatch_local(&self, envelope: Envelope) -> Result<Reply, RunnersError> {
        let address = envelope.address().clone();
        let (tx, mut rx) = mpsc::channel(32);
        self.dispatch_local_entity(address, envelope, Some(tx))
            .map_err(|err| match err {
                Error::Runners(inner) => inner,
                Error::Storage(inner) => RunnersError::Storage(inner),
            })?;
        rx.recv().await.ok_or_else(|| RunnersError::Protocol("entity closed without replying".into()))
    }

    async fn notify_local(&self, envelope: Envelope) -> Result<(), RunnersError> {
        let address = envelope.address().clone();
        self.dispatch_local_entity(address, envelope, None).map_err(|err| match err {
            Error::Runners(inner) => inner,
            Error::Storage(inner) => RunnersError::Storage(inner),
        })
    }

    async fn envelope_local(&self, envelope: Envelope) -> Result<(), RunnersError> {
        let address = envelope.address().clone();
        self.dispatch_local_entity(address, envelope, None).map_err(|err| match err {
            Error::Runners(inner) => inner,
            Error::Storage(inner) => RunnersError::Storage(inner),
        })
    }

    async fn stream_local(&self, envelope: Envelope, tx: mpsc::Sender<Reply>) -> Result<(), RunnersError> {
        let address = envelope.address().clone();
        self.dispatch_local_entity(address, envelope, Some(tx)).map_err(|err| match err {
            Error::Runners(inner) => inner,
            Error::Storage(inner) => RunnersError::Storage(inner),
        })
    }
}

fn rewrite_request_id(envelope: &Envelope, new_id: i64) -> Envelope {
    match envelope.clone() {
        Envelope::Request { address, tag, payload, headers, trace_id, span_id, sampled, deliver_at, .. } => Envelope::Request {
            request_id: new_id,
            address,
            tag,
            payload,
            headers,
            trace_id,
            span_id,
            sampled,
            deliver_at,
        },
        other => other,
    }
}

fn fnv_hash(s: &str) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = fnv::FnvHasher::default();
    s.hash(&mut hasher);
    (hasher.finish() % u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityBehavior;
    use crate::model::Runner;
    use crate::storage::{MemoryMessageStorage, MemoryRunnerStorage};
    use async_trait::async_trait as at;

    struct Echo;

    #[at]
    impl EntityBehavior for Echo {
        async fn handle(&mut self, request_id: i64, _tag: String, payload: serde_json::Value, replies: mpsc::Sender<Reply>) {
            let _ = replies
                .send(Reply::WithExit {
                    id: request_id,
                    request_id,
                    exit: Exit::Success(payload),
                })
                .await;
        }
    }

    fn sharding() -> Arc<Sharding> {
        let self_address: RunnerAddress = "127.0.0.1:7001".parse().unwrap();
        let runners = Runners::new();
        let manager_storage = Arc::new(MemoryRunnerStorage::new());
        let message_storage: Arc<dyn MessageStorage> = Arc::new(MemoryMessageStorage::new());
        let clock = Arc::new(SynchronizedClock::new());
        let snowflake = Arc::new(Snowflake::default());
        snowflake.set_machine_id(1).unwrap();

        let sharding_config = ShardingConfig {
            shards_per_group: 4,
            ..ShardingConfig::default()
        };

        let local_manager = crate::shard_manager::ShardManager::new(
            sharding_config.clone(),
            manager_storage.clone(),
            Arc::new(AlwaysAlive),
            clock.clone(),
            3,
            Duration::from_millis(250),
        );

        let sharding = Sharding::new(
            self_address,
            vec!["default".into()],
            EntityConfig::default(),
            sharding_config,
            runners,
            Arc::new(LocalShardManagerClient::new(local_manager)),
            message_storage,
            manager_storage,
            clock,
            snowflake,
        );
        sharding.register_entity("Echo", Arc::new(|_id: &str| Box::new(Echo) as Box<dyn EntityBehavior>));
        sharding
    }

    struct AlwaysAlive;
    #[at]
    impl crate::shard_manager::RunnerHealth for AlwaysAlive {
        async fn is_alive(&self, _address: &RunnerAddress) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_send_to_self_owned_shard() {
        let sharding = sharding();
        sharding
            .manager
            .register(Runner::new(sharding.self_address, vec!["default".into()], 1))
            .await
            .unwrap();
        sharding.refresh_assignments().await;

        let group_shards: Vec<ShardId> = (0..4).map(|i| ShardId::new("default", i)).collect();
        // force full ownership for determinism regardless of rebalance details
        let mut map = HashMap::new();
        for shard in group_shards {
            map.insert(shard, Some(sharding.self_address));
        }
        sharding.local_assignments.store(Arc::new(map));

        let address = EntityAddress::compute("default", "Echo", "abc", 4);
        let exit = sharding.send(address, "Echo", serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(exit, Exit::Success(serde_json::json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_duplicate_send_returns_same_exit() {
        let sharding = sharding();
        let mut map = HashMap::new();
        for i in 0..4 {
            map.insert(ShardId::new("default", i), Some(sharding.self_address));
        }
        sharding.local_assignments.store(Arc::new(map));

        let address = EntityAddress::compute("default", "Echo", "dup", 4);
        let first = sharding.send(address.clone(), "Echo", serde_json::json!({"key": "dup", "n": 1})).await.unwrap();
        let second = sharding.send(address, "Echo", serde_json::json!({"key": "dup", "n": 2})).await.unwrap();
        assert_eq!(first, second);
    }
}
