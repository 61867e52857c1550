use super::Command;
use crate::shard_manager::ShardManager;
use crate::util::{format_bytes, human_duration};

pub struct ShowStats;

impl Command for ShowStats {
    fn name() -> &'static str {
        "SHOW STATS"
    }

    fn parse(verb: &str) -> Option<Self> {
        verb.trim().eq_ignore_ascii_case(Self::name()).then_some(Self)
    }

    fn execute(&self, manager: &ShardManager) -> Vec<String> {
        let counts = manager.counts();
        let assignments = manager.get_assignments();
        let snapshot_bytes = serde_json::to_vec(&assignments).map(|bytes| bytes.len() as u64).unwrap_or(0);

        vec![
            format!("runners_registered: {}", counts.runners_registered),
            format!("runners_evicted: {}", counts.runners_evicted),
            format!("rebalance_cycles: {}", counts.rebalance_cycles),
            format!("shards_assigned: {}", counts.shards_assigned),
            format!("shards_unassigned: {}", counts.shards_unassigned),
            format!("rebalance_retries: {}", counts.rebalance_retries),
            format!("shards_unassigned_current: {}", counts.shards_unassigned_current),
            format!("persist_retry_interval: {}", human_duration(manager.persist_retry_interval())),
            format!("assignment_snapshot_size: {}", format_bytes(snapshot_bytes)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SynchronizedClock;
    use crate::model::{Runner, RunnerAddress};
    use crate::storage::MemoryRunnerStorage;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct AlwaysAlive;

    #[async_trait]
    impl crate::shard_manager::RunnerHealth for AlwaysAlive {
        async fn is_alive(&self, _address: &RunnerAddress) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_show_stats_reflects_registered_runner() {
        let manager = ShardManager::new(
            shardkeep_config::Sharding {
                shards_per_group: 4,
                ..shardkeep_config::Sharding::default()
            },
            Arc::new(MemoryRunnerStorage::new()),
            Arc::new(AlwaysAlive),
            Arc::new(SynchronizedClock::new()),
            3,
            Duration::from_millis(10),
        );
        manager
            .register(Runner::new("127.0.0.1:1".parse().unwrap(), vec!["default".into()], 1))
            .await
            .unwrap();
        manager.rebalance().await;

        let rows = ShowStats.execute(&manager);
        assert!(rows.iter().any(|r| r == "runners_registered: 1"));
        assert!(rows.iter().any(|r| r == "rebalance_cycles: 1"));
        assert!(rows.iter().any(|r| r.starts_with("shards_assigned: ") && !r.ends_with(": 0")));
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert!(ShowStats::parse("show stats").is_some());
        assert!(ShowStats::parse("SHOW STATS").is_some());
        assert!(ShowStats::parse("SHOW NONSENSE").is_none());
    }
}
