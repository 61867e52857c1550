use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Shard group layout and rebalance tuning, owned by the shard manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Sharding {
    /// Shard groups this cluster hosts. Each group partitions its own
    /// key space independently.
    ///
    /// _Default:_ `["default"]`
    #[serde(default = "Sharding::shard_groups")]
    pub shard_groups: Vec<String>,

    /// Number of shards per group.
    ///
    /// _Default:_ `300`
    #[serde(default = "Sharding::shards_per_group")]
    pub shards_per_group: u32,

    /// Default relative weight applied to a runner that doesn't declare one
    /// at registration.
    ///
    /// _Default:_ `1`
    #[serde(default = "Sharding::runner_shard_weight")]
    pub runner_shard_weight: u32,

    /// How often the shard manager runs the rebalance loop.
    ///
    /// _Default:_ `20000`
    #[serde(default = "Sharding::rebalance_interval")]
    pub rebalance_interval: u64,

    /// How long to wait after a membership change before triggering a
    /// rebalance, so that a burst of registrations collapses into one cycle.
    ///
    /// _Default:_ `3000`
    #[serde(default = "Sharding::rebalance_debounce")]
    pub rebalance_debounce: u64,

    /// Fraction of total shards in a group allowed to move in a single
    /// rebalance cycle.
    ///
    /// _Default:_ `0.02`
    #[serde(default = "Sharding::rebalance_rate")]
    pub rebalance_rate: f64,

    /// Delay before retrying a rebalance cycle that failed to persist.
    ///
    /// _Default:_ `5000`
    #[serde(default = "Sharding::rebalance_retry_interval")]
    pub rebalance_retry_interval: u64,

    /// How often the shard manager pings a runner to confirm it's alive
    /// before evicting it.
    ///
    /// _Default:_ `60000`
    #[serde(default = "Sharding::runner_health_check_interval")]
    pub runner_health_check_interval: u64,

    /// TTL of a shard lock lease before it becomes reclaimable.
    ///
    /// _Default:_ `5000`
    #[serde(default = "Sharding::shard_lock_ttl")]
    pub shard_lock_ttl: u64,

    /// How often a runner heartbeats its held shard locks.
    ///
    /// _Default:_ `10000`
    #[serde(default = "Sharding::shard_lock_refresh_interval")]
    pub shard_lock_refresh_interval: u64,

    /// How long a registered runner is considered live without a heartbeat.
    ///
    /// _Default:_ `35000`
    #[serde(default = "Sharding::shard_lock_expiration")]
    pub shard_lock_expiration: u64,
}

impl Default for Sharding {
    fn default() -> Self {
        Self {
            shard_groups: Self::shard_groups(),
            shards_per_group: Self::shards_per_group(),
            runner_shard_weight: Self::runner_shard_weight(),
            rebalance_interval: Self::rebalance_interval(),
            rebalance_debounce: Self::rebalance_debounce(),
            rebalance_rate: Self::rebalance_rate(),
            rebalance_retry_interval: Self::rebalance_retry_interval(),
            runner_health_check_interval: Self::runner_health_check_interval(),
            shard_lock_ttl: Self::shard_lock_ttl(),
            shard_lock_refresh_interval: Self::shard_lock_refresh_interval(),
            shard_lock_expiration: Self::shard_lock_expiration(),
        }
    }
}

impl Sharding {
    fn env_or_default<T: std::str::FromStr>(env_var: &str, default: T) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn shard_groups() -> Vec<String> {
        env::var("SHARDKEEP_SHARD_GROUPS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| vec!["default".into()])
    }

    fn shards_per_group() -> u32 {
        Self::env_or_default("SHARDKEEP_SHARDS_PER_GROUP", 300)
    }

    fn runner_shard_weight() -> u32 {
        Self::env_or_default("SHARDKEEP_RUNNER_SHARD_WEIGHT", 1)
    }

    fn rebalance_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_REBALANCE_INTERVAL", 20_000)
    }

    fn rebalance_debounce() -> u64 {
        Self::env_or_default("SHARDKEEP_REBALANCE_DEBOUNCE", 3_000)
    }

    fn rebalance_rate() -> f64 {
        Self::env_or_default("SHARDKEEP_REBALANCE_RATE", 0.02)
    }

    fn rebalance_retry_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_REBALANCE_RETRY_INTERVAL", 5_000)
    }

    fn runner_health_check_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_RUNNER_HEALTH_CHECK_INTERVAL", 60_000)
    }

    fn shard_lock_ttl() -> u64 {
        Self::env_or_default("SHARDKEEP_SHARD_LOCK_TTL", 5_000)
    }

    fn shard_lock_refresh_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_SHARD_LOCK_REFRESH_INTERVAL", 10_000)
    }

    fn shard_lock_expiration() -> u64 {
        Self::env_or_default("SHARDKEEP_SHARD_LOCK_EXPIRATION", 35_000)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval)
    }

    pub fn rebalance_debounce(&self) -> Duration {
        Duration::from_millis(self.rebalance_debounce)
    }

    pub fn rebalance_retry_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_retry_interval)
    }

    pub fn runner_health_check_interval(&self) -> Duration {
        Duration::from_millis(self.runner_health_check_interval)
    }

    pub fn shard_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.shard_lock_ttl)
    }

    pub fn shard_lock_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.shard_lock_refresh_interval)
    }

    pub fn shard_lock_expiration(&self) -> Duration {
        Duration::from_millis(self.shard_lock_expiration)
    }

    /// Maximum number of shards allowed to move in one rebalance cycle,
    /// for a group of the given total size.
    pub fn rebalance_budget(&self, total_shards: u32) -> u32 {
        ((total_shards as f64) * self.rebalance_rate).ceil() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_shard_groups() {
        env::set_var("SHARDKEEP_SHARD_GROUPS", "alpha, beta,gamma");
        assert_eq!(
            Sharding::shard_groups(),
            vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
        );
        env::remove_var("SHARDKEEP_SHARD_GROUPS");
        assert_eq!(Sharding::shard_groups(), vec!["default".to_string()]);
    }

    #[test]
    fn test_rebalance_budget() {
        let sharding = Sharding {
            rebalance_rate: 0.02,
            ..Sharding::default()
        };
        assert_eq!(sharding.rebalance_budget(300), 6);
        assert_eq!(sharding.rebalance_budget(1), 1);
    }

    #[test]
    fn test_default_serializable() {
        toml::to_string(&Sharding::default()).unwrap();
    }
}
