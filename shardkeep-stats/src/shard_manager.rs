use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use crate::open_metric::{counter, gauge, Metric};

/// Counters tracked by the shard manager, surfaced over the admin
/// `SHOW STATS` command and the OpenMetrics endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ShardManagerCounts {
    /// Number of runners currently registered.
    pub runners_registered: usize,
    /// Number of runners evicted due to a failed health check.
    pub runners_evicted: usize,
    /// Number of completed rebalance cycles.
    pub rebalance_cycles: usize,
    /// Number of shard assignments made across all cycles.
    pub shards_assigned: usize,
    /// Number of shard unassignments made across all cycles.
    pub shards_unassigned: usize,
    /// Number of rebalance cycles that failed to persist and were retried.
    pub rebalance_retries: usize,
    /// Number of shards currently unassigned.
    pub shards_unassigned_current: usize,
}

impl ShardManagerCounts {
    pub fn metrics(&self) -> Vec<Metric> {
        vec![
            gauge(
                "shardkeep_runners_registered",
                "Runners currently registered.",
                self.runners_registered,
            ),
            counter(
                "shardkeep_runners_evicted_total",
                "Runners evicted due to a failed health check.",
                self.runners_evicted,
            ),
            counter(
                "shardkeep_rebalance_cycles_total",
                "Completed rebalance cycles.",
                self.rebalance_cycles,
            ),
            counter(
                "shardkeep_shards_assigned_total",
                "Shard assignments made across all cycles.",
                self.shards_assigned,
            ),
            counter(
                "shardkeep_shards_unassigned_total",
                "Shard unassignments made across all cycles.",
                self.shards_unassigned,
            ),
            counter(
                "shardkeep_rebalance_retries_total",
                "Rebalance cycles retried after an assignment-persistence failure.",
                self.rebalance_retries,
            ),
            gauge(
                "shardkeep_shards_unassigned_current",
                "Shards currently unassigned.",
                self.shards_unassigned_current,
            ),
        ]
    }
}

impl Add for ShardManagerCounts {
    type Output = ShardManagerCounts;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            runners_registered: self.runners_registered.saturating_add(rhs.runners_registered),
            runners_evicted: self.runners_evicted.saturating_add(rhs.runners_evicted),
            rebalance_cycles: self.rebalance_cycles.saturating_add(rhs.rebalance_cycles),
            shards_assigned: self.shards_assigned.saturating_add(rhs.shards_assigned),
            shards_unassigned: self.shards_unassigned.saturating_add(rhs.shards_unassigned),
            rebalance_retries: self.rebalance_retries.saturating_add(rhs.rebalance_retries),
            shards_unassigned_current: rhs.shards_unassigned_current,
        }
    }
}

impl Sub for ShardManagerCounts {
    type Output = ShardManagerCounts;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            runners_registered: self.runners_registered.saturating_sub(rhs.runners_registered),
            runners_evicted: self.runners_evicted.saturating_sub(rhs.runners_evicted),
            rebalance_cycles: self.rebalance_cycles.saturating_sub(rhs.rebalance_cycles),
            shards_assigned: self.shards_assigned.saturating_sub(rhs.shards_assigned),
            shards_unassigned: self.shards_unassigned.saturating_sub(rhs.shards_unassigned),
            rebalance_retries: self.rebalance_retries.saturating_sub(rhs.rebalance_retries),
            shards_unassigned_current: self.shards_unassigned_current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub() {
        let a = ShardManagerCounts {
            runners_registered: 3,
            shards_assigned: 10,
            ..Default::default()
        };
        let b = ShardManagerCounts {
            runners_registered: 1,
            shards_assigned: 4,
            ..Default::default()
        };
        let sum = a + b;
        assert_eq!(sum.runners_registered, 4);
        assert_eq!(sum.shards_assigned, 14);

        let diff = sum - b;
        assert_eq!(diff.runners_registered, 3);
        assert_eq!(diff.shards_assigned, 10);
    }
}
