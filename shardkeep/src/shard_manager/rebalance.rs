//! The rebalance algorithm, kept as a pure function of its inputs so it can
//! be tested without a storage backend, event bus, or network.

use std::collections::HashMap;

use crate::model::{Runner, RunnerAddress, ShardId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalancePlan {
    pub assign: Vec<(ShardId, RunnerAddress)>,
    pub unassign: Vec<ShardId>,
}

impl RebalancePlan {
    pub fn touched(&self) -> usize {
        self.assign.len() + self.unassign.len()
    }
}

fn target_loads(shard_count: u32, runners: &[Runner]) -> HashMap<RunnerAddress, f64> {
    let total_weight: f64 = runners.iter().map(|r| r.weight as f64).sum();
    if total_weight == 0.0 {
        return HashMap::new();
    }
    runners
        .iter()
        .map(|r| (r.address, shard_count as f64 * r.weight as f64 / total_weight))
        .collect()
}

/// Pick the runner furthest below its target load, excluding `exclude` (if
/// given). Ties broken by `RunnerAddress`'s natural (host, port) order.
fn most_under_target(
    runners: &[Runner],
    targets: &HashMap<RunnerAddress, f64>,
    loads: &HashMap<RunnerAddress, u32>,
    exclude: Option<RunnerAddress>,
) -> Option<RunnerAddress> {
    runners
        .iter()
        .map(|r| r.address)
        .filter(|a| Some(*a) != exclude)
        .map(|a| {
            let deficit = targets.get(&a).copied().unwrap_or(0.0) - *loads.get(&a).unwrap_or(&0) as f64;
            (a, deficit)
        })
        .max_by(|(a_addr, a_deficit), (b_addr, b_deficit)| {
            a_deficit
                .partial_cmp(b_deficit)
                .unwrap()
                .then_with(|| a_addr.cmp(b_addr).reverse())
        })
        .map(|(addr, _)| addr)
}

/// Compute the assignment/unassignment plan for one shard group.
///
/// `runners` must already be filtered to the live, healthy runners that
/// host this group. `budget` bounds how many shards are moved *between*
/// runners in one cycle; filling never-assigned shards doesn't consume it,
/// since an unassigned shard is an availability gap, not load skew, and
/// shouldn't wait behind the rate limit.
pub fn compute(
    shard_ids: &[ShardId],
    assignments: &HashMap<ShardId, Option<RunnerAddress>>,
    runners: &[Runner],
    budget: u32,
) -> RebalancePlan {
    let mut plan = RebalancePlan::default();

    if runners.is_empty() {
        for shard in shard_ids {
            if assignments.get(shard).copied().flatten().is_some() {
                plan.unassign.push(shard.clone());
            }
        }
        return plan;
    }

    let targets = target_loads(shard_ids.len() as u32, runners);
    let mut loads: HashMap<RunnerAddress, u32> = runners.iter().map(|r| (r.address, 0)).collect();
    let live: std::collections::HashSet<RunnerAddress> = runners.iter().map(|r| r.address).collect();

    let mut owners: HashMap<ShardId, Option<RunnerAddress>> = HashMap::new();
    let mut unassigned = Vec::new();

    let mut sorted_shards: Vec<&ShardId> = shard_ids.iter().collect();
    sorted_shards.sort();

    for shard in sorted_shards {
        match assignments.get(shard).copied().flatten() {
            Some(owner) if live.contains(&owner) => {
                *loads.entry(owner).or_insert(0) += 1;
                owners.insert(shard.clone(), Some(owner));
            }
            Some(_stale_or_dead) => unassigned.push(shard.clone()),
            None => unassigned.push(shard.clone()),
        }
    }

    for shard in unassigned {
        if let Some(recipient) = most_under_target(runners, &targets, &loads, None) {
            *loads.entry(recipient).or_insert(0) += 1;
            owners.insert(shard.clone(), Some(recipient));
            plan.assign.push((shard, recipient));
        }
    }

    let mut remaining_budget = budget;
    let mut donors: Vec<RunnerAddress> = runners.iter().map(|r| r.address).collect();
    donors.sort();

    'donor_loop: for donor in donors {
        loop {
            if remaining_budget == 0 {
                break 'donor_loop;
            }
            let target = targets.get(&donor).copied().unwrap_or(0.0);
            let load = *loads.get(&donor).unwrap_or(&0);
            if (load as f64) - target <= 1.0 {
                break;
            }

            let Some(recipient) = most_under_target(runners, &targets, &loads, Some(donor)) else {
                break;
            };
            let recipient_target = targets.get(&recipient).copied().unwrap_or(0.0);
            let recipient_load = *loads.get(&recipient).unwrap_or(&0);
            if recipient_load as f64 >= recipient_target {
                break;
            }

            let mut donor_shards: Vec<&ShardId> = owners
                .iter()
                .filter(|(_, owner)| **owner == Some(donor))
                .map(|(shard, _)| shard)
                .collect();
            donor_shards.sort();
            let Some(&shard) = donor_shards.first() else {
                break;
            };
            let shard = shard.clone();

            owners.insert(shard.clone(), Some(recipient));
            *loads.get_mut(&donor).unwrap() -= 1;
            *loads.entry(recipient).or_insert(0) += 1;
            plan.unassign.push(shard.clone());
            plan.assign.push((shard, recipient));
            remaining_budget -= 1;
        }
    }

    plan
}
