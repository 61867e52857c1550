use std::fmt;
use std::hash::{Hash, Hasher as _};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use super::shard_id::ShardId;

/// Identifies a single addressable entity. Entities that share an address
/// share a serial mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityAddress {
    pub shard_id: ShardId,
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityAddress {
    /// Compute the address for `(entity_type, entity_id)` inside `group`,
    /// given the group's shard count.
    pub fn compute(group: &str, entity_type: &str, entity_id: &str, shards_per_group: u32) -> Self {
        let shard = hash_into(entity_type, entity_id, shards_per_group);
        Self {
            shard_id: ShardId::new(group, shard),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.shard_id, self.entity_type, self.entity_id)
    }
}

/// Deterministic hash of `(entity_type, entity_id)` into `[0, shards)`.
fn hash_into(entity_type: &str, entity_id: &str, shards: u32) -> u32 {
    if shards == 0 {
        return 0;
    }
    let mut hasher = FnvHasher::default();
    entity_type.hash(&mut hasher);
    entity_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_is_deterministic() {
        let a = EntityAddress::compute("default", "Counter", "abc", 16);
        let b = EntityAddress::compute("default", "Counter", "abc", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_compute_varies_by_id() {
        let addrs: Vec<_> = (0..50)
            .map(|i| EntityAddress::compute("default", "Counter", &i.to_string(), 16).shard_id.id)
            .collect();
        let distinct: std::collections::HashSet<_> = addrs.iter().collect();
        assert!(distinct.len() > 1, "hash should spread across shards");
    }

    #[test]
    fn test_compute_in_range() {
        for i in 0..200 {
            let addr = EntityAddress::compute("default", "Counter", &i.to_string(), 37);
            assert!(addr.shard_id.id < 37);
        }
    }

    #[test]
    fn test_display() {
        let addr = EntityAddress::compute("default", "Counter", "abc", 16);
        let rendered = addr.to_string();
        assert!(rendered.contains("Counter:abc"));
    }
}
