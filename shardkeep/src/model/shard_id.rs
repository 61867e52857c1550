use std::fmt;

use serde::{Deserialize, Serialize};

/// A shard is a deterministic partition of the entity key space within a
/// named group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    pub group: String,
    pub id: u32,
}

impl ShardId {
    pub fn new(group: impl Into<String>, id: u32) -> Self {
        Self {
            group: group.into(),
            id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let shard = ShardId::new("default", 7);
        assert_eq!(shard.to_string(), "default/7");
    }

    #[test]
    fn test_equality_and_hash() {
        use std::collections::HashSet;
        let a = ShardId::new("default", 1);
        let b = ShardId::new("default", 1);
        let c = ShardId::new("billing", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }
}
