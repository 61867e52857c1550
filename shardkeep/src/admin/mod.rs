//! Admin introspection surface. Adapted from a SQL-statement-driven pooler
//! command to a bare verb carried as a `Frame::Show` request, since there's
//! no SQL parser in front of this transport - the shard manager answers
//! in-process, a runner only relays.

pub mod show_stats;

pub use show_stats::ShowStats;

use crate::shard_manager::ShardManager;

/// An admin command, executed against the shard manager it arrived on.
pub trait Command: Sized {
    /// Command name, matched case-insensitively against the request verb.
    fn name() -> &'static str;
    fn parse(verb: &str) -> Option<Self>;
    fn execute(&self, manager: &ShardManager) -> Vec<String>;
}

/// Dispatch `verb` to the one registered command that claims it.
pub fn execute(verb: &str, manager: &ShardManager) -> Result<Vec<String>, String> {
    if let Some(cmd) = ShowStats::parse(verb) {
        return Ok(cmd.execute(manager));
    }
    Err(format!("unknown admin command {verb:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_command_rejected() {
        use crate::clock::SynchronizedClock;
        use crate::storage::MemoryRunnerStorage;
        use async_trait::async_trait;
        use std::sync::Arc;
        use std::time::Duration;

        struct AlwaysAlive;
        #[async_trait]
        impl crate::shard_manager::RunnerHealth for AlwaysAlive {
            async fn is_alive(&self, _address: &crate::model::RunnerAddress) -> bool {
                true
            }
        }

        let manager = ShardManager::new(
            shardkeep_config::Sharding::default(),
            Arc::new(MemoryRunnerStorage::new()),
            Arc::new(AlwaysAlive),
            Arc::new(SynchronizedClock::new()),
            3,
            Duration::from_millis(10),
        );

        assert!(execute("SHOW NONSENSE", &manager).is_err());
        assert!(execute("SHOW STATS", &manager).is_ok());
    }
}
