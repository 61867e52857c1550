use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Tuning for the runner-side entity mailboxes and outgoing dispatch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Entity {
    /// Capacity of each entity's mailbox before `send` fails with `MailboxFull`.
    ///
    /// _Default:_ `4096`
    #[serde(default = "Entity::mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// How long an entity may sit idle before it's interrupted and dropped.
    ///
    /// _Default:_ `60000`
    #[serde(default = "Entity::max_idle_time")]
    pub max_idle_time: u64,

    /// How long to wait for an entity to finish draining before it's
    /// forcibly dropped during a shard handoff or interrupt.
    ///
    /// _Default:_ `15000`
    #[serde(default = "Entity::termination_timeout")]
    pub termination_timeout: u64,

    /// How long a lazy entity construction is allowed to take.
    ///
    /// _Default:_ `5000`
    #[serde(default = "Entity::registration_timeout")]
    pub registration_timeout: u64,

    /// How often a runner polls storage for newly deliverable messages
    /// addressed to shards it owns.
    ///
    /// _Default:_ `10000`
    #[serde(default = "Entity::message_poll_interval")]
    pub message_poll_interval: u64,

    /// How often a caller polls storage for new replies when not attached
    /// to an in-process reply handler.
    ///
    /// _Default:_ `200`
    #[serde(default = "Entity::reply_poll_interval")]
    pub reply_poll_interval: u64,

    /// How often the local assignment cache is refreshed from the shard
    /// manager.
    ///
    /// _Default:_ `3000`
    #[serde(default = "Entity::refresh_assignments_interval")]
    pub refresh_assignments_interval: u64,

    /// Delay between dispatch retries while an owner is unknown or
    /// unreachable.
    ///
    /// _Default:_ `100`
    #[serde(default = "Entity::send_retry_interval")]
    pub send_retry_interval: u64,
}

impl Default for Entity {
    fn default() -> Self {
        Self {
            mailbox_capacity: Self::mailbox_capacity(),
            max_idle_time: Self::max_idle_time(),
            termination_timeout: Self::termination_timeout(),
            registration_timeout: Self::registration_timeout(),
            message_poll_interval: Self::message_poll_interval(),
            reply_poll_interval: Self::reply_poll_interval(),
            refresh_assignments_interval: Self::refresh_assignments_interval(),
            send_retry_interval: Self::send_retry_interval(),
        }
    }
}

impl Entity {
    fn env_or_default<T: std::str::FromStr>(env_var: &str, default: T) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn mailbox_capacity() -> usize {
        Self::env_or_default("SHARDKEEP_ENTITY_MAILBOX_CAPACITY", 4096)
    }

    fn max_idle_time() -> u64 {
        Self::env_or_default("SHARDKEEP_ENTITY_MAX_IDLE_TIME", 60_000)
    }

    fn termination_timeout() -> u64 {
        Self::env_or_default("SHARDKEEP_ENTITY_TERMINATION_TIMEOUT", 15_000)
    }

    fn registration_timeout() -> u64 {
        Self::env_or_default("SHARDKEEP_ENTITY_REGISTRATION_TIMEOUT", 5_000)
    }

    fn message_poll_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_ENTITY_MESSAGE_POLL_INTERVAL", 10_000)
    }

    fn reply_poll_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_ENTITY_REPLY_POLL_INTERVAL", 200)
    }

    fn refresh_assignments_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_REFRESH_ASSIGNMENTS_INTERVAL", 3_000)
    }

    fn send_retry_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_SEND_RETRY_INTERVAL", 100)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout)
    }

    pub fn message_poll_interval(&self) -> Duration {
        Duration::from_millis(self.message_poll_interval)
    }

    pub fn reply_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reply_poll_interval)
    }

    pub fn refresh_assignments_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_assignments_interval)
    }

    pub fn send_retry_interval(&self) -> Duration {
        Duration::from_millis(self.send_retry_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_mailbox_capacity() {
        env::set_var("SHARDKEEP_ENTITY_MAILBOX_CAPACITY", "128");
        assert_eq!(Entity::mailbox_capacity(), 128);
        env::remove_var("SHARDKEEP_ENTITY_MAILBOX_CAPACITY");
        assert_eq!(Entity::mailbox_capacity(), 4096);
    }

    #[test]
    fn test_default_serializable() {
        toml::to_string(&Entity::default()).unwrap();
    }
}
