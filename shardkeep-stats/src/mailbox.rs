use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use crate::open_metric::{counter, gauge, Metric};

/// Counters for the runner-side entity mailboxes, updated after each
/// dispatch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MailboxCounts {
    /// Entities currently hosted by this runner.
    pub entities_active: usize,
    /// Entities spawned since startup.
    pub entities_spawned: usize,
    /// Entities evicted for idling past `max_idle_time`.
    pub entities_evicted_idle: usize,
    /// Entities dropped due to shard revocation.
    pub entities_dropped_revoked: usize,
    /// Messages delivered to a mailbox.
    pub messages_delivered: usize,
    /// Sends rejected with `MailboxFull`.
    pub mailbox_full: usize,
    /// Sends retried because the local assignment map had no owner.
    pub dispatch_retries: usize,
    /// Sends forwarded to a remote runner.
    pub dispatch_remote: usize,
    /// Sends resolved locally.
    pub dispatch_local: usize,
}

impl MailboxCounts {
    pub fn metrics(&self) -> Vec<Metric> {
        vec![
            gauge("shardkeep_entities_active", "Entities currently hosted by this runner.", self.entities_active),
            counter(
                "shardkeep_entities_spawned_total",
                "Entities spawned since startup.",
                self.entities_spawned,
            ),
            counter(
                "shardkeep_entities_evicted_idle_total",
                "Entities evicted for idling past the configured max idle time.",
                self.entities_evicted_idle,
            ),
            counter(
                "shardkeep_entities_dropped_revoked_total",
                "Entities dropped because their shard was revoked.",
                self.entities_dropped_revoked,
            ),
            counter(
                "shardkeep_messages_delivered_total",
                "Messages delivered to a mailbox.",
                self.messages_delivered,
            ),
            counter("shardkeep_mailbox_full_total", "Sends rejected with a full mailbox.", self.mailbox_full),
            counter(
                "shardkeep_dispatch_retries_total",
                "Sends retried because no owner was known for the shard.",
                self.dispatch_retries,
            ),
            counter("shardkeep_dispatch_remote_total", "Sends forwarded to a remote runner.", self.dispatch_remote),
            counter("shardkeep_dispatch_local_total", "Sends resolved locally.", self.dispatch_local),
        ]
    }
}

impl Add for MailboxCounts {
    type Output = MailboxCounts;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            entities_active: rhs.entities_active,
            entities_spawned: self.entities_spawned.saturating_add(rhs.entities_spawned),
            entities_evicted_idle: self
                .entities_evicted_idle
                .saturating_add(rhs.entities_evicted_idle),
            entities_dropped_revoked: self
                .entities_dropped_revoked
                .saturating_add(rhs.entities_dropped_revoked),
            messages_delivered: self.messages_delivered.saturating_add(rhs.messages_delivered),
            mailbox_full: self.mailbox_full.saturating_add(rhs.mailbox_full),
            dispatch_retries: self.dispatch_retries.saturating_add(rhs.dispatch_retries),
            dispatch_remote: self.dispatch_remote.saturating_add(rhs.dispatch_remote),
            dispatch_local: self.dispatch_local.saturating_add(rhs.dispatch_local),
        }
    }
}

impl Sub for MailboxCounts {
    type Output = MailboxCounts;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            entities_active: self.entities_active,
            entities_spawned: self.entities_spawned.saturating_sub(rhs.entities_spawned),
            entities_evicted_idle: self
                .entities_evicted_idle
                .saturating_sub(rhs.entities_evicted_idle),
            entities_dropped_revoked: self
                .entities_dropped_revoked
                .saturating_sub(rhs.entities_dropped_revoked),
            messages_delivered: self.messages_delivered.saturating_sub(rhs.messages_delivered),
            mailbox_full: self.mailbox_full.saturating_sub(rhs.mailbox_full),
            dispatch_retries: self.dispatch_retries.saturating_sub(rhs.dispatch_retries),
            dispatch_remote: self.dispatch_remote.saturating_sub(rhs.dispatch_remote),
            dispatch_local: self.dispatch_local.saturating_sub(rhs.dispatch_local),
        }
    }
}
