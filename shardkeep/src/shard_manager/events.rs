use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::model::{Runner, RunnerAddress, ShardId};

/// Everything the shard manager publishes about changes to the assignment
/// map. Subscribers always see `StreamStarted` first so they know to treat
/// anything before it as potentially stale. `Serialize`/`Deserialize` so the
/// event stream can be relayed over the `ShardManagerClient` RPC binding to
/// a remote shard manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardingEvent {
    StreamStarted,
    ShardsAssigned {
        shard_ids: Vec<ShardId>,
        address: RunnerAddress,
    },
    ShardsUnassigned {
        shard_ids: Vec<ShardId>,
    },
    RunnerRegistered {
        runner: Runner,
    },
    RunnerUnregistered {
        address: RunnerAddress,
    },
}

const CHANNEL_CAPACITY: usize = 1024;

/// Best-effort fan-out of [`ShardingEvent`]s. "Best-effort" because a slow
/// subscriber that falls behind the broadcast channel's capacity is told to
/// reload the full map via `GetAssignments` rather than stalling everyone
/// else (§4.1 "Failure semantics").
pub struct EventBus {
    sender: broadcast::Sender<ShardingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: ShardingEvent) {
        // No receivers is a legitimate state (no one subscribed yet).
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream. The first item received is always
    /// `StreamStarted`.
    pub fn subscribe(&self) -> mpsc::Receiver<ShardingEvent> {
        let mut upstream = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            if tx.send(ShardingEvent::StreamStarted).await.is_err() {
                return;
            }
            loop {
                match upstream.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_sees_stream_started_first() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(rx.recv().await, Some(ShardingEvent::StreamStarted));
    }

    #[tokio::test]
    async fn test_subscriber_sees_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        rx.recv().await; // StreamStarted

        bus.publish(ShardingEvent::RunnerUnregistered {
            address: "127.0.0.1:1".parse().unwrap(),
        });

        assert_eq!(
            rx.recv().await,
            Some(ShardingEvent::RunnerUnregistered {
                address: "127.0.0.1:1".parse().unwrap(),
            })
        );
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(ShardingEvent::StreamStarted);
    }
}
