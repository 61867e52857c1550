//! One bounded queue per `EntityAddress`, processed sequentially by a
//! dedicated task — the serial-delivery guarantee from §5 ("Per-entity:
//! messages delivered to a single entity are processed in the order they
//! reached its mailbox").

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::entity::EntityFactory;
use crate::model::{EntityAddress, Envelope, Exit, Reply};
use crate::runners::Error;
use crate::storage::MessageStorage;

struct Delivery {
    envelope: Envelope,
    /// Present when the sender is an in-process caller waiting on this
    /// mailbox's task directly, bypassing the storage reply-poll path.
    local_reply: Option<mpsc::Sender<Reply>>,
}

/// Handle to a running per-entity mailbox task. Dropping it does not stop
/// the task; call [`MailboxHandle::shutdown`] explicitly.
pub struct MailboxHandle {
    tx: mpsc::Sender<Delivery>,
    task: JoinHandle<()>,
}

impl MailboxHandle {
    pub fn spawn(
        address: EntityAddress,
        factory: Arc<dyn EntityFactory>,
        storage: Arc<dyn MessageStorage>,
        capacity: usize,
        max_idle: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity);

        let task = tokio::spawn(async move {
            let mut behavior = None;

            loop {
                let delivery = match tokio::time::timeout(max_idle, rx.recv()).await {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => break,
                    Err(_) => break, // entityMaxIdleTime elapsed with no traffic
                };

                let Envelope::Request {
                    request_id,
                    tag,
                    payload,
                    ..
                } = &delivery.envelope
                else {
                    continue;
                };

                let handler = behavior.get_or_insert_with(|| factory.create(&address.entity_id));
                let (reply_tx, mut reply_rx) = mpsc::channel(32);
                let request_id = *request_id;

                let outcome = AssertUnwindSafe(handler.handle(request_id, tag.clone(), payload.clone(), reply_tx))
                    .catch_unwind()
                    .await;

                if let Err(panic) = outcome {
                    let message = panic_message(panic);
                    warn!(%address, request_id, %message, "entity handler panicked");
                    let reply = Reply::WithExit {
                        id: request_id,
                        request_id,
                        exit: Exit::die(message),
                    };
                    if let Err(err) = storage.save_reply(reply.clone()).await {
                        warn!(%address, "failed to persist reply: {err}");
                    }
                    if let Some(local) = &delivery.local_reply {
                        let _ = local.send(reply).await;
                    }
                    // The handler state is unknown after a panic; drop it so
                    // the next delivery gets a fresh instance.
                    behavior = None;
                    continue;
                }

                while let Some(reply) = reply_rx.recv().await {
                    if let Err(err) = storage.save_reply(reply.clone()).await {
                        warn!(%address, "failed to persist reply: {err}");
                    }
                    if let Some(local) = &delivery.local_reply {
                        let _ = local.send(reply).await;
                    }
                }
            }
        });

        Self { tx, task }
    }

    /// Enqueue a request. Fails with `MailboxFull` if the queue is at
    /// capacity, or if the task has already exited (idle eviction raced
    /// with this delivery) — the caller should reconstruct the mailbox.
    pub fn deliver(&self, envelope: Envelope, local_reply: Option<mpsc::Sender<Reply>>) -> Result<(), Error> {
        self.tx
            .try_send(Delivery { envelope, local_reply })
            .map_err(|_| Error::MailboxFull(self.tx.capacity().to_string()))
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "entity handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityBehavior;
    use crate::model::{Exit, ShardId};
    use crate::storage::MemoryMessageStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Echo;

    #[async_trait]
    impl EntityBehavior for Echo {
        async fn handle(&mut self, request_id: i64, _tag: String, payload: serde_json::Value, replies: mpsc::Sender<Reply>) {
            let _ = replies
                .send(Reply::WithExit {
                    id: request_id,
                    request_id,
                    exit: Exit::Success(payload),
                })
                .await;
        }
    }

    fn address() -> EntityAddress {
        EntityAddress {
            shard_id: ShardId::new("default", 0),
            entity_type: "Echo".into(),
            entity_id: "abc".into(),
        }
    }

    fn request(id: i64) -> Envelope {
        Envelope::Request {
            request_id: id,
            address: address(),
            tag: "Echo".into(),
            payload: serde_json::json!({"n": id}),
            headers: HashMap::new(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        }
    }

    #[tokio::test]
    async fn test_deliver_persists_and_forwards_reply() {
        let storage = Arc::new(MemoryMessageStorage::new());
        let factory: Arc<dyn EntityFactory> = Arc::new(|_id: &str| Box::new(Echo) as Box<dyn EntityBehavior>);
        let mailbox = MailboxHandle::spawn(address(), factory, storage.clone(), 16, Duration::from_secs(60));

        let (tx, mut rx) = mpsc::channel(4);
        mailbox.deliver(request(1), Some(tx)).unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(reply.is_exit());

        let replies = storage.replies_for(&[1]).await.unwrap();
        assert_eq!(replies[&1].len(), 1);
    }

    #[tokio::test]
    async fn test_mailbox_full_rejects_overflow() {
        let storage = Arc::new(MemoryMessageStorage::new());
        // A factory whose handler never replies, so the single in-flight
        // delivery occupies the task and the queue fills behind it.
        struct Stalls;
        #[async_trait]
        impl EntityBehavior for Stalls {
            async fn handle(&mut self, _id: i64, _tag: String, _payload: serde_json::Value, _replies: mpsc::Sender<Reply>) {
                std::future::pending::<()>().await;
            }
        }
        let factory: Arc<dyn EntityFactory> = Arc::new(|_id: &str| Box::new(Stalls) as Box<dyn EntityBehavior>);
        let mailbox = MailboxHandle::spawn(address(), factory, storage, 1, Duration::from_secs(60));

        mailbox.deliver(request(1), None).unwrap();
        tokio::task::yield_now().await;
        mailbox.deliver(request(2), None).unwrap();
        let result = mailbox.deliver(request(3), None);
        assert!(matches!(result, Err(Error::MailboxFull(_))));

        mailbox.shutdown();
    }

    #[tokio::test]
    async fn test_handler_panic_yields_die_reply_and_survives() {
        struct Explodes;
        #[async_trait]
        impl EntityBehavior for Explodes {
            async fn handle(&mut self, _id: i64, _tag: String, _payload: serde_json::Value, _replies: mpsc::Sender<Reply>) {
                panic!("handler exploded");
            }
        }
        let storage = Arc::new(MemoryMessageStorage::new());
        let factory: Arc<dyn EntityFactory> = Arc::new(|_id: &str| Box::new(Explodes) as Box<dyn EntityBehavior>);
        let mailbox = MailboxHandle::spawn(address(), factory, storage.clone(), 16, Duration::from_secs(60));

        let (tx, mut rx) = mpsc::channel(4);
        mailbox.deliver(request(1), Some(tx)).unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply, Reply::WithExit { exit: Exit::Die { .. }, .. }));
        assert!(mailbox.is_alive());
    }
}
