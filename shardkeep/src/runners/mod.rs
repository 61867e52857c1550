//! Transport adapter: the four RPC verbs (`Ping`, `Notify`, `Effect`/
//! `Stream`, `Envelope`) over the `wire` framing, plus the in-process
//! reply-handler registry that lets a caller on the owning runner skip the
//! storage poll loop entirely.

pub mod error;
pub mod pool;
pub mod server;
pub mod wire;

pub use error::Error;

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::warn;

use crate::model::{Envelope, Reply, RunnerAddress};
use crate::shard_manager::RunnerHealth;

use pool::ConnectionPool;
use wire::Frame;

/// The runner-local half of dispatch. Implemented by `sharding::Sharding`;
/// kept as a trait here so `Runners` doesn't depend on the router's crate
/// module directly (the two are constructed in sequence and wired together
/// with `bind_local`, resolving the `Sharding <-> Runners` cycle, per the
/// "graph cycles" design note).
#[async_trait]
pub trait LocalDispatch: Send + Sync {
    async fn dispatch_local(&self, envelope: Envelope) -> Result<Reply, Error>;
    async fn notify_local(&self, envelope: Envelope) -> Result<(), Error>;
    async fn envelope_local(&self, envelope: Envelope) -> Result<(), Error>;

    /// Like `dispatch_local`, but forwards every reply the handler emits
    /// (chunks included) onto `tx` instead of returning only the first one.
    /// Backs the `Stream` RPC verb.
    async fn stream_local(&self, envelope: Envelope, tx: mpsc::Sender<Reply>) -> Result<(), Error>;
}

const REPLY_CHANNEL_CAPACITY: usize = 256;

pub struct Runners {
    pool: Arc<ConnectionPool>,
    local: OnceCell<Arc<dyn LocalDispatch>>,
    /// In-process reply handlers keyed by `requestId`. Populated by callers
    /// of `effect`/`stream` that want a push rather than a storage poll.
    reply_registry: dashmap::DashMap<i64, mpsc::Sender<Reply>>,
}

impl Runners {
    pub fn new() -> Arc<Self> {
        let pool = ConnectionPool::new();
        pool.launch();
        Arc::new(Self {
            pool,
            local: OnceCell::new(),
            reply_registry: dashmap::DashMap::new(),
        })
    }

    /// Complete the two-phase construction: bind the local dispatch target
    /// once `Sharding` has been built.
    pub fn bind_local(&self, local: Arc<dyn LocalDispatch>) {
        let _ = self.local.set(local);
    }

    fn local(&self) -> &Arc<dyn LocalDispatch> {
        self.local.get().expect("Runners.bind_local was never called")
    }

    pub fn is_local(&self, address: RunnerAddress, self_address: RunnerAddress) -> bool {
        address == self_address
    }

    pub async fn ping(&self, address: RunnerAddress) -> Result<(), Error> {
        self.pool
            .with_connection(address, move |stream| async move {
                wire::write_frame(stream, &Frame::Ping).await?;
                match wire::read_frame(stream).await? {
                    Frame::Pong => Ok(()),
                    other => Err(unexpected(other)),
                }
            })
            .await
    }

    pub async fn send_local(&self, envelope: Envelope) -> Result<Reply, Error> {
        self.local().dispatch_local(envelope).await
    }

    pub async fn notify(&self, address: RunnerAddress, envelope: Envelope) -> Result<(), Error> {
        let frame = Frame::Notify(envelope);
        self.pool
            .with_connection(address, move |stream| {
                let frame = frame.clone();
                async move {
                    wire::write_frame(stream, &frame).await?;
                    match wire::read_frame(stream).await? {
                        Frame::Ack => Ok(()),
                        other => Err(unexpected(other)),
                    }
                }
            })
            .await
    }

    pub async fn effect(&self, address: RunnerAddress, envelope: Envelope) -> Result<Reply, Error> {
        let frame = Frame::Effect(envelope);
        self.pool
            .with_connection(address, move |stream| {
                let frame = frame.clone();
                async move {
                    wire::write_frame(stream, &frame).await?;
                    match wire::read_frame(stream).await? {
                        Frame::Reply(reply) => Ok(reply),
                        Frame::Err(message) => Err(Error::EntityNotAssignedToRunner(message)),
                        other => Err(unexpected(other)),
                    }
                }
            })
            .await
    }

    /// Stream replies for one request, forwarding each to `tx` until a
    /// `WithExit` closes the stream.
    pub async fn stream(
        &self,
        address: RunnerAddress,
        envelope: Envelope,
        tx: mpsc::Sender<Reply>,
    ) -> Result<(), Error> {
        let frame = Frame::Stream(envelope);
        self.pool
            .with_connection(address, move |stream| {
                let frame = frame.clone();
                let tx = tx.clone();
                async move {
                    wire::write_frame(stream, &frame).await?;
                    loop {
                        match wire::read_frame(stream).await? {
                            Frame::Reply(reply) => {
                                let is_exit = reply.is_exit();
                                if tx.send(reply).await.is_err() {
                                    break;
                                }
                                if is_exit {
                                    break;
                                }
                            }
                            Frame::Err(message) => return Err(Error::EntityNotAssignedToRunner(message)),
                            other => return Err(unexpected(other)),
                        }
                    }
                    Ok(())
                }
            })
            .await
    }

    pub async fn send_envelope(&self, address: RunnerAddress, envelope: Envelope) -> Result<(), Error> {
        let frame = Frame::EnvelopeMsg(envelope);
        self.pool
            .with_connection(address, move |stream| {
                let frame = frame.clone();
                async move {
                    wire::write_frame(stream, &frame).await?;
                    match wire::read_frame(stream).await? {
                        Frame::Ack => Ok(()),
                        other => Err(unexpected(other)),
                    }
                }
            })
            .await
    }

    /// Register an in-process reply handler for `request_id`. Returns the
    /// receiving half; the sender is consulted by `deliver_reply`.
    pub fn register_reply_handler(&self, request_id: i64) -> mpsc::Receiver<Reply> {
        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        self.reply_registry.insert(request_id, tx);
        rx
    }

    /// Push a reply to a registered in-process handler, if any. Silently a
    /// no-op if the caller has moved to the storage-polling path instead.
    pub async fn deliver_reply(&self, reply: Reply) {
        let request_id = reply.request_id();
        let is_exit = reply.is_exit();
        if let Some(tx) = self.reply_registry.get(&request_id) {
            let _ = tx.send(reply).await;
        }
        if is_exit {
            self.reply_registry.remove(&request_id);
        }
    }

    /// Fire every registered handler for `shard_ids` with
    /// `EntityNotAssignedToRunner`, so callers fall back to reply polling.
    /// Called when this runner loses a shard (rebalance revoke, shutdown).
    pub fn evict_handlers_for_shutdown(&self) {
        self.reply_registry.clear();
    }

    pub fn evict_peer(&self, address: &RunnerAddress) {
        self.pool.evict(address);
    }
}

fn unexpected(frame: Frame) -> Error {
    warn!(?frame, "unexpected frame in response position");
    Error::Protocol(format!("unexpected frame {frame:?}"))
}

#[async_trait]
impl RunnerHealth for Runners {
    async fn is_alive(&self, address: &RunnerAddress) -> bool {
        self.ping(*address).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait]
    impl LocalDispatch for AlwaysFails {
        async fn dispatch_local(&self, _envelope: Envelope) -> Result<Reply, Error> {
            Err(Error::MailboxFull("test".into()))
        }
        async fn notify_local(&self, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
        async fn envelope_local(&self, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
        async fn stream_local(&self, _envelope: Envelope, _tx: mpsc::Sender<Reply>) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ping_unreachable_peer_is_not_alive() {
        let runners = Runners::new();
        let address: RunnerAddress = "127.0.0.1:1".parse().unwrap();
        assert!(!runners.is_alive(&address).await);
    }

    #[tokio::test]
    async fn test_bind_local_then_send_local() {
        let runners = Runners::new();
        runners.bind_local(Arc::new(AlwaysFails));

        let envelope = Envelope::Interrupt {
            id: 1,
            address: crate::model::EntityAddress {
                shard_id: crate::model::ShardId::new("default", 0),
                entity_type: "Counter".into(),
                entity_id: "abc".into(),
            },
            request_id: 1,
        };
        let result = runners.send_local(envelope).await;
        assert!(matches!(result, Err(Error::MailboxFull(_))));
    }

    #[tokio::test]
    async fn test_reply_handler_receives_and_clears_on_exit() {
        let runners = Runners::new();
        let mut rx = runners.register_reply_handler(42);

        runners
            .deliver_reply(Reply::WithExit {
                id: 1,
                request_id: 42,
                exit: crate::model::Exit::Success(serde_json::json!(1)),
            })
            .await;

        let reply = rx.recv().await.unwrap();
        assert!(reply.is_exit());
        assert!(!runners.reply_registry.contains_key(&42));
    }
}
