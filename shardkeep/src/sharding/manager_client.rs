//! How a runner reaches the shard manager: in-process when this runner is
//! also the shard manager, or over the wire otherwise. Kept behind a trait
//! so `Sharding` never has to branch on deployment topology.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::model::{Runner, RunnerAddress, ShardId};
use crate::runners::wire::{self, Frame};
use crate::runners::Error;
use crate::shard_manager::{ShardManager, ShardingEvent};

#[async_trait]
pub trait ShardManagerClient: Send + Sync {
    async fn register(&self, runner: Runner) -> Result<u64, Error>;
    async fn unregister(&self, address: RunnerAddress) -> Result<(), Error>;
    async fn notify_unhealthy_runner(&self, address: RunnerAddress) -> Result<(), Error>;
    async fn get_assignments(&self) -> Result<HashMap<ShardId, Option<RunnerAddress>>, Error>;
    async fn get_time(&self) -> Result<i64, Error>;
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<ShardingEvent>, Error>;
}

/// Used when this process is itself the shard manager (`general.is_shard_manager()`).
pub struct LocalShardManagerClient {
    manager: Arc<ShardManager>,
}

impl LocalShardManagerClient {
    pub fn new(manager: Arc<ShardManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ShardManagerClient for LocalShardManagerClient {
    async fn register(&self, runner: Runner) -> Result<u64, Error> {
        self.manager.register(runner).await.map_err(|e| Error::Protocol(e.to_string()))
    }

    async fn unregister(&self, address: RunnerAddress) -> Result<(), Error> {
        self.manager
            .unregister(address)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    async fn notify_unhealthy_runner(&self, address: RunnerAddress) -> Result<(), Error> {
        self.manager
            .notify_unhealthy_runner(address)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    async fn get_assignments(&self) -> Result<HashMap<ShardId, Option<RunnerAddress>>, Error> {
        Ok(self.manager.get_assignments())
    }

    async fn get_time(&self) -> Result<i64, Error> {
        Ok(self.manager.get_time())
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<ShardingEvent>, Error> {
        Ok(self.manager.sharding_events())
    }
}

/// Used when `general.shard_manager_address` points elsewhere. Opens a
/// fresh connection per call (assignment/time lookups are infrequent; the
/// event subscription holds its own long-lived connection).
pub struct RemoteShardManagerClient {
    address: RunnerAddress,
}

impl RemoteShardManagerClient {
    pub fn new(address: RunnerAddress) -> Self {
        Self { address }
    }

    async fn connect(&self) -> Result<TcpStream, Error> {
        TcpStream::connect(self.address.socket_addr())
            .await
            .map_err(|_| Error::RunnerUnavailable(self.address.to_string()))
    }

    async fn roundtrip(&self, frame: Frame) -> Result<Frame, Error> {
        let mut stream = self.connect().await?;
        wire::write_frame(&mut stream, &frame).await?;
        wire::read_frame(&mut stream).await
    }
}

#[async_trait]
impl ShardManagerClient for RemoteShardManagerClient {
    async fn register(&self, runner: Runner) -> Result<u64, Error> {
        match self.roundtrip(Frame::Register(runner)).await? {
            Frame::MachineId(id) => Ok(id),
            Frame::Err(message) => Err(Error::Protocol(message)),
            other => Err(Error::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    async fn unregister(&self, address: RunnerAddress) -> Result<(), Error> {
        match self.roundtrip(Frame::Unregister(address)).await? {
            Frame::Ack => Ok(()),
            Frame::Err(message) => Err(Error::Protocol(message)),
            other => Err(Error::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    async fn notify_unhealthy_runner(&self, address: RunnerAddress) -> Result<(), Error> {
        match self.roundtrip(Frame::NotifyUnhealthyRunner(address)).await? {
            Frame::Ack => Ok(()),
            Frame::Err(message) => Err(Error::Protocol(message)),
            other => Err(Error::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    async fn get_assignments(&self) -> Result<HashMap<ShardId, Option<RunnerAddress>>, Error> {
        match self.roundtrip(Frame::GetAssignments).await? {
            Frame::Assignments(map) => Ok(map),
            other => Err(Error::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    async fn get_time(&self) -> Result<i64, Error> {
        match self.roundtrip(Frame::GetTime).await? {
            Frame::Time(ms) => Ok(ms),
            other => Err(Error::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<ShardingEvent>, Error> {
        let mut stream = self.connect().await?;
        wire::write_frame(&mut stream, &Frame::SubscribeEvents).await?;

        let (tx, rx) = mpsc::channel(1024);
        let stream = Arc::new(Mutex::new(stream));
        tokio::spawn(async move {
            let mut guard = stream.lock().await;
            loop {
                match wire::read_frame(&mut *guard).await {
                    Ok(Frame::ShardEvent(event)) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        Ok(rx)
    }
}
