//! Per-peer connection pool. One live `TcpStream` per [`RunnerAddress`],
//! reconnected lazily on demand and reaped after [`IDLE_TTL`] of disuse —
//! the same idle-then-reap shape as the grounding codebase's server pool,
//! scaled down to a single connection per peer since the Runners RPC verbs
//! are multiplexed request/reply frames rather than a session-bound stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::model::RunnerAddress;

use super::error::Error;

pub const IDLE_TTL: Duration = Duration::from_secs(3 * 60);
const REAP_INTERVAL: Duration = Duration::from_secs(30);

struct Entry {
    conn: Mutex<Option<TcpStream>>,
    last_used: Mutex<Instant>,
}

/// Connection pool keyed by peer address, with background idle reaping.
pub struct ConnectionPool {
    entries: DashMap<RunnerAddress, Arc<Entry>>,
    reap_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            reap_task: std::sync::Mutex::new(None),
        })
    }

    pub fn launch(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                pool.reap_idle().await;
            }
        });
        *self.reap_task.lock().expect("pool reap task lock poisoned") = Some(handle);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.reap_task.lock().expect("pool reap task lock poisoned").take() {
            handle.abort();
        }
    }

    async fn reap_idle(&self) {
        let mut stale = Vec::new();
        for entry in self.entries.iter() {
            let last_used = *entry.value().last_used.lock().await;
            if last_used.elapsed() > IDLE_TTL {
                stale.push(*entry.key());
            }
        }
        for addr in stale {
            self.entries.remove(&addr);
        }
    }

    /// Run `f` against a live connection to `address`, reconnecting once on
    /// a broken pipe before giving up with `RunnerUnavailable`.
    pub async fn with_connection<F, Fut, T>(&self, address: RunnerAddress, f: F) -> Result<T, Error>
    where
        F: Fn(&mut TcpStream) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let entry = self
            .entries
            .entry(address)
            .or_insert_with(|| {
                Arc::new(Entry {
                    conn: Mutex::new(None),
                    last_used: Mutex::new(Instant::now()),
                })
            })
            .clone();

        *entry.last_used.lock().await = Instant::now();

        let mut guard = entry.conn.lock().await;
        if guard.is_none() {
            *guard = Some(connect(address).await?);
        }

        let stream = guard.as_mut().expect("connection just established");
        match f(stream).await {
            Ok(value) => Ok(value),
            Err(_) => {
                // One reconnect attempt; if that also fails, surface as
                // RunnerUnavailable and drop the dead connection.
                *guard = Some(connect(address).await?);
                let stream = guard.as_mut().expect("connection just re-established");
                f(stream)
                    .await
                    .map_err(|_| Error::RunnerUnavailable(address.to_string()))
            }
        }
    }

    pub fn evict(&self, address: &RunnerAddress) {
        self.entries.remove(address);
    }
}

async fn connect(address: RunnerAddress) -> Result<TcpStream, Error> {
    TcpStream::connect(address.socket_addr())
        .await
        .map_err(|_| Error::RunnerUnavailable(address.to_string()))
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_surfaces_runner_unavailable() {
        let pool = ConnectionPool::new();
        let address: RunnerAddress = "127.0.0.1:1".parse().unwrap();
        let result = pool
            .with_connection(address, |_stream| async { Ok::<(), Error>(()) })
            .await;
        assert!(matches!(result, Err(Error::RunnerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_evict_removes_entry() {
        let pool = ConnectionPool::new();
        let address: RunnerAddress = "127.0.0.1:1".parse().unwrap();
        pool.entries.insert(
            address,
            Arc::new(Entry {
                conn: Mutex::new(None),
                last_used: Mutex::new(Instant::now()),
            }),
        );
        assert!(pool.entries.contains_key(&address));
        pool.evict(&address);
        assert!(!pool.entries.contains_key(&address));
    }
}
