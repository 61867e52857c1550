//! Cluster-wide wall-clock correction.
//!
//! Every runner's local clock drifts a little from the shard manager's. This
//! module samples the shard manager's clock, estimates the offset using the
//! same trick NTP uses (round-trip halved, median of several samples), and
//! exposes a corrected `now_ms()` that every timestamp in the system
//! (envelopes, Snowflakes) should go through instead of `SystemTime::now()`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SAMPLE_COUNT: usize = 5;
const RESAMPLE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Weight given to a fresh sample when folding it into the running estimate.
const DRIFT_SMOOTHING: f64 = 0.2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to sample shard manager time: {0}")]
    Sample(String),

    #[error("all {0} time samples failed")]
    AllSamplesFailed(usize),
}

/// Something that can answer "what time is it" for the shard manager.
/// Implemented by the runners transport in terms of its `GetTime` RPC; kept
/// as a trait here so this module has no dependency on the transport layer.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Returns the shard manager's current wall-clock time in epoch millis.
    async fn remote_time_ms(&self) -> Result<i64, Error>;
}

fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A corrected clock, continuously resynchronized against a [`TimeSource`].
pub struct SynchronizedClock {
    offset_ms: Arc<AtomicI64>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SynchronizedClock {
    /// Construct a clock with no correction applied yet. Call
    /// [`SynchronizedClock::launch`] to start the background resample loop.
    pub fn new() -> Self {
        Self {
            offset_ms: Arc::new(AtomicI64::new(0)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Current corrected time, in epoch millis.
    pub fn now_ms(&self) -> i64 {
        local_now_ms() + self.offset_ms.load(Ordering::Relaxed)
    }

    /// Current estimated offset (remote - local), in millis.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Take one round of samples and fold the result into the running
    /// estimate. Exposed directly so tests don't have to wait on the
    /// background loop.
    pub async fn resync(&self, source: &dyn TimeSource) -> Result<(), Error> {
        let mut samples = Vec::with_capacity(SAMPLE_COUNT);
        let mut failures = 0;

        for _ in 0..SAMPLE_COUNT {
            let before = local_now_ms();
            match source.remote_time_ms().await {
                Ok(remote) => {
                    let after = local_now_ms();
                    let midpoint = before + (after - before) / 2;
                    samples.push(remote - midpoint);
                }
                Err(err) => {
                    failures += 1;
                    warn!("clock sample failed: {err}");
                }
            }
        }

        if samples.is_empty() {
            return Err(Error::AllSamplesFailed(failures));
        }

        samples.sort_unstable();
        let median = samples[samples.len() / 2];

        self.offset_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let blended =
                    current as f64 * (1.0 - DRIFT_SMOOTHING) + median as f64 * DRIFT_SMOOTHING;
                Some(blended.round() as i64)
            })
            .expect("fetch_update closure never returns None");

        Ok(())
    }

    /// Spawn the background resync loop: every [`RESAMPLE_INTERVAL`] on
    /// success, retrying after [`ERROR_RETRY_INTERVAL`] on failure.
    pub fn launch(self: &Arc<Self>, source: Arc<dyn TimeSource>) {
        let clock = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let wait = match clock.resync(source.as_ref()).await {
                    Ok(()) => {
                        info!(offset_ms = clock.offset_ms(), "clock resynchronized");
                        RESAMPLE_INTERVAL
                    }
                    Err(err) => {
                        error!("clock resync failed, retrying shortly: {err}");
                        ERROR_RETRY_INTERVAL
                    }
                };
                tokio::time::sleep(wait).await;
            }
        });
        *self.task.lock().expect("clock task lock poisoned") = Some(handle);
    }

    /// Stop the background resync loop, if running.
    pub fn shutdown(&self) {
        if let Some(handle) = self.task.lock().expect("clock task lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Default for SynchronizedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SynchronizedClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedOffset {
        offset_ms: i64,
    }

    #[async_trait]
    impl TimeSource for FixedOffset {
        async fn remote_time_ms(&self) -> Result<i64, Error> {
            Ok(local_now_ms() + self.offset_ms)
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl TimeSource for AlwaysFails {
        async fn remote_time_ms(&self) -> Result<i64, Error> {
            Err(Error::Sample("unreachable".into()))
        }
    }

    struct FlakyThenFixed {
        calls: AtomicUsize,
        offset_ms: i64,
    }

    #[async_trait]
    impl TimeSource for FlakyThenFixed {
        async fn remote_time_ms(&self) -> Result<i64, Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::Sample("flaky".into()))
            } else {
                Ok(local_now_ms() + self.offset_ms)
            }
        }
    }

    #[tokio::test]
    async fn test_resync_converges_towards_offset() {
        let clock = SynchronizedClock::new();
        let source = FixedOffset { offset_ms: 10_000 };

        for _ in 0..40 {
            clock.resync(&source).await.unwrap();
        }

        assert!(
            (clock.offset_ms() - 10_000).abs() < 50,
            "offset {} did not converge to 10000",
            clock.offset_ms()
        );
    }

    #[tokio::test]
    async fn test_resync_all_samples_failed() {
        let clock = SynchronizedClock::new();
        let err = clock.resync(&AlwaysFails).await.unwrap_err();
        assert!(matches!(err, Error::AllSamplesFailed(SAMPLE_COUNT)));
        assert_eq!(clock.offset_ms(), 0);
    }

    #[tokio::test]
    async fn test_resync_tolerates_partial_failures() {
        let clock = SynchronizedClock::new();
        let source = FlakyThenFixed {
            calls: AtomicUsize::new(0),
            offset_ms: 5_000,
        };

        clock.resync(&source).await.unwrap();
        assert!(clock.offset_ms() > 0);
    }

    #[test]
    fn test_now_ms_uses_offset() {
        let clock = SynchronizedClock::new();
        clock.offset_ms.store(1_000_000, Ordering::Relaxed);
        assert!(clock.now_ms() > local_now_ms());
    }

    #[tokio::test]
    async fn test_launch_and_shutdown() {
        let clock = Arc::new(SynchronizedClock::new());
        let source: Arc<dyn TimeSource> = Arc::new(FixedOffset { offset_ms: 1 });
        clock.launch(source);
        clock.shutdown();
    }
}
