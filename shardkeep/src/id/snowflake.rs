//! 64-bit monotonic id: `(timestamp_ms - epoch) << 22 | machineId << 10 | sequence`.
//!
//! Relies on two invariants:
//!
//! 1. `machineId` is unique among live runners; it's handed out by the shard
//!    manager at registration and fixed for the lifetime of the process.
//! 2. The process clock is reasonably accurate (corrected by
//!    [`crate::clock::SynchronizedClock`] for cross-runner comparisons).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

const MACHINE_BITS: u64 = 12;
const SEQUENCE_BITS: u64 = 10;
const TIMESTAMP_BITS: u64 = 41;
const MAX_MACHINE_ID: u64 = (1 << MACHINE_BITS) - 1; // 4095
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1; // 1023
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;
const MACHINE_SHIFT: u8 = SEQUENCE_BITS as u8; // 10
const TIMESTAMP_SHIFT: u8 = (SEQUENCE_BITS + MACHINE_BITS) as u8; // 22

/// The epoch all timestamps are relative to: 2026-01-01T00:00:00Z.
pub const DEFAULT_EPOCH_MS: u64 = 1_767_225_600_000;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("machine id exceeds maximum ({MAX_MACHINE_ID}): {0}")]
    MachineIdTooLarge(u64),

    #[error("machine id already assigned for this generator")]
    MachineIdAlreadySet,

    #[error("generator has no machine id yet; register with the shard manager first")]
    MachineIdNotSet,
}

#[derive(Debug, Default)]
struct State {
    last_timestamp_ms: u64,
    sequence: u64,
}

impl State {
    async fn next_id(&mut self, machine_id: u64, epoch_ms: u64) -> u64 {
        let mut now = wait_until(self.last_timestamp_ms).await;

        if now == self.last_timestamp_ms {
            self.sequence = (self.sequence + 1) & MAX_SEQUENCE;
            if self.sequence == 0 {
                now = wait_until(now + 1).await;
            }
        } else {
            self.sequence = 0;
        }

        self.last_timestamp_ms = now;

        let elapsed = self.last_timestamp_ms.saturating_sub(epoch_ms);
        assert!(
            elapsed <= MAX_TIMESTAMP,
            "snowflake timestamp overflow: {elapsed} > {MAX_TIMESTAMP}"
        );

        let timestamp_part = (elapsed & MAX_TIMESTAMP) << TIMESTAMP_SHIFT;
        let machine_part = machine_id << MACHINE_SHIFT;
        timestamp_part | machine_part | self.sequence
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before UNIX_EPOCH")
        .as_millis() as u64
}

async fn wait_until(target_ms: u64) -> u64 {
    loop {
        let now = now_ms();
        if now >= target_ms {
            return now;
        }
        sleep(Duration::from_millis(1)).await;
    }
}

/// Generator of monotonically increasing, globally unique 64-bit ids.
///
/// Constructed without a machine id; [`Snowflake::set_machine_id`] is called
/// once the owning runner has registered with the shard manager and learned
/// its assignment.
#[derive(Debug)]
pub struct Snowflake {
    machine_id: OnceCell<u64>,
    epoch_ms: u64,
    state: Mutex<State>,
}

impl Snowflake {
    pub fn new(epoch_ms: u64) -> Self {
        Self {
            machine_id: OnceCell::new(),
            epoch_ms,
            state: Mutex::new(State::default()),
        }
    }

    /// Assign the machine id this generator will stamp onto every id.
    /// Can only be called once.
    pub fn set_machine_id(&self, machine_id: u64) -> Result<(), Error> {
        if machine_id > MAX_MACHINE_ID {
            return Err(Error::MachineIdTooLarge(machine_id));
        }
        self.machine_id
            .set(machine_id)
            .map_err(|_| Error::MachineIdAlreadySet)
    }

    pub fn machine_id(&self) -> Option<u64> {
        self.machine_id.get().copied()
    }

    /// Generate the next id. Fails until a machine id has been assigned.
    pub async fn next_id(&self) -> Result<i64, Error> {
        let machine_id = *self.machine_id.get().ok_or(Error::MachineIdNotSet)?;
        let mut state = self.state.lock().await;
        Ok(state.next_id(machine_id, self.epoch_ms).await as i64)
    }
}

impl Default for Snowflake {
    fn default() -> Self {
        Self::new(DEFAULT_EPOCH_MS)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_requires_machine_id() {
        let snowflake = Snowflake::default();
        assert_eq!(snowflake.next_id().await, Err(Error::MachineIdNotSet));
    }

    #[tokio::test]
    async fn test_machine_id_set_once() {
        let snowflake = Snowflake::default();
        snowflake.set_machine_id(3).unwrap();
        assert_eq!(snowflake.set_machine_id(4), Err(Error::MachineIdAlreadySet));
        assert_eq!(snowflake.machine_id(), Some(3));
    }

    #[tokio::test]
    async fn test_machine_id_too_large() {
        let snowflake = Snowflake::default();
        assert_eq!(
            snowflake.set_machine_id(MAX_MACHINE_ID + 1),
            Err(Error::MachineIdTooLarge(MAX_MACHINE_ID + 1))
        );
    }

    #[tokio::test]
    async fn test_unique_ids() {
        let snowflake = Snowflake::default();
        snowflake.set_machine_id(1).unwrap();

        let mut ids = HashSet::new();
        for _ in 0..5_000 {
            ids.insert(snowflake.next_id().await.unwrap());
        }
        assert_eq!(ids.len(), 5_000);
    }

    #[tokio::test]
    async fn test_monotonically_increasing() {
        let mut state = State::default();
        let mut prev = 0u64;
        for _ in 0..5_000 {
            let id = state.next_id(7, DEFAULT_EPOCH_MS).await;
            assert!(id > prev, "id {id} not greater than previous {prev}");
            prev = id;
        }
    }

    #[tokio::test]
    async fn test_always_positive() {
        let mut state = State::default();
        for _ in 0..5_000 {
            let id = state.next_id(MAX_MACHINE_ID, DEFAULT_EPOCH_MS).await;
            assert!((id as i64) > 0);
        }
    }

    #[test]
    fn test_bit_layout() {
        assert_eq!(TIMESTAMP_BITS + MACHINE_BITS + SEQUENCE_BITS, 63);
        assert_eq!(TIMESTAMP_SHIFT, 22);
        assert_eq!(MACHINE_SHIFT, 10);
    }

    #[tokio::test]
    async fn test_extract_components() {
        let machine: u64 = 42;
        let mut state = State::default();

        let id = state.next_id(machine, DEFAULT_EPOCH_MS).await;

        let extracted_seq = id & MAX_SEQUENCE;
        let extracted_machine = (id >> MACHINE_SHIFT) & MAX_MACHINE_ID;

        assert_eq!(extracted_machine, machine);
        assert_eq!(extracted_seq, 0);
    }

    #[tokio::test]
    async fn test_different_machines_distinguishable_same_tick() {
        let mut a = State::default();
        let mut b = State::default();
        let id_a = a.next_id(1, DEFAULT_EPOCH_MS).await;
        let id_b = b.next_id(2, DEFAULT_EPOCH_MS).await;
        assert_ne!(id_a, id_b);
        assert_eq!((id_a >> MACHINE_SHIFT) & MAX_MACHINE_ID, 1);
        assert_eq!((id_b >> MACHINE_SHIFT) & MAX_MACHINE_ID, 2);
    }
}
