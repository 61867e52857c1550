//! Durable request/reply log and the liveness/shard-lock tables, each with
//! an in-memory backend (tests, single-process use) and a Postgres backend.

pub mod error;
pub mod memory_message;
pub mod memory_runner_storage;
pub mod message;
pub mod runner_storage;
pub mod sql_message;
pub mod sql_runner_storage;

pub use error::Error;
pub use memory_message::MemoryMessageStorage;
pub use memory_runner_storage::MemoryRunnerStorage;
pub use message::{MessageStorage, UnprocessedMessage};
pub use runner_storage::{RunnerRecord, RunnerStorage, LOCK_EXPIRATION_MS};
pub use sql_message::SqlMessageStorage;
pub use sql_runner_storage::SqlRunnerStorage;
