pub mod mailbox;
pub mod open_metric;
pub mod shard_manager;
pub mod storage;

pub use mailbox::MailboxCounts;
pub use open_metric::{Measurement, Metric, OpenMetric};
pub use shard_manager::ShardManagerCounts;
pub use storage::StorageCounts;
