//! Core data model shared by every component.

pub mod entity_address;
pub mod envelope;
pub mod exit;
pub mod primary_key;
pub mod reply;
pub mod runner;
pub mod save_result;
pub mod shard_id;

pub use entity_address::EntityAddress;
pub use envelope::Envelope;
pub use exit::Exit;
pub use primary_key::PrimaryKey;
pub use reply::Reply;
pub use runner::{Runner, RunnerAddress};
pub use save_result::SaveResult;
pub use shard_id::ShardId;
