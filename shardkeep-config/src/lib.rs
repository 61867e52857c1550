pub mod core;
pub mod entity;
pub mod error;
pub mod general;
pub mod sharding;
pub mod storage;

pub use core::{Config, ConfigFile};
pub use entity::Entity;
pub use error::Error;
pub use general::{General, LogFormat};
pub use sharding::Sharding;
pub use storage::{Backend, Storage};
