//! Globally unique 64-bit snowflake ID generator.

pub mod snowflake;

pub use snowflake::{Error, Snowflake};
