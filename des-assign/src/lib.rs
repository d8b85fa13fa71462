//! Name assignment and shard routing (spec §3.5, §3.7, §4.B).

pub mod name;
pub mod shard;

pub use name::{parse_day, SnowflakeNameConfig, SnowflakeNameGenerator};
pub use shard::{consistent_hash, container_key, shard_hex_width, ShardAssignment};
