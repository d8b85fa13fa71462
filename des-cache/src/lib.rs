//! Index caching: key derivation and pluggable backends (spec §4.B).

pub mod backend;
pub mod key;

pub use backend::{InMemoryIndexCache, IndexCacheBackend, NullCache, RemoteIndexCache, RemoteKvClient};
pub use key::{local_cache_key, s3_cache_key};
