//! Storage-agnostic access to a single container object (spec §4.B/§4.D).
//!
//! `Reader<B>` is written once against this trait; `LocalFileBackend` and
//! `S3Backend` are the two concrete address spaces the original supports
//! (`des_reader.py` and `s3_des_reader.py`).

use async_trait::async_trait;
use bytes::Bytes;
use des_error::Error;

#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub size: u64,
    /// Distinguishes object versions; local files use mtime, S3 objects use ETag.
    pub identity: String,
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn head(&self) -> Result<ObjectHead, Error>;
    async fn range_get(&self, offset: u64, length: u64) -> Result<Bytes, Error>;
    /// Fetches an externalised file in full from its sibling location.
    async fn external_get(&self, name: &str) -> Result<Bytes, Error>;
    /// Cache key identifying this exact object version, for the index cache.
    fn cache_key(&self, head: &ObjectHead) -> String;
    /// Human-readable identity for diagnostics and response headers.
    fn describe(&self) -> String;
}
