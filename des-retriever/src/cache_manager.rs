//! Index cache backend selection, grounded on
//! `des/retriever/cache_manager.py::build_cache`.

use std::sync::Arc;
use std::time::Duration;

use des_cache::{InMemoryIndexCache, IndexCacheBackend, NullCache};
use des_config::{CacheBackend, CacheConfig};
use des_error::{make_err, Code, Error};

/// Builds the configured cache backend. `CacheBackend::Remote` requires a
/// real `des_cache::RemoteKvClient` wiring this crate does not ship, so it is
/// rejected the same way the original rejects a missing `DES_REDIS_URL`.
pub fn build_cache(config: &CacheConfig) -> Result<Arc<dyn IndexCacheBackend>, Error> {
    match config.backend {
        CacheBackend::Memory => {
            Ok(Arc::new(InMemoryIndexCache::new(config.max_size, Some(Duration::from_secs(config.ttl_secs)))))
        }
        CacheBackend::Null => Ok(Arc::new(NullCache)),
        CacheBackend::Remote => Err(make_err!(
            Code::FailedPrecondition,
            "cache backend 'remote' requires a RemoteKvClient to be wired in by the deployment; none is configured"
        )),
    }
}
