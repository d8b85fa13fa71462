//! Index cache backends (spec §4.B): in-process LRU+TTL, a remote-KV-backed
//! variant, and a null backend that always misses.

use des_error::{make_err, Code, Error};
use des_format::IndexEntry;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub trait IndexCacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<IndexEntry>>;
    fn set(&self, key: &str, entries: Vec<IndexEntry>, ttl: Option<Duration>);
    fn delete(&self, key: &str);
    fn clear(&self);
}

struct Slot {
    entries: Vec<IndexEntry>,
    expires_at: Option<Instant>,
}

/// Thread-safe in-memory cache with lazy TTL expiry and LRU eviction.
pub struct InMemoryIndexCache {
    inner: Mutex<LruCache<String, Slot>>,
    default_ttl: Option<Duration>,
}

impl InMemoryIndexCache {
    pub fn new(max_size: usize, default_ttl: Option<Duration>) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("max(1) is never zero");
        InMemoryIndexCache {
            inner: Mutex::new(LruCache::new(cap)),
            default_ttl,
        }
    }
}

impl IndexCacheBackend for InMemoryIndexCache {
    fn get(&self, key: &str) -> Option<Vec<IndexEntry>> {
        let mut inner = self.inner.lock();
        let expired = match inner.peek(key) {
            Some(slot) => slot.expires_at.is_some_and(|at| Instant::now() > at),
            None => return None,
        };
        if expired {
            inner.pop(key);
            return None;
        }
        inner.get(key).map(|slot| slot.entries.clone())
    }

    fn set(&self, key: &str, entries: Vec<IndexEntry>, ttl: Option<Duration>) {
        let effective_ttl = ttl.or(self.default_ttl);
        let expires_at = effective_ttl.map(|ttl| Instant::now() + ttl);
        self.inner.lock().put(
            key.to_string(),
            Slot {
                entries,
                expires_at,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Wire-format mirror of `IndexEntry` for remote-cache serialisation, kept
/// separate from the codec type so the container format crate stays free of
/// a `serde` derive it has no other use for.
#[derive(Serialize, Deserialize)]
struct WireEntry {
    name: String,
    data_offset: u64,
    data_length: u64,
    meta_offset: u64,
    meta_length: u64,
    flags: u32,
}

impl From<&IndexEntry> for WireEntry {
    fn from(e: &IndexEntry) -> Self {
        WireEntry {
            name: e.name.clone(),
            data_offset: e.data_offset,
            data_length: e.data_length,
            meta_offset: e.meta_offset,
            meta_length: e.meta_length,
            flags: e.flags,
        }
    }
}

impl From<WireEntry> for IndexEntry {
    fn from(w: WireEntry) -> Self {
        IndexEntry {
            name: w.name,
            data_offset: w.data_offset,
            data_length: w.data_length,
            meta_offset: w.meta_offset,
            meta_length: w.meta_length,
            flags: w.flags,
        }
    }
}

/// Minimal contract a remote key-value store must offer for `RemoteIndexCache`.
/// A production implementation would wrap a real client (Redis, memcached);
/// this crate only ships the in-memory test double below.
pub trait RemoteKvClient: Send + Sync {
    fn kv_get(&self, key: &str) -> Option<String>;
    fn kv_set(&self, key: &str, value: String, ttl: Option<Duration>);
    fn kv_delete(&self, key: &str);
    fn kv_clear_prefix(&self, prefix: &str);
}

pub struct RemoteIndexCache<C: RemoteKvClient> {
    client: C,
    key_prefix: String,
    default_ttl: Option<Duration>,
}

impl<C: RemoteKvClient> RemoteIndexCache<C> {
    pub fn new(client: C, key_prefix: impl Into<String>, default_ttl: Option<Duration>) -> Self {
        RemoteIndexCache {
            client,
            key_prefix: key_prefix.into(),
            default_ttl,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

impl<C: RemoteKvClient> IndexCacheBackend for RemoteIndexCache<C> {
    fn get(&self, key: &str) -> Option<Vec<IndexEntry>> {
        let full_key = self.full_key(key);
        let raw = self.client.kv_get(&full_key)?;
        match serde_json::from_str::<Vec<WireEntry>>(&raw) {
            Ok(wire) => Some(wire.into_iter().map(IndexEntry::from).collect()),
            Err(_) => {
                // Corrupted cache entry: evict and treat as a miss.
                self.client.kv_delete(&full_key);
                None
            }
        }
    }

    fn set(&self, key: &str, entries: Vec<IndexEntry>, ttl: Option<Duration>) {
        let wire: Vec<WireEntry> = entries.iter().map(WireEntry::from).collect();
        let Ok(serialized) = serde_json::to_string(&wire) else {
            return;
        };
        let effective_ttl = ttl.or(self.default_ttl);
        self.client
            .kv_set(&self.full_key(key), serialized, effective_ttl);
    }

    fn delete(&self, key: &str) {
        self.client.kv_delete(&self.full_key(key));
    }

    fn clear(&self) {
        self.client.kv_clear_prefix(&self.key_prefix);
    }
}

/// No-op backend: always misses. Used to disable caching without branching
/// call sites.
pub struct NullCache;

impl IndexCacheBackend for NullCache {
    fn get(&self, _key: &str) -> Option<Vec<IndexEntry>> {
        None
    }
    fn set(&self, _key: &str, _entries: Vec<IndexEntry>, _ttl: Option<Duration>) {}
    fn delete(&self, _key: &str) {}
    fn clear(&self) {}
}

/// Builds a backend from configuration, surfacing a config error for
/// combinations that cannot be satisfied (e.g. a remote backend requested
/// without a client wired in by the caller).
pub fn require_capacity(max_size: usize) -> Result<usize, Error> {
    if max_size == 0 {
        return Err(make_err!(Code::InvalidArgument, "cache max_size must be positive"));
    }
    Ok(max_size)
}
