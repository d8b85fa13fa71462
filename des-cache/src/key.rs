//! Cache-key derivation matching the reader's identity rules (spec §4.B).

use des_format::FORMAT_VERSION;

/// Cache key for a container addressed by local filesystem path.
///
/// Mirrors `"DES:{abspath}:{size}:{mtime}:{VERSION}"` so a changed file
/// invalidates the cache even if the path is reused.
pub fn local_cache_key(abs_path: &str, size: u64, mtime_secs: i64) -> String {
    format!("DES:{abs_path}:{size}:{mtime_secs}:{FORMAT_VERSION}")
}

/// Cache key for a container addressed by S3 bucket/key, scoped by ETag so a
/// replaced object is never served stale index data.
pub fn s3_cache_key(bucket: &str, key: &str, etag: &str) -> String {
    format!("{bucket}/{key}/{etag}")
}
