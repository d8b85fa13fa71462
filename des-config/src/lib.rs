//! Configuration surface for every DES binary.
//!
//! Structs here are plain serde-derived data with `#[serde(default)]` on every
//! optional field, loaded with `serde_json5` so config files may carry
//! comments and trailing commas. Path-like fields are expanded with
//! `shellexpand` by the caller before being deserialized further (e.g. `~` in
//! `work_dir`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_node_id() -> u8 {
    0
}

fn default_wrap_bits() -> u8 {
    22
}

fn default_shard_bits() -> u8 {
    8
}

/// Feeds the name generator (§4.E). `node_id` must fit in the low 8 bits of
/// the 48-bit `F` field; `wrap_bits` sizes the time-low window before it
/// wraps back to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier baked into every generated name. Default: 0.
    #[serde(default = "default_node_id")]
    pub node_id: u8,
    /// Width in bits of the low time field. Default: 22 (~69 minutes before wraparound).
    #[serde(default = "default_wrap_bits")]
    pub wrap_bits: u8,
    /// log2(total shard count). Default: 8 (256 shards).
    #[serde(default = "default_shard_bits")]
    pub shard_bits: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: default_node_id(),
            wrap_bits: default_wrap_bits(),
            shard_bits: default_shard_bits(),
        }
    }
}

fn default_big_file_threshold() -> u64 {
    100 * 1024 * 1024
}

/// Controls the writer's externalisation escape hatch (§4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Files at or above this size are stored as sibling objects instead of
    /// inline in the container's data region. Default: 100 MiB.
    #[serde(default = "default_big_file_threshold")]
    pub big_file_threshold: u64,
    /// Prefix under which externalised payloads are written, as
    /// `<external_prefix>/_bigFiles/<name>`. Required only when external
    /// storage is configured; all-or-nothing with `bucket`.
    #[serde(default)]
    pub external_prefix: Option<String>,
    /// Bucket used for externalised payloads. All-or-nothing with `external_prefix`.
    #[serde(default)]
    pub external_bucket: Option<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            big_file_threshold: default_big_file_threshold(),
            external_prefix: None,
            external_bucket: None,
        }
    }
}

fn default_max_gap_size() -> u64 {
    1024 * 1024
}

/// Controls read-path batching (§4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Maximum byte gap between two adjacent requested files before they are
    /// split into separate range reads. Default: 1 MiB.
    #[serde(default = "default_max_gap_size")]
    pub max_gap_size: u64,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            max_gap_size: default_max_gap_size(),
            cache: CacheConfig::default(),
        }
    }
}

/// Index cache backend selection (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Remote,
    Null,
}

impl Default for CacheBackend {
    fn default() -> Self {
        CacheBackend::Memory
    }
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_size() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Which backend implementation to instantiate. Default: memory.
    #[serde(default)]
    pub backend: CacheBackend,
    /// Time-to-live for a cached index entry, in seconds. Default: 3600.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of container indices kept resident (memory backend only). Default: 10000.
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            backend: CacheBackend::default(),
            ttl_secs: default_cache_ttl_secs(),
            max_size: default_cache_max_size(),
        }
    }
}

/// Exponential backoff with jitter, shared by every component that retries
/// transient I/O (§4.H, §7).
///
/// Delay for attempt `k` (1-indexed) is `base_delay_ms * backoff_base^(k-1)`,
/// optionally perturbed by `±jitter_ratio`. With the defaults
/// (`base_delay_ms=100`, `backoff_base=2.0`), attempts produce delays of
/// approximately 100ms, 200ms, 400ms, 800ms before `max_retries` is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retry {
    /// Maximum number of attempts before giving up. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for the first retry. Default: 100.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt. Default: 2.0.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// Whether to randomize the computed delay by up to this fraction either way. Default: 0.5.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_backoff_base() -> f64 {
    2.0
}
fn default_jitter_ratio() -> f64 {
    0.5
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_base: default_backoff_base(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl Retry {
    /// Delay before the given 1-indexed attempt, without jitter applied.
    pub fn base_delay(&self, attempt: u32) -> std::time::Duration {
        let ms = self.base_delay_ms as f64 * self.backoff_base.powi(attempt as i32 - 1);
        std::time::Duration::from_millis(ms.round() as u64)
    }
}

fn default_batch_size() -> u32 {
    200
}
fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_checkpoint_every_files() -> u64 {
    100
}
fn default_checkpoint_every_seconds() -> u64 {
    30
}
fn default_loop_sleep_secs() -> u64 {
    5
}

/// Main ingest loop parameters (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Shard ids this process owns.
    #[serde(default)]
    pub shard_ids: Vec<u32>,
    /// Number of source files claimed per shard per iteration. Default: 200.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Shard lease TTL in seconds. Default: 30.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Checkpoint the catalog row every N appended files. Default: 100.
    #[serde(default = "default_checkpoint_every_files")]
    pub checkpoint_every_files: u64,
    /// Checkpoint the catalog row at least this often, in seconds. Default: 30.
    #[serde(default = "default_checkpoint_every_seconds")]
    pub checkpoint_every_seconds: u64,
    /// Sleep between passes over all owned shards. Default: 5s.
    #[serde(default = "default_loop_sleep_secs")]
    pub loop_sleep_secs: u64,
    /// Local scratch directory for in-progress containers.
    pub work_dir: PathBuf,
    /// Object-store prefix finalised containers are uploaded under.
    pub dest_prefix: String,
    /// Bucket finalised containers are uploaded to.
    pub dest_bucket: String,
    #[serde(default)]
    pub db_retry: Retry,
    #[serde(default = "default_upload_retry")]
    pub upload_retry: Retry,
}

fn default_upload_retry() -> Retry {
    Retry {
        max_retries: 5,
        ..Retry::default()
    }
}

fn default_claim_timeout_secs() -> u64 {
    300
}
fn default_container_grace_secs() -> u64 {
    900
}

/// Crash-recovery sweep parameters (§4.I).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// A claim older than this with no heartbeat is considered stale. Default: 300s.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    /// A `writing` container older than this is eligible for reconciliation. Default: 900s.
    #[serde(default = "default_container_grace_secs")]
    pub container_grace_secs: u64,
    /// Whether to delete object-store keys under the prefix with no DB row. Default: true.
    #[serde(default = "default_true")]
    pub cleanup_orphaned_objects: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            claim_timeout_secs: default_claim_timeout_secs(),
            container_grace_secs: default_container_grace_secs(),
            cleanup_orphaned_objects: true,
        }
    }
}

fn default_cb_threshold() -> u32 {
    5
}
fn default_cb_timeout_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_router_max_retries() -> u32 {
    3
}

/// Routing strategy for the router service (§4.K).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    HashByte,
    RoundRobin,
    Weighted,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::HashByte
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverEndpointConfig {
    pub id: String,
    pub url: String,
    /// Relative weight, only consulted under the `weighted` strategy. Default: 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub bind_addr: String,
    pub retrievers: Vec<RetrieverEndpointConfig>,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    /// Consecutive failures before an endpoint is marked unhealthy. Default: 5.
    #[serde(default = "default_cb_threshold")]
    pub cb_threshold: u32,
    /// Seconds an unhealthy endpoint is skipped before being retried. Default: 30.
    #[serde(default = "default_cb_timeout_secs")]
    pub cb_timeout_secs: u64,
    /// Per-request timeout against the upstream retriever, in seconds. Default: 30.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Max upstream attempts before returning 503. Default: 3.
    #[serde(default = "default_router_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    pub bind_addr: String,
    /// Object-store bucket containing DES containers.
    pub container_bucket: String,
    /// Object-store prefix containers live under, e.g. `des`.
    pub container_prefix: String,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

fn default_marker_batch_size() -> u32 {
    500
}
fn default_marker_max_age_secs() -> u64 {
    60
}
fn default_marker_rate() -> f64 {
    50.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Rows selected per batch. Default: 500.
    #[serde(default = "default_marker_batch_size")]
    pub batch_size: u32,
    /// Minimum row age before it is eligible for marking, in seconds. Default: 60.
    #[serde(default = "default_marker_max_age_secs")]
    pub max_age_secs: u64,
    /// Token-bucket refill rate, in ops/sec. Default: 50.
    #[serde(default = "default_marker_rate")]
    pub rate_per_sec: f64,
    /// Token-bucket capacity. Default: 2x rate.
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub node: NodeConfig,
    /// Sleep between batches when nothing was found, in seconds. Default: 5.
    #[serde(default = "default_loop_sleep_secs")]
    pub loop_sleep_secs: u64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        MarkerConfig {
            batch_size: default_marker_batch_size(),
            max_age_secs: default_marker_max_age_secs(),
            rate_per_sec: default_marker_rate(),
            capacity: None,
            retry: Retry::default(),
            node: NodeConfig::default(),
            loop_sleep_secs: default_loop_sleep_secs(),
        }
    }
}

/// Column-mapped view over one external source database's file-tracking
/// table (§3.9, §6.4). Lets the marker/packer stay schema-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_claimed_by_column")]
    pub claimed_by_column: String,
    #[serde(default = "default_claimed_at_column")]
    pub claimed_at_column: String,
    #[serde(default = "default_bucket_column")]
    pub s3_bucket_column: String,
    #[serde(default = "default_key_column")]
    pub s3_key_column: String,
    #[serde(default = "default_size_column")]
    pub size_column: String,
    #[serde(default)]
    pub metadata_columns: Vec<String>,
    #[serde(default = "default_pending_status")]
    pub pending_status: String,
    #[serde(default = "default_claimed_status")]
    pub claimed_status: String,
    #[serde(default = "default_packed_status")]
    pub packed_status: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_id_column() -> String {
    "id".into()
}
fn default_status_column() -> String {
    "status".into()
}
fn default_claimed_by_column() -> String {
    "claimed_by".into()
}
fn default_claimed_at_column() -> String {
    "claimed_at".into()
}
fn default_bucket_column() -> String {
    "source_bucket".into()
}
fn default_key_column() -> String {
    "source_key".into()
}
fn default_size_column() -> String {
    "size_bytes".into()
}
fn default_pending_status() -> String {
    "pending".into()
}
fn default_claimed_status() -> String {
    "claimed".into()
}
fn default_packed_status() -> String {
    "packed".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MultiSourceConfig {
    pub sources: Vec<SourceConfig>,
}

impl MultiSourceConfig {
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

/// Logging verbosity/format, read by every binary's entry point (§4.O).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level configuration aggregating every surface in §6.6. A binary reads
/// only the sub-structs it needs, but they're all loaded together so a single
/// config file can describe a whole deployment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DesConfig {
    pub database_url: String,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub packer: Option<PackerConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub router: Option<RouterConfig>,
    #[serde(default)]
    pub retriever: Option<RetrieverConfig>,
    #[serde(default)]
    pub marker: MarkerConfig,
    #[serde(default)]
    pub sources: MultiSourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Loads and expands (`~`, `$VARS`) a JSON5 config file from disk.
pub fn load_config(path: &std::path::Path) -> Result<DesConfig, des_error::Error> {
    use des_error::ResultExt;
    let raw = std::fs::read_to_string(path).err_tip(|| format!("reading config at {path:?}"))?;
    let expanded = shellexpand::full(&raw)
        .map_err(|e| des_error::Error::new(des_error::Code::InvalidArgument, e.to_string()))?;
    serde_json5::from_str(&expanded).err_tip(|| format!("parsing config at {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults_produce_expected_backoff_table() {
        let retry = Retry::default();
        assert_eq!(retry.base_delay(1).as_millis(), 100);
        assert_eq!(retry.base_delay(2).as_millis(), 200);
        assert_eq!(retry.base_delay(3).as_millis(), 400);
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let json = r#"{ "database_url": "postgres://x" }"#;
        let cfg: DesConfig = serde_json5::from_str(json).unwrap();
        assert_eq!(cfg.node.shard_bits, 8);
        assert_eq!(cfg.writer.big_file_threshold, 100 * 1024 * 1024);
        assert_eq!(cfg.marker.rate_per_sec, 50.0);
    }

    #[test]
    fn source_config_defaults_column_mapping() {
        let json = r#"{ "name": "orders", "table": "source_files" }"#;
        let cfg: SourceConfig = serde_json5::from_str(json).unwrap();
        assert_eq!(cfg.id_column, "id");
        assert_eq!(cfg.pending_status, "pending");
        assert!(cfg.enabled);
    }
}
