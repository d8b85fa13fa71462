//! File lookup against DES containers, grounded on
//! `des/retriever/file_handler.py::FileHandler`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aws_sdk_s3::Client;
use bytes::Bytes;
use des_cache::IndexCacheBackend;
use des_config::{NodeConfig, ReaderConfig};
use des_error::Error;
use des_store::{Reader, S3Backend};

use crate::metrics::RetrieverMetrics;

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub container: String,
    pub shard_id: u32,
    pub size: u64,
    pub is_external: bool,
}

pub struct FileHandler {
    s3: Client,
    bucket: String,
    prefix: String,
    node: NodeConfig,
    reader_config: ReaderConfig,
    cache: Arc<dyn IndexCacheBackend>,
    metrics: Arc<RetrieverMetrics>,
}

impl FileHandler {
    pub fn new(
        s3: Client,
        bucket: String,
        prefix: String,
        node: NodeConfig,
        reader_config: ReaderConfig,
        cache: Arc<dyn IndexCacheBackend>,
        metrics: Arc<RetrieverMetrics>,
    ) -> Self {
        FileHandler { s3, bucket, prefix, node, reader_config, cache, metrics }
    }

    pub fn compute_shard_id(&self, name: &str) -> Result<u32, Error> {
        des_assign::consistent_hash(name, self.node.shard_bits)
    }

    pub fn container_key(&self, name: &str) -> Result<String, Error> {
        let day = des_assign::parse_day(name)?;
        let shard_id = self.compute_shard_id(name)?;
        Ok(des_assign::container_key(&self.prefix, shard_id, self.node.shard_bits, day))
    }

    async fn open_reader(&self, key: &str) -> Result<Reader<S3Backend>, Error> {
        let backend = S3Backend::new(self.s3.clone(), self.bucket.clone(), key.to_string());
        let reader = Reader::open(backend).await?;
        Ok(reader.with_cache(self.cache.clone(), Some(Duration::from_secs(self.reader_config.cache.ttl_secs))))
    }

    pub async fn get_file(&self, name: &str) -> Result<(Bytes, FileInfo), Error> {
        let key = self.container_key(name)?;
        let start = Instant::now();
        let reader = self.open_reader(&key).await?;
        let content = reader.get_file(name).await?;
        self.metrics.store_latency_seconds.observe(start.elapsed().as_secs_f64());

        let meta = reader.get_meta(name).await?;
        let is_external = meta.get("is_external").and_then(|v| v.as_bool()).unwrap_or(false);
        self.metrics.file_size_bytes.observe(content.len() as f64);

        let info = FileInfo {
            container: key,
            shard_id: self.compute_shard_id(name)?,
            size: content.len() as u64,
            is_external,
        };
        Ok((content, info))
    }

    pub async fn file_exists(&self, name: &str) -> Result<Option<FileInfo>, Error> {
        let key = self.container_key(name)?;
        let start = Instant::now();
        let reader = self.open_reader(&key).await?;
        let stat = reader.stat(name).await;
        self.metrics.store_latency_seconds.observe(start.elapsed().as_secs_f64());

        match stat {
            Ok(stat) => Ok(Some(FileInfo {
                container: key,
                shard_id: self.compute_shard_id(name)?,
                size: stat.size,
                is_external: stat.is_external,
            })),
            Err(e) if e.code == des_error::Code::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
