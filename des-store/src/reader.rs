//! Backend-agnostic container reader: footer/index loading with caching,
//! single-file and batch range-read retrieval (spec §4.B, §4.D).
//!
//! Batch coalescing is ported from `s3_des_reader.py::_group_entries` /
//! `_fetch_batches`: entries are sorted by `data_offset`, merged whenever the
//! gap between two adjacent entries is `<= max_gap_size`, and each merged
//! group becomes a single range read that is then sliced back apart.

use crate::backend::ContainerBackend;
use bytes::Bytes;
use des_error::{make_err, Code, Error, ResultExt};
use des_format::constants::FOOTER_SIZE;
use des_format::{flags, Footer, IndexEntry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Entry metadata needed for a `HEAD`-style existence check, obtainable
/// without fetching the file's data bytes (only the already-cached index).
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub is_external: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DesStats {
    pub total_files: u64,
    pub internal_files: u64,
    pub external_files: u64,
    pub internal_size_bytes: u64,
    pub external_size_bytes: u64,
    pub archive_size_bytes: u64,
}

struct Index {
    by_name: HashMap<String, IndexEntry>,
    footer: Footer,
}

/// Reads one container object. Constructing a `Reader` eagerly fetches the
/// footer; the index itself is loaded lazily (from cache if present) on the
/// first call that needs it.
pub struct Reader<B: ContainerBackend> {
    backend: B,
    cache: Option<Arc<dyn des_cache::IndexCacheBackend>>,
    cache_ttl: Option<std::time::Duration>,
    index: RwLock<Option<Index>>,
}

impl<B: ContainerBackend> Reader<B> {
    pub async fn open(backend: B) -> Result<Self, Error> {
        Ok(Reader {
            backend,
            cache: None,
            cache_ttl: None,
            index: RwLock::new(None),
        })
    }

    pub fn with_cache(
        mut self,
        cache: Arc<dyn des_cache::IndexCacheBackend>,
        ttl: Option<std::time::Duration>,
    ) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    async fn load_index(&self) -> Result<(), Error> {
        if self.index.read().is_some() {
            return Ok(());
        }

        let head = self.backend.head().await?;
        let cache_key = self.backend.cache_key(&head);

        if let Some(cache) = &self.cache {
            if let Some(entries) = cache.get(&cache_key) {
                let by_name = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
                let footer = self.read_footer(head.size).await?;
                *self.index.write() = Some(Index { by_name, footer });
                return Ok(());
            }
        }

        let footer = self.read_footer(head.size).await?;
        let by_name = if footer.index_length == 0 {
            HashMap::new()
        } else {
            let raw = self
                .backend
                .range_get(footer.index_start, footer.index_length)
                .await?;
            let entries = des_format::decode_index(&raw, Some(footer.file_count))?;
            entries.into_iter().map(|e| (e.name.clone(), e)).collect()
        };

        if let Some(cache) = &self.cache {
            let entries: Vec<IndexEntry> = by_name.values().cloned().collect();
            cache.set(&cache_key, entries, self.cache_ttl);
        }

        *self.index.write() = Some(Index { by_name, footer });
        Ok(())
    }

    async fn read_footer(&self, object_size: u64) -> Result<Footer, Error> {
        let raw = self
            .backend
            .range_get(object_size.saturating_sub(FOOTER_SIZE), FOOTER_SIZE)
            .await
            .err_tip(|| "reading container footer")?;
        Footer::decode(&raw, object_size)
    }

    fn entry(&self, name: &str) -> Result<IndexEntry, Error> {
        let guard = self.index.read();
        let index = guard.as_ref().expect("load_index must run first");
        index
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| make_err!(Code::NotFound, "file not found: {name}"))
    }

    pub async fn get_file(&self, name: &str) -> Result<Bytes, Error> {
        self.load_index().await?;
        let entry = self.entry(name)?;
        if entry.is_external() {
            self.backend.external_get(&entry.name).await
        } else {
            self.backend.range_get(entry.data_offset, entry.data_length).await
        }
    }

    /// Existence + size check against the index alone, no data range read.
    pub async fn stat(&self, name: &str) -> Result<FileStat, Error> {
        self.load_index().await?;
        let entry = self.entry(name)?;
        Ok(FileStat { size: entry.data_length, is_external: entry.is_external() })
    }

    pub async fn get_meta(&self, name: &str) -> Result<serde_json::Value, Error> {
        self.load_index().await?;
        let entry = self.entry(name)?;
        let raw = self.backend.range_get(entry.meta_offset, entry.meta_length).await?;
        serde_json::from_slice(&raw).map_err(Error::from)
    }

    /// Fetches many files at once. Internal entries are grouped by gap and
    /// fetched with one range read per group; external entries are fetched
    /// individually. Names with no matching entry are silently skipped.
    pub async fn get_files_batch(
        &self,
        names: &[String],
        max_gap_size: u64,
    ) -> Result<HashMap<String, Bytes>, Error> {
        self.load_index().await?;

        let mut internal = Vec::new();
        let mut external = Vec::new();
        {
            let guard = self.index.read();
            let index = guard.as_ref().expect("load_index must run first");
            for name in names {
                if let Some(entry) = index.by_name.get(name) {
                    if entry.flags & flags::EXTERNAL != 0 {
                        external.push(entry.clone());
                    } else {
                        internal.push(entry.clone());
                    }
                }
            }
        }

        let mut results = HashMap::new();

        internal.sort_by_key(|e| e.data_offset);
        for group in group_by_gap(&internal, max_gap_size) {
            let first = &group[0];
            let last = &group[group.len() - 1];
            let start = first.data_offset;
            let total_len = (last.data_offset + last.data_length) - start;
            let batch_data = self.backend.range_get(start, total_len).await?;
            for entry in &group {
                let rel_start = (entry.data_offset - start) as usize;
                let rel_end = rel_start + entry.data_length as usize;
                results.insert(entry.name.clone(), batch_data.slice(rel_start..rel_end));
            }
        }

        for entry in external {
            if let Ok(data) = self.backend.external_get(&entry.name).await {
                results.insert(entry.name.clone(), data);
            }
        }

        Ok(results)
    }

    pub async fn list_files(&self, include_external: bool) -> Result<Vec<String>, Error> {
        self.load_index().await?;
        let guard = self.index.read();
        let index = guard.as_ref().expect("load_index must run first");
        Ok(index
            .by_name
            .values()
            .filter(|e| include_external || e.flags & flags::EXTERNAL == 0)
            .map(|e| e.name.clone())
            .collect())
    }

    pub async fn contains(&self, name: &str) -> Result<bool, Error> {
        self.load_index().await?;
        let guard = self.index.read();
        Ok(guard.as_ref().expect("load_index must run first").by_name.contains_key(name))
    }

    pub async fn stats(&self) -> Result<DesStats, Error> {
        self.load_index().await?;
        let guard = self.index.read();
        let index = guard.as_ref().expect("load_index must run first");
        let mut stats = DesStats {
            archive_size_bytes: index.footer.index_start + index.footer.index_length + FOOTER_SIZE,
            ..Default::default()
        };
        for entry in index.by_name.values() {
            stats.total_files += 1;
            if entry.flags & flags::EXTERNAL != 0 {
                stats.external_files += 1;
                stats.external_size_bytes += entry.data_length;
            } else {
                stats.internal_files += 1;
                stats.internal_size_bytes += entry.data_length;
            }
        }
        Ok(stats)
    }
}

fn group_by_gap(entries: &[IndexEntry], max_gap_size: u64) -> Vec<Vec<IndexEntry>> {
    let mut batches: Vec<Vec<IndexEntry>> = Vec::new();
    for entry in entries {
        match batches.last_mut() {
            Some(batch) => {
                let prev = &batch[batch.len() - 1];
                let prev_end = prev.data_offset + prev.data_length;
                let gap = entry.data_offset.saturating_sub(prev_end);
                if gap <= max_gap_size {
                    batch.push(entry.clone());
                } else {
                    batches.push(vec![entry.clone()]);
                }
            }
            None => batches.push(vec![entry.clone()]),
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFileBackend;
    use des_format::Writer;
    use std::io::Write as _;

    async fn build_container(path: &std::path::Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = Writer::new(file, u64::MAX, None).unwrap();
        writer.add("a.txt", b"hello", serde_json::json!({"k": "v"})).unwrap();
        writer.add("b.txt", b"world!", serde_json::json!({})).unwrap();
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn round_trips_file_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.des");
        build_container(&path).await;

        let reader = Reader::open(LocalFileBackend::new(&path)).await.unwrap();
        assert_eq!(&reader.get_file("a.txt").await.unwrap()[..], b"hello");
        let meta = reader.get_meta("a.txt").await.unwrap();
        assert_eq!(meta["k"], "v");
        assert!(reader.contains("b.txt").await.unwrap());
        assert!(!reader.contains("missing").await.unwrap());
    }

    #[tokio::test]
    async fn stat_reports_size_without_is_external() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.des");
        build_container(&path).await;

        let reader = Reader::open(LocalFileBackend::new(&path)).await.unwrap();
        let stat = reader.stat("a.txt").await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_external);
        assert!(reader.stat("missing").await.is_err());
    }

    #[tokio::test]
    async fn batch_fetch_covers_all_requested_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.des");
        build_container(&path).await;

        let reader = Reader::open(LocalFileBackend::new(&path)).await.unwrap();
        let names = vec!["a.txt".to_string(), "b.txt".to_string()];
        let batch = reader.get_files_batch(&names, 1024).await.unwrap();
        assert_eq!(&batch["a.txt"][..], b"hello");
        assert_eq!(&batch["b.txt"][..], b"world!");
    }

    #[tokio::test]
    async fn stats_counts_internal_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.des");
        build_container(&path).await;

        let reader = Reader::open(LocalFileBackend::new(&path)).await.unwrap();
        let stats = reader.stats().await.unwrap();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.internal_files, 2);
        assert_eq!(stats.external_files, 0);
    }

    #[test]
    fn group_by_gap_merges_adjacent_and_splits_far() {
        let e = |offset: u64, len: u64| IndexEntry {
            name: format!("{offset}"),
            data_offset: offset,
            data_length: len,
            meta_offset: 0,
            meta_length: 0,
            flags: 0,
        };
        let entries = vec![e(0, 10), e(10, 10), e(25, 10), e(1000, 10)];
        let groups = group_by_gap(&entries, 10);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn external_sink_smoke() {
        use crate::sink::LocalExternalSink;
        use des_format::ExternalSink as _;
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LocalExternalSink::new(dir.path());
        sink.put("pfx/_bigFiles/big.bin", b"payload").unwrap();
        let out = std::fs::read(dir.path().join("pfx/_bigFiles/big.bin")).unwrap();
        assert_eq!(out, b"payload");
    }
}
