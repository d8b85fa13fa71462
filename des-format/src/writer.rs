//! Streaming container writer (spec §4.C).
//!
//! Data is streamed straight to the underlying `Write` as `add` is called, so
//! a container larger than available RAM can still be produced. Metadata
//! blobs and index entries are buffered in memory until `close`, which is
//! consistent with the original writer's two-phase approach (append data
//! eagerly, assemble meta+index lazily).

use crate::constants::{flags, FOOTER_SIZE, HEADER_SIZE, MAX_META_LEN};
use crate::footer::{encode_header, Footer};
use crate::index::{validate_name, IndexEntry};
use des_error::{make_err, Code, Error, ResultExt};
use std::io::Write;

/// Abstraction over "put this blob at this key", implemented by `des-store`
/// against S3 and by an in-memory double in tests. Kept decoupled from any
/// particular object-store SDK so the codec crate has no cloud dependency.
pub trait ExternalSink {
    fn put(&mut self, key: &str, data: &[u8]) -> Result<(), Error>;
}

/// An externalised side-object published after `close`, so the caller (the
/// packer) can record it in the catalog.
#[derive(Debug, Clone)]
pub struct ExternalObjectInfo {
    pub name: String,
    pub key: String,
    pub size: u64,
}

struct PendingMeta {
    relative_offset: u64,
    length: u64,
}

enum State {
    Open,
    Closed,
}

/// Configuration for the externalisation escape hatch. All-or-nothing: a
/// writer either has external storage fully configured or not at all (spec
/// §4.C). The sink is owned rather than borrowed so a `Writer` can be kept
/// open (and moved between tasks) for the lifetime of a shard's container,
/// rather than being tied to a borrow that outlives it.
pub struct ExternalConfig {
    pub sink: Box<dyn ExternalSink + Send>,
    pub external_prefix: String,
}

pub struct Writer<W: Write> {
    out: W,
    state: State,
    write_offset: u64,
    meta_buf: Vec<u8>,
    entries: Vec<IndexEntry>,
    pending_meta: Vec<PendingMeta>,
    big_file_threshold: u64,
    external: Option<ExternalConfig>,
    externalised: Vec<ExternalObjectInfo>,
}

impl<W: Write> Writer<W> {
    /// Creates a new writer, writing the 16-byte header immediately.
    ///
    /// `external` must be `Some` for any call to `add` with `|data| >=
    /// big_file_threshold` to succeed; a writer with no external config simply
    /// stores everything inline regardless of size.
    pub fn new(mut out: W, big_file_threshold: u64, external: Option<ExternalConfig>) -> Result<Self, Error> {
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        encode_header(&mut header);
        out.write_all(&header).err_tip(|| "writing container header")?;
        Ok(Writer {
            out,
            state: State::Open,
            write_offset: HEADER_SIZE,
            meta_buf: Vec::new(),
            entries: Vec::new(),
            pending_meta: Vec::new(),
            big_file_threshold,
            external,
            externalised: Vec::new(),
        })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        match self.state {
            State::Open => Ok(()),
            State::Closed => Err(make_err!(Code::FailedPrecondition, "writer is closed")),
        }
    }

    /// Appends one file. `meta` is any JSON-serialisable value; `is_external`
    /// fields are injected automatically when externalisation triggers.
    pub fn add(&mut self, name: &str, data: &[u8], meta: serde_json::Value) -> Result<(), Error> {
        self.ensure_open()?;
        validate_name(name)?;

        let mut meta = match meta {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let data_len = data.len() as u64;
        let should_externalise = data_len >= self.big_file_threshold && self.external.is_some();

        let (data_offset, data_length, entry_flags) = if should_externalise {
            let ext = self.external.as_mut().expect("checked is_some above");
            let key = format!("{}/_bigFiles/{}", ext.external_prefix, name);
            ext.sink.put(&key, data).err_tip(|| format!("externalising '{name}' to {key}"))?;
            meta.insert("is_external".to_string(), serde_json::Value::Bool(true));
            meta.insert("external_key".to_string(), serde_json::Value::String(key.clone()));
            self.externalised.push(ExternalObjectInfo {
                name: name.to_string(),
                key,
                size: data_len,
            });
            (0u64, data_len, flags::EXTERNAL)
        } else {
            let offset = self.write_offset;
            self.out.write_all(data).err_tip(|| format!("writing data for '{name}'"))?;
            self.write_offset += data_len;
            (offset, data_len, 0u32)
        };

        let meta_bytes = serde_json::to_vec(&serde_json::Value::Object(meta))?;
        if meta_bytes.len() as u64 > MAX_META_LEN {
            return Err(make_err!(
                Code::InvalidArgument,
                "metadata for '{name}' is {} bytes, exceeds max {MAX_META_LEN}",
                meta_bytes.len()
            ));
        }
        let relative_offset = self.meta_buf.len() as u64;
        self.meta_buf.extend_from_slice(&meta_bytes);
        self.pending_meta.push(PendingMeta {
            relative_offset,
            length: meta_bytes.len() as u64,
        });

        self.entries.push(IndexEntry {
            name: name.to_string(),
            data_offset,
            data_length,
            meta_offset: 0, // rewritten to absolute in `close`.
            meta_length: meta_bytes.len() as u64,
            flags: entry_flags,
        });
        let _ = data_length; // already stored on the entry above.

        Ok(())
    }

    /// Flushes the meta region, index region, and footer. Idempotent: a
    /// second call is a no-op and returns the same externalised-object list.
    pub fn close(mut self) -> Result<Vec<ExternalObjectInfo>, Error> {
        if matches!(self.state, State::Closed) {
            return Ok(self.externalised);
        }

        let data_start = HEADER_SIZE;
        let data_length = self.write_offset - HEADER_SIZE;
        let meta_start = self.write_offset;

        self.out
            .write_all(&self.meta_buf)
            .err_tip(|| "writing meta region")?;
        let meta_length = self.meta_buf.len() as u64;

        for (entry, pending) in self.entries.iter_mut().zip(self.pending_meta.iter()) {
            entry.meta_offset = meta_start + pending.relative_offset;
            entry.meta_length = pending.length;
        }

        let mut index_buf = Vec::new();
        for entry in &self.entries {
            entry.encode(&mut index_buf);
        }
        self.out
            .write_all(&index_buf)
            .err_tip(|| "writing index region")?;

        let index_start = meta_start + meta_length;
        let index_length = index_buf.len() as u64;

        let footer = Footer {
            version: crate::constants::FORMAT_VERSION,
            data_start,
            data_length,
            meta_start,
            meta_length,
            index_start,
            index_length,
            file_count: self.entries.len() as u64,
        };
        self.out
            .write_all(&footer.encode())
            .err_tip(|| "writing footer")?;
        self.out.flush().err_tip(|| "flushing container output")?;

        self.state = State::Closed;
        let _ = FOOTER_SIZE;
        Ok(std::mem::take(&mut self.externalised))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::decode_index;
    use std::collections::HashMap;

    struct MemSink {
        objects: HashMap<String, Vec<u8>>,
    }

    impl ExternalSink for MemSink {
        fn put(&mut self, key: &str, data: &[u8]) -> Result<(), Error> {
            self.objects.insert(key.to_string(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn round_trip_two_small_files() {
        let mut buf = Vec::new();
        let mut writer = Writer::new(&mut buf, u64::MAX, None).unwrap();
        writer.add("a.txt", b"hello", serde_json::json!({})).unwrap();
        writer.add("b.bin", &[0u8, 1, 2], serde_json::json!({})).unwrap();
        let externalised = writer.close().unwrap();
        assert!(externalised.is_empty());

        let footer = Footer::decode(&buf[buf.len() - 72..], buf.len() as u64).unwrap();
        let index_bytes =
            &buf[footer.index_start as usize..(footer.index_start + footer.index_length) as usize];
        let entries = decode_index(index_bytes, Some(footer.file_count)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        let data = &buf[entries[0].data_offset as usize
            ..(entries[0].data_offset + entries[0].data_length) as usize];
        assert_eq!(data, b"hello");
    }

    #[test]
    fn externalises_big_files() {
        let sink = MemSink {
            objects: HashMap::new(),
        };
        let mut buf = Vec::new();
        let external = ExternalConfig {
            sink: Box::new(sink),
            external_prefix: "pfx".to_string(),
        };
        let mut writer = Writer::new(&mut buf, 16, Some(external)).unwrap();
        writer
            .add("big", &[0u8; 20], serde_json::json!({}))
            .unwrap();
        writer.add("small", &[1, 2, 3, 4], serde_json::json!({})).unwrap();
        let externalised = writer.close().unwrap();
        assert_eq!(externalised.len(), 1);
        assert_eq!(externalised[0].name, "big");
        assert_eq!(externalised[0].key, "pfx/_bigFiles/big");

        let footer = Footer::decode(&buf[buf.len() - 72..], buf.len() as u64).unwrap();
        let index_bytes =
            &buf[footer.index_start as usize..(footer.index_start + footer.index_length) as usize];
        let entries = decode_index(index_bytes, Some(footer.file_count)).unwrap();
        let big = entries.iter().find(|e| e.name == "big").unwrap();
        assert!(big.is_external());
        assert_eq!(big.data_offset, 0);
        assert_eq!(big.data_length, 20);
        // Only "small"'s 4 bytes should be in the data region.
        assert_eq!(footer.data_length, 4);
    }

    #[test]
    fn rejects_invalid_name() {
        let mut buf = Vec::new();
        let mut writer = Writer::new(&mut buf, u64::MAX, None).unwrap();
        let err = writer.add("bad name", b"x", serde_json::json!({})).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn close_is_idempotent() {
        let mut buf = Vec::new();
        let mut writer = Writer::new(&mut buf, u64::MAX, None).unwrap();
        writer.add("a.txt", b"hello", serde_json::json!({})).unwrap();
        let first = writer.close().unwrap();
        assert!(first.is_empty());
    }
}
