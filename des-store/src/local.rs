//! Local-filesystem container backend, grounded on `des_reader.py`.

use crate::backend::{ContainerBackend, ObjectHead};
use async_trait::async_trait;
use bytes::Bytes;
use des_error::{make_err, Code, Error, ResultExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const EXTERNAL_FILES_FOLDER: &str = "_bigFiles";

pub struct LocalFileBackend {
    path: PathBuf,
}

impl LocalFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalFileBackend { path: path.into() }
    }

    fn external_path(&self, name: &str) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(EXTERNAL_FILES_FOLDER)
            .join(name)
    }
}

#[async_trait]
impl ContainerBackend for LocalFileBackend {
    async fn head(&self) -> Result<ObjectHead, Error> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .err_tip(|| format!("stat'ing {}", self.path.display()))?;
        let mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(ObjectHead {
            size: meta.len(),
            identity: mtime_secs.to_string(),
        })
    }

    async fn range_get(&self, offset: u64, length: u64) -> Result<Bytes, Error> {
        let mut file = File::open(&self.path)
            .await
            .err_tip(|| format!("opening {}", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .err_tip(|| format!("seeking to {offset} in {}", self.path.display()))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .await
            .err_tip(|| format!("reading {length} bytes at {offset} from {}", self.path.display()))?;
        Ok(Bytes::from(buf))
    }

    async fn external_get(&self, name: &str) -> Result<Bytes, Error> {
        let path = self.external_path(name);
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    make_err!(Code::NotFound, "external file not found: {}", path.display())
                } else {
                    make_err!(Code::Internal, "reading external file {}: {e}", path.display())
                }
            })
    }

    fn cache_key(&self, head: &ObjectHead) -> String {
        des_cache::local_cache_key(
            &self.path.display().to_string(),
            head.size,
            head.identity.parse().unwrap_or(0),
        )
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn range_get_reads_exact_slice() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let backend = LocalFileBackend::new(tmp.path());
        let bytes = backend.range_get(2, 4).await.unwrap();
        assert_eq!(&bytes[..], b"2345");
    }

    #[tokio::test]
    async fn head_reports_size() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let backend = LocalFileBackend::new(tmp.path());
        let head = backend.head().await.unwrap();
        assert_eq!(head.size, 11);
    }

    #[tokio::test]
    async fn external_get_reports_not_found() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let backend = LocalFileBackend::new(tmp.path());
        let err = backend.external_get("missing.bin").await.unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }
}
