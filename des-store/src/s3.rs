//! S3 container backend, grounded on `s3_des_reader.py`'s Range GET approach
//! and the teacher's retry-around-status-code shape (`cas/store/s3_store.rs`).

use crate::backend::{ContainerBackend, ObjectHead};
use crate::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::Bytes;
use des_error::{make_err, Code, Error};

const EXTERNAL_FILES_FOLDER: &str = "_bigFiles";

pub struct S3Backend {
    client: Client,
    bucket: String,
    key: String,
    retry: RetryPolicy,
}

impl S3Backend {
    pub fn new(client: Client, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        S3Backend {
            client,
            bucket: bucket.into(),
            key: key.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn base_prefix(&self) -> &str {
        match self.key.rfind('/') {
            Some(idx) => &self.key[..idx],
            None => "",
        }
    }

    fn external_key(&self, name: &str) -> String {
        let prefix = self.base_prefix();
        if prefix.is_empty() {
            format!("{EXTERNAL_FILES_FOLDER}/{name}")
        } else {
            format!("{prefix}/{EXTERNAL_FILES_FOLDER}/{name}")
        }
    }
}

#[async_trait]
impl ContainerBackend for S3Backend {
    async fn head(&self) -> Result<ObjectHead, Error> {
        retry_with_backoff(&self.retry, Error::is_transient, || async {
            let resp = self
                .client
                .head_object()
                .bucket(self.bucket.as_str())
                .key(self.key.as_str())
                .send()
                .await
                .map_err(|e| make_err!(Code::Unavailable, "HEAD {}/{}: {e}", self.bucket, self.key))?;
            let size = resp.content_length().unwrap_or(0).max(0) as u64;
            let identity = resp.e_tag().unwrap_or_default().trim_matches('"').to_string();
            Ok(ObjectHead { size, identity })
        })
        .await
    }

    async fn range_get(&self, offset: u64, length: u64) -> Result<Bytes, Error> {
        let end = offset + length.saturating_sub(1);
        let range = format!("bytes={offset}-{end}");
        retry_with_backoff(&self.retry, Error::is_transient, || async {
            let resp = self
                .client
                .get_object()
                .bucket(self.bucket.as_str())
                .key(self.key.as_str())
                .range(&range)
                .send()
                .await
                .map_err(|e| make_err!(Code::Unavailable, "GET {range} {}/{}: {e}", self.bucket, self.key))?;
            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| make_err!(Code::Unavailable, "reading body for {range}: {e}"))?;
            Ok(data.into_bytes())
        })
        .await
    }

    async fn external_get(&self, name: &str) -> Result<Bytes, Error> {
        let key = self.external_key(name);
        retry_with_backoff(&self.retry, Error::is_transient, || async {
            let resp = self
                .client
                .get_object()
                .bucket(self.bucket.as_str())
                .key(key.as_str())
                .send()
                .await
                .map_err(|e| {
                    let msg = e.to_string();
                    if msg.contains("NoSuchKey") {
                        make_err!(Code::NotFound, "external file not found: {}/{key}", self.bucket)
                    } else {
                        make_err!(Code::Unavailable, "GET {}/{key}: {e}", self.bucket)
                    }
                })?;
            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| make_err!(Code::Unavailable, "reading body for {}/{key}: {e}", self.bucket))?;
            Ok(data.into_bytes())
        })
        .await
    }

    fn cache_key(&self, head: &ObjectHead) -> String {
        des_cache::s3_cache_key(&self.bucket, &self.key, &head.identity)
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}
