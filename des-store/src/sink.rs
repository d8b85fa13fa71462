//! `des_format::ExternalSink` implementations used by the packer while
//! writing a container (spec §4.C).

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use des_error::{make_err, Code, Error};
use des_format::ExternalSink;

pub struct S3ExternalSink {
    client: Client,
    bucket: String,
    runtime: tokio::runtime::Handle,
}

impl S3ExternalSink {
    pub fn new(client: Client, bucket: impl Into<String>, runtime: tokio::runtime::Handle) -> Self {
        S3ExternalSink {
            client,
            bucket: bucket.into(),
            runtime,
        }
    }
}

impl ExternalSink for S3ExternalSink {
    fn put(&mut self, key: &str, data: &[u8]) -> Result<(), Error> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        let body = ByteStream::from(data.to_vec());
        self.runtime
            .block_on(async move {
                client
                    .put_object()
                    .bucket(bucket.as_str())
                    .key(key.as_str())
                    .body(body)
                    .send()
                    .await
            })
            .map_err(|e| make_err!(Code::Unavailable, "PUT {bucket}/{key}: {e}"))?;
        Ok(())
    }
}

pub struct LocalExternalSink {
    base_dir: std::path::PathBuf,
}

impl LocalExternalSink {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        LocalExternalSink {
            base_dir: base_dir.into(),
        }
    }
}

impl ExternalSink for LocalExternalSink {
    fn put(&mut self, key: &str, data: &[u8]) -> Result<(), Error> {
        let path = self.base_dir.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| make_err!(Code::Internal, "creating {}: {e}", parent.display()))?;
        }
        std::fs::write(&path, data)
            .map_err(|e| make_err!(Code::Internal, "writing {}: {e}", path.display()))
    }
}
