//! AWS S3 storage backend.
//!
//! Credentials are resolved by `aws-config`'s default provider chain,
//! which already implements the standard precedence (explicit option →
//! `AWS_*` env vars → `~/.aws/credentials`/`~/.aws/config` → defaults).
//! Multipart uploads are used for objects larger than
//! [`S3Backend::MULTIPART_THRESHOLD`]; the SDK's credential provider
//! refreshes proactively before `Expiration`, so this module does not
//! need to reimplement that.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use super::{BoxRead, ObjectInfo, StorageBackend, WriteStream};

#[derive(Clone, Debug, Default)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub profile: Option<String>,
}

pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Objects larger than this use multipart upload (the exact
    /// threshold is backend-chosen).
    pub const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;

    pub async fn new(cfg: S3Config) -> Result<Self> {
        let mut loader = aws_config::from_env();
        if let Some(region) = &cfg.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &cfg.profile {
            loader = loader.profile_name(profile);
        }
        let shared = loader.load().await;
        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint.clone());
        }
        let client = Client::from_conf(s3_builder.build());
        Ok(Self {
            client,
            bucket: cfg.bucket,
        })
    }
}

struct S3WriteStream {
    client: Client,
    bucket: String,
    key: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl WriteStream for S3WriteStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if self.buffer.len() as u64 <= S3Backend::MULTIPART_THRESHOLD {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(self.buffer))
                .send()
                .await
                .with_context(|| format!("PUT s3://{}/{}", self.bucket, self.key))?;
            return Ok(());
        }
        multipart_upload(&self.client, &self.bucket, &self.key, &self.buffer).await
    }
}

async fn multipart_upload(client: &Client, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
    let create = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .context("CreateMultipartUpload")?;
    let upload_id = create.upload_id().context("missing upload id")?.to_string();

    const PART_SIZE: usize = 8 * 1024 * 1024;
    let mut parts = Vec::new();
    for (i, chunk) in data.chunks(PART_SIZE).enumerate() {
        let part_number = (i + 1) as i32;
        let result = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk.to_vec()))
            .send()
            .await
            .with_context(|| format!("UploadPart {}", part_number))?;
        parts.push(
            aws_sdk_s3::types::CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(result.e_tag().map(str::to_string))
                .build(),
        );
    }

    client
        .complete_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(&upload_id)
        .multipart_upload(
            aws_sdk_s3::types::CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build(),
        )
        .send()
        .await
        .context("CompleteMultipartUpload")?;

    Ok(())
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn open_read(&self, path: &str) -> Result<BoxRead> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .with_context(|| format!("GetObject s3://{}/{}", self.bucket, path))?;
        Ok(Box::pin(resp.body.into_async_read()))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(S3WriteStream {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: path.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .context("ListObjectsV2")?;
        Ok(resp
            .contents()
            .iter()
            .map(|o| ObjectInfo {
                path: o.key().unwrap_or_default().to_string(),
                size: o.size().unwrap_or(0) as u64,
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(resp) => Ok(Some(ObjectInfo {
                path: path.to_string(),
                size: resp.content_length().unwrap_or(0) as u64,
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => bail!("HeadObject s3://{}/{} failed: {}", self.bucket, path, e),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .with_context(|| format!("DeleteObject s3://{}/{}", self.bucket, path))?;
        Ok(())
    }

    fn supports_random_read(&self) -> bool {
        true
    }
}

fn is_not_found<E: std::fmt::Display>(err: &E) -> bool {
    err.to_string().contains("NotFound") || err.to_string().contains("404")
}
