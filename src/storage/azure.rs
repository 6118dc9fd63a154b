//! Azure Blob Storage backend.
//!
//! Credential precedence: a SAS token supersedes the account key, and
//! a connection string supersedes either individual account/key pair.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use futures::StreamExt;

use super::{BoxRead, ObjectInfo, StorageBackend, WriteStream};

#[derive(Clone, Debug, Default)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    pub account_key: Option<String>,
    pub sas_token: Option<String>,
    pub connection_string: Option<String>,
}

pub struct AzureBackend {
    container: ContainerClient,
}

impl AzureBackend {
    pub fn new(cfg: AzureConfig) -> Result<Self> {
        let client = if let Some(conn) = &cfg.connection_string {
            ClientBuilder::from_connection_string(conn)
                .context("parsing Azure connection string")?
        } else if let Some(sas) = &cfg.sas_token {
            let credentials = StorageCredentials::sas_token(sas.clone())
                .context("parsing Azure SAS token")?;
            ClientBuilder::new(cfg.account.clone(), credentials)
        } else if let Some(key) = &cfg.account_key {
            let credentials = StorageCredentials::access_key(cfg.account.clone(), key.clone());
            ClientBuilder::new(cfg.account.clone(), credentials)
        } else {
            bail!("Azure backend requires one of connection_string, sas_token, account_key");
        };
        let container = client.container_client(cfg.container.clone());
        Ok(Self { container })
    }
}

struct AzureWriteStream {
    blob: BlobClient,
    buffer: Vec<u8>,
}

#[async_trait]
impl WriteStream for AzureWriteStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.blob
            .put_block_blob(self.buffer)
            .await
            .context("PutBlob")?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for AzureBackend {
    async fn open_read(&self, path: &str) -> Result<BoxRead> {
        let blob = self.container.blob_client(path);
        let mut stream = blob.get().into_stream();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("reading blob {}", path))?;
            let bytes = chunk
                .data
                .collect()
                .await
                .context("collecting blob chunk")?;
            data.extend_from_slice(&bytes);
        }
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        let blob = self.container.blob_client(path);
        Ok(Box::new(AzureWriteStream {
            blob,
            buffer: Vec::new(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        let mut stream = self
            .container
            .list_blobs()
            .prefix(prefix.to_string())
            .into_stream();
        while let Some(page) = stream.next().await {
            let page = page.context("ListBlobs")?;
            for blob in page.blobs.blobs() {
                out.push(ObjectInfo {
                    path: blob.name.clone(),
                    size: blob.properties.content_length,
                });
            }
        }
        Ok(out)
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>> {
        let blob = self.container.blob_client(path);
        match blob.get_properties().await {
            Ok(props) => Ok(Some(ObjectInfo {
                path: path.to_string(),
                size: props.blob.properties.content_length,
            })),
            Err(e) if e.to_string().contains("BlobNotFound") => Ok(None),
            Err(e) => bail!("GetBlobProperties {} failed: {}", path, e),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let blob = self.container.blob_client(path);
        blob.delete().await.with_context(|| format!("DeleteBlob {}", path))?;
        Ok(())
    }
}
