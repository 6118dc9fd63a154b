//! Read-only HTTP(S) storage backend, with PAR write support.
//!
//! Used by the loader to read artifacts over plain HTTPS, and by any
//! backend whose URL is a pre-authenticated request: writes go out as a
//! `PUT` to that URL, built on a hyper-based client.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Method, Request};
use hyper_tls_compat::HttpsConnector;

use super::{is_transient_status, Backoff, BoxRead, ObjectInfo, StorageBackend, WriteStream};

/// Thin shim so this module doesn't hard-code a particular
/// hyper-TLS-connector crate choice; `HttpsConnector` here wraps the
/// `openssl`-backed connector used throughout the rest of this codebase
/// (tokio-openssl + openssl) rather than pulling in a second
/// independent TLS implementation.
mod hyper_tls_compat {
    use hyper::client::HttpConnector;
    use hyper_openssl::HttpsConnector as Inner;

    pub type HttpsConnector = Inner<HttpConnector>;
}

pub struct HttpBackend {
    client: Client<HttpsConnector, Body>,
    base: url::Url,
    par_write: bool,
}

impl HttpBackend {
    pub fn new(base: url::Url, par_write: bool) -> Result<Self> {
        let ssl = openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())?.build();
        let https = hyper_openssl::HttpsConnector::with_connector(HttpConnector::new(), ssl)?;
        let client = Client::builder().build(https);
        Ok(Self {
            client,
            base,
            par_write,
        })
    }

    fn resolve(&self, path: &str) -> Result<hyper::Uri> {
        let joined = self.base.join(path).context("joining HTTP backend path")?;
        joined.as_str().parse().context("building hyper::Uri")
    }
}

struct HttpWriteStream {
    client: Client<HttpsConnector, Body>,
    uri: hyper::Uri,
    buffer: Vec<u8>,
}

#[async_trait]
impl WriteStream for HttpWriteStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // PAR writes are single-shot full overwrites (no If-Match), as
        // used for progress-log entries on HTTP(S) backends: buffer
        // then PUT once.
        let mut backoff = Backoff::new(5);
        loop {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(self.uri.clone())
                .body(Body::from(self.buffer.clone()))?;
            let resp = self.client.request(req).await?;
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return Ok(());
            }
            if is_transient_status(status) && backoff.sleep_next().await {
                continue;
            }
            bail!("PUT {} failed with status {}", self.uri, status);
        }
    }
}

#[async_trait]
impl StorageBackend for HttpBackend {
    async fn open_read(&self, path: &str) -> Result<BoxRead> {
        let uri = self.resolve(path)?;
        let mut backoff = Backoff::new(5);
        loop {
            let resp = self.client.get(uri.clone()).await?;
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                let body = resp.into_body();
                let stream = tokio_util::io::StreamReader::new(
                    tokio_stream::StreamExt::map(body, |chunk| {
                        chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                    }),
                );
                return Ok(Box::pin(stream));
            }
            if is_transient_status(status) && backoff.sleep_next().await {
                continue;
            }
            bail!("GET {} failed with status {}", uri, status);
        }
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        if !self.par_write {
            bail!("HTTP backend is read-only unless the URL is a pre-authenticated request");
        }
        let uri = self.resolve(path)?;
        Ok(Box::new(HttpWriteStream {
            client: self.client.clone(),
            uri,
            buffer: Vec::new(),
        }))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>> {
        bail!("HTTP backend does not support listing; artifacts are addressed directly by the manifest")
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>> {
        let uri = self.resolve(path)?;
        let req = Request::builder()
            .method(Method::HEAD)
            .uri(uri)
            .body(Body::empty())?;
        let resp = self.client.request(req).await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let size = resp
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Some(ObjectInfo {
            path: path.to_string(),
            size,
        }))
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        bail!("HTTP backend does not support delete")
    }
}
