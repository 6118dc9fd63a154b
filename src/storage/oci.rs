//! Oracle Cloud Infrastructure (OCI) Object Storage backend.
//!
//! No official OCI SDK crate is part of this stack, so requests are
//! signed and sent directly over the `hyper`/`openssl` client already
//! used by [`super::http`], following OCI's request-signing scheme
//! (a `Signature` header computed over a canonical `(request-target)`
//! string, RSA-SHA256 with the configured API key).
//!
//! Object names simulate directories (no real hierarchy). When
//! `ociParManifest` is enabled the caller generates one
//! pre-authenticated request per artifact and appends it to
//! `@.manifest.json` as the dump proceeds — that bookkeeping lives in
//! [`crate::manifest`], this module only issues the PAR-creation call.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hyper::client::HttpConnector;
use hyper::{Body, Method, Request};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

use super::{is_transient_status, Backoff, BoxRead, ObjectInfo, StorageBackend, WriteStream};

#[derive(Clone, Debug, Default)]
pub struct OciConfig {
    pub namespace: String,
    pub bucket: String,
    pub region: String,
    pub tenancy_ocid: String,
    pub user_ocid: String,
    pub key_fingerprint: String,
    pub private_key_pem: String,
    /// Config file profile this was resolved from, kept for diagnostics
    /// (`ociConfigFile`/`ociProfile`).
    pub profile: String,
}

type HttpsConnector = hyper_openssl::HttpsConnector<HttpConnector>;

pub struct OciBackend {
    client: hyper::Client<HttpsConnector, Body>,
    cfg: OciConfig,
}

impl OciBackend {
    pub fn new(cfg: OciConfig) -> Result<Self> {
        let ssl = openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())?.build();
        let https = hyper_openssl::HttpsConnector::with_connector(HttpConnector::new(), ssl)?;
        let client = hyper::Client::builder().build(https);
        Ok(Self { client, cfg })
    }

    fn endpoint(&self) -> String {
        format!(
            "https://objectstorage.{}.oraclecloud.com",
            self.cfg.region
        )
    }

    fn object_uri(&self, path: &str) -> String {
        format!(
            "{}/n/{}/b/{}/o/{}",
            self.endpoint(),
            self.cfg.namespace,
            self.cfg.bucket,
            percent_encoding::utf8_percent_encode(path, percent_encoding::NON_ALPHANUMERIC)
        )
    }

    /// Builds the `Authorization` header for a signed OCI request.
    fn sign(&self, method: &Method, uri: &hyper::Uri, date: &str) -> Result<String> {
        let request_target = format!(
            "{} {}",
            method.as_str().to_lowercase(),
            uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
        );
        let host = uri.host().unwrap_or_default();
        let signing_string = format!(
            "(request-target): {}\nhost: {}\ndate: {}",
            request_target, host, date
        );

        let pkey = PKey::private_key_from_pem(self.cfg.private_key_pem.as_bytes())
            .context("parsing OCI API private key")?;
        let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
        signer.update(signing_string.as_bytes())?;
        let signature = signer.sign_to_vec()?;
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature);

        let key_id = format!(
            "{}/{}/{}",
            self.cfg.tenancy_ocid, self.cfg.user_ocid, self.cfg.key_fingerprint
        );

        Ok(format!(
            "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"{}\"",
            key_id, signature_b64
        ))
    }

    fn rfc1123_now() -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        httpdate::fmt_http_date(UNIX_EPOCH + now)
    }

    /// Body bytes are buffered in memory (never large: object payloads
    /// in this backend are whole dump artifacts read once into `Vec<u8>`
    /// by the callers below) so a retried request can replay the exact
    /// same bytes.
    async fn signed_request(
        &self,
        method: Method,
        uri_str: &str,
        body: Vec<u8>,
    ) -> Result<hyper::Response<Body>> {
        let uri: hyper::Uri = uri_str.parse()?;
        let date = Self::rfc1123_now();
        let auth = self.sign(&method, &uri, &date)?;

        let mut backoff = Backoff::new(5);
        loop {
            let req = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .header(hyper::header::HOST, uri.host().unwrap_or_default())
                .header(hyper::header::DATE, &date)
                .header(hyper::header::AUTHORIZATION, &auth)
                .body(Body::from(body.clone()))?;
            let resp = self.client.request(req).await?;
            let status = resp.status().as_u16();
            if resp.status().is_success() || !is_transient_status(status) {
                return Ok(resp);
            }
            if !backoff.sleep_next().await {
                return Ok(resp);
            }
        }
    }
}

struct OciWriteStream {
    client: hyper::Client<HttpsConnector, Body>,
    cfg: OciConfig,
    path: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl WriteStream for OciWriteStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let backend = OciBackend {
            client: self.client,
            cfg: self.cfg,
        };
        let uri = backend.object_uri(&self.path);
        let resp = backend
            .signed_request(Method::PUT, &uri, self.buffer)
            .await?;
        if !resp.status().is_success() {
            bail!("PutObject {} failed with status {}", self.path, resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for OciBackend {
    async fn open_read(&self, path: &str) -> Result<BoxRead> {
        let uri = self.object_uri(path);
        let resp = self.signed_request(Method::GET, &uri, Vec::new()).await?;
        if !resp.status().is_success() {
            bail!("GetObject {} failed with status {}", path, resp.status());
        }
        let body = resp.into_body();
        let stream = tokio_util::io::StreamReader::new(tokio_stream::StreamExt::map(
            body,
            |chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        ));
        Ok(Box::pin(stream))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(OciWriteStream {
            client: self.client.clone(),
            cfg: self.cfg.clone(),
            path: path.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let uri = format!(
            "{}/n/{}/b/{}/o?prefix={}",
            self.endpoint(),
            self.cfg.namespace,
            self.cfg.bucket,
            percent_encoding::utf8_percent_encode(prefix, percent_encoding::NON_ALPHANUMERIC)
        );
        let resp = self.signed_request(Method::GET, &uri, Vec::new()).await?;
        if !resp.status().is_success() {
            bail!("ListObjects failed with status {}", resp.status());
        }
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;
        let parsed: serde_json::Value = serde_json::from_slice(&bytes)?;
        let objects = parsed["objects"].as_array().cloned().unwrap_or_default();
        Ok(objects
            .into_iter()
            .filter_map(|o| {
                Some(ObjectInfo {
                    path: o.get("name")?.as_str()?.to_string(),
                    size: o.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
                })
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>> {
        let uri = self.object_uri(path);
        let resp = self.signed_request(Method::HEAD, &uri, Vec::new()).await?;
        if resp.status() == hyper::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("HeadObject {} failed with status {}", path, resp.status());
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

    async fn remove(&self, path: &str) -> Result<()> {
        let uri = self.object_uri(path);
        let resp = self.signed_request(Method::DELETE, &uri, Vec::new()).await?;
        if !resp.status().is_success() && resp.status() != hyper::StatusCode::NOT_FOUND {
            bail!("DeleteObject {} failed with status {}", path, resp.status());
        }
        Ok(())
    }
}
