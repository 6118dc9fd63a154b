//! Compression Codec.
//!
//! Pure streaming transforms chained around read/write streams. The
//! codec name is recorded in the manifest entry for its artifact so the
//! loader auto-selects on read. CPU-bound codec work is offloaded to
//! `spawn_blocking`, the same way chunk verification and writing is
//! kept off the async executor elsewhere in this crate.

use std::io::Write;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The three supported compression codecs; `none` is a pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// File extension fragment used when composing chunk artifact names,
    /// e.g. `.tsv.zst`, `.csv.gz`.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(Compression::Gzip),
            "zst" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => anyhow::bail!("unknown compression codec '{}'", other),
        }
    }
}

/// Compress `data` wholesale (used for small artifacts: DDL, metadata,
/// manifest). Large data-chunk streams instead go through
/// [`StreamingEncoder`] so compression runs incrementally as rows are
/// produced.
pub async fn compress_blocking(codec: Compression, data: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || match codec {
        Compression::None => Ok(data),
        Compression::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(&data)?;
            Ok(enc.finish()?)
        }
        Compression::Zstd => {
            zstd::stream::encode_all(&data[..], 0).context("zstd compression")
        }
    })
    .await
    .context("compression task panicked")?
}

pub async fn decompress_blocking(codec: Compression, data: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || match codec {
        Compression::None => Ok(data),
        Compression::Gzip => {
            let mut dec = flate2::read::GzDecoder::new(&data[..]);
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut dec, &mut out)?;
            Ok(out)
        }
        Compression::Zstd => zstd::stream::decode_all(&data[..]).context("zstd decompression"),
    })
    .await
    .context("decompression task panicked")?
}

/// Incremental encoder used by the Dump Writer to compress a
/// chunk's bytes as rows are appended, rather than buffering the whole
/// chunk before compressing.
pub struct StreamingEncoder {
    inner: Encoder,
}

enum Encoder {
    None(Vec<u8>),
    Gzip(flate2::write::GzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl StreamingEncoder {
    pub fn new(codec: Compression) -> Result<Self> {
        let inner = match codec {
            Compression::None => Encoder::None(Vec::new()),
            Compression::Gzip => {
                Encoder::Gzip(flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default()))
            }
            Compression::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(Vec::new(), 0)?),
        };
        Ok(Self { inner })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.inner {
            Encoder::None(buf) => buf.extend_from_slice(data),
            Encoder::Gzip(enc) => enc.write_all(data)?,
            Encoder::Zstd(enc) => enc.write_all(data)?,
        }
        Ok(())
    }

    /// Finish the stream and return the fully compressed bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        match self.inner {
            Encoder::None(buf) => Ok(buf),
            Encoder::Gzip(enc) => Ok(enc.finish()?),
            Encoder::Zstd(enc) => Ok(enc.finish()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_gzip() {
        let data = b"hello world, chunked and compressed".to_vec();
        let compressed = compress_blocking(Compression::Gzip, data.clone()).await.unwrap();
        let decompressed = decompress_blocking(Compression::Gzip, compressed).await.unwrap();
        assert_eq!(decompressed, data);
    }

    #[tokio::test]
    async fn round_trip_zstd() {
        let data = b"hello world, chunked and compressed".to_vec();
        let compressed = compress_blocking(Compression::Zstd, data.clone()).await.unwrap();
        let decompressed = decompress_blocking(Compression::Zstd, compressed).await.unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn streaming_encoder_matches_whole_buffer() {
        let mut enc = StreamingEncoder::new(Compression::None).unwrap();
        enc.write(b"abc").unwrap();
        enc.write(b"def").unwrap();
        assert_eq!(enc.finish().unwrap(), b"abcdef".to_vec());
    }
}
