//! Object-store access: HEAD metadata, inclusive byte-range GETs, and
//! presigned URLs.
//!
//! The core consumes the store only through the [`ObjectStore`] trait and
//! never holds a full-file stream; ranges are copied straight to disk via
//! [`stream_range_to_file`].

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{Result, TranscriberError};

/// Attempts per ranged read, including the first
pub const RANGE_FETCH_ATTEMPTS: u32 = 3;

/// Pause between ranged-read attempts
const RANGE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Metadata returned by a HEAD request
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    /// Object size in bytes
    pub content_length: u64,
    /// MIME type, if the store reported one
    pub content_type: Option<String>,
}

/// A stream of body bytes from a ranged GET
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Byte-range access to an object store.
///
/// The core depends on exactly three operations; listing and deletion are
/// deliberately absent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch object metadata. Fails with `NotFound` for a missing key.
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;

    /// Stream the inclusive byte range `[start_byte, end_byte]`.
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<ByteStream>;

    /// Produce a URL that grants read access for `ttl`, letting the audio
    /// tool read bytes directly.
    fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
}

/// Render the inclusive range header value `bytes=start-end`
pub(crate) fn format_range(start_byte: u64, end_byte: u64) -> String {
    format!("bytes={}-{}", start_byte, end_byte)
}

/// Copy a byte range of an object to a local file without buffering the
/// body in memory. Returns the number of bytes written.
pub async fn stream_range_to_file(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    start_byte: u64,
    end_byte: u64,
    dest: &Path,
) -> Result<u64> {
    let mut stream = store.get_range(bucket, key, start_byte, end_byte).await?;
    let mut file = tokio::fs::File::create(dest).await?;

    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!(
        "Copied {} bytes ({}..={}) of {}/{} to {}",
        written,
        start_byte,
        end_byte,
        bucket,
        key,
        dest.display()
    );
    Ok(written)
}

/// [`stream_range_to_file`] with bounded retries on transient failures.
///
/// Only transport and local I/O errors are retried; a missing object is
/// final. A partial file from a failed attempt is removed before the next
/// one starts.
pub async fn fetch_range_to_file(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    start_byte: u64,
    end_byte: u64,
    dest: &Path,
) -> Result<u64> {
    let mut last_error: Option<TranscriberError> = None;

    for attempt in 0..RANGE_FETCH_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(RANGE_RETRY_DELAY).await;
        }
        match stream_range_to_file(store, bucket, key, start_byte, end_byte, dest).await {
            Ok(written) => return Ok(written),
            Err(e @ (TranscriberError::Transport(_) | TranscriberError::Io(_))) => {
                warn!(
                    "Ranged read {}..={} of {}/{} failed on attempt {}: {}",
                    start_byte,
                    end_byte,
                    bucket,
                    key,
                    attempt + 1,
                    e
                );
                let _ = tokio::fs::remove_file(dest).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        TranscriberError::Transport("ranged read failed with no recorded error".into())
    }))
}

/// `ObjectStore` implementation over an S3-style HTTP gateway.
///
/// Objects live at `{base_url}/{bucket}/{key}`; ranged reads use standard
/// `Range: bytes=start-end` headers. Presigning appends the expiry as a
/// query parameter, which is what the internal gateway accepts; a SigV4
/// signer can replace this without touching callers.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    /// Create a store client for the given gateway base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TranscriberError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, key)
    }

    fn classify(bucket: &str, key: &str, status: reqwest::StatusCode) -> TranscriberError {
        if status == reqwest::StatusCode::NOT_FOUND {
            TranscriberError::NotFound(format!("{}/{}", bucket, key))
        } else {
            TranscriberError::Transport(format!(
                "object store returned {} for {}/{}",
                status, bucket, key
            ))
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let url = self.object_url(bucket, key);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| TranscriberError::Transport(format!("HEAD {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::classify(bucket, key, response.status()));
        }

        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                TranscriberError::Transport(format!("HEAD {url}: missing Content-Length"))
            })?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Ok(ObjectMetadata {
            content_length,
            content_type,
        })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<ByteStream> {
        let url = self.object_url(bucket, key);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::RANGE, format_range(start_byte, end_byte))
            .send()
            .await
            .map_err(|e| TranscriberError::Transport(format!("GET {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::classify(bucket, key, response.status()));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TranscriberError::Transport(format!("range body: {e}"))));
        Ok(Box::pin(stream))
    }

    fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "{}?expires={}",
            self.object_url(bucket, key),
            ttl.as_secs()
        ))
    }
}
