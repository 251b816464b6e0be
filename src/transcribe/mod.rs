//! Client for the external transcription service.
//!
//! The service accepts a multipart upload (`file`, `chunkDurationSeconds`,
//! `chunkIndex`) and answers with JSON segments in chunk-relative seconds.
//! Retries live entirely inside this module: transient failures back off
//! exponentially with jitter; permanent (4xx) failures surface immediately.
//! Callers only ever see a final success or a `Transport` error.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::protocol::TranscriptSegment;
use crate::{Result, TranscriberError};

/// Parsed response from the transcription service
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscriptionResponse {
    /// Segments ordered as the service returned them, chunk-relative times
    pub segments: Vec<TranscriptSegment>,
    /// Detected language tag
    pub language: Option<String>,
}

/// Single-chunk transcription. Idempotent per (chunk index, file content).
#[async_trait]
pub trait TranscribeClient: Send + Sync {
    async fn transcribe(
        &self,
        audio_path: &Path,
        chunk_duration_seconds: f64,
        chunk_index: usize,
    ) -> Result<TranscriptionResponse>;
}

/// Retry schedule for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), jittered into
    /// `[base/2, base]` where `base` doubles per attempt up to the cap.
    /// `jitter` must be in `[0, 1)`.
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let doubled = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        let base = doubled.min(self.max_backoff);
        base.div_f64(2.0) + base.mul_f64(jitter / 2.0)
    }
}

/// How one attempt against the service failed
enum AttemptError {
    /// Worth retrying: transport failure or 5xx
    Transient(String),
    /// Not worth retrying: the service rejected the request
    Permanent(String),
}

/// HTTP implementation of [`TranscribeClient`].
pub struct HttpTranscribeClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpTranscribeClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TranscriberError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn attempt(
        &self,
        audio_path: &Path,
        chunk_duration_seconds: f64,
        chunk_index: usize,
    ) -> std::result::Result<TranscriptionResponse, AttemptError> {
        let file = tokio::fs::File::open(audio_path)
            .await
            .map_err(|e| AttemptError::Permanent(format!("open {}: {e}", audio_path.display())))?;

        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("chunk-{chunk_index}.mp3"));

        let part = reqwest::multipart::Part::stream(reqwest::Body::from(file))
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| AttemptError::Permanent(format!("invalid mime type: {e}")))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("chunkDurationSeconds", format!("{chunk_duration_seconds}"))
            .text("chunkIndex", chunk_index.to_string());

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::Transient(format!("send: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Permanent(format!("service returned {status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Transient(format!("service returned {status}: {body}")));
        }

        response
            .json::<TranscriptionResponse>()
            .await
            .map_err(|e| AttemptError::Permanent(format!("malformed response: {e}")))
    }
}

#[async_trait]
impl TranscribeClient for HttpTranscribeClient {
    async fn transcribe(
        &self,
        audio_path: &Path,
        chunk_duration_seconds: f64,
        chunk_index: usize,
    ) -> Result<TranscriptionResponse> {
        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            match self
                .attempt(audio_path, chunk_duration_seconds, chunk_index)
                .await
            {
                Ok(response) => {
                    debug!(
                        "Chunk {} transcribed: {} segments, language {:?}",
                        chunk_index,
                        response.segments.len(),
                        response.language
                    );
                    return Ok(response);
                }
                Err(AttemptError::Permanent(message)) => {
                    return Err(TranscriberError::Transport(format!(
                        "chunk {chunk_index} permanently rejected: {message}"
                    )));
                }
                Err(AttemptError::Transient(message)) => {
                    last_error = message;
                    if attempt + 1 < self.retry.max_attempts {
                        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                        let delay = self.retry.backoff_delay(attempt, jitter);
                        warn!(
                            "Chunk {} attempt {} failed ({}); retrying in {:?}",
                            chunk_index,
                            attempt + 1,
                            last_error,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(TranscriberError::Transport(format!(
            "chunk {chunk_index} failed after {} attempts: {last_error}",
            self.retry.max_attempts
        )))
    }
}
