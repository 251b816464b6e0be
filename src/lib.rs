//! Archive Transcriber - bounded-memory transcription of very large recordings
//!
//! This crate transcribes recordings of up to 24 hours held in an object
//! store, reading them only by byte range so memory stays bounded regardless
//! of input length. It features:
//!
//! - A silence-aware greedy planner that cuts chunks at natural pauses while
//!   streaming byte ranges of an opaque binary file
//! - A chunk executor with a persistent transcript cache (crash resume),
//!   memory backpressure, and strict temp-file hygiene
//! - An overlap reconciler that merges adjacent chunk transcripts with
//!   longest-common-word alignment, producing one absolute timeline
//! - External collaborators (object store, ffmpeg, transcription service)
//!   behind thin async trait contracts
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use archive_transcriber::{
//!     cache::ChunkCache,
//!     config::TranscriberConfig,
//!     memory::BackpressureGate,
//!     pipeline::{TranscriptionPipeline, TranscriptionRequest},
//!     probe::FfmpegSilenceProbe,
//!     store::HttpObjectStore,
//!     transcribe::HttpTranscribeClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TranscriberConfig::default();
//!     let store = Arc::new(HttpObjectStore::new("http://localhost:9000")?);
//!     let probe = Arc::new(FfmpegSilenceProbe::new(
//!         "ffmpeg",
//!         config.silence_noise_threshold_db,
//!         config.silence_min_duration_seconds,
//!     ));
//!     let transcriber = Arc::new(HttpTranscribeClient::new(
//!         "http://localhost:8000/transcribe",
//!     )?);
//!     let cache = Arc::new(ChunkCache::new_temp()?);
//!     let gate = Arc::new(BackpressureGate::with_system_reader());
//!
//!     let pipeline =
//!         TranscriptionPipeline::new(config, store, probe, transcriber, cache, gate);
//!     let request = TranscriptionRequest::new("recordings", "board/2024-06-01.mp3");
//!     let transcript = pipeline.run(request).await?;
//!     println!("{} segments", transcript.segments.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod executor;
pub mod memory;
pub mod merge;
pub mod pipeline;
pub mod planner;
pub mod probe;
pub mod protocol;
pub mod store;
pub mod transcribe;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for convenience
pub use protocol::{
    Breakpoint, CacheKey, ChunkPlan, ChunkTranscript, ChunkingMode, MergedSegment,
    SilenceInterval, TranscriptSegment,
};

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur in the transcription pipeline
#[derive(Error, Debug)]
pub enum TranscriberError {
    /// The object-store key does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Transient I/O to the object store or transcription service, surfaced
    /// after internal retries were exhausted
    #[error("transport failure: {0}")]
    Transport(String),

    /// The external audio analyser failed
    #[error("audio analysis failed: {0}")]
    AnalysisFailed(String),

    /// Estimated duration exceeds the configured limit
    #[error("recording too long: estimated {estimated_hours:.1}h exceeds {limit_hours:.1}h limit")]
    TooLong {
        estimated_hours: f64,
        limit_hours: f64,
    },

    /// Malformed request or configuration
    #[error("validation failed: {0}")]
    Validation(String),

    /// A cancellation signal was observed
    #[error("run cancelled")]
    Cancelled,

    /// A post-merge invariant check failed; indicates a bug
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Local I/O error (temp files, stream copies)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk-cache storage error
    #[error("cache error: {0}")]
    Cache(String),
}

impl TranscriberError {
    /// The stable kind tag for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscriberError::NotFound(_) => ErrorKind::NotFound,
            TranscriberError::Transport(_) => ErrorKind::Transport,
            TranscriberError::AnalysisFailed(_) => ErrorKind::AnalysisFailed,
            TranscriberError::TooLong { .. } => ErrorKind::TooLong,
            TranscriberError::Validation(_) => ErrorKind::Validation,
            TranscriberError::Cancelled => ErrorKind::Cancelled,
            TranscriberError::InternalInvariant(_) => ErrorKind::InternalInvariant,
            TranscriberError::Io(_) => ErrorKind::Io,
            TranscriberError::Cache(_) => ErrorKind::Cache,
        }
    }
}

impl From<sled::Error> for TranscriberError {
    fn from(err: sled::Error) -> Self {
        TranscriberError::Cache(err.to_string())
    }
}

/// Stable error classification used in user-visible failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Transport,
    AnalysisFailed,
    TooLong,
    Validation,
    Cancelled,
    InternalInvariant,
    Io,
    Cache,
}

/// Structured failure returned by a run.
///
/// Chunk-specific failures include the chunk index; run-level failures omit
/// it.
#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
}

impl RunError {
    pub fn from_error(err: &TranscriberError, chunk_index: Option<usize>) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            chunk_index,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.chunk_index {
            Some(index) => write!(f, "{} (chunk {})", self.message, index),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RunError {}

/// Result type alias for transcriber operations
pub type Result<T> = std::result::Result<T, TranscriberError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
