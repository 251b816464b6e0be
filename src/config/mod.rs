use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol::ChunkingMode;
use crate::{Result, TranscriberError};

/// How the executor obtains a chunk's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStrategy {
    /// Stream the estimated byte range (with a one-second bleed on both
    /// ends) straight to a temp file.
    ByteRange,
    /// Presign the object and have the audio tool extract the exact time
    /// range into a standalone MP3.
    Extract,
}

/// Chunk-cache sizing and eviction limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// On-disk location; `None` uses a temporary directory
    pub path: Option<PathBuf>,
    /// Cap on the total bytes of stored transcript values
    pub max_size_bytes: u64,
    /// Entries older than this are evicted
    pub ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_size_bytes: 512 * 1024 * 1024,
            ttl_hours: 24,
        }
    }
}

/// Recognised options for the transcription pipeline.
///
/// One instance is built at startup (CLI flags map onto the fields) and
/// passed explicitly into the pipeline constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriberConfig {
    /// Chunk boundary strategy
    pub mode: ChunkingMode,
    /// How chunk audio is fetched
    pub fetch_strategy: FetchStrategy,
    /// Hard upper bound per chunk in both modes, seconds
    pub max_chunk_duration_seconds: f64,
    /// Shared tail/head length between adjacent chunks in overlap mode;
    /// also the merger's tokenisation window
    pub overlap_seconds: f64,
    /// dBFS threshold passed to the silence probe (negative)
    pub silence_noise_threshold_db: f64,
    /// Minimum silence length counted, seconds
    pub silence_min_duration_seconds: f64,
    /// Tail window within which the greedy planner searches for silences
    pub lookback_seconds: f64,
    /// Minimum common-word-run length for a valid merge
    pub min_match_words: usize,
    /// Estimation constant for time<->byte mapping (128 kbps stereo)
    pub bytes_per_second: u64,
    /// Directory for transient chunk and probe files
    pub temp_dir: PathBuf,
    /// Inputs estimated longer than this are rejected before any fetch
    pub max_file_duration_hours: f64,
    /// Number of full runs permitted in parallel
    pub concurrent_runs: usize,
    /// Chunk-cache limits
    pub cache: CacheConfig,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            mode: ChunkingMode::SilenceAware,
            fetch_strategy: FetchStrategy::ByteRange,
            max_chunk_duration_seconds: 3600.0,
            overlap_seconds: 30.0,
            silence_noise_threshold_db: -30.0,
            silence_min_duration_seconds: 0.5,
            lookback_seconds: 600.0,
            min_match_words: 3,
            bytes_per_second: 16_000,
            temp_dir: std::env::temp_dir(),
            max_file_duration_hours: 24.0,
            concurrent_runs: 2,
            cache: CacheConfig::default(),
        }
    }
}

impl TranscriberConfig {
    /// Check the option set for contradictions before any run starts
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_duration_seconds <= 0.0 {
            return Err(TranscriberError::Validation(
                "maxChunkDurationSeconds must be positive".into(),
            ));
        }
        if self.overlap_seconds < 0.0 {
            return Err(TranscriberError::Validation(
                "overlapSeconds must not be negative".into(),
            ));
        }
        if self.overlap_seconds >= self.max_chunk_duration_seconds {
            return Err(TranscriberError::Validation(format!(
                "overlapSeconds ({}) must be smaller than maxChunkDurationSeconds ({})",
                self.overlap_seconds, self.max_chunk_duration_seconds
            )));
        }
        if self.lookback_seconds <= 0.0 {
            return Err(TranscriberError::Validation(
                "lookbackSeconds must be positive".into(),
            ));
        }
        if self.silence_min_duration_seconds < 0.0 {
            return Err(TranscriberError::Validation(
                "silenceMinDuration must not be negative".into(),
            ));
        }
        if self.min_match_words == 0 {
            return Err(TranscriberError::Validation(
                "minMatchWords must be at least 1".into(),
            ));
        }
        if self.bytes_per_second == 0 {
            return Err(TranscriberError::Validation(
                "bytesPerSecond must be positive".into(),
            ));
        }
        if self.max_file_duration_hours <= 0.0 {
            return Err(TranscriberError::Validation(
                "maxFileDurationHours must be positive".into(),
            ));
        }
        if self.concurrent_runs == 0 {
            return Err(TranscriberError::Validation(
                "concurrentRuns must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Maximum accepted input duration in seconds
    pub fn max_file_duration_seconds(&self) -> f64 {
        self.max_file_duration_hours * 3600.0
    }
}

/// Reject malformed object coordinates before a run starts
pub fn validate_request(bucket: &str, key: &str) -> Result<()> {
    if bucket.trim().is_empty() {
        return Err(TranscriberError::Validation("bucket must not be empty".into()));
    }
    if key.trim().is_empty() {
        return Err(TranscriberError::Validation("key must not be empty".into()));
    }
    Ok(())
}
