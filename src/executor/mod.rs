//! Chunk execution: turn one [`ChunkPlan`] into one [`ChunkTranscript`].
//!
//! The cache is consulted before any byte moves, so a re-run after a crash
//! skips completed chunks entirely. Fetched audio lives in a uniquely named
//! temp file that is removed on every path out of [`ChunkExecutor::execute`],
//! keeping the on-disk working set to the chunks actually in flight.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::ChunkCache;
use crate::config::{FetchStrategy, TranscriberConfig};
use crate::memory::BackpressureGate;
use crate::probe::SilenceDetector;
use crate::protocol::{CacheKey, ChunkPlan, ChunkTranscript};
use crate::store::{fetch_range_to_file, ObjectStore};
use crate::transcribe::TranscribeClient;
use crate::Result;

/// Validity window for presigned URLs handed to the audio tool
const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// Estimated byte range for a plan, with a one-second bleed on both ends so
/// boundary audio frames arrive complete despite the constant-rate
/// approximation
pub fn byte_range_with_bleed(plan: &ChunkPlan, bytes_per_second: u64, file_size: u64) -> (u64, u64) {
    let bps = bytes_per_second as f64;
    let start = (plan.start_seconds * bps - bps).max(0.0) as u64;
    let end = ((plan.end_seconds * bps + bps) as u64).min(file_size.saturating_sub(1));
    (start, end)
}

/// Executes planned chunks against the external services.
pub struct ChunkExecutor {
    store: Arc<dyn ObjectStore>,
    probe: Arc<dyn SilenceDetector>,
    transcriber: Arc<dyn TranscribeClient>,
    cache: Arc<ChunkCache>,
    gate: Arc<BackpressureGate>,
    config: TranscriberConfig,
}

impl ChunkExecutor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        probe: Arc<dyn SilenceDetector>,
        transcriber: Arc<dyn TranscribeClient>,
        cache: Arc<ChunkCache>,
        gate: Arc<BackpressureGate>,
        config: TranscriberConfig,
    ) -> Self {
        Self {
            store,
            probe,
            transcriber,
            cache,
            gate,
            config,
        }
    }

    /// Produce the transcript for `plan`, from cache when possible.
    pub async fn execute(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        plan: &ChunkPlan,
    ) -> Result<ChunkTranscript> {
        let cache_key = CacheKey::for_plan(bucket, key, plan);
        if let Some(cached) = self.cache.get(&cache_key)? {
            info!("Chunk {} served from cache", plan.index);
            return Ok(cached);
        }

        self.gate.wait_if_needed().await;

        let temp_path = self.chunk_temp_path(plan);
        let result = self
            .fetch_and_transcribe(bucket, key, file_size, plan, &temp_path)
            .await;

        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    "Failed to remove chunk temp file {}: {}",
                    temp_path.display(),
                    e
                );
            }
        }

        let transcript = result?;
        self.cache.put(&cache_key, &transcript)?;
        Ok(transcript)
    }

    async fn fetch_and_transcribe(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        plan: &ChunkPlan,
        temp_path: &PathBuf,
    ) -> Result<ChunkTranscript> {
        match self.config.fetch_strategy {
            FetchStrategy::ByteRange => {
                let (start_byte, end_byte) =
                    byte_range_with_bleed(plan, self.config.bytes_per_second, file_size);
                let written = fetch_range_to_file(
                    self.store.as_ref(),
                    bucket,
                    key,
                    start_byte,
                    end_byte,
                    temp_path,
                )
                .await?;
                debug!(
                    "Chunk {}: fetched {} bytes [{}, {}]",
                    plan.index, written, start_byte, end_byte
                );
            }
            FetchStrategy::Extract => {
                let url = self.store.presign(bucket, key, PRESIGN_TTL)?;
                self.probe
                    .extract_clip(&url, plan.start_seconds, plan.end_seconds, temp_path)
                    .await?;
                debug!(
                    "Chunk {}: extracted [{:.2}, {:.2}] via audio tool",
                    plan.index, plan.start_seconds, plan.end_seconds
                );
            }
        }

        let response = self
            .transcriber
            .transcribe(temp_path, plan.duration(), plan.index)
            .await?;

        Ok(ChunkTranscript::new(
            plan.index,
            plan.start_seconds,
            response.segments,
            response.language,
        ))
    }

    fn chunk_temp_path(&self, plan: &ChunkPlan) -> PathBuf {
        self.config
            .temp_dir
            .join(format!("chunk-{}-{}.mp3", plan.index, Uuid::new_v4()))
    }
}
