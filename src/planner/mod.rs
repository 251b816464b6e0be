//! Chunk planning.
//!
//! The silence-aware planner walks the remote file in a single forward
//! pass: it streams one window of estimated bytes to a temp file, asks the
//! silence probe where the pauses are, and promotes the best pause in the
//! window's tail to a breakpoint. Only one window of audio ever exists on
//! disk, so planning cost is flat regardless of recording length, and each
//! plan is handed downstream the moment it is known so transcription can
//! start while planning continues.
//!
//! Overlap planning is pure arithmetic and never touches the file.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TranscriberConfig;
use crate::probe::SilenceDetector;
use crate::protocol::{Breakpoint, ChunkPlan, ChunkingMode, SilenceInterval};
use crate::store::{fetch_range_to_file, ObjectStore};
use crate::{Result, TranscriberError};

/// Estimated duration in seconds from the object size
pub fn estimate_duration(file_size: u64, bytes_per_second: u64) -> f64 {
    file_size as f64 / bytes_per_second as f64
}

/// Pick the breakpoint for one planner window.
///
/// Considers only silences fully contained in `[lookback_start,
/// window_end]`; the greatest duration wins, ties break to the earlier
/// start. With no candidate the cut is forced at `window_end`.
pub fn select_breakpoint(
    silences: &[SilenceInterval],
    lookback_start: f64,
    window_end: f64,
) -> Breakpoint {
    let best = silences
        .iter()
        .filter(|s| s.start >= lookback_start && s.end <= window_end)
        .fold(None::<&SilenceInterval>, |best, candidate| match best {
            None => Some(candidate),
            Some(current) => {
                if candidate.duration() > current.duration() {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        });

    match best {
        Some(silence) => Breakpoint::at_silence(*silence),
        None => Breakpoint::forced(window_end),
    }
}

/// Convert an ordered breakpoint list into contiguous plans covering
/// `[0, total_duration]`
pub fn breakpoints_to_plans(breakpoints: &[Breakpoint], total_duration: f64) -> Vec<ChunkPlan> {
    let mut plans = Vec::new();
    let mut previous = 0.0_f64;

    for breakpoint in breakpoints {
        if breakpoint.position > previous {
            plans.push(ChunkPlan::new(plans.len(), previous, breakpoint.position));
            previous = breakpoint.position;
        }
    }

    if previous < total_duration {
        plans.push(ChunkPlan::new(plans.len(), previous, total_duration));
    }

    plans
}

/// Fixed-stride overlap plans: each chunk spans `max_chunk` seconds and
/// shares `overlap` seconds with its successor
pub fn plan_overlap(total_duration: f64, max_chunk: f64, overlap: f64) -> Vec<ChunkPlan> {
    if total_duration <= 0.0 {
        return Vec::new();
    }
    if total_duration <= max_chunk {
        return vec![ChunkPlan::new(0, 0.0, total_duration)];
    }

    let stride = max_chunk - overlap;
    let mut plans = Vec::new();
    let mut start = 0.0_f64;

    loop {
        let end = (start + max_chunk).min(total_duration);
        let index = plans.len();
        if end < total_duration {
            // The next chunk begins `stride` in; the shared region is the
            // tail of this one
            plans.push(ChunkPlan::with_overlap(index, start, end, start + stride, end));
        } else {
            plans.push(ChunkPlan::new(index, start, end));
            break;
        }
        start += stride;
    }

    plans
}

/// Plans chunks for one object, in either mode.
pub struct ChunkPlanner {
    store: Arc<dyn ObjectStore>,
    probe: Arc<dyn SilenceDetector>,
    config: TranscriberConfig,
}

impl ChunkPlanner {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        probe: Arc<dyn SilenceDetector>,
        config: TranscriberConfig,
    ) -> Self {
        Self {
            store,
            probe,
            config,
        }
    }

    /// Plan every chunk of `bucket`/`key` and return the full sequence
    pub async fn plan_chunks(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
    ) -> Result<Vec<ChunkPlan>> {
        self.plan_chunks_into(bucket, key, file_size, None).await
    }

    /// Plan chunks, pushing each one into `sink` as soon as it is known so
    /// the executor can start on chunk N while chunk N+1 is being planned.
    pub async fn plan_chunks_into(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        sink: Option<&mpsc::Sender<ChunkPlan>>,
    ) -> Result<Vec<ChunkPlan>> {
        let total_duration = estimate_duration(file_size, self.config.bytes_per_second);

        let plans = match self.config.mode {
            ChunkingMode::Overlap => {
                let plans = plan_overlap(
                    total_duration,
                    self.config.max_chunk_duration_seconds,
                    self.config.overlap_seconds,
                );
                if let Some(sink) = sink {
                    for plan in &plans {
                        if sink.send(plan.clone()).await.is_err() {
                            return Err(TranscriberError::Cancelled);
                        }
                    }
                }
                plans
            }
            ChunkingMode::SilenceAware => {
                self.plan_silence_aware(bucket, key, file_size, total_duration, sink)
                    .await?
            }
        };

        info!(
            "Planned {} chunks for {}/{} ({:.1}s estimated)",
            plans.len(),
            bucket,
            key,
            total_duration
        );
        Ok(plans)
    }

    /// Single forward pass of the greedy silence-aware algorithm
    async fn plan_silence_aware(
        &self,
        bucket: &str,
        key: &str,
        file_size: u64,
        total_duration: f64,
        sink: Option<&mpsc::Sender<ChunkPlan>>,
    ) -> Result<Vec<ChunkPlan>> {
        let max_chunk = self.config.max_chunk_duration_seconds;

        // A short recording is one chunk; no probing needed
        if total_duration < max_chunk {
            let plan = ChunkPlan::new(0, 0.0, total_duration);
            if let Some(sink) = sink {
                if sink.send(plan.clone()).await.is_err() {
                    return Err(TranscriberError::Cancelled);
                }
            }
            return Ok(vec![plan]);
        }

        let bps = self.config.bytes_per_second as f64;
        let mut plans: Vec<ChunkPlan> = Vec::new();
        let mut previous = 0.0_f64;
        let mut position = 0.0_f64;

        while position < total_duration {
            let window_end = (position + max_chunk).min(total_duration);
            let start_byte = (position * bps) as u64;
            let end_byte = ((window_end * bps) as u64).min(file_size.saturating_sub(1));

            let silences = self
                .probe_window(bucket, key, start_byte, end_byte, position)
                .await?;

            let lookback_start = (window_end - self.config.lookback_seconds).max(position);
            let mut breakpoint = select_breakpoint(&silences, lookback_start, window_end);
            // A breakpoint must advance the position; a degenerate silence
            // sitting exactly at the window start forces the cut instead
            if breakpoint.position <= position {
                breakpoint = Breakpoint::forced(window_end);
            }
            debug!(
                "Window [{:.1}, {:.1}]: {} silences, breakpoint at {:.2} ({})",
                position,
                window_end,
                silences.len(),
                breakpoint.position,
                if breakpoint.has_silence { "silence" } else { "forced" }
            );

            if breakpoint.position > previous {
                let plan = ChunkPlan::new(plans.len(), previous, breakpoint.position);
                if let Some(sink) = sink {
                    if sink.send(plan.clone()).await.is_err() {
                        return Err(TranscriberError::Cancelled);
                    }
                }
                plans.push(plan);
                previous = breakpoint.position;
            }

            position = breakpoint.position;

            if position >= total_duration - 1.0 {
                break;
            }
        }

        if previous < total_duration {
            let plan = ChunkPlan::new(plans.len(), previous, total_duration);
            if let Some(sink) = sink {
                if sink.send(plan.clone()).await.is_err() {
                    return Err(TranscriberError::Cancelled);
                }
            }
            plans.push(plan);
        }

        Ok(plans)
    }

    /// Stream one window to a temp file, probe it, and remap the intervals
    /// to absolute positions. The temp file is removed on every path out.
    async fn probe_window(
        &self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
        window_offset: f64,
    ) -> Result<Vec<SilenceInterval>> {
        let temp_path = self
            .config
            .temp_dir
            .join(format!("probe-{}.mp3", Uuid::new_v4()));

        let result = async {
            fetch_range_to_file(
                self.store.as_ref(),
                bucket,
                key,
                start_byte,
                end_byte,
                &temp_path,
            )
            .await?;
            self.probe.detect(&temp_path.to_string_lossy()).await
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to remove probe temp file {}: {}", temp_path.display(), e);
            }
        }

        let min_duration = self.config.silence_min_duration_seconds;
        Ok(result?
            .into_iter()
            .map(|s| s.offset_by(window_offset))
            .filter(|s| s.duration() >= min_duration)
            .collect())
    }
}
