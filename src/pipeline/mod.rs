//! Run orchestration.
//!
//! A run moves through `Pending -> Running -> Planning -> Processing ->
//! Merging -> Completed`; any fatal error lands it in `Failed`, which is
//! terminal. The planner executes as its own task feeding an ordered channel
//! of plans, so transcription of chunk N proceeds while chunk N+1 is still
//! being planned. Within a run, chunks execute strictly in index order;
//! parallelism across runs belongs to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache::ChunkCache;
use crate::config::{validate_request, TranscriberConfig};
use crate::executor::ChunkExecutor;
use crate::memory::BackpressureGate;
use crate::merge::TranscriptMerger;
use crate::planner::{estimate_duration, ChunkPlanner};
use crate::probe::SilenceDetector;
use crate::protocol::{ChunkTranscript, MergedSegment};
use crate::store::ObjectStore;
use crate::transcribe::TranscribeClient;
use crate::{RunError, TranscriberError};

/// Plans buffered between the planner and executor tasks
const PLAN_CHANNEL_CAPACITY: usize = 8;

/// Lifecycle of one transcription run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Planning,
    Processing,
    Merging,
    Completed,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Planning => "planning",
            RunState::Processing => "processing",
            RunState::Merging => "merging",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observable progress of a run. The fraction is executed plans over the
/// best known plan count; it is not required to be monotonic across
/// restarts since the cache may satisfy earlier plans instantly.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub state: RunState,
    pub executed_chunks: usize,
    pub planned_chunks: usize,
    pub fraction: f64,
}

impl RunProgress {
    fn new(state: RunState) -> Self {
        Self {
            state,
            executed_chunks: 0,
            planned_chunks: 0,
            fraction: 0.0,
        }
    }
}

/// Object coordinate to transcribe
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub bucket: String,
    pub key: String,
}

impl TranscriptionRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// The final reconciled transcript of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedTranscript {
    pub bucket: String,
    pub key: String,
    pub language: Option<String>,
    pub duration_seconds: f64,
    pub segments: Vec<MergedSegment>,
}

/// Orchestrates planning, execution and merging for transcription runs.
///
/// Every dependency is passed in explicitly; the cache is the only state
/// shared across runs.
pub struct TranscriptionPipeline {
    config: TranscriberConfig,
    store: Arc<dyn ObjectStore>,
    probe: Arc<dyn SilenceDetector>,
    transcriber: Arc<dyn TranscribeClient>,
    cache: Arc<ChunkCache>,
    gate: Arc<BackpressureGate>,
    cancelled: Arc<AtomicBool>,
}

impl TranscriptionPipeline {
    pub fn new(
        config: TranscriberConfig,
        store: Arc<dyn ObjectStore>,
        probe: Arc<dyn SilenceDetector>,
        transcriber: Arc<dyn TranscribeClient>,
        cache: Arc<ChunkCache>,
        gate: Arc<BackpressureGate>,
    ) -> Self {
        Self {
            config,
            store,
            probe,
            transcriber,
            cache,
            gate,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation: in-flight external calls finish, no new chunks
    /// start, and active runs fail with `Cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        warn!("Cancellation signal received");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Execute a run to completion
    pub async fn run(
        &self,
        request: TranscriptionRequest,
    ) -> std::result::Result<MergedTranscript, RunError> {
        self.run_with_progress(request, None).await
    }

    /// Execute a run, publishing progress on `progress` when provided
    pub async fn run_with_progress(
        &self,
        request: TranscriptionRequest,
        progress: Option<watch::Sender<RunProgress>>,
    ) -> std::result::Result<MergedTranscript, RunError> {
        let started = Instant::now();
        let mut tracker = ProgressTracker::new(progress);

        let result = self.run_inner(&request, &mut tracker).await;
        match &result {
            Ok(transcript) => {
                tracker.set_state(RunState::Completed);
                info!(
                    "Run for {}/{} completed: {} segments in {:.1}s",
                    request.bucket,
                    request.key,
                    transcript.segments.len(),
                    started.elapsed().as_secs_f64()
                );
            }
            Err(error) => {
                tracker.set_state(RunState::Failed);
                warn!(
                    "Run for {}/{} failed after {:.1}s: {}",
                    request.bucket,
                    request.key,
                    started.elapsed().as_secs_f64(),
                    error
                );
            }
        }
        result
    }

    async fn run_inner(
        &self,
        request: &TranscriptionRequest,
        tracker: &mut ProgressTracker,
    ) -> std::result::Result<MergedTranscript, RunError> {
        tracker.set_state(RunState::Running);

        self.config
            .validate()
            .map_err(|e| RunError::from_error(&e, None))?;
        validate_request(&request.bucket, &request.key)
            .map_err(|e| RunError::from_error(&e, None))?;
        self.check_cancelled().map_err(|e| RunError::from_error(&e, None))?;

        let metadata = self
            .store
            .head(&request.bucket, &request.key)
            .await
            .map_err(|e| RunError::from_error(&e, None))?;
        let file_size = metadata.content_length;

        let total_duration = estimate_duration(file_size, self.config.bytes_per_second);
        let limit = self.config.max_file_duration_seconds();
        if total_duration > limit {
            let err = TranscriberError::TooLong {
                estimated_hours: total_duration / 3600.0,
                limit_hours: self.config.max_file_duration_hours,
            };
            return Err(RunError::from_error(&err, None));
        }
        info!(
            "Starting run for {}/{}: {} bytes, {:.1}s estimated",
            request.bucket, request.key, file_size, total_duration
        );

        tracker.set_state(RunState::Planning);
        tracker.estimate_plans(estimated_plan_count(
            total_duration,
            self.config.max_chunk_duration_seconds,
        ));

        // The planner works ahead through a bounded channel while the
        // executor drains it in index order
        let (plan_tx, mut plan_rx) = mpsc::channel(PLAN_CHANNEL_CAPACITY);
        let planner_task = {
            let planner = ChunkPlanner::new(
                Arc::clone(&self.store),
                Arc::clone(&self.probe),
                self.config.clone(),
            );
            let bucket = request.bucket.clone();
            let key = request.key.clone();
            tokio::spawn(async move {
                planner
                    .plan_chunks_into(&bucket, &key, file_size, Some(&plan_tx))
                    .await
            })
        };

        let executor = ChunkExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.probe),
            Arc::clone(&self.transcriber),
            Arc::clone(&self.cache),
            Arc::clone(&self.gate),
            self.config.clone(),
        );

        let mut transcripts: Vec<ChunkTranscript> = Vec::new();
        let mut chunk_failure: Option<RunError> = None;

        while let Some(plan) = plan_rx.recv().await {
            if self.is_cancelled() {
                break;
            }
            tracker.set_state(RunState::Processing);
            tracker.plan_known(plan.index + 1);

            match executor
                .execute(&request.bucket, &request.key, file_size, &plan)
                .await
            {
                Ok(transcript) => {
                    transcripts.push(transcript);
                    tracker.chunk_executed();
                }
                Err(e) => {
                    chunk_failure = Some(RunError::from_error(&e, Some(plan.index)));
                    break;
                }
            }
        }

        // Stop the planner before deciding the outcome: dropping the
        // receiver makes any further send fail, which the planner treats as
        // its stop signal
        drop(plan_rx);
        let planner_result = planner_task.await.map_err(|e| {
            RunError::from_error(
                &TranscriberError::InternalInvariant(format!("planner task panicked: {e}")),
                None,
            )
        })?;

        if let Some(failure) = chunk_failure {
            return Err(failure);
        }
        self.check_cancelled().map_err(|e| RunError::from_error(&e, None))?;

        let plans = match planner_result {
            Ok(plans) => plans,
            // The planner only observes Cancelled when the executor stopped
            // listening, and the executor outcomes were handled above
            Err(TranscriberError::Cancelled) => Vec::new(),
            Err(e) => return Err(RunError::from_error(&e, None)),
        };
        if plans.len() != transcripts.len() {
            let err = TranscriberError::InternalInvariant(format!(
                "{} plans but {} transcripts",
                plans.len(),
                transcripts.len()
            ));
            return Err(RunError::from_error(&err, None));
        }
        tracker.planning_complete(plans.len());

        tracker.set_state(RunState::Merging);
        let merger = TranscriptMerger::new(self.config.mode, self.config.min_match_words);
        let segments = merger
            .merge(&transcripts)
            .map_err(|e| RunError::from_error(&e, None))?;

        let language = transcripts.iter().find_map(|t| t.language.clone());
        let stats = self.cache.stats();
        info!(
            "Merged {} chunks into {} segments (cache hit ratio {:.2})",
            transcripts.len(),
            segments.len(),
            stats.hit_ratio()
        );

        Ok(MergedTranscript {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            language,
            duration_seconds: total_duration,
            segments,
        })
    }

    fn check_cancelled(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(TranscriberError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Tracks and publishes run progress
struct ProgressTracker {
    sender: Option<watch::Sender<RunProgress>>,
    current: RunProgress,
    estimated_plans: usize,
    planning_done: bool,
}

impl ProgressTracker {
    fn new(sender: Option<watch::Sender<RunProgress>>) -> Self {
        Self {
            sender,
            current: RunProgress::new(RunState::Pending),
            estimated_plans: 0,
            planning_done: false,
        }
    }

    fn set_state(&mut self, state: RunState) {
        if self.current.state != state {
            self.current.state = state;
            self.publish();
        }
    }

    fn estimate_plans(&mut self, estimate: usize) {
        self.estimated_plans = estimate.max(1);
        self.recompute();
    }

    fn plan_known(&mut self, count: usize) {
        if count > self.current.planned_chunks {
            self.current.planned_chunks = count;
            self.recompute();
        }
    }

    fn planning_complete(&mut self, total: usize) {
        self.planning_done = true;
        self.current.planned_chunks = total;
        self.recompute();
    }

    fn chunk_executed(&mut self) {
        self.current.executed_chunks += 1;
        self.recompute();
    }

    fn recompute(&mut self) {
        let denominator = if self.planning_done {
            self.current.planned_chunks
        } else {
            self.current.planned_chunks.max(self.estimated_plans)
        }
        .max(1);
        self.current.fraction =
            (self.current.executed_chunks as f64 / denominator as f64).min(1.0);
        self.publish();
    }

    fn publish(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(self.current.clone());
        }
    }
}

/// Lower bound on the number of plans a recording will produce
fn estimated_plan_count(total_duration: f64, max_chunk: f64) -> usize {
    (total_duration / max_chunk).ceil().max(1.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryThresholds;
    use crate::protocol::{ChunkingMode, SilenceInterval, TranscriptSegment};
    use crate::test_support::{
        MockObjectStore, MockSilenceDetector, MockTranscribeClient, StubMemoryReader,
    };
    use crate::transcribe::TranscriptionResponse;
    use crate::ErrorKind;
    use tempfile::TempDir;

    struct Harness {
        temp: TempDir,
        store: Arc<MockObjectStore>,
        probe: Arc<MockSilenceDetector>,
        transcriber: Arc<MockTranscribeClient>,
        cache: Arc<ChunkCache>,
        config: TranscriberConfig,
    }

    impl Harness {
        fn new(
            store: MockObjectStore,
            probe: MockSilenceDetector,
            transcriber: MockTranscribeClient,
        ) -> Self {
            let temp = TempDir::new().unwrap();
            let config = TranscriberConfig {
                temp_dir: temp.path().to_path_buf(),
                ..Default::default()
            };
            Self {
                temp,
                store: Arc::new(store),
                probe: Arc::new(probe),
                transcriber: Arc::new(transcriber),
                cache: Arc::new(ChunkCache::new_temp().unwrap()),
                config,
            }
        }

        fn with_config(mut self, adjust: impl FnOnce(&mut TranscriberConfig)) -> Self {
            adjust(&mut self.config);
            self.config.temp_dir = self.temp.path().to_path_buf();
            self
        }

        fn pipeline(&self) -> TranscriptionPipeline {
            let gate = Arc::new(BackpressureGate::new(
                Box::new(StubMemoryReader { ratio: 0.1 }),
                MemoryThresholds::default(),
            ));
            TranscriptionPipeline::new(
                self.config.clone(),
                Arc::clone(&self.store) as Arc<dyn ObjectStore>,
                Arc::clone(&self.probe) as Arc<dyn SilenceDetector>,
                Arc::clone(&self.transcriber) as Arc<dyn TranscribeClient>,
                Arc::clone(&self.cache),
                gate,
            )
        }

        fn temp_is_empty(&self) -> bool {
            std::fs::read_dir(self.temp.path()).unwrap().next().is_none()
        }
    }

    fn two_hour_harness() -> Harness {
        let file_size = 7200 * 16_000u64;
        Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            MockSilenceDetector::with_responses(vec![
                vec![SilenceInterval::new(3500.0, 3510.0)],
                vec![],
            ]),
            MockTranscribeClient::new(),
        )
    }

    #[tokio::test]
    async fn test_silence_aware_run_end_to_end() {
        let harness = two_hour_harness();
        let pipeline = harness.pipeline();
        let (progress_tx, progress_rx) = watch::channel(RunProgress::new(RunState::Pending));

        let transcript = pipeline
            .run_with_progress(TranscriptionRequest::new("b", "k"), Some(progress_tx))
            .await
            .unwrap();

        // Three chunks: silence cut at 3505, forced cut at 7105, tail to 7200
        assert_eq!(transcript.segments.len(), 3);
        assert_eq!(transcript.segments[0].start, 0.0);
        assert_eq!(transcript.segments[1].start, 3505.0);
        assert_eq!(transcript.segments[2].start, 7105.0);
        assert_eq!(transcript.duration_seconds, 7200.0);
        assert_eq!(transcript.language.as_deref(), Some("en"));

        let final_progress = progress_rx.borrow();
        assert_eq!(final_progress.state, RunState::Completed);
        assert_eq!(final_progress.executed_chunks, 3);
        assert_eq!(final_progress.planned_chunks, 3);
        assert_eq!(final_progress.fraction, 1.0);

        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn test_overlap_run_deduplicates_boundary() {
        let file_size = 110 * 16_000u64;
        let shared = "shared tail words here";
        let transcriber = MockTranscribeClient::new()
            .with_response(
                0,
                TranscriptionResponse {
                    segments: vec![
                        TranscriptSegment::new(0.0, 50.0, "opening remarks"),
                        TranscriptSegment::new(50.0, 60.0, shared),
                    ],
                    language: Some("en".into()),
                },
            )
            .with_response(
                1,
                TranscriptionResponse {
                    segments: vec![
                        TranscriptSegment::new(0.0, 10.0, shared),
                        TranscriptSegment::new(10.0, 20.0, "fresh content"),
                    ],
                    language: Some("en".into()),
                },
            );

        let harness = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            MockSilenceDetector::with_responses(vec![]),
            transcriber,
        )
        .with_config(|c| {
            c.mode = ChunkingMode::Overlap;
            c.max_chunk_duration_seconds = 60.0;
            c.overlap_seconds = 10.0;
        });

        let transcript = harness
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap();

        let text: Vec<&str> = transcript.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(text, vec!["opening remarks", shared, "fresh content"]);
        assert_eq!(transcript.segments[2].start, 60.0);
    }

    #[tokio::test]
    async fn test_validation_failures_reported_before_any_io() {
        let harness = two_hour_harness();
        let pipeline = harness.pipeline();

        let err = pipeline
            .run(TranscriptionRequest::new("", "k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.chunk_index.is_none());
        assert_eq!(harness.store.range_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let harness = two_hour_harness().with_config(|c| {
            c.overlap_seconds = c.max_chunk_duration_seconds;
        });
        let err = harness
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let harness = Harness::new(
            MockObjectStore::new(),
            MockSilenceDetector::with_responses(vec![]),
            MockTranscribeClient::new(),
        );
        let err = harness
            .pipeline()
            .run(TranscriptionRequest::new("b", "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_too_long_rejected_before_any_fetch() {
        // 30 hours at the default rate
        let file_size = 30 * 3600 * 16_000u64;
        let harness = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            MockSilenceDetector::with_responses(vec![]),
            MockTranscribeClient::new(),
        );

        let err = harness
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TooLong);
        assert_eq!(harness.store.range_calls(), 0);
    }

    #[tokio::test]
    async fn test_chunk_failure_carries_index_and_preserves_cache() {
        let file_size = 7200 * 16_000u64;
        let harness = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            MockSilenceDetector::with_responses(vec![
                vec![SilenceInterval::new(3500.0, 3510.0)],
                vec![],
            ]),
            MockTranscribeClient::new().failing_on(1),
        );

        let err = harness
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
        assert_eq!(err.chunk_index, Some(1));

        // Chunk 0 stayed cached; temp files are gone
        assert_eq!(harness.cache.len(), 1);
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn test_resume_from_cache_skips_completed_chunks() {
        // First run dies on chunk 1; the re-run transcribes only chunk 1
        // and produces the same output an uninterrupted run would
        let file_size = 7200 * 16_000u64;
        let probe_script = || {
            MockSilenceDetector::with_responses(vec![
                vec![SilenceInterval::new(3500.0, 3510.0)],
                vec![],
            ])
        };

        let failed = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            probe_script(),
            MockTranscribeClient::new().failing_on(1),
        );
        let cache = Arc::clone(&failed.cache);
        failed
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap_err();

        // Re-run with an identical request against the same cache
        let mut resumed = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            probe_script(),
            MockTranscribeClient::new(),
        );
        resumed.cache = cache;
        let transcript = resumed
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap();

        // Chunk 0 came from cache: only the remaining chunks were transcribed
        assert_eq!(resumed.transcriber.calls(), vec![1, 2]);

        // And the output matches a run that never failed
        let uninterrupted = two_hour_harness();
        let expected = uninterrupted
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap();
        assert_eq!(transcript, expected);
    }

    #[tokio::test]
    async fn test_warm_cache_rerun_is_idempotent() {
        let harness = two_hour_harness();
        let pipeline = harness.pipeline();

        let first = pipeline.run(TranscriptionRequest::new("b", "k")).await.unwrap();
        let calls_after_first = harness.transcriber.call_count();

        // Planner probes again, but every chunk comes from the cache
        let probe_again = MockSilenceDetector::with_responses(vec![
            vec![SilenceInterval::new(3500.0, 3510.0)],
            vec![],
        ]);
        let mut warm = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", 7200 * 16_000u64),
            probe_again,
            MockTranscribeClient::new(),
        );
        warm.cache = Arc::clone(&harness.cache);
        let second = warm.pipeline().run(TranscriptionRequest::new("b", "k")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls_after_first, 3);
        assert_eq!(warm.transcriber.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_before_start() {
        let harness = two_hour_harness();
        let pipeline = harness.pipeline();
        pipeline.cancel();

        let err = pipeline
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(harness.transcriber.call_count(), 0);
    }

    #[tokio::test]
    async fn test_analysis_failure_fails_the_run() {
        let file_size = 7200 * 16_000u64;
        let harness = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            MockSilenceDetector::failing("tool exited with signal 9"),
            MockTranscribeClient::new(),
        );

        let err = harness
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AnalysisFailed);
        assert!(harness.temp_is_empty());
    }

    #[test]
    fn test_estimated_plan_count() {
        assert_eq!(estimated_plan_count(7200.0, 3600.0), 2);
        assert_eq!(estimated_plan_count(7201.0, 3600.0), 3);
        assert_eq!(estimated_plan_count(100.0, 3600.0), 1);
    }

    #[tokio::test]
    async fn test_short_recording_single_chunk() {
        let file_size = 600 * 16_000u64;
        let harness = Harness::new(
            MockObjectStore::new().with_virtual_object("b", "k", file_size),
            MockSilenceDetector::with_responses(vec![]),
            MockTranscribeClient::new(),
        );

        let transcript = harness
            .pipeline()
            .run(TranscriptionRequest::new("b", "k"))
            .await
            .unwrap();
        assert_eq!(transcript.segments.len(), 1);
        assert_eq!(harness.probe.calls(), 0);
        assert_eq!(harness.transcriber.calls(), vec![0]);
    }
}
