use serde::{Deserialize, Serialize};

/// A detected region of silence in the recording.
///
/// Times are seconds. Intervals produced by the probe are file-relative to
/// the window that was analysed; the planner remaps them to absolute
/// positions before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SilenceInterval {
    /// Start of the silence in seconds
    pub start: f64,
    /// End of the silence in seconds (always > start)
    pub end: f64,
}

impl SilenceInterval {
    /// Create a new silence interval
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Length of the silence in seconds
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Midpoint of the silence, where a breakpoint is placed
    pub fn midpoint(&self) -> f64 {
        (self.start + self.end) / 2.0
    }

    /// Shift both endpoints by `offset` seconds
    pub fn offset_by(&self, offset: f64) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
        }
    }
}

/// A position chosen by the planner to end one chunk and start the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Absolute position in seconds
    pub position: f64,
    /// The silence this breakpoint sits in, if any
    pub silence: Option<SilenceInterval>,
    /// False means a forced cut at the maximum chunk length
    pub has_silence: bool,
}

impl Breakpoint {
    /// Breakpoint at the midpoint of a silence interval
    pub fn at_silence(silence: SilenceInterval) -> Self {
        Self {
            position: silence.midpoint(),
            silence: Some(silence),
            has_silence: true,
        }
    }

    /// Forced cut at `position` with no silence backing it
    pub fn forced(position: f64) -> Self {
        Self {
            position,
            silence: None,
            has_silence: false,
        }
    }
}

/// How the input is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkingMode {
    /// Fixed-stride chunks whose tails overlap; reconciliation requires
    /// word alignment in the merger.
    Overlap,
    /// Chunks meet exactly at silence midpoints; the merger concatenates.
    SilenceAware,
}

/// One contiguous time range of the input selected for a single
/// transcription call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPlan {
    /// Contiguous 0-based index within the run
    pub index: usize,
    /// Absolute start in seconds
    pub start_seconds: f64,
    /// Absolute end in seconds (always > start)
    pub end_seconds: f64,
    /// Start of the region shared with the next chunk, in overlap mode
    pub overlap_start: Option<f64>,
    /// End of the region shared with the next chunk, in overlap mode
    pub overlap_end: Option<f64>,
}

impl ChunkPlan {
    /// Create a plan without an overlap region
    pub fn new(index: usize, start_seconds: f64, end_seconds: f64) -> Self {
        Self {
            index,
            start_seconds,
            end_seconds,
            overlap_start: None,
            overlap_end: None,
        }
    }

    /// Create a plan that shares `[overlap_start, overlap_end]` with its
    /// successor
    pub fn with_overlap(
        index: usize,
        start_seconds: f64,
        end_seconds: f64,
        overlap_start: f64,
        overlap_end: f64,
    ) -> Self {
        Self {
            index,
            start_seconds,
            end_seconds,
            overlap_start: Some(overlap_start),
            overlap_end: Some(overlap_end),
        }
    }

    /// Planned chunk length in seconds
    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// A single timed span of transcribed text.
///
/// Times are relative to the start of the chunk the segment came from until
/// the merger converts them to absolute positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Segment start in seconds
    pub start: f64,
    /// Segment end in seconds (>= start)
    pub end: f64,
    /// Transcribed text
    pub text: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// The transcript of one executed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTranscript {
    /// Index of the plan this transcript belongs to
    pub chunk_index: usize,
    /// Absolute start of the chunk (= plan.start_seconds); added to every
    /// segment time to place it on the final timeline
    pub start_offset: f64,
    /// Segments in the order the transcription service returned them,
    /// sorted by start
    pub segments: Vec<TranscriptSegment>,
    /// Detected language tag, if the service reported one
    pub language: Option<String>,
}

impl ChunkTranscript {
    pub fn new(
        chunk_index: usize,
        start_offset: f64,
        segments: Vec<TranscriptSegment>,
        language: Option<String>,
    ) -> Self {
        Self {
            chunk_index,
            start_offset,
            segments,
            language,
        }
    }

    /// Relative end time of the last segment, or 0 when empty
    pub fn last_segment_end(&self) -> f64 {
        self.segments.last().map(|s| s.end).unwrap_or(0.0)
    }

    /// Convert every segment to absolute time by adding `start_offset`
    pub fn absolute_segments(&self) -> Vec<MergedSegment> {
        self.segments
            .iter()
            .map(|s| MergedSegment {
                start: self.start_offset + s.start,
                end: self.start_offset + s.end,
                text: s.text.clone(),
            })
            .collect()
    }

    /// Serialize to MessagePack for the chunk cache
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// A segment on the final, reconciled timeline. All times are absolute
/// positions in the original recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl MergedSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Identity of one planned chunk of one object, used for at-most-once work.
///
/// Stable under re-planning only when every input is identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    pub bucket: String,
    pub key: String,
    pub chunk_index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl CacheKey {
    /// Build the key identifying `plan` of `bucket`/`key`
    pub fn for_plan(bucket: &str, key: &str, plan: &ChunkPlan) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            chunk_index: plan.index,
            start_seconds: plan.start_seconds,
            end_seconds: plan.end_seconds,
        }
    }

    /// Render the persisted form: `bucket:key:chunk-<i>:<start>-<end>`
    /// with times formatted to two decimal places
    pub fn render(&self) -> String {
        format!(
            "{}:{}:chunk-{}:{:.2}-{:.2}",
            self.bucket, self.key, self.chunk_index, self.start_seconds, self.end_seconds
        )
    }

    /// Prefix shared by every chunk of one object, used for whole-file
    /// eviction
    pub fn file_prefix(bucket: &str, key: &str) -> String {
        format!("{}:{}:chunk-", bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_interval_math() {
        let s = SilenceInterval::new(3480.0, 3495.0);
        assert_eq!(s.duration(), 15.0);
        assert_eq!(s.midpoint(), 3487.5);

        let shifted = s.offset_by(100.0);
        assert_eq!(shifted.start, 3580.0);
        assert_eq!(shifted.end, 3595.0);
    }

    #[test]
    fn test_breakpoint_constructors() {
        let silence = SilenceInterval::new(10.0, 14.0);
        let bp = Breakpoint::at_silence(silence);
        assert!(bp.has_silence);
        assert_eq!(bp.position, 12.0);
        assert_eq!(bp.silence, Some(silence));

        let forced = Breakpoint::forced(3600.0);
        assert!(!forced.has_silence);
        assert!(forced.silence.is_none());
        assert_eq!(forced.position, 3600.0);
    }

    #[test]
    fn test_chunk_plan_duration() {
        let plan = ChunkPlan::new(0, 0.0, 3487.5);
        assert_eq!(plan.duration(), 3487.5);
        assert!(plan.overlap_start.is_none());

        let with_overlap = ChunkPlan::with_overlap(1, 3570.0, 7170.0, 7140.0, 7170.0);
        assert_eq!(with_overlap.overlap_start, Some(7140.0));
        assert_eq!(with_overlap.overlap_end, Some(7170.0));
    }

    #[test]
    fn test_absolute_segments_offsets() {
        let transcript = ChunkTranscript::new(
            2,
            7200.0,
            vec![
                TranscriptSegment::new(0.0, 4.5, "hello"),
                TranscriptSegment::new(4.5, 9.0, "world"),
            ],
            Some("en".to_string()),
        );

        let absolute = transcript.absolute_segments();
        assert_eq!(absolute.len(), 2);
        assert_eq!(absolute[0].start, 7200.0);
        assert_eq!(absolute[0].end, 7204.5);
        assert_eq!(absolute[1].start, 7204.5);
        assert_eq!(absolute[1].text, "world");
    }

    #[test]
    fn test_chunk_transcript_roundtrip() {
        let transcript = ChunkTranscript::new(
            0,
            0.0,
            vec![TranscriptSegment::new(0.0, 2.0, "testing")],
            Some("en".to_string()),
        );

        let bytes = transcript.to_bytes().unwrap();
        let restored = ChunkTranscript::from_bytes(&bytes).unwrap();
        assert_eq!(transcript, restored);
    }

    #[test]
    fn test_last_segment_end() {
        let empty = ChunkTranscript::new(0, 0.0, vec![], None);
        assert_eq!(empty.last_segment_end(), 0.0);

        let transcript = ChunkTranscript::new(
            0,
            0.0,
            vec![
                TranscriptSegment::new(0.0, 2.0, "a"),
                TranscriptSegment::new(2.0, 5.5, "b"),
            ],
            None,
        );
        assert_eq!(transcript.last_segment_end(), 5.5);
    }

    #[test]
    fn test_cache_key_render() {
        let plan = ChunkPlan::new(3, 10650.0, 14250.0);
        let key = CacheKey::for_plan("recordings", "board/2024-06-01.mp3", &plan);
        assert_eq!(
            key.render(),
            "recordings:board/2024-06-01.mp3:chunk-3:10650.00-14250.00"
        );
        assert!(key
            .render()
            .starts_with(&CacheKey::file_prefix("recordings", "board/2024-06-01.mp3")));
    }

    #[test]
    fn test_cache_key_two_decimal_formatting() {
        let plan = ChunkPlan::new(0, 0.0, 3487.5);
        let key = CacheKey::for_plan("b", "k", &plan);
        assert_eq!(key.render(), "b:k:chunk-0:0.00-3487.50");
    }
}
