//! Transcript reconciliation.
//!
//! Overlap chunking makes adjacent chunks transcribe the same audio twice;
//! this module removes the duplicated phrasing by aligning the previous
//! chunk's tail with the next chunk's head on their longest contiguous run
//! of common words, then cutting the next chunk at the timestamp where the
//! match ends. Silence-aware chunking needs no alignment and concatenates.
//!
//! All output times are absolute positions in the original recording, and
//! `start` never decreases across the final sequence.

use tracing::{debug, warn};

use crate::protocol::{ChunkTranscript, ChunkingMode, MergedSegment, TranscriptSegment};
use crate::{Result, TranscriberError};

/// Characters stripped before word comparison
const STRIP_CHARS: &[char] = &['.', ',', '!', '?', ';', ':', '\'', '"'];

/// Normalise a word for comparison: lowercase, punctuation stripped
pub fn normalize_word(word: &str) -> String {
    word.chars()
        .filter(|c| !STRIP_CHARS.contains(c))
        .collect::<String>()
        .to_lowercase()
}

/// Split segments into normalised tokens, one per whitespace-separated word.
///
/// Tokens that normalise to the empty string are kept so token positions
/// stay aligned with the per-segment word counts used for cutoffs.
fn tokenize(segments: &[TranscriptSegment]) -> Vec<String> {
    segments
        .iter()
        .flat_map(|s| s.text.split_whitespace())
        .map(normalize_word)
        .collect()
}

/// Number of whitespace-separated words in a segment
fn word_count(segment: &TranscriptSegment) -> usize {
    segment.text.split_whitespace().count()
}

/// A contiguous run of equal tokens shared by two token lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonRun {
    /// Start index in the first list
    pub i: usize,
    /// Start index in the second list
    pub j: usize,
    /// Run length in words
    pub len: usize,
}

/// Longest contiguous common word run between `a` and `b`.
///
/// Nested sliding windows: every start pair is extended while tokens match.
/// Ties break to the earlier `j`, then the earlier `i`. Runs shorter than
/// `min_len` do not count.
pub fn longest_common_run(a: &[String], b: &[String], min_len: usize) -> Option<CommonRun> {
    let mut best: Option<CommonRun> = None;

    for j in 0..b.len() {
        for i in 0..a.len() {
            let mut len = 0;
            while i + len < a.len() && j + len < b.len() && a[i + len] == b[j + len] {
                len += 1;
            }
            if len >= min_len && best.map_or(true, |run| len > run.len) {
                best = Some(CommonRun { i, j, len });
            }
        }
    }

    best
}

/// Merger over completed chunk transcripts, strategy selected by the
/// chunking mode.
pub struct TranscriptMerger {
    mode: ChunkingMode,
    min_match_words: usize,
}

impl TranscriptMerger {
    pub fn new(mode: ChunkingMode, min_match_words: usize) -> Self {
        Self {
            mode,
            min_match_words,
        }
    }

    /// Produce the final ordered timeline from chunk transcripts in
    /// chunk-index order. Fails with `InternalInvariant` if the result has
    /// a decreasing start time.
    pub fn merge(&self, chunks: &[ChunkTranscript]) -> Result<Vec<MergedSegment>> {
        let merged = match self.mode {
            ChunkingMode::Overlap => self.merge_overlap(chunks),
            ChunkingMode::SilenceAware => self.merge_concat(chunks),
        };
        check_monotonic(&merged)?;
        Ok(merged)
    }

    /// Overlap reconciliation: the first chunk contributes everything;
    /// every later chunk is cut where its words stop repeating the
    /// previous chunk's tail.
    fn merge_overlap(&self, chunks: &[ChunkTranscript]) -> Vec<MergedSegment> {
        let mut output: Vec<MergedSegment> = Vec::new();
        let Some(first) = chunks.first() else {
            return output;
        };
        output.extend(first.absolute_segments());

        for pair in chunks.windows(2) {
            let (prev, curr) = (&pair[0], &pair[1]);
            output.extend(self.reconcile_pair(prev, curr));
        }

        output
    }

    /// Segments of `curr` that survive reconciliation against `prev`,
    /// already in absolute time.
    fn reconcile_pair(
        &self,
        prev: &ChunkTranscript,
        curr: &ChunkTranscript,
    ) -> Vec<MergedSegment> {
        // The tail of prev that overlaps curr's time range
        let tail_start = curr.start_offset - prev.start_offset;
        let tail: Vec<TranscriptSegment> = prev
            .segments
            .iter()
            .filter(|s| s.start >= tail_start)
            .cloned()
            .collect();

        if tail.is_empty() {
            return curr.absolute_segments();
        }

        let tail_tokens = tokenize(&tail);
        let curr_tokens = tokenize(&curr.segments);

        match longest_common_run(&tail_tokens, &curr_tokens, self.min_match_words) {
            Some(run) => {
                let match_end_word_index = run.j + run.len;
                let cutoff = cutoff_after_words(&curr.segments, match_end_word_index);
                let absolute_cutoff = curr.start_offset + cutoff;
                debug!(
                    "Chunks {}->{}: {}-word match, cutting chunk {} at {:.2}s",
                    prev.chunk_index, curr.chunk_index, run.len, curr.chunk_index, absolute_cutoff
                );
                curr.absolute_segments()
                    .into_iter()
                    .filter(|s| s.start >= absolute_cutoff)
                    .collect()
            }
            None => {
                // No alignment found; fall back to cutting at the previous
                // chunk's last timestamp
                let absolute_cutoff = prev.start_offset + prev.last_segment_end();
                warn!(
                    "Chunks {}->{}: no word match of length >= {}; falling back to timestamp cut at {:.2}s",
                    prev.chunk_index, curr.chunk_index, self.min_match_words, absolute_cutoff
                );
                curr.absolute_segments()
                    .into_iter()
                    .filter(|s| s.start >= absolute_cutoff)
                    .collect()
            }
        }
    }

    /// Silence-aware merge: pure concatenation in chunk-index order.
    /// Overlapping boundaries are unexpected here; they are logged and
    /// appended anyway.
    fn merge_concat(&self, chunks: &[ChunkTranscript]) -> Vec<MergedSegment> {
        let mut output: Vec<MergedSegment> = Vec::new();

        for chunk in chunks {
            let segments = chunk.absolute_segments();
            if let (Some(last), Some(first)) = (output.last(), segments.first()) {
                if first.start < last.start {
                    warn!(
                        "Chunk {} starts at {:.2}s before previous segment at {:.2}s; appending anyway",
                        chunk.chunk_index, first.start, last.start
                    );
                }
            }
            output.extend(segments);
        }

        output
    }
}

/// Relative end time of the segment where the cumulative word count first
/// reaches `word_index`. Falls back to the last segment's end if the count
/// is never reached.
fn cutoff_after_words(segments: &[TranscriptSegment], word_index: usize) -> f64 {
    let mut cumulative = 0usize;
    for segment in segments {
        cumulative += word_count(segment);
        if cumulative >= word_index {
            return segment.end;
        }
    }
    segments.last().map(|s| s.end).unwrap_or(0.0)
}

/// Reject timelines whose start times decrease
fn check_monotonic(segments: &[MergedSegment]) -> Result<()> {
    for pair in segments.windows(2) {
        if pair[1].start < pair[0].start {
            return Err(TranscriberError::InternalInvariant(format!(
                "merged timeline decreases: {:.3}s after {:.3}s ({:?} after {:?})",
                pair[1].start, pair[0].start, pair[1].text, pair[0].text
            )));
        }
    }
    Ok(())
}
