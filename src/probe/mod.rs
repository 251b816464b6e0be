//! Silence detection and clip extraction via an external audio tool.
//!
//! The tool contract is ffmpeg-shaped: a `silencedetect` filter that prints
//! `silence_start: <seconds>` / `silence_end: <seconds>` pairs on its
//! diagnostic stream, and a `-ss`/`-to` extraction mode producing a
//! standalone MP3. Everything that parses the diagnostic stream is a pure
//! function so tests never need the tool installed.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::protocol::SilenceInterval;
use crate::{Result, TranscriberError};

/// Hard cap on intervals per invocation; prevents pathological inputs from
/// ballooning the planner's working set
pub const MAX_INTERVALS: usize = 10_000;

/// Silence analysis over any tool-readable input (local path or URL).
#[async_trait]
pub trait SilenceDetector: Send + Sync {
    /// Run the analyser and return silence intervals sorted by start,
    /// relative to the start of `input`.
    async fn detect(&self, input: &str) -> Result<Vec<SilenceInterval>>;

    /// Extract `[start_seconds, end_seconds]` of `input` into a standalone
    /// MP3 at `output`.
    async fn extract_clip(
        &self,
        input: &str,
        start_seconds: f64,
        end_seconds: f64,
        output: &Path,
    ) -> Result<()>;
}

/// ffmpeg-backed [`SilenceDetector`].
pub struct FfmpegSilenceProbe {
    ffmpeg_path: String,
    noise_threshold_db: f64,
    min_duration_seconds: f64,
}

impl FfmpegSilenceProbe {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        noise_threshold_db: f64,
        min_duration_seconds: f64,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            noise_threshold_db,
            min_duration_seconds,
        }
    }

    fn silence_filter(&self) -> String {
        format!(
            "silencedetect=noise={}dB:d={}",
            self.noise_threshold_db, self.min_duration_seconds
        )
    }
}

#[async_trait]
impl SilenceDetector for FfmpegSilenceProbe {
    async fn detect(&self, input: &str) -> Result<Vec<SilenceInterval>> {
        let mut child = Command::new(&self.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-nostats")
            .arg("-i")
            .arg(input)
            .arg("-af")
            .arg(self.silence_filter())
            .arg("-f")
            .arg("null")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TranscriberError::AnalysisFailed(format!(
                    "failed to spawn {}: {}",
                    self.ffmpeg_path, e
                ))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscriberError::AnalysisFailed("failed to capture stderr".into()))?;

        let mut parser = SilenceParser::new(self.min_duration_seconds, MAX_INTERVALS);
        let mut tail: Vec<String> = Vec::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            parser.feed(&line);
            if tail.len() >= 8 {
                tail.remove(0);
            }
            tail.push(line);
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(TranscriberError::AnalysisFailed(format!(
                "audio tool exited with {}: {}",
                status,
                tail.join(" | ")
            )));
        }

        let intervals = parser.finish();
        debug!("Silence probe found {} intervals in {}", intervals.len(), input);
        Ok(intervals)
    }

    async fn extract_clip(
        &self,
        input: &str,
        start_seconds: f64,
        end_seconds: f64,
        output: &Path,
    ) -> Result<()> {
        let status = Command::new(&self.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-nostats")
            .arg("-y")
            .arg("-ss")
            .arg(format!("{start_seconds}"))
            .arg("-to")
            .arg(format!("{end_seconds}"))
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-c:a")
            .arg("libmp3lame")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| {
                TranscriberError::AnalysisFailed(format!(
                    "failed to spawn {}: {}",
                    self.ffmpeg_path, e
                ))
            })?;

        if !status.success() {
            return Err(TranscriberError::AnalysisFailed(format!(
                "clip extraction [{:.2}, {:.2}] exited with {}",
                start_seconds, end_seconds, status
            )));
        }
        Ok(())
    }
}

/// Incremental parser for the analyser's diagnostic stream.
///
/// Pairs `silence_start` with the following `silence_end`; a trailing
/// unpaired start is dropped silently at end of stream.
pub struct SilenceParser {
    min_duration_seconds: f64,
    cap: usize,
    pending_start: Option<f64>,
    intervals: Vec<SilenceInterval>,
    capped: bool,
}

impl SilenceParser {
    pub fn new(min_duration_seconds: f64, cap: usize) -> Self {
        Self {
            min_duration_seconds,
            cap,
            pending_start: None,
            intervals: Vec::new(),
            capped: false,
        }
    }

    /// Consume one diagnostic line
    pub fn feed(&mut self, line: &str) {
        if self.intervals.len() >= self.cap {
            if !self.capped {
                warn!("Silence probe hit the {}-interval cap; ignoring the rest", self.cap);
                self.capped = true;
            }
            return;
        }

        if let Some(value) = extract_field(line, "silence_start:") {
            self.pending_start = Some(value);
        } else if let Some(value) = extract_field(line, "silence_end:") {
            if let Some(start) = self.pending_start.take() {
                if value > start && value - start >= self.min_duration_seconds {
                    self.intervals.push(SilenceInterval::new(start, value));
                }
            }
        }
    }

    /// Finish parsing, returning intervals sorted by start
    pub fn finish(mut self) -> Vec<SilenceInterval> {
        self.intervals
            .sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
        self.intervals
    }
}

/// Pull the float that follows `field` out of a diagnostic line
fn extract_field(line: &str, field: &str) -> Option<f64> {
    let idx = line.find(field)?;
    let rest = &line[idx + field.len()..];
    let token = rest.split_whitespace().next()?;
    token.parse::<f64>().ok()
}

/// Parse a complete diagnostic stream in one shot
pub fn parse_silence_output<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    min_duration_seconds: f64,
    cap: usize,
) -> Vec<SilenceInterval> {
    let mut parser = SilenceParser::new(min_duration_seconds, cap);
    for line in lines {
        parser.feed(line);
    }
    parser.finish()
}
