use anyhow::{Context, Result};
use archive_transcriber::{
    cache::ChunkCache,
    config::{CacheConfig, FetchStrategy, TranscriberConfig},
    memory::BackpressureGate,
    pipeline::{TranscriptionPipeline, TranscriptionRequest},
    probe::FfmpegSilenceProbe,
    protocol::ChunkingMode,
    store::HttpObjectStore,
    transcribe::HttpTranscribeClient,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "archive-transcriber")]
#[command(about = "Transcribe very large recordings held in object storage")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Object-store bucket holding the recordings
    #[arg(long)]
    pub bucket: String,

    /// Object key to transcribe; repeat for multiple runs
    #[arg(long = "key", required = true)]
    pub keys: Vec<String>,

    /// Object-store gateway base URL
    #[arg(long, default_value = "http://localhost:9000")]
    pub store_url: String,

    /// Transcription service endpoint
    #[arg(long, default_value = "http://localhost:8000/transcribe")]
    pub transcribe_url: String,

    /// Bearer token for the transcription service
    #[arg(long)]
    pub api_key: Option<String>,

    /// Audio tool binary used for silence probing and extraction
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Chunk boundary strategy
    #[arg(long, value_enum, default_value = "silence-aware")]
    pub mode: ModeArg,

    /// How chunk audio is fetched
    #[arg(long, value_enum, default_value = "byte-range")]
    pub fetch: FetchArg,

    /// Hard upper bound per chunk in seconds
    #[arg(long, default_value = "3600")]
    pub max_chunk_duration_seconds: f64,

    /// Overlap between adjacent chunks in overlap mode, seconds
    #[arg(long, default_value = "30")]
    pub overlap_seconds: f64,

    /// Silence threshold in dBFS passed to the audio tool
    #[arg(long, default_value = "-30", allow_hyphen_values = true)]
    pub silence_noise_threshold: f64,

    /// Minimum silence length counted, seconds
    #[arg(long, default_value = "0.5")]
    pub silence_min_duration: f64,

    /// Tail window searched for silences when planning, seconds
    #[arg(long, default_value = "600")]
    pub lookback_seconds: f64,

    /// Minimum common word run for a valid overlap merge
    #[arg(long, default_value = "3")]
    pub min_match_words: usize,

    /// Byte-rate constant for time<->byte estimation
    #[arg(long, default_value = "16000")]
    pub bytes_per_second: u64,

    /// Directory for transient chunk and probe files
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Reject recordings estimated longer than this many hours
    #[arg(long, default_value = "24")]
    pub max_file_duration_hours: f64,

    /// Number of full runs permitted in parallel
    #[arg(long, default_value = "2")]
    pub concurrent_runs: usize,

    /// Chunk-cache directory; omit for a throwaway cache
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Chunk-cache size cap in bytes
    #[arg(long, default_value = "536870912")]
    pub cache_max_size: u64,

    /// Chunk-cache entry lifetime in hours
    #[arg(long, default_value = "24")]
    pub cache_ttl_hours: u64,

    /// Write one JSON transcript per key here instead of stdout
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Seconds between service statistics reports
    #[arg(long, default_value = "60")]
    pub stats_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum ModeArg {
    SilenceAware,
    Overlap,
}

impl From<ModeArg> for ChunkingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::SilenceAware => ChunkingMode::SilenceAware,
            ModeArg::Overlap => ChunkingMode::Overlap,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum FetchArg {
    ByteRange,
    Extract,
}

impl From<FetchArg> for FetchStrategy {
    fn from(fetch: FetchArg) -> Self {
        match fetch {
            FetchArg::ByteRange => FetchStrategy::ByteRange,
            FetchArg::Extract => FetchStrategy::Extract,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Args {
    fn to_config(&self) -> TranscriberConfig {
        TranscriberConfig {
            mode: self.mode.into(),
            fetch_strategy: self.fetch.into(),
            max_chunk_duration_seconds: self.max_chunk_duration_seconds,
            overlap_seconds: self.overlap_seconds,
            silence_noise_threshold_db: self.silence_noise_threshold,
            silence_min_duration_seconds: self.silence_min_duration,
            lookback_seconds: self.lookback_seconds,
            min_match_words: self.min_match_words,
            bytes_per_second: self.bytes_per_second,
            temp_dir: self.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
            max_file_duration_hours: self.max_file_duration_hours,
            concurrent_runs: self.concurrent_runs,
            cache: CacheConfig {
                path: self.cache_dir.clone(),
                max_size_bytes: self.cache_max_size,
                ttl_hours: self.cache_ttl_hours,
            },
        }
    }
}

/// The service binary: one pipeline, one cache, N runs under a concurrency
/// cap, with signal handling and periodic statistics.
pub struct TranscriberService {
    pipeline: Arc<TranscriptionPipeline>,
    cache: Arc<ChunkCache>,
    config: TranscriberConfig,
    running: Arc<AtomicBool>,
    args: Args,
}

impl TranscriberService {
    /// Build the component graph from parsed arguments
    pub fn new(args: Args) -> Result<Self> {
        let config = args.to_config();
        config.validate().context("invalid configuration")?;

        let store = Arc::new(
            HttpObjectStore::new(&args.store_url).context("failed to create store client")?,
        );
        let probe = Arc::new(FfmpegSilenceProbe::new(
            &args.ffmpeg,
            config.silence_noise_threshold_db,
            config.silence_min_duration_seconds,
        ));
        let mut transcriber = HttpTranscribeClient::new(&args.transcribe_url)
            .context("failed to create transcription client")?;
        if let Some(api_key) = &args.api_key {
            transcriber = transcriber.with_api_key(api_key);
        }
        let transcriber = Arc::new(transcriber);
        let cache =
            Arc::new(ChunkCache::new(&config.cache).context("failed to open chunk cache")?);
        let gate = Arc::new(BackpressureGate::with_system_reader());

        let pipeline = Arc::new(TranscriptionPipeline::new(
            config.clone(),
            store,
            probe,
            transcriber,
            Arc::clone(&cache),
            gate,
        ));

        Ok(Self {
            pipeline,
            cache,
            config,
            running: Arc::new(AtomicBool::new(false)),
            args,
        })
    }

    /// Run every requested key to completion; returns the failure count
    pub async fn start(&self) -> Result<usize> {
        self.running.store(true, Ordering::Relaxed);

        let signal_handle = self.spawn_signal_watcher();
        let stats_handle = self.spawn_stats_reporter();

        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_runs));
        let mut runs = JoinSet::new();
        for key in &self.args.keys {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&semaphore);
            let request = TranscriptionRequest::new(&self.args.bucket, key);
            runs.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let key = request.key.clone();
                (key, pipeline.run(request).await)
            });
        }

        let mut failures = 0usize;
        while let Some(joined) = runs.join_next().await {
            let (key, outcome) = joined.context("run task panicked")?;
            match outcome {
                Ok(transcript) => {
                    self.write_output(&key, &transcript).await?;
                }
                Err(run_error) => {
                    failures += 1;
                    error!("Run for {} failed: {}", key, run_error);
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        signal_handle.abort();
        stats_handle.abort();

        info!("All runs finished; final cache stats: {}", self.cache.stats());
        Ok(failures)
    }

    async fn write_output(
        &self,
        key: &str,
        transcript: &archive_transcriber::pipeline::MergedTranscript,
    ) -> Result<()> {
        let json =
            serde_json::to_string_pretty(transcript).context("failed to serialize transcript")?;
        match &self.args.output_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(output_file_name(key));
                tokio::fs::write(&path, json).await?;
                info!("Wrote transcript for {} to {}", key, path.display());
            }
            None => println!("{json}"),
        }
        Ok(())
    }

    /// Cancel all runs when the process receives Ctrl-C or TERM
    fn spawn_signal_watcher(&self) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C; cancelling runs");
                }
                _ = wait_for_term_signal() => {
                    info!("Received TERM signal; cancelling runs");
                }
            }
            pipeline.cancel();
        })
    }

    /// Log cache statistics periodically while runs are active
    fn spawn_stats_reporter(&self) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let running = Arc::clone(&self.running);
        let period = Duration::from_secs(self.args.stats_interval.max(1));

        tokio::spawn(async move {
            let mut interval = interval(period);
            interval.tick().await;
            while running.load(Ordering::Relaxed) {
                interval.tick().await;
                info!("Service stats: cache {} ({} entries)", cache.stats(), cache.len());
            }
        })
    }
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    } else {
        futures::future::pending::<()>().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    // On non-Unix systems, just wait indefinitely
    futures::future::pending::<()>().await;
}

/// File-safe name for a transcript written to the output directory
fn output_file_name(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{safe}.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Archive Transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Store: {}", args.store_url);
    info!("  Transcription service: {}", args.transcribe_url);
    info!("  Bucket: {}", args.bucket);
    info!("  Keys: {}", args.keys.len());
    info!("  Mode: {:?}", args.mode);
    info!("  Concurrent runs: {}", args.concurrent_runs);

    let total_keys = args.keys.len();
    let service = TranscriberService::new(args).context("failed to create service")?;
    let failures = service.start().await?;

    if failures > 0 {
        anyhow::bail!("{failures} of {total_keys} runs failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from([
            "archive-transcriber",
            "--bucket",
            "recordings",
            "--key",
            "a.mp3",
            "--key",
            "b.mp3",
            "--mode",
            "overlap",
            "--silence-noise-threshold",
            "-42.5",
            "--log-level",
            "debug",
        ]);

        assert_eq!(args.bucket, "recordings");
        assert_eq!(args.keys, vec!["a.mp3", "b.mp3"]);
        assert_eq!(args.mode, ModeArg::Overlap);
        assert_eq!(args.silence_noise_threshold, -42.5);
        assert!(matches!(args.log_level, LogLevel::Debug));
    }

    #[test]
    fn test_args_defaults_map_to_config() {
        let args = Args::parse_from(["archive-transcriber", "--bucket", "b", "--key", "k.mp3"]);
        let config = args.to_config();

        assert_eq!(config.mode, ChunkingMode::SilenceAware);
        assert_eq!(config.fetch_strategy, FetchStrategy::ByteRange);
        assert_eq!(config.max_chunk_duration_seconds, 3600.0);
        assert_eq!(config.bytes_per_second, 16_000);
        assert_eq!(config.cache.ttl_hours, 24);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_creation_with_defaults() {
        let args = Args::parse_from(["archive-transcriber", "--bucket", "b", "--key", "k.mp3"]);
        let service = TranscriberService::new(args).unwrap();
        assert!(!service.running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_service_creation_rejects_bad_config() {
        let args = Args::parse_from([
            "archive-transcriber",
            "--bucket",
            "b",
            "--key",
            "k.mp3",
            "--overlap-seconds",
            "3600",
        ]);
        assert!(TranscriberService::new(args).is_err());
    }

    #[test]
    fn test_output_file_name_flattens_paths() {
        assert_eq!(output_file_name("board/2024/06.mp3"), "board_2024_06.mp3.json");
        assert_eq!(output_file_name("plain.mp3"), "plain.mp3.json");
    }
}
