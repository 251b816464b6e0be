//! Scripted stand-ins for the external collaborators, shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;

use crate::memory::MemoryReader;
use crate::probe::SilenceDetector;
use crate::protocol::{SilenceInterval, TranscriptSegment};
use crate::store::{ByteStream, ObjectMetadata, ObjectStore};
use crate::transcribe::{TranscribeClient, TranscriptionResponse};
use crate::{Result, TranscriberError};

enum StoredObject {
    /// Real bytes; ranges slice them
    Real(Vec<u8>),
    /// Size-only object; ranges serve a small dummy body
    Virtual(u64),
}

/// In-memory [`ObjectStore`] with optional transient-failure injection.
pub struct MockObjectStore {
    objects: HashMap<(String, String), StoredObject>,
    head_calls: AtomicU64,
    range_calls: AtomicU64,
    failing_ranges: AtomicU64,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            head_calls: AtomicU64::new(0),
            range_calls: AtomicU64::new(0),
            failing_ranges: AtomicU64::new(0),
        }
    }

    pub fn with_object(mut self, bucket: &str, key: &str, body: Vec<u8>) -> Self {
        self.objects
            .insert((bucket.into(), key.into()), StoredObject::Real(body));
        self
    }

    /// Object that reports `size` bytes but serves dummy range bodies, so
    /// tests can pretend at multi-hour recordings without allocating them
    pub fn with_virtual_object(mut self, bucket: &str, key: &str, size: u64) -> Self {
        self.objects
            .insert((bucket.into(), key.into()), StoredObject::Virtual(size));
        self
    }

    /// Make the next `count` ranged GETs fail with a transport error
    pub fn fail_next_ranges(&self, count: u64) {
        self.failing_ranges.store(count, Ordering::SeqCst);
    }

    pub fn range_calls(&self) -> u64 {
        self.range_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, bucket: &str, key: &str) -> Result<&StoredObject> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| TranscriberError::NotFound(format!("{bucket}/{key}")))
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let size = match self.lookup(bucket, key)? {
            StoredObject::Real(body) => body.len() as u64,
            StoredObject::Virtual(size) => *size,
        };
        Ok(ObjectMetadata {
            content_length: size,
            content_type: Some("audio/mpeg".into()),
        })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<ByteStream> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);

        let failures = self.failing_ranges.load(Ordering::SeqCst);
        if failures > 0 {
            self.failing_ranges.store(failures - 1, Ordering::SeqCst);
            return Err(TranscriberError::Transport("injected range failure".into()));
        }

        let body = match self.lookup(bucket, key)? {
            StoredObject::Real(body) => {
                let start = start_byte as usize;
                let end = (end_byte as usize).min(body.len().saturating_sub(1));
                body[start..=end].to_vec()
            }
            StoredObject::Virtual(_) => vec![0u8; 64],
        };

        let chunks: Vec<Result<Bytes>> = body
            .chunks(4096)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        self.lookup(bucket, key)?;
        Ok(format!("mock://{bucket}/{key}?expires={}", ttl.as_secs()))
    }
}

/// [`SilenceDetector`] serving one scripted response per call, in order.
/// Exhausted responses come back empty.
pub struct MockSilenceDetector {
    responses: Mutex<VecDeque<Vec<SilenceInterval>>>,
    calls: AtomicU64,
    extract_calls: AtomicU64,
    failure: Option<String>,
}

impl MockSilenceDetector {
    pub fn with_responses(responses: Vec<Vec<SilenceInterval>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicU64::new(0),
            extract_calls: AtomicU64::new(0),
            failure: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            extract_calls: AtomicU64::new(0),
            failure: Some(message.to_string()),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn extract_calls(&self) -> u64 {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SilenceDetector for MockSilenceDetector {
    async fn detect(&self, _input: &str) -> Result<Vec<SilenceInterval>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(TranscriberError::AnalysisFailed(message.clone()));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn extract_clip(
        &self,
        _input: &str,
        _start_seconds: f64,
        _end_seconds: f64,
        output: &Path,
    ) -> Result<()> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(TranscriberError::AnalysisFailed(message.clone()));
        }
        tokio::fs::write(output, b"mock mp3 clip").await?;
        Ok(())
    }
}

/// [`TranscribeClient`] that fabricates one segment per chunk, records the
/// indices it was called with, and can fail on a chosen index.
pub struct MockTranscribeClient {
    scripted: Mutex<HashMap<usize, TranscriptionResponse>>,
    calls: Mutex<Vec<usize>>,
    fail_on: Option<usize>,
}

impl MockTranscribeClient {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    /// Use a fixed response for one chunk index instead of the generated one
    pub fn with_response(self, chunk_index: usize, response: TranscriptionResponse) -> Self {
        self.scripted.lock().unwrap().insert(chunk_index, response);
        self
    }

    /// Fail every call for `chunk_index` with a transport error
    pub fn failing_on(mut self, chunk_index: usize) -> Self {
        self.fail_on = Some(chunk_index);
        self
    }

    /// Chunk indices transcribed so far, in call order
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockTranscribeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscribeClient for MockTranscribeClient {
    async fn transcribe(
        &self,
        audio_path: &Path,
        chunk_duration_seconds: f64,
        chunk_index: usize,
    ) -> Result<TranscriptionResponse> {
        assert!(
            audio_path.exists(),
            "chunk audio file must exist at transcription time"
        );
        self.calls.lock().unwrap().push(chunk_index);

        if self.fail_on == Some(chunk_index) {
            return Err(TranscriberError::Transport(format!(
                "chunk {chunk_index} failed after 5 attempts: injected"
            )));
        }

        if let Some(response) = self.scripted.lock().unwrap().get(&chunk_index) {
            return Ok(response.clone());
        }

        Ok(TranscriptionResponse {
            segments: vec![TranscriptSegment::new(
                0.0,
                chunk_duration_seconds,
                format!("spoken words for chunk {chunk_index}"),
            )],
            language: Some("en".into()),
        })
    }
}

/// Memory reader pinned to one ratio
pub struct StubMemoryReader {
    pub ratio: f64,
}

impl MemoryReader for StubMemoryReader {
    fn usage_ratio(&self) -> f64 {
        self.ratio
    }
}
