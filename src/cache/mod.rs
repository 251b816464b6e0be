//! Persistent chunk-transcript cache.
//!
//! A sled-backed map from rendered [`CacheKey`]s to MessagePack-encoded
//! transcripts. This is the only state that survives a crash: a re-run with
//! an identical request skips every chunk already present here. Semantics
//! are last-writer-wins; recomputing an evicted chunk from the same inputs
//! yields the same logical transcript.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::protocol::{CacheKey, ChunkTranscript};
use crate::{Result, TranscriberError};

/// Cache observability counters
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hits={}, misses={}, hit_ratio={:.2}",
            self.hits,
            self.misses,
            self.hit_ratio()
        )
    }
}

/// Stored value: the transcript plus its insertion time for TTL eviction
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry {
    transcript: ChunkTranscript,
    stored_at: DateTime<Utc>,
}

/// Bounded, persistent map of chunk transcripts keyed for at-most-once work
/// per plan. Safe under concurrent access from multiple runs.
pub struct ChunkCache {
    db: sled::Db,
    max_size_bytes: u64,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    // Keeps a temp-backed cache directory alive for the cache's lifetime
    _temp_dir: Option<tempfile::TempDir>,
}

impl ChunkCache {
    /// Open (or create) a cache according to `config`
    pub fn new(config: &CacheConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open(path, config.max_size_bytes, config.ttl_hours),
            None => Self::new_temp_with_limits(config.max_size_bytes, config.ttl_hours),
        }
    }

    /// Open a cache at `path`
    pub fn open(path: &Path, max_size_bytes: u64, ttl_hours: u64) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            max_size_bytes,
            ttl: Duration::hours(ttl_hours as i64),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            _temp_dir: None,
        })
    }

    /// Cache in a throwaway directory, with default limits
    pub fn new_temp() -> Result<Self> {
        let defaults = CacheConfig::default();
        Self::new_temp_with_limits(defaults.max_size_bytes, defaults.ttl_hours)
    }

    fn new_temp_with_limits(max_size_bytes: u64, ttl_hours: u64) -> Result<Self> {
        let temp_dir = tempfile::TempDir::new()?;
        let db = sled::open(temp_dir.path())?;
        Ok(Self {
            db,
            max_size_bytes,
            ttl: Duration::hours(ttl_hours as i64),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            _temp_dir: Some(temp_dir),
        })
    }

    /// Look up the transcript for `key`. Expired entries are evicted on the
    /// way out and reported as misses.
    pub fn get(&self, key: &CacheKey) -> Result<Option<ChunkTranscript>> {
        let rendered = key.render();
        match self.db.get(rendered.as_bytes())? {
            Some(bytes) => match rmp_serde::from_slice::<CachedEntry>(&bytes) {
                Ok(entry) if !self.is_expired(&entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit for {}", rendered);
                    Ok(Some(entry.transcript))
                }
                Ok(_) => {
                    self.db.remove(rendered.as_bytes())?;
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache entry for {} expired", rendered);
                    Ok(None)
                }
                Err(e) => {
                    // Corrupt value: drop it rather than poisoning the run
                    warn!("Evicting undecodable cache entry {}: {}", rendered, e);
                    self.db.remove(rendered.as_bytes())?;
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store the transcript under `key` and enforce the eviction limits
    pub fn put(&self, key: &CacheKey, transcript: &ChunkTranscript) -> Result<()> {
        self.put_with_timestamp(key, transcript, Utc::now())
    }

    fn put_with_timestamp(
        &self,
        key: &CacheKey,
        transcript: &ChunkTranscript,
        stored_at: DateTime<Utc>,
    ) -> Result<()> {
        let entry = CachedEntry {
            transcript: transcript.clone(),
            stored_at,
        };
        let bytes = rmp_serde::to_vec(&entry)
            .map_err(|e| TranscriberError::Cache(format!("encode {}: {e}", key.render())))?;
        self.db.insert(key.render().as_bytes(), bytes)?;
        self.sweep()?;
        Ok(())
    }

    /// Remove one entry; returns whether it existed
    pub fn evict(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.db.remove(key.render().as_bytes())?.is_some())
    }

    /// Remove every chunk cached for one object; returns the count removed
    pub fn evict_all_for_file(&self, bucket: &str, key: &str) -> Result<usize> {
        let prefix = CacheKey::file_prefix(bucket, key);
        let mut removed = 0;
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (stored_key, _) = item?;
            self.db.remove(&stored_key)?;
            removed += 1;
        }
        debug!("Evicted {} cached chunks for {}/{}", removed, bucket, key);
        Ok(removed)
    }

    /// Current hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    fn is_expired(&self, entry: &CachedEntry) -> bool {
        Utc::now() - entry.stored_at > self.ttl
    }

    /// Drop expired entries, then evict oldest-first until the stored bytes
    /// fit the size cap
    fn sweep(&self) -> Result<()> {
        let mut live: Vec<(sled::IVec, u64, DateTime<Utc>)> = Vec::new();
        let mut total_bytes = 0u64;

        for item in self.db.iter() {
            let (stored_key, value) = item?;
            match rmp_serde::from_slice::<CachedEntry>(&value) {
                Ok(entry) if self.is_expired(&entry) => {
                    self.db.remove(&stored_key)?;
                }
                Ok(entry) => {
                    total_bytes += value.len() as u64;
                    live.push((stored_key, value.len() as u64, entry.stored_at));
                }
                Err(_) => {
                    self.db.remove(&stored_key)?;
                }
            }
        }

        if total_bytes > self.max_size_bytes {
            live.sort_by_key(|(_, _, stored_at)| *stored_at);
            for (stored_key, size, _) in live {
                if total_bytes <= self.max_size_bytes {
                    break;
                }
                self.db.remove(&stored_key)?;
                total_bytes -= size;
            }
            warn!("Cache size cap reached; evicted oldest entries");
        }

        Ok(())
    }
}
