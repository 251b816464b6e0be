//! Memory backpressure for chunk scheduling.
//!
//! The gate reads the resident-memory ratio of this process and delays the
//! next chunk's fetch while the ratio sits above the pause threshold. It is
//! deliberately soft: work already in flight is never preempted, and the
//! wait is bounded so a stuck reading cannot stall a run forever.

use std::sync::Mutex;
use std::time::Duration;

use sysinfo::System;
use tracing::{debug, warn};

/// Resident-memory thresholds as fractions of the process maximum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryThresholds {
    /// Log once the ratio crosses this
    pub warn: f64,
    /// Loudly warn; the next reading may force a pause
    pub critical: f64,
    /// Stop starting new chunk fetches
    pub pause: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warn: 0.75,
            critical: 0.85,
            pause: 0.90,
        }
    }
}

/// Source of the resident-memory ratio (`used / max`)
pub trait MemoryReader: Send + Sync {
    fn usage_ratio(&self) -> f64;
}

/// Production reader: process RSS over total physical memory, via sysinfo
pub struct SysinfoReader {
    system: Mutex<System>,
    pid: sysinfo::Pid,
}

impl SysinfoReader {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            pid: sysinfo::get_current_pid().expect("current pid is always resolvable"),
        }
    }
}

impl Default for SysinfoReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReader for SysinfoReader {
    fn usage_ratio(&self) -> f64 {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();
        system.refresh_process(self.pid);

        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        let used = system.process(self.pid).map(|p| p.memory()).unwrap_or(0);
        used as f64 / total as f64
    }
}

/// Number of 1-second polls before `wait_if_needed` proceeds anyway
pub const MAX_WAIT_POLLS: u32 = 30;

/// Gate that pauses new chunk work while resident memory is near its limit
pub struct BackpressureGate {
    reader: Box<dyn MemoryReader>,
    thresholds: MemoryThresholds,
    poll_interval: Duration,
    max_polls: u32,
}

impl BackpressureGate {
    pub fn new(reader: Box<dyn MemoryReader>, thresholds: MemoryThresholds) -> Self {
        Self {
            reader,
            thresholds,
            poll_interval: Duration::from_secs(1),
            max_polls: MAX_WAIT_POLLS,
        }
    }

    /// Gate backed by the sysinfo reader and default thresholds
    pub fn with_system_reader() -> Self {
        Self::new(Box::new(SysinfoReader::new()), MemoryThresholds::default())
    }

    /// Shorten the poll interval (tests run in milliseconds)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// True iff the current ratio is at or above the pause threshold
    pub fn should_pause(&self) -> bool {
        self.reader.usage_ratio() >= self.thresholds.pause
    }

    /// Sleep-and-repoll while the ratio stays at or above the pause
    /// threshold, for at most `max_polls` iterations, then proceed anyway.
    /// Returns the number of polls spent waiting.
    pub async fn wait_if_needed(&self) -> u32 {
        let mut waited = 0u32;
        loop {
            let ratio = self.reader.usage_ratio();

            if ratio >= self.thresholds.pause {
                if waited >= self.max_polls {
                    warn!(
                        "Memory ratio {:.2} still above pause threshold after {} polls; proceeding anyway",
                        ratio, waited
                    );
                    return waited;
                }
                if waited == 0 {
                    warn!(
                        "Memory ratio {:.2} >= {:.2}; pausing before next chunk",
                        ratio, self.thresholds.pause
                    );
                }
                tokio::time::sleep(self.poll_interval).await;
                waited += 1;
                continue;
            }

            if ratio >= self.thresholds.critical {
                warn!(
                    "Memory ratio {:.2} above critical threshold {:.2}",
                    ratio, self.thresholds.critical
                );
            } else if ratio >= self.thresholds.warn {
                debug!("Memory ratio {:.2} above warn threshold", ratio);
            }
            return waited;
        }
    }
}
