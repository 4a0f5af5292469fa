//! Progress cadence, speed and ETA.
//!
//! Speed is re-derived from cumulative counters on every sample rather than a
//! sliding window, so ETA is noisy under bursty I/O.

use std::time::{Duration, Instant};

use crate::config::EngineConfig;

/// Rate figures for one emitted update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    /// Bytes processed in this phase
    pub processed: u64,

    /// Average bytes/second since the phase started
    pub speed_bps: u64,

    /// `None` while speed is still zero or the total is unknown
    pub eta_seconds: Option<u64>,
}

/// Decides when a byte stream has moved far enough, or long enough, to
/// deserve a progress update.
pub struct ProgressMeter {
    start_time: Instant,
    last_emit_time: Instant,
    last_emit_bytes: u64,
    processed: u64,
    total: Option<u64>,
    bytes_step: u64,
    interval: Duration,
}

impl ProgressMeter {
    pub fn new(total: Option<u64>, bytes_step: u64, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_emit_time: now,
            last_emit_bytes: 0,
            processed: 0,
            total,
            bytes_step: bytes_step.max(1),
            interval,
        }
    }

    pub fn from_config(total: Option<u64>, config: &EngineConfig) -> Self {
        Self::new(total, config.progress_bytes_step, config.progress_interval())
    }

    /// Count `n` more bytes. Returns a sample when an update is due.
    pub fn advance(&mut self, n: u64) -> Option<RateSample> {
        self.processed += n;
        self.poll()
    }

    /// Set the absolute byte count, for sources that report cumulative totals.
    /// Never moves backwards.
    pub fn advance_to(&mut self, processed: u64) -> Option<RateSample> {
        self.processed = self.processed.max(processed);
        self.poll()
    }

    fn poll(&mut self) -> Option<RateSample> {
        let now = Instant::now();
        let by_bytes = self.processed.saturating_sub(self.last_emit_bytes) >= self.bytes_step;
        let by_time = now.duration_since(self.last_emit_time) >= self.interval;
        if !(by_bytes || by_time) {
            return None;
        }
        self.last_emit_time = now;
        self.last_emit_bytes = self.processed;
        Some(self.sample_at(now))
    }

    /// Current figures regardless of cadence.
    pub fn sample(&self) -> RateSample {
        self.sample_at(Instant::now())
    }

    fn sample_at(&self, now: Instant) -> RateSample {
        let elapsed = now.duration_since(self.start_time).as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            (self.processed as f64 / elapsed) as u64
        } else {
            0
        };

        let eta_seconds = match self.total {
            Some(total) if speed_bps > 0 => Some(total.saturating_sub(self.processed) / speed_bps),
            _ => None,
        };

        RateSample {
            processed: self.processed,
            speed_bps,
            eta_seconds,
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
