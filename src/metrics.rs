//! Ingest bitrate estimator (part of C9, §4.9): a sliding 10 s / 1 Hz
//! window over bytes ingested, plus running counters for
//! `bytes_ingested`/`segments_fetched`/`samples`/`errors`.
//!
//! Adapted from the teacher's `PacketMetrics` (bitrate via
//! bytes-over-elapsed, auto-report on an interval) by replacing its
//! single running-average window with a ring of 1 s buckets so the
//! estimate reflects only the last 10 s rather than the whole session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(10);
const BUCKET: Duration = Duration::from_secs(1);

struct Bucket {
    started_at: Instant,
    bytes: u64,
}

/// Tracks bytes/segments/samples/errors for one ingest driver instance and
/// estimates current bitrate from the trailing window.
pub struct IngestMetrics {
    buckets: VecDeque<Bucket>,
    pub bytes_ingested: u64,
    pub segments_fetched: u64,
    pub samples: u64,
    pub errors: u64,
    source_name: String,
}

impl IngestMetrics {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            buckets: VecDeque::new(),
            bytes_ingested: 0,
            segments_fetched: 0,
            samples: 0,
            errors: 0,
            source_name: source_name.into(),
        }
    }

    pub fn record_bytes(&mut self, bytes: usize) {
        self.bytes_ingested += bytes as u64;
        let now = Instant::now();
        match self.buckets.back_mut() {
            Some(bucket) if now.duration_since(bucket.started_at) < BUCKET => {
                bucket.bytes += bytes as u64;
            }
            _ => {
                self.buckets.push_back(Bucket {
                    started_at: now,
                    bytes: bytes as u64,
                });
            }
        }
        self.evict_expired_buckets(now);
    }

    pub fn record_segment_fetched(&mut self) {
        self.segments_fetched += 1;
    }

    pub fn record_sample(&mut self) {
        self.samples += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    fn evict_expired_buckets(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.started_at) > WINDOW {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bits per second averaged over the trailing window (up to 10 s).
    pub fn current_bitrate_bps(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }
        let span = self
            .buckets
            .back()
            .unwrap()
            .started_at
            .duration_since(self.buckets.front().unwrap().started_at)
            + BUCKET;
        let total_bytes: u64 = self.buckets.iter().map(|b| b.bytes).sum();
        if span.as_secs_f64() <= 0.0 {
            return 0.0;
        }
        (total_bytes as f64 * 8.0) / span.as_secs_f64()
    }

    pub fn log_snapshot(&self) {
        debug!(
            source = %self.source_name,
            bitrate_mbps = self.current_bitrate_bps() / 1_000_000.0,
            bytes_ingested = self.bytes_ingested,
            segments_fetched = self.segments_fetched,
            errors = self.errors,
            "ingest metrics"
        );
    }

    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            bytes_ingested: self.bytes_ingested,
            segments_fetched: self.segments_fetched,
            samples: self.samples,
            errors: self.errors,
            bitrate_bps: self.current_bitrate_bps(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestMetricsSnapshot {
    pub bytes_ingested: u64,
    pub segments_fetched: u64,
    pub samples: u64,
    pub errors: u64,
    pub bitrate_bps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_counters() {
        let mut m = IngestMetrics::new("test");
        m.record_bytes(1000);
        m.record_segment_fetched();
        m.record_sample();
        m.record_error();
        assert_eq!(m.bytes_ingested, 1000);
        assert_eq!(m.segments_fetched, 1);
        assert_eq!(m.samples, 1);
        assert_eq!(m.errors, 1);
    }

    #[test]
    fn bitrate_is_zero_with_no_data() {
        let m = IngestMetrics::new("test");
        assert_eq!(m.current_bitrate_bps(), 0.0);
    }

    #[test]
    fn bitrate_reflects_recorded_bytes() {
        let mut m = IngestMetrics::new("test");
        m.record_bytes(125_000); // 1 Mbit in one ~1s bucket
        assert!(m.current_bitrate_bps() > 0.0);
    }
}
