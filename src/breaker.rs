//! Circuit Breaker (C5, §4.5). Per-URL three-state FSM with a lazily
//! populated registry.
//!
//! Grounded on the retry/backoff bookkeeping in
//! `examples/v0l-zap-stream-core/crates/core/src/ingress/*` (connection
//! retry loops tracked with counters and timestamps), generalized into an
//! explicit state machine per the transition table in §4.5.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

struct BreakerEntry {
    state: BreakerState,
    failures_in_window: u32,
    window_started_at: Instant,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            failures_in_window: 0,
            window_started_at: now,
            opened_at: None,
        }
    }
}

/// Per-URL registry. Lazily creates an entry (starting Closed) on first
/// access.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a new attempt against `url` should proceed right now.
    /// Transitions Open→HalfOpen here if the cooldown has elapsed.
    pub fn allow(&self, url: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(url.to_string()).or_insert_with(|| BreakerEntry::new(now));

        match entry.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|t| now.duration_since(t)).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    entry.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, url: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(url.to_string()).or_insert_with(|| BreakerEntry::new(now));
        match entry.state {
            BreakerState::Closed => {
                // A success doesn't reset the failure window by itself;
                // only the window's own expiry does (table: "stay").
            }
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Closed;
                entry.failures_in_window = 0;
                entry.window_started_at = now;
                entry.opened_at = None;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, url: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(url.to_string()).or_insert_with(|| BreakerEntry::new(now));

        match entry.state {
            BreakerState::Closed => {
                if now.duration_since(entry.window_started_at) > self.config.window {
                    entry.failures_in_window = 0;
                    entry.window_started_at = now;
                }
                entry.failures_in_window += 1;
                if entry.failures_in_window >= self.config.failure_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(now);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self, url: &str) -> BreakerState {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.entry(url.to_string()).or_insert_with(|| BreakerEntry::new(now)).state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(20),
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        let url = "http://x/playlist.m3u8";
        assert!(reg.allow(url));
        reg.record_failure(url);
        reg.record_failure(url);
        assert_eq!(reg.state(url), BreakerState::Closed);
        reg.record_failure(url);
        assert_eq!(reg.state(url), BreakerState::Open);
        assert!(!reg.allow(url));
    }

    #[tokio::test]
    async fn half_opens_after_cooldown_then_closes_on_success() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        let url = "http://x/playlist.m3u8";
        for _ in 0..3 {
            reg.record_failure(url);
        }
        assert_eq!(reg.state(url), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reg.allow(url));
        assert_eq!(reg.state(url), BreakerState::HalfOpen);

        reg.record_success(url);
        assert_eq!(reg.state(url), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_resets_cooldown() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        let url = "http://x/playlist.m3u8";
        for _ in 0..3 {
            reg.record_failure(url);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reg.allow(url));
        reg.record_failure(url);
        assert_eq!(reg.state(url), BreakerState::Open);
        assert!(!reg.allow(url));
    }

    #[test]
    fn separate_urls_track_independently() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.record_failure("http://a/x");
        }
        assert_eq!(reg.state("http://a/x"), BreakerState::Open);
        assert_eq!(reg.state("http://b/x"), BreakerState::Closed);
    }
}
