//! Fallback Controller (C12, §4.12). Normal/Fallback FSM per session: on
//! sustained upstream errors, substitutes a pre-rendered slate; probes for
//! recovery and restarts the real ingest driver without tearing down the
//! buffer.
//!
//! Grounded on the `ingress` reconnect/backoff loop shape in
//! `examples/v0l-zap-stream-core/crates/core/src/ingress/*`, generalized
//! into an explicit two-state FSM with its own transition rules instead of
//! inline retry logic.

use crate::buffer::SharedBuffer;
use crate::error::RelayError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    Normal,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    /// Consecutive upstream errors within `window` before tripping to Fallback.
    pub error_threshold: u32,
    pub window: Duration,
    /// Clamped to a 5 s minimum per §4.12.
    pub recovery_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            window: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(5),
        }
    }
}

impl FallbackConfig {
    pub fn effective_recovery_interval(&self) -> Duration {
        self.recovery_interval.max(Duration::from_secs(5))
    }
}

/// Probes upstream for recovery (a lightweight HEAD or small GET). The
/// core doesn't own an HTTP client (§1); callers inject one.
#[async_trait::async_trait]
pub trait RecoveryProbe: Send + Sync {
    async fn probe(&self, url: &str) -> bool;
}

/// Supplies the pre-rendered slate TS segment to loop during Fallback.
/// The core does not regenerate the slate (§6) — it only replays it.
#[async_trait::async_trait]
pub trait SlateSource: Send + Sync {
    async fn slate_bytes(&self) -> bytes::Bytes;
    /// Real-time pacing interval between writes.
    fn loop_interval(&self) -> Duration;
}

pub struct FallbackController {
    config: FallbackConfig,
    state: FallbackState,
    error_timestamps: VecDeque<Instant>,
}

impl FallbackController {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            state: FallbackState::Normal,
            error_timestamps: VecDeque::new(),
        }
    }

    pub fn state(&self) -> FallbackState {
        self.state
    }

    /// Feeds one upstream error-trigger observation (§6 error-trigger
    /// patterns, via [`RelayError::classify_upstream_text`]). Trips to
    /// Fallback when `error_threshold` errors have landed within `window`.
    pub fn record_upstream_error(&mut self, text: &str) {
        if self.state == FallbackState::Fallback {
            return;
        }
        // Every classification is treated as a trigger for fallback purposes;
        // the distinction between transient/fatal only matters to the
        // ingest driver's retry policy, not to the slate decision.
        let _ = RelayError::classify_upstream_text(text);

        let now = Instant::now();
        self.error_timestamps.push_back(now);
        while let Some(front) = self.error_timestamps.front() {
            if now.duration_since(*front) > self.config.window {
                self.error_timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.error_timestamps.len() as u32 >= self.config.error_threshold {
            warn!(
                count = self.error_timestamps.len(),
                "fallback controller tripping to Fallback"
            );
            self.state = FallbackState::Fallback;
            self.error_timestamps.clear();
        }
    }

    pub fn record_recovery_success(&mut self) {
        if self.state == FallbackState::Fallback {
            info!("fallback controller recovered, returning to Normal");
            self.state = FallbackState::Normal;
        }
    }

    /// Runs the slate loop while in Fallback, probing for recovery every
    /// `effective_recovery_interval`. Returns once recovery succeeds or
    /// `cancel` fires; the caller is responsible for restarting the real
    /// ingest driver and for calling [`Self::record_recovery_success`]
    /// beforehand so subsequent errors retrip correctly.
    pub async fn run_slate_loop(
        &mut self,
        buffer: &SharedBuffer,
        slate: &dyn SlateSource,
        probe: &dyn RecoveryProbe,
        probe_url: &str,
        cancel: &CancellationToken,
    ) {
        let mut last_probe = Instant::now() - self.config.effective_recovery_interval();

        loop {
            if cancel.is_cancelled() || self.state != FallbackState::Fallback {
                return;
            }

            if last_probe.elapsed() >= self.config.effective_recovery_interval() {
                last_probe = Instant::now();
                if probe.probe(probe_url).await {
                    self.record_recovery_success();
                    return;
                }
            }

            let bytes = slate.slate_bytes().await;
            if buffer.write_chunk(bytes, Some(true)).is_err() {
                return; // buffer closed
            }

            tokio::select! {
                _ = tokio::time::sleep(slate.loop_interval()) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;

    fn fast_config() -> FallbackConfig {
        FallbackConfig {
            error_threshold: 2,
            window: Duration::from_secs(60),
            recovery_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn trips_to_fallback_after_threshold() {
        let mut fc = FallbackController::new(fast_config());
        fc.record_upstream_error("connection refused");
        assert_eq!(fc.state(), FallbackState::Normal);
        fc.record_upstream_error("connection timed out");
        assert_eq!(fc.state(), FallbackState::Fallback);
    }

    #[test]
    fn recovery_success_returns_to_normal() {
        let mut fc = FallbackController::new(fast_config());
        fc.record_upstream_error("i/o error");
        fc.record_upstream_error("i/o error");
        assert_eq!(fc.state(), FallbackState::Fallback);
        fc.record_recovery_success();
        assert_eq!(fc.state(), FallbackState::Normal);
    }

    #[test]
    fn recovery_interval_has_5s_floor() {
        let config = FallbackConfig {
            recovery_interval: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(config.effective_recovery_interval(), Duration::from_secs(5));
    }

    struct AlwaysRecovers;
    #[async_trait::async_trait]
    impl RecoveryProbe for AlwaysRecovers {
        async fn probe(&self, _url: &str) -> bool {
            true
        }
    }

    struct StaticSlate;
    #[async_trait::async_trait]
    impl SlateSource for StaticSlate {
        async fn slate_bytes(&self) -> bytes::Bytes {
            bytes::Bytes::from_static(b"slate")
        }
        fn loop_interval(&self) -> Duration {
            Duration::from_millis(5)
        }
    }

    #[tokio::test]
    async fn slate_loop_exits_on_recovery() {
        let mut fc = FallbackController::new(fast_config());
        fc.record_upstream_error("server returned 503");
        fc.record_upstream_error("server returned 503");
        assert_eq!(fc.state(), FallbackState::Fallback);

        let buffer = SharedBuffer::new(BufferConfig::default());
        let cancel = CancellationToken::new();
        fc.run_slate_loop(&buffer, &StaticSlate, &AlwaysRecovers, "http://up/probe", &cancel)
            .await;

        assert_eq!(fc.state(), FallbackState::Normal);
    }
}
