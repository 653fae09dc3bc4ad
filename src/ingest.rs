//! Ingest Driver (C9, §4.9). Owns the upstream byte source for
//! non-transcode paths: raw MPEG-TS streamed straight into the buffer, or
//! a collapsed single-variant HLS feed.
//!
//! Grounded on the connection-retry loop shape in
//! `examples/v0l-zap-stream-core/crates/core/src/ingress/*` (bounded retry
//! with a fixed sleep, recoverable-vs-fatal split) combined with the
//! counters from `crate::metrics::IngestMetrics` (itself adapted from the
//! teacher's `PacketMetrics`).

use crate::breaker::CircuitBreakerRegistry;
use crate::buffer::SharedBuffer;
use crate::collapse::{CollapsedOutput, CollapserError, HlsCollapser, SegmentFetcher};
use crate::error::RelayError;
use crate::metrics::IngestMetrics;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const RECOVERABLE_RETRY_SLEEP: Duration = Duration::from_secs(2);
const MAX_RECOVERABLE_RETRIES: u32 = 10;
const MPEGTS_CHUNK_PACKETS: usize = 7; // 7 * 188 bytes per chunk, a conventional TS read unit

/// Abstraction over a long-lived upstream byte source (raw MPEG-TS HTTP
/// GET). The core doesn't own an HTTP stack (§1); callers inject one.
#[async_trait::async_trait]
pub trait RawByteSource: Send + Sync {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means clean EOF.
    async fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
}

pub struct IngestDriver {
    metrics: Mutex<IngestMetrics>,
}

impl IngestDriver {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            metrics: Mutex::new(IngestMetrics::new(source_name)),
        }
    }

    pub fn metrics_snapshot(&self) -> crate::metrics::IngestMetricsSnapshot {
        self.metrics.lock().unwrap().snapshot()
    }

    /// Raw-MPEGTS path: reads `source` in fixed-size chunks and writes
    /// each into `buffer` until clean EOF, a fatal error, or `cancel`.
    /// Recoverable errors sleep and retry (bounded); on exhaustion or a
    /// fatal classification, records against `breaker` and returns.
    pub async fn run_raw_mpegts(
        &self,
        mut source: Box<dyn RawByteSource>,
        source_url: &str,
        buffer: &SharedBuffer,
        breaker: &CircuitBreakerRegistry,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let mut buf = vec![0u8; 188 * MPEGTS_CHUNK_PACKETS];
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let read_result = tokio::select! {
                r = source.read(&mut buf) => r,
                _ = cancel.cancelled() => return Ok(()),
            };

            match read_result {
                Ok(0) => return Ok(()), // clean EOF
                Ok(n) => {
                    retries = 0;
                    breaker.record_success(source_url);
                    let chunk = bytes::Bytes::copy_from_slice(&buf[..n]);
                    {
                        let mut metrics = self.metrics.lock().unwrap();
                        metrics.record_bytes(n);
                    }
                    buffer.write_chunk(chunk, None)?;
                }
                Err(e) => {
                    self.metrics.lock().unwrap().record_error();
                    let classified = RelayError::classify_upstream_text(&e.to_string());
                    breaker.record_failure(source_url);

                    match classified {
                        RelayError::SourceFatal(_) => {
                            error!(error = %e, "ingest fatal error, closing session");
                            return Err(classified);
                        }
                        _ => {
                            retries += 1;
                            warn!(error = %e, retries, "ingest transient error, retrying");
                            if retries > MAX_RECOVERABLE_RETRIES {
                                return Err(RelayError::SourceTransient(format!(
                                    "exceeded {MAX_RECOVERABLE_RETRIES} retries: {e}"
                                )));
                            }
                            tokio::time::sleep(RECOVERABLE_RETRY_SLEEP).await;
                        }
                    }
                }
            }
        }
    }

    /// Collapsed-HLS path: drives [`HlsCollapser::run`] and writes its
    /// output into `buffer`. Discontinuities are passed through at the
    /// byte level (no TS mangling), so they are only logged here.
    pub async fn run_collapsed_hls(
        &self,
        fetcher: &dyn SegmentFetcher,
        playlist_url: &str,
        target_duration_s: f64,
        buffer: &SharedBuffer,
        breaker: &CircuitBreakerRegistry,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let (tx, mut rx) = mpsc::channel(8);
        let collapser_cancel = cancel.clone();
        let playlist_url_owned = playlist_url.to_string();

        // The collapser can loop for the lifetime of a live playlist,
        // sending into a bounded channel; it must run concurrently with
        // the drain below rather than be awaited to completion first, or
        // it deadlocks against it once the channel fills up.
        let collapse_fut = HlsCollapser::run(fetcher, &playlist_url_owned, target_duration_s, &collapser_cancel, tx);

        let drain_fut = async {
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(CollapsedOutput::Bytes(bytes)) => {
                        breaker.record_success(playlist_url);
                        self.metrics.lock().unwrap().record_segment_fetched();
                        buffer.write_chunk(bytes, None)?;
                    }
                    Ok(CollapsedOutput::Discontinuity) => {
                        warn!(url = playlist_url, "ingest observed HLS discontinuity, passing through");
                    }
                    Err(CollapserError::Aborted) => return Ok(()),
                    Err(e) => {
                        self.metrics.lock().unwrap().record_error();
                        breaker.record_failure(playlist_url);
                        return Err(RelayError::SourceTransient(e.to_string()));
                    }
                }
            }
            Ok(())
        };

        let ((), drain_result) = tokio::join!(collapse_fut, drain_fut);
        drain_result
    }
}
