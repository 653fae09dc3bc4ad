//! The error taxonomy crossing component boundaries (§7).
//!
//! Internal helpers still return `anyhow::Result` where the failure never
//! needs to be branched on by a caller; `RelayError` is reserved for the
//! boundary between Session/Manager/format handlers and the outside world,
//! so callers can match exhaustively instead of downcasting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Retryable upstream I/O: dropped connection, 5xx, timeout.
    #[error("source transient error: {0}")]
    SourceTransient(String),

    /// 4xx, invalid format, classification failure. Ends the session.
    #[error("source fatal error: {0}")]
    SourceFatal(String),

    /// Reader disconnected. Non-fatal.
    #[error("client gone")]
    ClientGone,

    /// Reader fell behind `first_available_sequence` and was resynced.
    #[error("reader lagged, resynced to sequence {resynced_to}")]
    BufferLag { resynced_to: u64 },

    /// Session cap or per-host pool cap reached.
    #[error("capacity exceeded")]
    CapacityExceeded,

    /// Upstream circuit breaker denies the start.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Transcode bridge reported failure.
    #[error("transcode error: {0}")]
    TranscodeError(String),

    /// Buffer was closed; writer or reader attempted further use.
    #[error("buffer closed")]
    BufferClosed,
}

impl RelayError {
    /// Maps an error to the HTTP status an outer transport layer should use.
    /// The core never speaks HTTP itself (§1 non-goal), but the mapping is
    /// part of its contract so a thin transport shim has nothing to decide.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::SourceTransient(_) | RelayError::SourceFatal(_) => 502,
            RelayError::ClientGone => 499,
            RelayError::BufferLag { .. } => 200,
            RelayError::CapacityExceeded => 503,
            RelayError::CircuitOpen(_) => 502,
            RelayError::TranscodeError(_) => 502,
            RelayError::BufferClosed => 502,
        }
    }

    /// Classifies upstream error text per the case-insensitive substring
    /// rules in §6 "Error-trigger patterns". Used by the Fallback Controller's
    /// error detector and by the Ingest Driver to decide retry vs. fatal.
    pub fn classify_upstream_text(text: &str) -> RelayError {
        let lower = text.to_ascii_lowercase();
        const TRANSIENT_PATTERNS: &[&str] = &[
            "connection refused",
            "connection timed out",
            "i/o error",
            "server returned 5",
        ];
        const FATAL_PATTERNS: &[&str] = &["server returned 4", "invalid data"];
        if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
            RelayError::SourceFatal(text.to_string())
        } else if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
            RelayError::SourceTransient(text.to_string())
        } else {
            RelayError::SourceTransient(text.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_vs_fatal() {
        assert!(matches!(
            RelayError::classify_upstream_text("Connection Refused by host"),
            RelayError::SourceTransient(_)
        ));
        assert!(matches!(
            RelayError::classify_upstream_text("server returned 404"),
            RelayError::SourceFatal(_)
        ));
        assert!(matches!(
            RelayError::classify_upstream_text("stream contained invalid data"),
            RelayError::SourceFatal(_)
        ));
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(RelayError::CapacityExceeded.http_status(), 503);
        assert_eq!(RelayError::SourceFatal("x".into()).http_status(), 502);
    }
}
