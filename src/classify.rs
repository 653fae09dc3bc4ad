//! Source Classifier (C1, §4.1). Peeks an upstream URL/body and returns a
//! [`SourceClassification`] without committing to a long-lived stream.
//!
//! Grounded on the probe step of the teacher's pipeline
//! (`pipeline/runner.rs::setup` calls `demuxer.probe_input()` before
//! building the pipeline config) — we replace ffmpeg's format-probing with
//! a small byte-budget HTTP GET and manual tag/byte inspection, since the
//! core never links ffmpeg.

use crate::profile::{SourceClassification, StreamFormat};
use std::time::Duration;

/// Byte budget for the classification GET (§4.1).
pub const PEEK_BUDGET_BYTES: usize = 64 * 1024;

/// Classification must never block more than this.
pub const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Abstraction over "fetch up to `limit` bytes and the content-type header".
/// The core doesn't own an HTTP client (§1 — transport is an external
/// collaborator); callers inject one that satisfies this trait.
#[async_trait::async_trait]
pub trait SourcePeeker: Send + Sync {
    async fn peek(&self, url: &str, limit: usize) -> anyhow::Result<PeekedBody>;
}

pub struct PeekedBody {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub struct SourceClassifier;

impl SourceClassifier {
    /// Classify the given URL using `peeker` to fetch a bounded prefix of
    /// the body. `bandwidth_cap` configures the HLS variant-selection rule.
    pub async fn classify(
        peeker: &dyn SourcePeeker,
        url: &str,
        bandwidth_cap: Option<u64>,
    ) -> SourceClassification {
        let peeked = match tokio::time::timeout(
            CLASSIFY_TIMEOUT,
            peeker.peek(url, PEEK_BUDGET_BYTES),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return SourceClassification::unknown(format!("peek failed: {e}")),
            Err(_) => return SourceClassification::unknown("classification timed out"),
        };

        let body_str = String::from_utf8_lossy(&peeked.bytes);
        let is_hls_content_type = peeked
            .content_type
            .as_deref()
            .map(|ct| {
                ct.contains("mpegurl") || ct.contains("vnd.apple.mpegurl") || ct.contains("x-mpegURL")
            })
            .unwrap_or(false);

        if body_str.trim_start().starts_with("#EXTM3U") || is_hls_content_type {
            Self::classify_hls(&body_str, bandwidth_cap)
        } else if body_str.trim_start().starts_with("<?xml") && body_str.contains("<MPD") {
            Self::classify_dash(&body_str)
        } else if Self::looks_like_mpegts(&peeked.bytes) {
            let mut c = SourceClassification::unknown("");
            c.format = StreamFormat::Mpegts;
            c.reasons = vec!["TS sync byte found at 188-byte stride".to_string()];
            c
        } else {
            SourceClassification::unknown("no known format signature matched")
        }
    }

    fn looks_like_mpegts(bytes: &[u8]) -> bool {
        if bytes.len() < 188 * 3 {
            return false;
        }
        // require a run of consecutive 0x47 sync bytes at 188-byte stride
        let mut offset = 0;
        while offset + 188 * 3 <= bytes.len() {
            if bytes[offset] == 0x47
                && bytes[offset + 188] == 0x47
                && bytes[offset + 188 * 2] == 0x47
            {
                return true;
            }
            offset += 1;
            if offset > 188 {
                break;
            }
        }
        false
    }

    fn classify_hls(body: &str, bandwidth_cap: Option<u64>) -> SourceClassification {
        let mut reasons = vec!["body starts with #EXTM3U".to_string()];
        let mut variant_count = 0usize;
        let mut target_duration = None;
        let mut encrypted = false;
        let mut uses_fmp4 = false;
        let mut selected_media_playlist = None;
        let mut selected_bandwidth = None;

        // Collect (bandwidth, uri) pairs for #EXT-X-STREAM-INF variants.
        let mut variants: Vec<(u64, String)> = Vec::new();
        let mut pending_bandwidth: Option<u64> = None;

        for line in body.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
                variant_count += 1;
                pending_bandwidth = rest
                    .split(',')
                    .find_map(|kv| kv.strip_prefix("BANDWIDTH="))
                    .and_then(|v| v.parse::<u64>().ok());
            } else if let Some(bw) = pending_bandwidth.take() {
                if !line.is_empty() && !line.starts_with('#') {
                    variants.push((bw, line.to_string()));
                }
            } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                target_duration = rest.trim().parse::<f64>().ok();
            } else if line.starts_with("#EXT-X-KEY:") {
                encrypted = true;
            } else if line.starts_with("#EXT-X-MAP:") {
                uses_fmp4 = true;
            }
        }

        if variant_count > 1 {
            reasons.push(format!("{variant_count} variants declared"));
            let chosen = match bandwidth_cap {
                Some(cap) => variants
                    .iter()
                    .filter(|(bw, _)| *bw <= cap)
                    .max_by_key(|(bw, _)| *bw)
                    .or_else(|| variants.iter().max_by_key(|(bw, _)| *bw)),
                None => variants.iter().max_by_key(|(bw, _)| *bw),
            };
            if let Some((bw, uri)) = chosen {
                reasons.push(format!("selected variant bandwidth={bw}"));
                selected_bandwidth = Some(*bw);
                selected_media_playlist = Some(uri.clone());
            }
        } else if variant_count == 1 {
            // Single-variant master: select it outright.
            if let Some((bw, uri)) = variants.first() {
                selected_bandwidth = Some(*bw);
                selected_media_playlist = Some(uri.clone());
            }
        }

        let eligible_for_collapse = !encrypted && !uses_fmp4 && variant_count <= 1;
        reasons.push(format!("eligible_for_collapse={eligible_for_collapse}"));

        SourceClassification {
            format: StreamFormat::Hls,
            variant_count: variant_count.max(1),
            target_duration,
            encrypted,
            uses_fmp4,
            eligible_for_collapse,
            selected_media_playlist,
            selected_bandwidth,
            reasons,
        }
    }

    fn classify_dash(body: &str) -> SourceClassification {
        let target_duration = body
            .split("minimumUpdatePeriod=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .and_then(parse_iso8601_duration_secs);

        SourceClassification {
            format: StreamFormat::Dash,
            variant_count: 1,
            target_duration,
            encrypted: body.contains("ContentProtection"),
            uses_fmp4: true,
            eligible_for_collapse: false,
            selected_media_playlist: None,
            selected_bandwidth: None,
            reasons: vec!["body starts with <?xml ... <MPD".to_string()],
        }
    }
}

/// Minimal ISO-8601 duration parser for the common `PT<secs>S` form DASH
/// manifests use for `minimumUpdatePeriod`.
fn parse_iso8601_duration_secs(s: &str) -> Option<f64> {
    let s = s.strip_prefix("PT")?;
    let s = s.strip_suffix('S')?;
    s.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPeeker(&'static str, Option<&'static str>);

    #[async_trait::async_trait]
    impl SourcePeeker for StaticPeeker {
        async fn peek(&self, _url: &str, _limit: usize) -> anyhow::Result<PeekedBody> {
            Ok(PeekedBody {
                content_type: self.1.map(|s| s.to_string()),
                bytes: self.0.as_bytes().to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn classifies_single_variant_hls_as_collapse_eligible() {
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg1.ts\n";
        let peeker = StaticPeeker(body, None);
        let c = SourceClassifier::classify(&peeker, "http://x/master.m3u8", None).await;
        assert_eq!(c.format, StreamFormat::Hls);
        assert!(c.eligible_for_collapse);
        assert!(!c.encrypted);
    }

    #[tokio::test]
    async fn classifies_encrypted_hls_as_not_collapse_eligible() {
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-KEY:METHOD=AES-128,URI=\"key\"\n#EXTINF:6.0,\nseg1.ts\n";
        let peeker = StaticPeeker(body, None);
        let c = SourceClassifier::classify(&peeker, "http://x/master.m3u8", None).await;
        assert!(c.encrypted);
        assert!(!c.eligible_for_collapse);
    }

    #[tokio::test]
    async fn multi_variant_selects_highest_under_cap() {
        let body = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1000000\nlow.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=5000000\nhigh.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=3000000\nmid.m3u8\n";
        let peeker = StaticPeeker(body, None);
        let c = SourceClassifier::classify(&peeker, "http://x/master.m3u8", Some(3_500_000)).await;
        assert_eq!(c.selected_media_playlist.as_deref(), Some("mid.m3u8"));
        assert!(!c.eligible_for_collapse);
    }

    #[tokio::test]
    async fn classifies_dash() {
        let body = "<?xml version=\"1.0\"?><MPD minimumUpdatePeriod=\"PT4S\"></MPD>";
        let peeker = StaticPeeker(body, None);
        let c = SourceClassifier::classify(&peeker, "http://x/manifest.mpd", None).await;
        assert_eq!(c.format, StreamFormat::Dash);
        assert_eq!(c.target_duration, Some(4.0));
    }

    #[tokio::test]
    async fn classifies_mpegts_by_sync_byte_stride() {
        let mut bytes = vec![0u8; 188 * 4];
        bytes[0] = 0x47;
        bytes[188] = 0x47;
        bytes[188 * 2] = 0x47;
        let peeker = StaticPeekerBytes(bytes);
        let c = SourceClassifier::classify(&peeker, "http://x/stream.ts", None).await;
        assert_eq!(c.format, StreamFormat::Mpegts);
    }

    struct StaticPeekerBytes(Vec<u8>);

    #[async_trait::async_trait]
    impl SourcePeeker for StaticPeekerBytes {
        async fn peek(&self, _url: &str, _limit: usize) -> anyhow::Result<PeekedBody> {
            Ok(PeekedBody {
                content_type: None,
                bytes: self.0.clone(),
            })
        }
    }
}
