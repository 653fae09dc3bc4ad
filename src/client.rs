//! Client Detector (C2, §4.2). A pure function from request headers to
//! [`ClientCapabilities`]. No component in the teacher maps onto this
//! directly (its clients are always raw RTMP/SRT encoders); grounded
//! instead on the `Display`/lookup-table idioms used throughout
//! `examples/v0l-zap-stream-core/crates/core/src/variant/*.rs`.

use crate::profile::{ClientCapabilities, DetectionSource};
use std::collections::HashSet;

/// A case-insensitive view over request headers plus an optional query
/// override. The core doesn't own an HTTP stack (§1), so callers adapt
/// their framework's header map into this shape.
pub struct ClientRequest<'a> {
    pub format_query_override: Option<&'a str>,
    pub player_header: Option<&'a str>,
    pub accept_header: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Known `X-Tvarr-Player` values and the capabilities they imply.
struct KnownPlayer {
    name: &'static str,
    preferred_format: &'static str,
    video_codecs: &'static [&'static str],
    audio_codecs: &'static [&'static str],
    supports_fmp4: bool,
    supports_mpegts: bool,
}

const KNOWN_PLAYERS: &[KnownPlayer] = &[
    KnownPlayer {
        name: "hls.js",
        preferred_format: "hls-fmp4",
        video_codecs: &["h264", "h265"],
        audio_codecs: &["aac"],
        supports_fmp4: true,
        supports_mpegts: false,
    },
    KnownPlayer {
        name: "exoplayer",
        preferred_format: "dash",
        video_codecs: &["h264", "h265", "vp9", "av1"],
        audio_codecs: &["aac", "eac3", "opus"],
        supports_fmp4: true,
        supports_mpegts: true,
    },
    KnownPlayer {
        name: "vlc",
        preferred_format: "mpegts",
        video_codecs: &["h264", "h265", "mpeg2"],
        audio_codecs: &["aac", "ac3", "eac3", "mp2"],
        supports_fmp4: true,
        supports_mpegts: true,
    },
];

pub struct ClientDetector;

impl ClientDetector {
    /// Resolution order (§4.2): `?format=` override > `X-Tvarr-Player` >
    /// `Accept` > User-Agent heuristics > default.
    pub fn detect(req: &ClientRequest) -> ClientCapabilities {
        if let Some(fmt) = req.format_query_override.and_then(map_format_override) {
            let mut caps = ClientCapabilities::default();
            caps.preferred_format = fmt.to_string();
            caps.detection_source = DetectionSource::Override;
            return caps;
        }

        if let Some(player) = req
            .player_header
            .and_then(|h| KNOWN_PLAYERS.iter().find(|p| p.name.eq_ignore_ascii_case(h)))
        {
            return ClientCapabilities {
                preferred_format: player.preferred_format.to_string(),
                accepted_video_codecs: player.video_codecs.iter().map(|s| s.to_string()).collect(),
                accepted_audio_codecs: player.audio_codecs.iter().map(|s| s.to_string()).collect(),
                supports_fmp4: player.supports_fmp4,
                supports_mpegts: player.supports_mpegts,
                detection_source: DetectionSource::Override,
            };
        }

        if let Some(accept) = req.accept_header {
            if let Some(fmt) = map_accept_header(accept) {
                let mut caps = ClientCapabilities::default();
                caps.preferred_format = fmt.to_string();
                caps.detection_source = DetectionSource::Accept;
                return caps;
            }
        }

        if let Some(ua) = req.user_agent {
            if is_apple_device_ua(ua) {
                let mut caps = ClientCapabilities::default();
                caps.preferred_format = "hls".to_string();
                caps.detection_source = DetectionSource::UserAgent;
                return caps;
            }
        }

        ClientCapabilities::default()
    }
}

fn map_format_override(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "fmp4" | "hls-fmp4" => Some("hls-fmp4"),
        "ts" | "mpegts" | "mpeg-ts" => Some("mpegts"),
        "hls" => Some("hls"),
        "dash" => Some("dash"),
        "hls-ts" => Some("hls-ts"),
        _ => None,
    }
}

fn map_accept_header(accept: &str) -> Option<&'static str> {
    let accept = accept.to_ascii_lowercase();
    if accept.contains("application/dash+xml") {
        Some("dash")
    } else if accept.contains("application/vnd.apple.mpegurl") || accept.contains("application/x-mpegurl") {
        Some("hls")
    } else if accept.contains("video/mp2t") {
        Some("mpegts")
    } else {
        None
    }
}

fn is_apple_device_ua(ua: &str) -> bool {
    let lower = ua.to_ascii_lowercase();
    const APPLE_SUBSTRINGS: &[&str] = &["iphone", "ipad", "ipod", "apple tv", "applecoremedia", "tvos"];
    if APPLE_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return true;
    }
    lower.contains("mac os x") && lower.contains("safari") && !lower.contains("chrome") && !lower.contains("firefox")
}

impl Default for ClientRequest<'_> {
    fn default() -> Self {
        Self {
            format_query_override: None,
            player_header: None,
            accept_header: None,
            user_agent: None,
        }
    }
}

#[allow(dead_code)]
fn codec_set(codecs: &[&str]) -> HashSet<String> {
    codecs.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_override_wins_over_everything() {
        let req = ClientRequest {
            format_query_override: Some("dash"),
            player_header: Some("vlc"),
            accept_header: Some("video/mp2t"),
            user_agent: Some("iPhone"),
        };
        let caps = ClientDetector::detect(&req);
        assert_eq!(caps.preferred_format, "dash");
        assert_eq!(caps.detection_source, DetectionSource::Override);
    }

    #[test]
    fn known_player_header_populates_codec_lists() {
        let req = ClientRequest {
            player_header: Some("vlc"),
            ..Default::default()
        };
        let caps = ClientDetector::detect(&req);
        assert_eq!(caps.preferred_format, "mpegts");
        assert!(caps.accepts_video_codec("h264"));
        assert!(!caps.accepts_video_codec("vp9"));
    }

    #[test]
    fn accept_header_maps_to_format() {
        let req = ClientRequest {
            accept_header: Some("application/dash+xml, */*"),
            ..Default::default()
        };
        let caps = ClientDetector::detect(&req);
        assert_eq!(caps.preferred_format, "dash");
        assert_eq!(caps.detection_source, DetectionSource::Accept);
    }

    #[test]
    fn apple_user_agent_prefers_hls() {
        let req = ClientRequest {
            user_agent: Some("AppleCoreMedia/1.0.0 (iPhone; U; CPU OS 16_0)"),
            ..Default::default()
        };
        let caps = ClientDetector::detect(&req);
        assert_eq!(caps.preferred_format, "hls");
    }

    #[test]
    fn default_when_nothing_matches() {
        let req = ClientRequest {
            user_agent: Some("curl/8.0"),
            ..Default::default()
        };
        let caps = ClientDetector::detect(&req);
        assert_eq!(caps.preferred_format, "");
        assert!(caps.supports_fmp4);
        assert!(caps.supports_mpegts);
        assert_eq!(caps.detection_source, DetectionSource::Default);
    }

    #[test]
    fn unrecognized_codec_assumed_compatible() {
        let caps = ClientCapabilities::default();
        assert!(caps.accepts_video_codec("h264"));
        assert!(caps.accepts_video_codec("anything"));
    }
}
