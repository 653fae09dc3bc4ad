//! Shared data model (§3): stream/container formats, client capabilities,
//! encoding profiles, and the routing decision enum. Grounded on the shape
//! of `examples/v0l-zap-stream-core/crates/core/src/variant/mod.rs`'s
//! `VariantStream` enum and `Display` impls, generalized from "ffmpeg encoder
//! config" to "what format/codec does this delivery want".

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFormat {
    Hls,
    Dash,
    Mpegts,
    Unknown,
}

impl StreamFormat {
    pub fn is_segmented(&self) -> bool {
        matches!(self, StreamFormat::Hls | StreamFormat::Dash)
    }
}

impl Display for StreamFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFormat::Hls => write!(f, "hls"),
            StreamFormat::Dash => write!(f, "dash"),
            StreamFormat::Mpegts => write!(f, "mpegts"),
            StreamFormat::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerFormat {
    Mpegts,
    Fmp4,
    Auto,
}

/// Codecs `ContainerFormat::Mpegts` cannot carry; forces fMP4.
const MPEGTS_INCOMPATIBLE_CODECS: &[&str] = &["vp9", "av1", "opus"];

impl ContainerFormat {
    pub fn can_carry(&self, codec: &str) -> bool {
        match self {
            ContainerFormat::Fmp4 => true,
            ContainerFormat::Mpegts => !MPEGTS_INCOMPATIBLE_CODECS.contains(&codec),
            ContainerFormat::Auto => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionSource {
    Override,
    Accept,
    UserAgent,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Empty string means "no explicit preference" (§4.2 default).
    pub preferred_format: String,
    pub accepted_video_codecs: HashSet<String>,
    pub accepted_audio_codecs: HashSet<String>,
    pub supports_fmp4: bool,
    pub supports_mpegts: bool,
    pub detection_source: DetectionSource,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            preferred_format: String::new(),
            accepted_video_codecs: HashSet::new(),
            accepted_audio_codecs: HashSet::new(),
            supports_fmp4: true,
            supports_mpegts: true,
            detection_source: DetectionSource::Default,
        }
    }
}

impl ClientCapabilities {
    /// Absent lists are treated as "unknown" (§4.2) — assume compatible.
    pub fn accepts_video_codec(&self, codec: &str) -> bool {
        self.accepted_video_codecs.is_empty() || self.accepted_video_codecs.contains(codec)
    }

    pub fn accepts_audio_codec(&self, codec: &str) -> bool {
        self.accepted_audio_codecs.is_empty() || self.accepted_audio_codecs.contains(codec)
    }

    pub fn accepts_source_codecs(&self, video_codec: Option<&str>, audio_codec: Option<&str>) -> bool {
        video_codec.map_or(true, |c| self.accepts_video_codec(c))
            && audio_codec.map_or(true, |c| self.accepts_audio_codec(c))
    }
}

/// Normalizes a codec name the way §3 requires: lower-case, strip known
/// encoder prefixes/suffixes, then map aliases to a canonical form.
/// Idempotent: `normalize_codec(normalize_codec(x)) == normalize_codec(x)`.
pub fn normalize_codec(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_lowercase();

    const ENCODER_SUFFIXES: &[&str] = &["_nvenc", "_qsv", "_vaapi", "_videotoolbox", "_amf"];
    for suffix in ENCODER_SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.to_string();
        }
    }
    const ENCODER_PREFIXES: &[&str] = &["lib"];
    for prefix in ENCODER_PREFIXES {
        if let Some(stripped) = s.strip_prefix(prefix) {
            s = stripped.to_string();
        }
    }

    match s.as_str() {
        "hevc" => "h265".to_string(),
        "ec-3" | "eac-3" => "eac3".to_string(),
        "avc" | "h.264" => "h264".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingProfile {
    /// `None` means "copy" (no transcode) for that track.
    pub target_video_codec: Option<String>,
    pub target_audio_codec: Option<String>,
    pub target_container: ContainerFormat,
    pub force_video_transcode: bool,
    pub force_audio_transcode: bool,
    pub segment_duration: f64,
    pub playlist_size: usize,
}

impl EncodingProfile {
    pub fn needs_transcode(&self) -> bool {
        self.force_video_transcode
            || self.force_audio_transcode
            || self.target_video_codec.is_some()
            || self.target_audio_codec.is_some()
    }

    /// FMP4 if any target codec can't be carried by MPEG-TS, else the
    /// configured container (AUTO resolves to FMP4).
    pub fn determine_container(&self) -> ContainerFormat {
        let incompatible = [&self.target_video_codec, &self.target_audio_codec]
            .into_iter()
            .flatten()
            .any(|codec| !ContainerFormat::Mpegts.can_carry(codec));

        if incompatible {
            ContainerFormat::Fmp4
        } else {
            match self.target_container {
                ContainerFormat::Auto => ContainerFormat::Fmp4,
                other => other,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceClassification {
    pub format: StreamFormat,
    pub variant_count: usize,
    pub target_duration: Option<f64>,
    pub encrypted: bool,
    pub uses_fmp4: bool,
    pub eligible_for_collapse: bool,
    pub selected_media_playlist: Option<String>,
    pub selected_bandwidth: Option<u64>,
    pub reasons: Vec<String>,
}

impl SourceClassification {
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            format: StreamFormat::Unknown,
            variant_count: 0,
            target_duration: None,
            encrypted: false,
            uses_fmp4: false,
            eligible_for_collapse: false,
            selected_media_playlist: None,
            selected_bandwidth: None,
            reasons: vec![reason.into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingDecision {
    Passthrough,
    Repackage,
    Transcode,
}

impl Display for RoutingDecision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingDecision::Passthrough => write!(f, "passthrough"),
            RoutingDecision::Repackage => write!(f, "repackage"),
            RoutingDecision::Transcode => write!(f, "transcode"),
        }
    }
}
