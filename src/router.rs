//! Router (C3, §4.3). A pure function deciding PASSTHROUGH/REPACKAGE/TRANSCODE
//! from source classification, client capabilities, and an encoding profile.
//!
//! Grounded on the rule-table-with-rationale shape of
//! `examples/v0l-zap-stream-core/crates/core/src/overseer/mod.rs`'s variant
//! selection, generalized into an explicit first-match rule list per §3.

use crate::client::ClientRequest;
use crate::profile::{ClientCapabilities, ContainerFormat, EncodingProfile, RoutingDecision, SourceClassification};

#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub decision: RoutingDecision,
    pub client_format: String,
    pub reasons: Vec<String>,
}

/// Tracks whether raw MPEGTS passthrough shares the ES buffer or opens a
/// direct upstream tunnel. The source material disagreed on the default
/// (PASSTHROUGH vs. always-REPACKAGE "for buffer sharing"); §3 rule 2 is
/// authoritative, so this flag only controls the mechanism, not the
/// outcome of rule 2 itself.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub share_upstream_via_buffer: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            share_upstream_via_buffer: true,
        }
    }
}

pub struct Router;

impl Router {
    /// Pure: identical inputs always yield an identical `RoutingResult`
    /// (§8 property 5).
    pub fn decide(
        source: &SourceClassification,
        source_video_codec: Option<&str>,
        source_audio_codec: Option<&str>,
        client_caps: &ClientCapabilities,
        profile: &EncodingProfile,
    ) -> RoutingResult {
        let mut reasons = Vec::new();
        let codecs_compatible = client_caps.accepts_source_codecs(source_video_codec, source_audio_codec);

        let decision = if profile.needs_transcode() && !codecs_compatible {
            reasons.push("profile requires transcode and client rejects source codecs".to_string());
            RoutingDecision::Transcode
        } else if source.format == crate::profile::StreamFormat::Mpegts
            && codecs_compatible
            && client_caps.supports_mpegts
        {
            reasons.push("raw MPEGTS source, client accepts codecs and MPEGTS".to_string());
            RoutingDecision::Passthrough
        } else if !source.format.is_segmented() && client_wants_segmented(client_caps) {
            reasons.push("unsegmented source, client wants a segmented format".to_string());
            RoutingDecision::Transcode
        } else if formats_match(source, client_caps) && codecs_compatible {
            reasons.push("source format matches client preference and codecs compatible".to_string());
            RoutingDecision::Passthrough
        } else if source.format.is_segmented() && wants_other_segmented_format(source, client_caps) && codecs_compatible {
            reasons.push("client wants the other segmented format, codecs fit target container".to_string());
            RoutingDecision::Repackage
        } else {
            reasons.push("no prior rule matched".to_string());
            RoutingDecision::Transcode
        };

        let client_format = Self::resolve_client_format(client_caps, profile);
        reasons.push(format!("client_format={client_format}"));

        RoutingResult {
            decision,
            client_format,
            reasons,
        }
    }

    fn resolve_client_format(client_caps: &ClientCapabilities, profile: &EncodingProfile) -> String {
        if !client_caps.preferred_format.is_empty() {
            return client_caps.preferred_format.clone();
        }
        match profile.determine_container() {
            ContainerFormat::Fmp4 => "hls-fmp4".to_string(),
            ContainerFormat::Mpegts => "mpegts".to_string(),
            ContainerFormat::Auto if client_caps.supports_fmp4 => "hls-fmp4".to_string(),
            ContainerFormat::Auto => "mpegts".to_string(),
        }
    }

    /// Convenience entry point wiring [`crate::client::ClientDetector`]'s
    /// output straight into `decide`, for callers that haven't already
    /// resolved [`ClientCapabilities`].
    pub fn decide_from_request(
        source: &SourceClassification,
        source_video_codec: Option<&str>,
        source_audio_codec: Option<&str>,
        req: &ClientRequest,
        profile: &EncodingProfile,
    ) -> RoutingResult {
        let caps = crate::client::ClientDetector::detect(req);
        Self::decide(source, source_video_codec, source_audio_codec, &caps, profile)
    }
}

fn client_wants_segmented(caps: &ClientCapabilities) -> bool {
    matches!(caps.preferred_format.as_str(), "hls" | "hls-fmp4" | "dash" | "hls-ts") || caps.preferred_format.is_empty()
}

fn formats_match(source: &SourceClassification, caps: &ClientCapabilities) -> bool {
    match (source.format, caps.preferred_format.as_str()) {
        (crate::profile::StreamFormat::Hls, "hls" | "hls-fmp4" | "hls-ts") => true,
        (crate::profile::StreamFormat::Dash, "dash") => true,
        (crate::profile::StreamFormat::Mpegts, "mpegts") => true,
        (_, "") => true,
        _ => false,
    }
}

fn wants_other_segmented_format(source: &SourceClassification, caps: &ClientCapabilities) -> bool {
    match (source.format, caps.preferred_format.as_str()) {
        (crate::profile::StreamFormat::Hls, "dash") => true,
        (crate::profile::StreamFormat::Dash, "hls" | "hls-fmp4" | "hls-ts") => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DetectionSource, StreamFormat};
    use std::collections::HashSet;

    fn passthrough_profile() -> EncodingProfile {
        EncodingProfile {
            target_video_codec: None,
            target_audio_codec: None,
            target_container: ContainerFormat::Auto,
            force_video_transcode: false,
            force_audio_transcode: false,
            segment_duration: 6.0,
            playlist_size: 6,
        }
    }

    fn classification(format: StreamFormat) -> SourceClassification {
        SourceClassification {
            format,
            variant_count: 1,
            target_duration: Some(6.0),
            encrypted: false,
            uses_fmp4: false,
            eligible_for_collapse: format == StreamFormat::Hls,
            selected_media_playlist: None,
            selected_bandwidth: None,
            reasons: vec![],
        }
    }

    #[test]
    fn rule1_transcode_when_profile_demands_and_client_rejects() {
        let mut profile = passthrough_profile();
        profile.target_video_codec = Some("h265".to_string());
        let mut caps = ClientCapabilities::default();
        caps.accepted_video_codecs = HashSet::from(["h264".to_string()]);
        let result = Router::decide(&classification(StreamFormat::Mpegts), Some("h265"), None, &caps, &profile);
        assert_eq!(result.decision, RoutingDecision::Transcode);
    }

    #[test]
    fn rule2_passthrough_raw_mpegts() {
        let caps = ClientCapabilities {
            preferred_format: "mpegts".to_string(),
            supports_mpegts: true,
            detection_source: DetectionSource::Override,
            ..Default::default()
        };
        let result = Router::decide(&classification(StreamFormat::Mpegts), Some("h264"), Some("aac"), &caps, &passthrough_profile());
        assert_eq!(result.decision, RoutingDecision::Passthrough);
    }

    #[test]
    fn rule3_transcode_unsegmented_source_segmented_client() {
        let caps = ClientCapabilities {
            preferred_format: "hls".to_string(),
            ..Default::default()
        };
        let result = Router::decide(&classification(StreamFormat::Mpegts), Some("h264"), Some("aac"), &caps, &passthrough_profile());
        assert_eq!(result.decision, RoutingDecision::Transcode);
    }

    #[test]
    fn rule4_passthrough_matching_formats() {
        let caps = ClientCapabilities {
            preferred_format: "hls".to_string(),
            ..Default::default()
        };
        let result = Router::decide(&classification(StreamFormat::Hls), Some("h264"), Some("aac"), &caps, &passthrough_profile());
        assert_eq!(result.decision, RoutingDecision::Passthrough);
    }

    #[test]
    fn rule5_repackage_hls_to_dash() {
        let caps = ClientCapabilities {
            preferred_format: "dash".to_string(),
            ..Default::default()
        };
        let result = Router::decide(&classification(StreamFormat::Hls), Some("h264"), Some("aac"), &caps, &passthrough_profile());
        assert_eq!(result.decision, RoutingDecision::Repackage);
    }

    #[test]
    fn rule6_fallback_transcode() {
        let mut source = classification(StreamFormat::Hls);
        source.format = StreamFormat::Unknown;
        let caps = ClientCapabilities::default();
        let result = Router::decide(&source, None, None, &caps, &passthrough_profile());
        assert_eq!(result.decision, RoutingDecision::Transcode);
    }

    #[test]
    fn client_format_prefers_explicit_preference() {
        let caps = ClientCapabilities {
            preferred_format: "dash".to_string(),
            ..Default::default()
        };
        let result = Router::decide(&classification(StreamFormat::Hls), Some("h264"), Some("aac"), &caps, &passthrough_profile());
        assert_eq!(result.client_format, "dash");
    }

    #[test]
    fn decision_is_pure() {
        let caps = ClientCapabilities::default();
        let profile = passthrough_profile();
        let source = classification(StreamFormat::Hls);
        let a = Router::decide(&source, Some("h264"), Some("aac"), &caps, &profile);
        let b = Router::decide(&source, Some("h264"), Some("aac"), &caps, &profile);
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.client_format, b.client_format);
    }
}
