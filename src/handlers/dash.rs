//! DASH manifest/init/segment handler (C11, §4.11). Emits a minimal
//! dynamic MPD from the buffer's segment view.
//!
//! Manifest text is hand-templated rather than built via `dash_mpd::MPD`
//! and reserialized: the exact attribute set and `$Number$` template form
//! are pinned by §4.11/§6, and a literal template is easier to keep
//! byte-for-byte correct than a struct round-trip through a crate whose
//! primary purpose is parsing, not emission. `passthrough/dash.rs` still
//! uses `dash_mpd::parse` for the inverse (reading an upstream MPD).

use super::{HandlerResponse, CACHE_CONTROL_NO_CACHE, CACHE_CONTROL_SEGMENT, CONTENT_TYPE_DASH_INIT, CONTENT_TYPE_DASH_MANIFEST, CONTENT_TYPE_DASH_SEGMENT};
use crate::buffer::SharedBuffer;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bandwidth: Option<u64>,
}

pub struct DashHandler;

impl DashHandler {
    pub fn serve_manifest(
        buffer: &SharedBuffer,
        proxy_base: &str,
        video: Option<&TrackMetadata>,
        audio: Option<&TrackMetadata>,
        availability_start_time: DateTime<Utc>,
    ) -> HandlerResponse {
        let target_duration = buffer.target_duration();
        let segment_count = buffer.get_segment_infos().len();
        let time_shift_buffer_depth_s = target_duration * segment_count as f64;

        let mut adaptation_sets = String::new();
        if let Some(meta) = video {
            adaptation_sets.push_str(&video_adaptation_set(proxy_base, target_duration, meta));
        }
        if let Some(meta) = audio {
            adaptation_sets.push_str(&audio_adaptation_set(proxy_base, target_duration, meta));
        }

        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" profiles="urn:mpeg:dash:profile:isoff-live:2011" minimumUpdatePeriod="PT{target_duration:.1}S" timeShiftBufferDepth="PT{time_shift_buffer_depth_s:.1}S" availabilityStartTime="{start}">
  <Period id="0" start="PT0S">
{adaptation_sets}  </Period>
</MPD>
"#,
            start = availability_start_time.to_rfc3339(),
        );

        HandlerResponse {
            status: 200,
            content_type: CONTENT_TYPE_DASH_MANIFEST,
            cache_control: CACHE_CONTROL_NO_CACHE,
            body: bytes::Bytes::from(body),
        }
    }

    pub fn serve_segment(buffer: &SharedBuffer, sequence: u64) -> HandlerResponse {
        match buffer.get_segment(sequence) {
            Some(bytes) => HandlerResponse {
                status: 200,
                content_type: CONTENT_TYPE_DASH_SEGMENT,
                cache_control: CACHE_CONTROL_SEGMENT,
                body: bytes,
            },
            None => HandlerResponse {
                status: 404,
                content_type: CONTENT_TYPE_DASH_SEGMENT,
                cache_control: CACHE_CONTROL_NO_CACHE,
                body: bytes::Bytes::new(),
            },
        }
    }

    /// Init segments are explicitly provided by the transcode bridge, not
    /// derived from the chunk ring; `init_bytes` is `None` when the
    /// session hasn't received one yet.
    pub fn serve_init(init_bytes: Option<bytes::Bytes>, stream_type: &str) -> HandlerResponse {
        if !matches!(stream_type, "v" | "a") {
            return HandlerResponse {
                status: 400,
                content_type: CONTENT_TYPE_DASH_INIT,
                cache_control: CACHE_CONTROL_NO_CACHE,
                body: bytes::Bytes::new(),
            };
        }
        match init_bytes {
            Some(bytes) => HandlerResponse {
                status: 200,
                content_type: CONTENT_TYPE_DASH_INIT,
                cache_control: CACHE_CONTROL_SEGMENT,
                body: bytes,
            },
            None => HandlerResponse {
                status: 404,
                content_type: CONTENT_TYPE_DASH_INIT,
                cache_control: CACHE_CONTROL_NO_CACHE,
                body: bytes::Bytes::new(),
            },
        }
    }
}

fn video_adaptation_set(proxy_base: &str, target_duration: f64, meta: &TrackMetadata) -> String {
    let dims = match (meta.width, meta.height) {
        (Some(w), Some(h)) => format!(r#" width="{w}" height="{h}""#),
        _ => String::new(),
    };
    let bandwidth = meta.bandwidth.unwrap_or(2_000_000);
    format!(
        r#"    <AdaptationSet contentType="video" mimeType="video/mp4" segmentAlignment="true">
      <Representation id="v0" bandwidth="{bandwidth}"{dims}>
        <SegmentTemplate timescale="1" duration="{target_duration:.3}" startNumber="1" media="{proxy_base}?format=dash&amp;seg=$Number$" initialization="{proxy_base}?format=dash&amp;init=v"/>
      </Representation>
    </AdaptationSet>
"#
    )
}

fn audio_adaptation_set(proxy_base: &str, target_duration: f64, meta: &TrackMetadata) -> String {
    let bandwidth = meta.bandwidth.unwrap_or(128_000);
    format!(
        r#"    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <Representation id="a0" bandwidth="{bandwidth}">
        <SegmentTemplate timescale="1" duration="{target_duration:.3}" startNumber="1" media="{proxy_base}?format=dash&amp;seg=$Number$" initialization="{proxy_base}?format=dash&amp;init=a"/>
      </Representation>
    </AdaptationSet>
"#
    )
}
