//! HLS playlist/segment handler (C11, §4.11). Renders
//! [`crate::buffer::SegmentMarker`]s as a media playlist and serves
//! individual segments by marker sequence.

use super::{HandlerResponse, CACHE_CONTROL_NO_CACHE, CACHE_CONTROL_SEGMENT, CONTENT_TYPE_HLS_PLAYLIST, CONTENT_TYPE_HLS_SEGMENT_FMP4, CONTENT_TYPE_HLS_SEGMENT_TS};
use crate::buffer::SharedBuffer;
use crate::profile::ContainerFormat;

pub struct HlsHandler;

impl HlsHandler {
    /// Exact form per §4.11. `#EXTINF` durations are formatted with 3
    /// decimals; `#EXT-X-TARGETDURATION` is the ceiling of the longest
    /// segment seen.
    pub fn serve_playlist(buffer: &SharedBuffer, proxy_base: &str) -> HandlerResponse {
        let segments = buffer.get_segment_infos();
        let target_duration = segments
            .iter()
            .map(|s| s.duration_seconds)
            .fold(buffer.target_duration(), f64::max)
            .ceil() as u64;
        let media_sequence = segments.first().map(|s| s.sequence).unwrap_or(0);

        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));

        for segment in &segments {
            out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration_seconds));
            out.push_str(&format!("{proxy_base}?format=hls&seg={}\n", segment.sequence));
        }

        HandlerResponse {
            status: 200,
            content_type: CONTENT_TYPE_HLS_PLAYLIST,
            cache_control: CACHE_CONTROL_NO_CACHE,
            body: bytes::Bytes::from(out),
        }
    }

    pub fn serve_segment(buffer: &SharedBuffer, sequence: u64, container: ContainerFormat) -> HandlerResponse {
        match buffer.get_segment(sequence) {
            Some(bytes) => HandlerResponse {
                status: 200,
                content_type: if container == ContainerFormat::Fmp4 {
                    CONTENT_TYPE_HLS_SEGMENT_FMP4
                } else {
                    CONTENT_TYPE_HLS_SEGMENT_TS
                },
                cache_control: CACHE_CONTROL_SEGMENT,
                body: bytes,
            },
            None => HandlerResponse {
                status: 404,
                content_type: CONTENT_TYPE_HLS_SEGMENT_TS,
                cache_control: CACHE_CONTROL_NO_CACHE,
                body: bytes::Bytes::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn playlist_lists_every_segment_with_proxy_url() {
        let mut cfg = BufferConfig::default();
        cfg.target_segment_duration_s = 0.02;
        let buffer = SharedBuffer::new(cfg);
        buffer.write_chunk(Bytes::from_static(b"kf1"), Some(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        buffer.write_chunk(Bytes::from_static(b"kf2"), Some(true)).unwrap();

        let response = HlsHandler::serve_playlist(&buffer, "http://proxy/chan1");
        let text = String::from_utf8(response.body.to_vec()).unwrap();
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("http://proxy/chan1?format=hls&seg=1"));
        assert_eq!(response.content_type, CONTENT_TYPE_HLS_PLAYLIST);
    }

    #[tokio::test]
    async fn missing_segment_is_404() {
        let buffer = SharedBuffer::new(BufferConfig::default());
        let response = HlsHandler::serve_segment(&buffer, 99, ContainerFormat::Mpegts);
        assert_eq!(response.status, 404);
    }
}
