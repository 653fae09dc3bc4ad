//! Format Handlers (C11, §4.11). Turn a [`crate::buffer::SharedBuffer`]'s
//! segment/byte-stream views into the wire formats named in §6: HLS
//! playlist/segment, DASH manifest/init/segment, raw MPEG-TS.
//!
//! The response shape below is a thin, transport-agnostic stand-in for
//! whatever HTTP response type an outer transport layer uses — the core
//! doesn't own an HTTP stack (§1).

pub mod dash;
pub mod hls;
pub mod mpegts;

pub struct HandlerResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub cache_control: &'static str,
    pub body: bytes::Bytes,
}

pub const CACHE_CONTROL_NO_CACHE: &str = "no-cache, no-store, must-revalidate";
pub const CACHE_CONTROL_SEGMENT: &str = "max-age=86400";

pub const CONTENT_TYPE_HLS_PLAYLIST: &str = "application/vnd.apple.mpegurl";
pub const CONTENT_TYPE_HLS_SEGMENT_TS: &str = "video/mp2t";
pub const CONTENT_TYPE_HLS_SEGMENT_FMP4: &str = "video/iso.segment";
pub const CONTENT_TYPE_DASH_MANIFEST: &str = "application/dash+xml";
pub const CONTENT_TYPE_DASH_SEGMENT: &str = "video/iso.segment";
pub const CONTENT_TYPE_DASH_INIT: &str = "video/mp4";
pub const CONTENT_TYPE_MPEGTS: &str = "video/mp2t";
