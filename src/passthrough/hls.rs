//! HLS passthrough handler (C6, §4.6).

use super::{PassthroughFetchError, SegmentCache, UpstreamFetcher};
use crate::error::RelayError;
use m3u8_rs::{MediaPlaylist, Playlist};
use std::collections::HashSet;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CachedManifest {
    text: String,
    segment_urls: Vec<String>,
    fetched_at: Instant,
}

pub struct HlsPassthrough {
    upstream_manifest_url: String,
    proxy_base: String,
    refresh_interval: Duration,
    cache: SegmentCache,
    manifest: RwLock<Option<CachedManifest>>,
}

impl HlsPassthrough {
    pub fn new(upstream_manifest_url: String, proxy_base: String, refresh_interval: Duration, segment_cache_cap: usize) -> Self {
        Self {
            upstream_manifest_url,
            proxy_base,
            refresh_interval,
            cache: SegmentCache::new(segment_cache_cap),
            manifest: RwLock::new(None),
        }
    }

    /// Returns cached rewritten manifest text if fresh, else re-fetches
    /// and rewrites. A fetch failure leaves the previous cached manifest
    /// intact (§4.6) and surfaces a single error to this caller only.
    pub async fn get_rewritten_manifest(&self, fetcher: &dyn UpstreamFetcher) -> Result<String, RelayError> {
        if let Some(cached) = self.manifest.read().unwrap().as_ref() {
            if cached.fetched_at.elapsed() < self.refresh_interval {
                return Ok(cached.text.clone());
            }
        }

        let body = match fetcher.fetch_text(&self.upstream_manifest_url).await {
            Ok(body) => body,
            Err(_) => {
                if let Some(cached) = self.manifest.read().unwrap().as_ref() {
                    return Ok(cached.text.clone());
                }
                return Err(RelayError::SourceTransient("hls manifest fetch failed".to_string()));
            }
        };

        let mut playlist = match m3u8_rs::parse_playlist_res(body.as_bytes()) {
            Ok(Playlist::MediaPlaylist(p)) => p,
            _ => return Err(RelayError::SourceFatal("expected HLS media playlist".to_string())),
        };

        let segment_urls = self.rewrite_segment_urls(&mut playlist);
        let text = serialize_media_playlist(&playlist);

        self.cache.evict(&segment_urls.iter().cloned().collect::<HashSet<_>>());

        *self.manifest.write().unwrap() = Some(CachedManifest {
            text: text.clone(),
            segment_urls,
            fetched_at: Instant::now(),
        });

        Ok(text)
    }

    fn rewrite_segment_urls(&self, playlist: &mut MediaPlaylist) -> Vec<String> {
        let mut upstream_urls = Vec::with_capacity(playlist.segments.len());
        for (idx, segment) in playlist.segments.iter_mut().enumerate() {
            upstream_urls.push(segment.uri.clone());
            segment.uri = format!("{}?format=hls&seg={}", self.proxy_base, idx);
        }
        upstream_urls
    }

    /// Serves a segment by its proxy index, from cache if present.
    pub async fn get_segment(&self, index: usize, fetcher: &dyn UpstreamFetcher) -> Result<bytes::Bytes, RelayError> {
        let upstream_url = {
            let manifest = self.manifest.read().unwrap();
            let manifest = manifest.as_ref().ok_or_else(|| RelayError::SourceFatal("manifest not yet fetched".to_string()))?;
            manifest
                .segment_urls
                .get(index)
                .cloned()
                .ok_or_else(|| RelayError::SourceFatal(format!("segment index {index} not found")))?
        };

        if let Some(cached) = self.cache.get(&upstream_url) {
            return Ok(cached);
        }

        match fetcher.fetch_bytes(&upstream_url).await {
            Ok(bytes) => {
                self.cache.insert(upstream_url, bytes.clone());
                Ok(bytes)
            }
            Err(PassthroughFetchError { status }) => Err(RelayError::SourceTransient(format!(
                "segment fetch failed, upstream status {status:?}"
            ))),
        }
    }
}

fn serialize_media_playlist(playlist: &MediaPlaylist) -> String {
    let mut buf = Vec::new();
    playlist.write_to(&mut buf).expect("writing to an in-memory buffer cannot fail");
    String::from_utf8(buf).expect("m3u8-rs only emits valid UTF-8")
}
