//! HLS Collapser (C7, §4.7). Turns a single-variant media playlist into a
//! continuous, exactly-once byte stream by polling the playlist and
//! fetching each new segment in order.
//!
//! Grounded directly on
//! `other_examples/jmylchreest-m3u-proxy` `streaming/collapsing.rs`
//! (`CollapsingSession`, bounded mpsc output channel, `CollapsingError`,
//! consecutive-failure guards) — the component this spec names is the same
//! idea, generalized from that prototype's single-consumer channel into a
//! task that feeds the Ingest Driver's writes into the shared buffer.

use m3u8_rs::{MediaPlaylist, Playlist};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(4);
const MAX_CONSECUTIVE_PLAYLIST_ERRORS: u32 = 6;

#[derive(Debug, Error)]
pub enum CollapserError {
    #[error("playlist fetch failed: {0}")]
    PlaylistFetch(String),
    #[error("playlist parse failed: {0}")]
    PlaylistParse(String),
    #[error("collapser aborted")]
    Aborted,
}

/// One unit of collapsed output. `Discontinuity` is emitted, not mangled
/// into the byte stream, when upstream marks `#EXT-X-DISCONTINUITY`
/// between the last delivered segment and the next.
#[derive(Debug)]
pub enum CollapsedOutput {
    Bytes(bytes::Bytes),
    Discontinuity,
}

/// Abstraction over fetching the playlist text and segment bytes. The core
/// doesn't own an HTTP client (§1); callers inject one.
#[async_trait::async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch_playlist(&self, url: &str) -> anyhow::Result<String>;
    async fn fetch_segment(&self, url: &str) -> anyhow::Result<bytes::Bytes>;
}

pub struct HlsCollapser;

impl HlsCollapser {
    /// Runs until `#EXT-X-ENDLIST` after draining (clean EOF, channel just
    /// closes), `cancel` fires (`CollapserError::Aborted`), or consecutive
    /// playlist failures exceed the guard.
    pub async fn run(
        fetcher: &dyn SegmentFetcher,
        playlist_url: &str,
        target_duration_s: f64,
        cancel: &CancellationToken,
        out: mpsc::Sender<Result<CollapsedOutput, CollapserError>>,
    ) {
        let poll_interval = (target_duration_s / 2.0).clamp(
            MIN_POLL_INTERVAL.as_secs_f64(),
            MAX_POLL_INTERVAL.as_secs_f64(),
        );
        let poll_interval = Duration::from_secs_f64(poll_interval);

        let mut delivered_sequence: Option<u64> = None;
        let mut consecutive_playlist_errors = 0u32;
        let mut had_discontinuity_pending = false;

        loop {
            if cancel.is_cancelled() {
                let _ = out.send(Err(CollapserError::Aborted)).await;
                return;
            }

            let body = match fetcher.fetch_playlist(playlist_url).await {
                Ok(b) => {
                    consecutive_playlist_errors = 0;
                    b
                }
                Err(e) => {
                    consecutive_playlist_errors += 1;
                    warn!(error = %e, consecutive = consecutive_playlist_errors, "collapser playlist fetch failed");
                    if consecutive_playlist_errors >= MAX_CONSECUTIVE_PLAYLIST_ERRORS {
                        let _ = out.send(Err(CollapserError::PlaylistFetch(e.to_string()))).await;
                        return;
                    }
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            let media = match parse_media_playlist(&body) {
                Ok(m) => m,
                Err(e) => {
                    let _ = out.send(Err(CollapserError::PlaylistParse(e))).await;
                    return;
                }
            };

            let media_sequence = media.media_sequence;
            let end_list = media.end_list;

            for (idx, segment) in media.segments.iter().enumerate() {
                let seq = media_sequence + idx as u64;
                if let Some(last) = delivered_sequence {
                    if seq <= last {
                        continue;
                    }
                    if seq > last + 1 {
                        debug!(expected = last + 1, got = seq, "collapser skipped vanished segment");
                    }
                }

                if segment.discontinuity {
                    had_discontinuity_pending = true;
                }
                if had_discontinuity_pending {
                    if out.send(Ok(CollapsedOutput::Discontinuity)).await.is_err() {
                        return;
                    }
                    had_discontinuity_pending = false;
                }

                match fetcher.fetch_segment(&segment.uri).await {
                    Ok(bytes) => {
                        if out.send(Ok(CollapsedOutput::Bytes(bytes))).await.is_err() {
                            return;
                        }
                        delivered_sequence = Some(seq);
                    }
                    Err(e) => {
                        warn!(url = %segment.uri, error = %e, "collapser segment vanished before fetch, skipping");
                        delivered_sequence = Some(seq);
                    }
                }
            }

            if end_list {
                debug!("collapser reached #EXT-X-ENDLIST, draining complete");
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = cancel.cancelled() => {
                    let _ = out.send(Err(CollapserError::Aborted)).await;
                    return;
                }
            }
        }
    }
}

fn parse_media_playlist(body: &str) -> Result<MediaPlaylist, String> {
    match m3u8_rs::parse_playlist_res(body.as_bytes()) {
        Ok(Playlist::MediaPlaylist(p)) => Ok(p),
        Ok(Playlist::MasterPlaylist(_)) => Err("expected a media playlist, got a master playlist".to_string()),
        Err(e) => Err(format!("{e:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedFetcher {
        playlists: Mutex<Vec<String>>,
        call_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SegmentFetcher for ScriptedFetcher {
        async fn fetch_playlist(&self, _url: &str) -> anyhow::Result<String> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            let playlists = self.playlists.lock().unwrap();
            Ok(playlists.get(idx.min(playlists.len() - 1)).cloned().unwrap())
        }

        async fn fetch_segment(&self, url: &str) -> anyhow::Result<Bytes> {
            Ok(Bytes::from(url.as_bytes().to_vec()))
        }
    }

    #[tokio::test]
    async fn delivers_segments_in_order_and_stops_at_endlist() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n\
            #EXTINF:2.0,\nseg0.ts\n#EXTINF:2.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let fetcher = ScriptedFetcher {
            playlists: Mutex::new(vec![playlist.to_string()]),
            call_count: AtomicUsize::new(0),
        };
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        HlsCollapser::run(&fetcher, "http://x/media.m3u8", 2.0, &cancel, tx).await;

        let mut outputs = Vec::new();
        while let Some(item) = rx.recv().await {
            outputs.push(item.unwrap());
        }
        assert_eq!(outputs.len(), 2);
        assert!(matches!(&outputs[0], CollapsedOutput::Bytes(b) if b.as_ref() == b"seg0.ts"));
        assert!(matches!(&outputs[1], CollapsedOutput::Bytes(b) if b.as_ref() == b"seg1.ts"));
    }

    #[tokio::test]
    async fn does_not_redeliver_already_delivered_segments() {
        let first = "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:1.0,\nseg0.ts\n";
        let second = "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n\
            #EXTINF:1.0,\nseg0.ts\n#EXTINF:1.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let fetcher = ScriptedFetcher {
            playlists: Mutex::new(vec![first.to_string(), second.to_string()]),
            call_count: AtomicUsize::new(0),
        };
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        HlsCollapser::run(&fetcher, "http://x/media.m3u8", 1.0, &cancel, tx).await;

        let mut outputs = Vec::new();
        while let Some(item) = rx.recv().await {
            outputs.push(item.unwrap());
        }
        assert_eq!(outputs.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_emits_aborted() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:60\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:60.0,\nseg0.ts\n";
        let fetcher = ScriptedFetcher {
            playlists: Mutex::new(vec![playlist.to_string()]),
            call_count: AtomicUsize::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(8);

        HlsCollapser::run(&fetcher, "http://x/media.m3u8", 60.0, &cancel, tx).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Err(CollapserError::Aborted)));
    }
}
