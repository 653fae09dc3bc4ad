//! DASH passthrough handler (C6, §4.6).
//!
//! Grounded on `other_examples/emarsden-dash-mpd-rs` for the `dash-mpd`
//! crate's `MPD`/`Period`/`Representation`/`SegmentList`/`SegmentURL`
//! shape; the teacher never produces DASH, so there is no teacher file to
//! adapt for this half of C6.

use super::{PassthroughFetchError, SegmentCache, UpstreamFetcher};
use crate::error::RelayError;
use dash_mpd::MPD;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CachedManifest {
    text: String,
    segment_mapping: HashMap<String, String>,
    init_mapping: HashMap<String, String>,
    fetched_at: Instant,
}

pub struct DashPassthrough {
    upstream_manifest_url: String,
    proxy_base: String,
    refresh_interval: Duration,
    cache: SegmentCache,
    manifest: RwLock<Option<CachedManifest>>,
}

impl DashPassthrough {
    pub fn new(upstream_manifest_url: String, proxy_base: String, refresh_interval: Duration, segment_cache_cap: usize) -> Self {
        Self {
            upstream_manifest_url,
            proxy_base,
            refresh_interval,
            cache: SegmentCache::new(segment_cache_cap),
            manifest: RwLock::new(None),
        }
    }

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
                return Err(RelayError::SourceTransient("dash manifest fetch failed".to_string()));
            }
        };

        let mpd: MPD = dash_mpd::parse(&body).map_err(|e| RelayError::SourceFatal(format!("invalid MPD: {e}")))?;

        let (text, segment_mapping, init_mapping) = self.rewrite(&mpd, &body);

        let mut referenced: std::collections::HashSet<String> = segment_mapping.values().cloned().collect();
        referenced.extend(init_mapping.values().cloned());
        self.cache.evict(&referenced);

        self.manifest.write().unwrap().replace(CachedManifest {
            text: text.clone(),
            segment_mapping,
            init_mapping,
            fetched_at: Instant::now(),
        });

        Ok(text)
    }

    /// Walks every period/adaptation-set/representation's `SegmentList`,
    /// assigns each `SegmentURL` and `Initialization` a stable proxy id
    /// (`{track}-{index}`), and replaces the upstream URL in the raw XML
    /// text with the proxy form. Editing the source text directly (rather
    /// than re-serializing `mpd`) preserves every tag/attribute verbatim,
    /// as §4.6 requires.
    fn rewrite(&self, mpd: &MPD, original_xml: &str) -> (String, HashMap<String, String>, HashMap<String, String>) {
        let mut text = original_xml.to_string();
        let mut segment_mapping = HashMap::new();
        let mut init_mapping = HashMap::new();

        for period in &mpd.periods {
            for (adaptation_idx, adaptation) in period.adaptations.iter().enumerate() {
                let track = if adaptation.contentType.as_deref() == Some("audio") { "a" } else { "v" };

                for representation in &adaptation.representations {
                    let Some(segment_list) = representation.SegmentList.as_ref() else {
                        continue;
                    };

                    if let Some(init) = segment_list.Initialization.as_ref() {
                        if let Some(source_url) = init.sourceURL.as_ref() {
                            let id = format!("{track}{adaptation_idx}");
                            init_mapping.insert(id.clone(), source_url.clone());
                            text = text.replacen(
                                source_url.as_str(),
                                &format!("{}?format=dash&init={track}", self.proxy_base),
                                1,
                            );
                        }
                    }

                    for (seg_idx, segment_url) in segment_list.segment_urls.iter().enumerate() {
                        if let Some(media) = segment_url.media.as_ref() {
                            let id = format!("{track}{adaptation_idx}-{seg_idx}");
                            segment_mapping.insert(id.clone(), media.clone());
                            text = text.replacen(
                                media.as_str(),
                                &format!("{}?format=dash&seg={id}", self.proxy_base),
                                1,
                            );
                        }
                    }
                }
            }
        }

        (text, segment_mapping, init_mapping)
    }

    pub async fn get_segment(&self, id: &str, fetcher: &dyn UpstreamFetcher) -> Result<bytes::Bytes, RelayError> {
        self.resolve_and_fetch(id, fetcher, false).await
    }

    pub async fn get_init(&self, id: &str, fetcher: &dyn UpstreamFetcher) -> Result<bytes::Bytes, RelayError> {
        self.resolve_and_fetch(id, fetcher, true).await
    }

    async fn resolve_and_fetch(&self, id: &str, fetcher: &dyn UpstreamFetcher, is_init: bool) -> Result<bytes::Bytes, RelayError> {
        let upstream_url = {
            let manifest = self.manifest.read().unwrap();
            let manifest = manifest.as_ref().ok_or_else(|| RelayError::SourceFatal("manifest not yet fetched".to_string()))?;
            let mapping = if is_init { &manifest.init_mapping } else { &manifest.segment_mapping };
            mapping.get(id).cloned().ok_or_else(|| RelayError::SourceFatal(format!("unknown id {id}")))?
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
                "dash fetch failed, upstream status {status:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher(String);

    #[async_trait::async_trait]
    impl UpstreamFetcher for StaticFetcher {
        async fn fetch_text(&self, _url: &str) -> Result<String, PassthroughFetchError> {
            Ok(self.0.clone())
        }
        async fn fetch_bytes(&self, _url: &str) -> Result<bytes::Bytes, PassthroughFetchError> {
            Ok(bytes::Bytes::from_static(b"segment-bytes"))
        }
    }

    fn sample_mpd() -> String {
        r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" profiles="urn:mpeg:dash:profile:isoff-live:2011">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v0" bandwidth="2000000">
        <SegmentList>
          <Initialization sourceURL="http://up/init-v.mp4"/>
          <SegmentURL media="http://up/seg-v-1.m4s"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#
            .to_string()
    }

    #[tokio::test]
    async fn rewrites_init_and_segment_urls() {
        let fetcher = StaticFetcher(sample_mpd());
        let handler = DashPassthrough::new(
            "http://up/manifest.mpd".to_string(),
            "http://proxy/chan1".to_string(),
            Duration::from_secs(5),
            32,
        );
        let text = handler.get_rewritten_manifest(&fetcher).await.unwrap();
        assert!(text.contains("format=dash&init=v"));
        assert!(text.contains("format=dash&seg=v0-0"));
        assert!(!text.contains("http://up/seg-v-1.m4s"));
    }

    #[tokio::test]
    async fn segment_fetch_resolves_via_mapping() {
        let fetcher = StaticFetcher(sample_mpd());
        let handler = DashPassthrough::new(
            "http://up/manifest.mpd".to_string(),
            "http://proxy/chan1".to_string(),
            Duration::from_secs(5),
            32,
        );
        handler.get_rewritten_manifest(&fetcher).await.unwrap();
        let bytes = handler.get_segment("v0-0", &fetcher).await.unwrap();
        assert_eq!(bytes.as_ref(), b"segment-bytes");
    }

    #[tokio::test]
    async fn unknown_id_is_fatal() {
        let fetcher = StaticFetcher(sample_mpd());
        let handler = DashPassthrough::new(
            "http://up/manifest.mpd".to_string(),
            "http://proxy/chan1".to_string(),
            Duration::from_secs(5),
            32,
        );
        handler.get_rewritten_manifest(&fetcher).await.unwrap();
        let result = handler.get_segment("missing", &fetcher).await;
        assert!(matches!(result, Err(RelayError::SourceFatal(_))));
    }
}
