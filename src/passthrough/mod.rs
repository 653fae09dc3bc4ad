//! HLS / DASH Passthrough (C6, §4.6). Owns an upstream manifest URL and
//! serves rewritten manifests plus cached segments under proxy URLs.
//!
//! The manifest cache and segment cache share one shape across both
//! formats (`hls.rs`, `dash.rs` build on this module's [`SegmentCache`]),
//! grounded on the rwlock-guarded registry idiom used for shared mutable
//! state throughout `examples/v0l-zap-stream-core/crates/core/src/overseer/mod.rs`.

pub mod dash;
pub mod hls;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

#[derive(Clone)]
pub struct CachedSegment {
    pub bytes: bytes::Bytes,
    pub fetched_at: Instant,
}

/// Byte cache keyed by upstream URL, shared by the HLS and DASH
/// passthrough handlers. Eviction (§4.6): first drop entries no longer
/// referenced by the current manifest, then, if still over cap, drop by
/// oldest `fetched_at`.
pub struct SegmentCache {
    size_cap: usize,
    entries: RwLock<HashMap<String, CachedSegment>>,
}

impl SegmentCache {
    pub fn new(size_cap: usize) -> Self {
        Self {
            size_cap,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, upstream_url: &str) -> Option<bytes::Bytes> {
        self.entries.read().unwrap().get(upstream_url).map(|e| e.bytes.clone())
    }

    pub fn insert(&self, upstream_url: String, bytes: bytes::Bytes) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            upstream_url,
            CachedSegment {
                bytes,
                fetched_at: Instant::now(),
            },
        );
    }

    /// `referenced` is every upstream URL the current manifest still
    /// points at. Called after each manifest refresh.
    pub fn evict(&self, referenced: &std::collections::HashSet<String>) {
        let mut entries = self.entries.write().unwrap();

        if entries.len() <= self.size_cap {
            return;
        }

        let stale: Vec<String> = entries.keys().filter(|k| !referenced.contains(*k)).cloned().collect();
        for key in stale {
            entries.remove(&key);
            if entries.len() <= self.size_cap {
                return;
            }
        }

        while entries.len() > self.size_cap {
            let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.fetched_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&oldest_key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

/// Abstraction over fetching manifest text and segment bytes from an
/// upstream URL. The core doesn't own an HTTP client (§1); callers inject
/// one. Shared by the HLS and DASH passthrough handlers.
#[async_trait::async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, PassthroughFetchError>;
    async fn fetch_bytes(&self, url: &str) -> Result<bytes::Bytes, PassthroughFetchError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PassthroughFetchError {
    pub status: Option<u16>,
}
