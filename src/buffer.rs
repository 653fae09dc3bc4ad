//! Shared ES Buffer (C8, §4.8) — the fan-out hub. Single writer, many
//! readers, bounded memory, keyframe-aligned segment view.
//!
//! Grounded on two teacher files: the `Arc<RwLock<...>>` + per-entity
//! cleanup-task pattern in `src/viewer.rs`'s `ViewerTracker` (client
//! registry, stale eviction, self-spawned cleanup loop) and the
//! accumulate-then-report counters in `src/metrics.rs`'s `PacketMetrics`
//! (sliding totals, `Instant`-based windows). Readers use
//! `tokio::sync::Notify`, which already coalesces redundant wakeups the
//! way the spec's "one-slot wake channel" requires.

use crate::error::RelayError;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub sequence: u64,
    pub bytes: Bytes,
    pub written_at: Instant,
    pub is_keyframe: bool,
}

#[derive(Debug, Clone)]
pub struct SegmentMarker {
    pub sequence: u64,
    pub start_chunk_seq: u64,
    pub end_chunk_seq: u64,
    pub duration_seconds: f64,
    pub emitted_at: Instant,
    pub byte_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub max_buffer_bytes: u64,
    pub max_chunks: usize,
    pub chunk_timeout: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub target_segment_duration_s: f64,
    pub max_segments: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 64 * 1024 * 1024,
            max_chunks: 8192,
            chunk_timeout: Duration::from_secs(30),
            client_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(1),
            target_segment_duration_s: 6.0,
            max_segments: 12,
        }
    }
}

struct OpenSegment {
    sequence: u64,
    start_chunk_seq: u64,
    end_chunk_seq: u64,
    opened_at: Instant,
    byte_size: u64,
}

struct Inner {
    chunks: VecDeque<Chunk>,
    segments: VecDeque<SegmentMarker>,
    open_segment: Option<OpenSegment>,
    last_sequence: u64,
    next_segment_sequence: u64,
    first_available_sequence: u64,
    current_bytes: u64,
    total_bytes: u64,
    closed: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            segments: VecDeque::new(),
            open_segment: None,
            last_sequence: 0,
            next_segment_sequence: 1,
            first_available_sequence: 1,
            current_bytes: 0,
            total_bytes: 0,
            closed: false,
        }
    }
}

/// A buffer reader. Lives exactly as long as it is registered with a
/// [`SharedBuffer`]; never shared across sessions.
pub struct BufferClient {
    pub id: Uuid,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub connected_at: Instant,
    last_chunk_sequence: AtomicU64,
    bytes_read: AtomicU64,
    last_read_at: Mutex<Instant>,
    wake: tokio::sync::Notify,
}

impl BufferClient {
    pub fn last_chunk_sequence(&self) -> u64 {
        self.last_chunk_sequence.load(Ordering::Acquire)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn last_read_at(&self) -> Instant {
        *self.last_read_at.lock().unwrap()
    }
}

pub struct SharedBuffer {
    config: BufferConfig,
    inner: RwLock<Inner>,
    clients: RwLock<HashMap<Uuid, Arc<BufferClient>>>,
}

impl SharedBuffer {
    pub fn new(config: BufferConfig) -> Arc<Self> {
        let buffer = Arc::new(Self {
            config,
            inner: RwLock::new(Inner::new()),
            clients: RwLock::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&buffer);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.cleanup_interval);
            loop {
                interval.tick().await;
                let Some(buffer) = weak.upgrade() else {
                    break;
                };
                if buffer.is_closed() {
                    break;
                }
                buffer.evict_stale_clients();
            }
        });

        buffer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().unwrap().closed
    }

    /// Appends a chunk. `is_keyframe` should be `Some` for samples arriving
    /// already typed (fMP4 from the transcode bridge); for raw MPEG-TS
    /// bytes, pass `None` to fall back to the adaptation-field heuristic.
    pub fn write_chunk(&self, bytes: Bytes, is_keyframe: Option<bool>) -> Result<(), RelayError> {
        let is_keyframe = is_keyframe.unwrap_or_else(|| mpegts_has_keyframe(&bytes));
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(RelayError::BufferClosed);
        }

        inner.last_sequence += 1;
        let seq = inner.last_sequence;
        let size = bytes.len() as u64;
        let now = Instant::now();

        inner.chunks.push_back(Chunk {
            sequence: seq,
            bytes,
            written_at: now,
            is_keyframe,
        });
        inner.current_bytes += size;
        inner.total_bytes += size;

        self.advance_segment_state(&mut inner, seq, size, is_keyframe, now);
        self.enforce_limits(&mut inner);

        drop(inner);
        self.wake_all_clients();
        Ok(())
    }

    fn advance_segment_state(&self, inner: &mut Inner, seq: u64, size: u64, is_keyframe: bool, now: Instant) {
        let target = self.config.target_segment_duration_s;
        let hard_cap = Duration::from_secs_f64(target * 2.0);

        match &mut inner.open_segment {
            None => {
                if is_keyframe {
                    inner.open_segment = Some(OpenSegment {
                        sequence: inner.next_segment_sequence,
                        start_chunk_seq: seq,
                        end_chunk_seq: seq,
                        opened_at: now,
                        byte_size: size,
                    });
                }
                // Non-keyframe chunks before the first keyframe are dropped
                // from segment accounting but remain in the byte-stream view.
            }
            Some(open) => {
                let elapsed = now.duration_since(open.opened_at);
                let should_close = (elapsed.as_secs_f64() >= target && is_keyframe) || elapsed >= hard_cap;

                if should_close {
                    let marker = SegmentMarker {
                        sequence: open.sequence,
                        start_chunk_seq: open.start_chunk_seq,
                        end_chunk_seq: open.end_chunk_seq,
                        duration_seconds: elapsed.as_secs_f64(),
                        emitted_at: now,
                        byte_size: open.byte_size,
                    };
                    inner.segments.push_back(marker);
                    inner.next_segment_sequence += 1;

                    inner.open_segment = Some(OpenSegment {
                        sequence: inner.next_segment_sequence,
                        start_chunk_seq: seq,
                        end_chunk_seq: seq,
                        opened_at: now,
                        byte_size: size,
                    });
                } else {
                    open.end_chunk_seq = seq;
                    open.byte_size += size;
                }
            }
        }

        if inner.segments.len() > self.config.max_segments {
            inner.segments.pop_front();
        }
    }

    /// Evicts from the head: chunk-count cap first, then byte cap, per
    /// §4.8 write path step 3.
    fn enforce_limits(&self, inner: &mut Inner) {
        while inner.chunks.len() > self.config.max_chunks {
            self.evict_oldest_chunk(inner);
        }
        while inner.current_bytes > self.config.max_buffer_bytes {
            if !self.evict_oldest_chunk(inner) {
                break;
            }
        }
    }

    fn evict_oldest_chunk(&self, inner: &mut Inner) -> bool {
        let Some(chunk) = inner.chunks.pop_front() else {
            return false;
        };
        inner.current_bytes -= chunk.bytes.len() as u64;
        inner.first_available_sequence = chunk.sequence + 1;

        if let Some(oldest) = inner.segments.front() {
            if oldest.end_chunk_seq < inner.first_available_sequence {
                inner.segments.pop_front();
            }
        }
        true
    }

    fn wake_all_clients(&self) {
        let clients = self.clients.read().unwrap();
        for client in clients.values() {
            client.wake.notify_one();
        }
    }

    pub fn add_client(&self, user_agent: Option<String>, remote_addr: Option<String>) -> Arc<BufferClient> {
        let head_seq = self.inner.read().unwrap().last_sequence;
        let client = Arc::new(BufferClient {
            id: Uuid::new_v4(),
            user_agent,
            remote_addr,
            connected_at: Instant::now(),
            last_chunk_sequence: AtomicU64::new(head_seq),
            bytes_read: AtomicU64::new(0),
            last_read_at: Mutex::new(Instant::now()),
            wake: tokio::sync::Notify::new(),
        });
        self.clients.write().unwrap().insert(client.id, client.clone());
        client
    }

    pub fn remove_client(&self, id: Uuid) {
        self.clients.write().unwrap().remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    fn evict_stale_clients(&self) {
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .clients
            .read()
            .unwrap()
            .values()
            .filter(|c| now.duration_since(c.last_read_at()) > self.config.client_timeout)
            .map(|c| c.id)
            .collect();
        for id in stale {
            debug!(client_id = %id, "evicting stale buffer client");
            self.remove_client(id);
        }
    }

    /// Never blocks. Returns chunks with `sequence > seq`.
    pub fn read_chunks_from(&self, seq: u64) -> Vec<Chunk> {
        let inner = self.inner.read().unwrap();
        inner.chunks.iter().filter(|c| c.sequence > seq).cloned().collect()
    }

    /// Reads for a specific client, advancing its cursor. Detects lag: if
    /// the client's cursor is behind `first_available_sequence`, resyncs
    /// and reports `BufferLag` once instead of silently skipping data.
    pub fn read_for_client(&self, client: &BufferClient) -> Result<Vec<Chunk>, RelayError> {
        let inner = self.inner.read().unwrap();
        let cursor = client.last_chunk_sequence();

        if cursor < inner.first_available_sequence.saturating_sub(1) && !inner.chunks.is_empty() {
            let resynced_to = inner.first_available_sequence;
            drop(inner);
            client.last_chunk_sequence.store(resynced_to.saturating_sub(1), Ordering::Release);
            return Err(RelayError::BufferLag { resynced_to });
        }

        let chunks: Vec<Chunk> = inner.chunks.iter().filter(|c| c.sequence > cursor).cloned().collect();
        drop(inner);

        if let Some(last) = chunks.last() {
            client.last_chunk_sequence.store(last.sequence, Ordering::Release);
            let bytes: u64 = chunks.iter().map(|c| c.bytes.len() as u64).sum();
            client.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        }
        *client.last_read_at.lock().unwrap() = Instant::now();

        Ok(chunks)
    }

    /// Blocks until chunks are available, the buffer closes, or `cancel`
    /// fires. Uses the client's wake notifier; no polling.
    pub async fn read_with_wait(&self, client: &BufferClient, cancel: &CancellationToken) -> Result<Vec<Chunk>, RelayError> {
        loop {
            if self.is_closed() {
                return Err(RelayError::BufferClosed);
            }

            match self.read_for_client(client) {
                Ok(chunks) if !chunks.is_empty() => return Ok(chunks),
                Ok(_) => {}
                Err(e) => return Err(e),
            }

            let notified = client.wake.notified();
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(RelayError::ClientGone),
                _ = tokio::time::sleep(self.config.chunk_timeout) => {
                    if self.is_closed() {
                        return Err(RelayError::BufferClosed);
                    }
                }
            }
        }
    }

    pub fn get_segment_infos(&self) -> Vec<SegmentMarker> {
        self.inner.read().unwrap().segments.iter().cloned().collect()
    }

    pub fn get_segment(&self, sequence: u64) -> Option<Bytes> {
        let inner = self.inner.read().unwrap();
        let marker = inner.segments.iter().find(|s| s.sequence == sequence)?;
        if marker.start_chunk_seq < inner.first_available_sequence {
            // Its leading chunks were evicted before the whole segment
            // aged out; serving the remainder would be a truncated body.
            return None;
        }
        let mut out = Vec::with_capacity(marker.byte_size as usize);
        for chunk in inner
            .chunks
            .iter()
            .filter(|c| c.sequence >= marker.start_chunk_seq && c.sequence <= marker.end_chunk_seq)
        {
            out.extend_from_slice(&chunk.bytes);
        }
        Some(Bytes::from(out))
    }

    pub fn target_duration(&self) -> f64 {
        self.config.target_segment_duration_s
    }

    pub fn first_available_sequence(&self) -> u64 {
        self.inner.read().unwrap().first_available_sequence
    }

    pub fn head_sequence(&self) -> u64 {
        self.inner.read().unwrap().last_sequence
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.read().unwrap();
        BufferStats {
            current_bytes: inner.current_bytes,
            total_bytes: inner.total_bytes,
            chunk_count: inner.chunks.len(),
            segment_count: inner.segments.len(),
            first_available_sequence: inner.first_available_sequence,
            head_sequence: inner.last_sequence,
            client_count: self.client_count(),
            closed: inner.closed,
        }
    }

    /// Idempotent. Wakes every registered reader so they observe
    /// `BufferClosed` on their next poll.
    pub fn close(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        let clients = self.clients.read().unwrap();
        for client in clients.values() {
            client.wake.notify_waiters();
        }
        debug!("shared buffer closed");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub chunk_count: usize,
    pub segment_count: usize,
    pub first_available_sequence: u64,
    pub head_sequence: u64,
    pub client_count: usize,
    pub closed: bool,
}

/// Scans MPEG-TS packets (188-byte, sync byte `0x47`) for an adaptation
/// field with `random_access_indicator` set. Used when the caller does not
/// already know whether a chunk starts at a keyframe.
fn mpegts_has_keyframe(bytes: &[u8]) -> bool {
    let mut offset = 0;
    while offset + 188 <= bytes.len() {
        let packet = &bytes[offset..offset + 188];
        if packet[0] == 0x47 {
            let adaptation_field_control = (packet[3] & 0x30) >> 4;
            if adaptation_field_control == 0b10 || adaptation_field_control == 0b11 {
                let af_len = packet[4] as usize;
                if af_len > 0 {
                    let flags = packet[5];
                    if flags & 0x40 != 0 {
                        return true;
                    }
                }
            }
        }
        offset += 188;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BufferConfig {
        BufferConfig {
            max_buffer_bytes: 1_000_000,
            max_chunks: 100,
            chunk_timeout: Duration::from_millis(200),
            client_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            target_segment_duration_s: 0.05,
            max_segments: 4,
        }
    }

    #[tokio::test]
    async fn write_and_read_chunks_from() {
        let buf = SharedBuffer::new(config());
        buf.write_chunk(Bytes::from_static(b"a"), Some(true)).unwrap();
        buf.write_chunk(Bytes::from_static(b"b"), Some(false)).unwrap();
        let chunks = buf.read_chunks_from(0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[1].sequence, 2);
    }

    #[tokio::test]
    async fn new_client_only_sees_future_data() {
        let buf = SharedBuffer::new(config());
        buf.write_chunk(Bytes::from_static(b"a"), Some(true)).unwrap();
        let client = buf.add_client(None, None);
        assert_eq!(client.last_chunk_sequence(), 1);

        buf.write_chunk(Bytes::from_static(b"b"), Some(true)).unwrap();
        let chunks = buf.read_for_client(&client).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence, 2);
    }

    #[tokio::test]
    async fn segment_closes_on_duration_and_keyframe() {
        let buf = SharedBuffer::new(config());
        buf.write_chunk(Bytes::from_static(b"kf1"), Some(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        buf.write_chunk(Bytes::from_static(b"kf2"), Some(true)).unwrap();

        let segments = buf.get_segment_infos();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_chunk_seq, 1);
        assert_eq!(segments[0].end_chunk_seq, 1);
    }

    #[tokio::test]
    async fn segment_closes_at_hard_cap_without_keyframe() {
        let buf = SharedBuffer::new(config());
        buf.write_chunk(Bytes::from_static(b"kf1"), Some(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        buf.write_chunk(Bytes::from_static(b"p"), Some(false)).unwrap();

        let segments = buf.get_segment_infos();
        assert_eq!(segments.len(), 1);
    }

    #[tokio::test]
    async fn partially_evicted_segment_is_unavailable_not_truncated() {
        let mut cfg = config();
        cfg.max_chunks = 2;
        let buf = SharedBuffer::new(cfg);

        buf.write_chunk(Bytes::from_static(b"kf1"), Some(true)).unwrap();
        buf.write_chunk(Bytes::from_static(b"p"), Some(false)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Closes segment 0 (chunks 1..=2) and evicts chunk 1 to stay at
        // max_chunks, leaving the marker's start chunk gone but its end
        // chunk still present.
        buf.write_chunk(Bytes::from_static(b"kf2"), Some(true)).unwrap();

        let segments = buf.get_segment_infos();
        assert_eq!(segments[0].start_chunk_seq, 1);
        assert_eq!(segments[0].end_chunk_seq, 2);
        assert_eq!(buf.first_available_sequence(), 2);

        assert!(buf.get_segment(segments[0].sequence).is_none());
    }

    #[tokio::test]
    async fn eviction_advances_first_available_sequence() {
        let mut cfg = config();
        cfg.max_chunks = 2;
        let buf = SharedBuffer::new(cfg);
        buf.write_chunk(Bytes::from_static(b"a"), Some(true)).unwrap();
        buf.write_chunk(Bytes::from_static(b"b"), Some(false)).unwrap();
        buf.write_chunk(Bytes::from_static(b"c"), Some(false)).unwrap();

        assert_eq!(buf.first_available_sequence(), 2);
        assert_eq!(buf.read_chunks_from(0).len(), 2);
    }

    #[tokio::test]
    async fn lagged_client_is_resynced_and_reported() {
        let mut cfg = config();
        cfg.max_chunks = 2;
        let buf = SharedBuffer::new(cfg);
        let client = buf.add_client(None, None);
        buf.write_chunk(Bytes::from_static(b"a"), Some(true)).unwrap();
        buf.write_chunk(Bytes::from_static(b"b"), Some(false)).unwrap();
        buf.write_chunk(Bytes::from_static(b"c"), Some(false)).unwrap();
        buf.write_chunk(Bytes::from_static(b"d"), Some(false)).unwrap();

        let result = buf.read_for_client(&client);
        assert!(matches!(result, Err(RelayError::BufferLag { .. })));
        assert_eq!(client.last_chunk_sequence(), buf.first_available_sequence() - 1);

        let chunks = buf.read_for_client(&client).unwrap();
        assert!(!chunks.is_empty());
    }

    #[tokio::test]
    async fn close_wakes_waiting_readers() {
        let buf = SharedBuffer::new(config());
        let client = buf.add_client(None, None);
        let cancel = CancellationToken::new();

        let buf2 = buf.clone();
        let handle = tokio::spawn(async move { buf2.read_with_wait(&client, &cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.close();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RelayError::BufferClosed)));
    }

    #[test]
    fn detects_mpegts_keyframe_via_adaptation_field() {
        let mut packet = vec![0u8; 188];
        packet[0] = 0x47;
        packet[3] = 0b0011_0000; // adaptation + payload
        packet[4] = 1; // adaptation field length
        packet[5] = 0x40; // random_access_indicator
        assert!(mpegts_has_keyframe(&packet));
    }

    #[test]
    fn mpegts_without_random_access_is_not_keyframe() {
        let mut packet = vec![0u8; 188];
        packet[0] = 0x47;
        packet[3] = 0b0001_0000; // payload only, no adaptation field
        assert!(!mpegts_has_keyframe(&packet));
    }
}
