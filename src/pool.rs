//! Connection Pool (C4, §4.4). Per-host counted semaphore with a global cap
//! and a per-host cap.
//!
//! Grounded on the `Arc<Mutex<...>>` + owned-guard idiom used for shared
//! mutable registries throughout
//! `examples/v0l-zap-stream-core/crates/core/src/overseer/mod.rs`; the
//! release-on-drop guard pattern mirrors how the teacher scopes pipeline
//! resources to a task's lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub global_max: usize,
    pub per_host_max: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            global_max: 512,
            per_host_max: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub global_current: usize,
    pub global_max: usize,
    pub per_host_current: usize,
    pub per_host_max: usize,
}

struct HostEntry {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// Holding this alive counts as holding one global slot and one per-host
/// slot; dropping it releases both. Release is idempotent because ownership
/// of each `OwnedSemaphorePermit` is unique.
pub struct PoolGuard {
    _global: tokio::sync::OwnedSemaphorePermit,
    _host: tokio::sync::OwnedSemaphorePermit,
}

pub struct ConnectionPool {
    limits: PoolLimits,
    global: Arc<Semaphore>,
    hosts: Mutex<HashMap<String, HostEntry>>,
}

impl ConnectionPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            global: Arc::new(Semaphore::new(limits.global_max)),
            limits,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until a global and a per-host slot are both free, or `cancel`
    /// fires. Acquisition order is global-then-host to avoid a starvation
    /// cycle where many hosts each hold their own slot waiting on a
    /// perpetually-exhausted global pool.
    pub async fn acquire(&self, url: &str, cancel: &CancellationToken) -> anyhow::Result<PoolGuard> {
        let host = host_of(url);

        let global = tokio::select! {
            permit = self.global.clone().acquire_owned() => permit?,
            _ = cancel.cancelled() => anyhow::bail!("connection pool acquire canceled"),
        };

        let host_sem = {
            let mut hosts = self.hosts.lock().await;
            hosts
                .entry(host)
                .or_insert_with(|| HostEntry {
                    semaphore: Arc::new(Semaphore::new(self.limits.per_host_max)),
                    max: self.limits.per_host_max,
                })
                .semaphore
                .clone()
        };

        let host_permit = tokio::select! {
            permit = host_sem.acquire_owned() => permit?,
            _ = cancel.cancelled() => anyhow::bail!("connection pool acquire canceled"),
        };

        Ok(PoolGuard {
            _global: global,
            _host: host_permit,
        })
    }

    pub async fn stats(&self, url: &str) -> PoolStats {
        let host = host_of(url);
        let hosts = self.hosts.lock().await;
        let (per_host_current, per_host_max) = hosts
            .get(&host)
            .map(|e| (e.max - e.semaphore.available_permits(), e.max))
            .unwrap_or((0, self.limits.per_host_max));

        PoolStats {
            global_current: self.limits.global_max - self.global.available_permits(),
            global_max: self.limits.global_max,
            per_host_current,
            per_host_max,
        }
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_updates_stats() {
        let pool = ConnectionPool::new(PoolLimits {
            global_max: 2,
            per_host_max: 1,
        });
        let cancel = CancellationToken::new();
        let guard = pool.acquire("http://a.example/x", &cancel).await.unwrap();
        let stats = pool.stats("http://a.example/x").await;
        assert_eq!(stats.global_current, 1);
        assert_eq!(stats.per_host_current, 1);
        drop(guard);

        // Give the semaphore a tick to release (drop is synchronous, but be explicit).
        let stats = pool.stats("http://a.example/x").await;
        assert_eq!(stats.global_current, 0);
        assert_eq!(stats.per_host_current, 0);
    }

    #[tokio::test]
    async fn per_host_cap_blocks_second_acquire_same_host() {
        let pool = Arc::new(ConnectionPool::new(PoolLimits {
            global_max: 10,
            per_host_max: 1,
        }));
        let cancel = CancellationToken::new();
        let _first = pool.acquire("http://a.example/x", &cancel).await.unwrap();

        let pool2 = pool.clone();
        let cancel2 = CancellationToken::new();
        let cancel2_inner = cancel2.clone();
        let handle = tokio::spawn(async move { pool2.acquire("http://a.example/y", &cancel2_inner).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        cancel2.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn different_hosts_do_not_contend() {
        let pool = ConnectionPool::new(PoolLimits {
            global_max: 10,
            per_host_max: 1,
        });
        let cancel = CancellationToken::new();
        let _a = pool.acquire("http://a.example/x", &cancel).await.unwrap();
        let _b = pool.acquire("http://b.example/x", &cancel).await.unwrap();
    }
}
