//! Manager (C14, §4.14). Process-wide session registry: coalesces
//! concurrent session-start races per channel, runs idle/timeout cleanup,
//! and exposes per-source admission counts.
//!
//! Grounded on `examples/v0l-zap-stream-core/crates/core/src/overseer/mod.rs`'s
//! `Arc<RwLock<HashMap<...>>>` registry plus self-spawned interval task —
//! the same shape [`crate::buffer::SharedBuffer`] uses for its client
//! registry, applied here one level up at the session level.

use crate::breaker::CircuitBreakerRegistry;
use crate::fallback::{FallbackConfig, RecoveryProbe, SlateSource};
use crate::pool::ConnectionPool;
use crate::session::{IngestRun, Session, SessionConfig};
use crate::stats::ManagerStats;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub cleanup_interval: Duration,
    pub max_sessions: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(1),
            max_sessions: 1024,
        }
    }
}

/// What the caller must supply to start a brand-new session for a channel
/// that isn't already running. Classification/codec-probing (network-bound,
/// §4.14 step 3) happen before this is built, outside any manager lock.
pub struct NewSessionSpec {
    pub source_id: String,
    pub source_url: String,
    pub channel_name: String,
    pub buffer_config: crate::buffer::BufferConfig,
    pub ingest: Arc<dyn IngestRun>,
}

pub struct Manager {
    config: ManagerConfig,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    channel_to_session: RwLock<HashMap<String, Uuid>>,
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    slate: Arc<dyn SlateSource>,
    probe: Arc<dyn RecoveryProbe>,
    session_config: SessionConfig,
    fallback_config: FallbackConfig,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        pool: Arc<ConnectionPool>,
        breakers: Arc<CircuitBreakerRegistry>,
        slate: Arc<dyn SlateSource>,
        probe: Arc<dyn RecoveryProbe>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            channel_to_session: RwLock::new(HashMap::new()),
            pool,
            breakers,
            slate,
            probe,
            session_config: SessionConfig::default(),
            fallback_config: FallbackConfig::default(),
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        tokio::spawn(async move {
            loop {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let interval = manager.config.cleanup_interval;
                manager.run_cleanup_pass().await;
                drop(manager);
                tokio::time::sleep(interval).await;
            }
        });

        manager
    }

    /// §4.14 four-step coalescing algorithm. `spec` is only consulted (and
    /// therefore only needs to be fully populated) when no reusable
    /// session exists yet.
    pub async fn get_or_create_session(&self, channel_id: &str, spec: NewSessionSpec) -> Result<Arc<Session>, crate::error::RelayError> {
        if let Some(existing) = self.find_reusable(channel_id) {
            return Ok(existing);
        }

        if self.sessions.read().unwrap().len() >= self.config.max_sessions {
            return Err(crate::error::RelayError::CapacityExceeded);
        }

        let candidate = Session::new(
            channel_id,
            spec.source_id,
            spec.source_url,
            spec.channel_name,
            spec.buffer_config,
            self.session_config,
            self.fallback_config,
        );

        {
            let mut sessions = self.sessions.write().unwrap();
            let mut channel_map = self.channel_to_session.write().unwrap();

            if let Some(winner_id) = channel_map.get(channel_id).copied() {
                if let Some(winner) = sessions.get(&winner_id).filter(|s| !s.is_closed()).cloned() {
                    drop(sessions);
                    drop(channel_map);
                    candidate.close();
                    return Ok(winner);
                }
            }

            if sessions.len() >= self.config.max_sessions {
                drop(sessions);
                drop(channel_map);
                candidate.close();
                return Err(crate::error::RelayError::CapacityExceeded);
            }

            sessions.insert(candidate.id, Arc::clone(&candidate));
            channel_map.insert(channel_id.to_string(), candidate.id);
        }

        if let Err(e) = candidate
            .start(Arc::clone(&self.pool), Arc::clone(&self.breakers), spec.ingest, Arc::clone(&self.slate), Arc::clone(&self.probe))
            .await
        {
            candidate.close();
            self.sessions.write().unwrap().remove(&candidate.id);
            self.channel_to_session.write().unwrap().retain(|_, v| *v != candidate.id);
            return Err(e);
        }

        info!(session_id = %candidate.id, channel_id, "session started");
        Ok(candidate)
    }

    fn find_reusable(&self, channel_id: &str) -> Option<Arc<Session>> {
        let channel_map = self.channel_to_session.read().unwrap();
        let session_id = *channel_map.get(channel_id)?;
        let sessions = self.sessions.read().unwrap();
        let session = sessions.get(&session_id)?;

        if session.is_closed() {
            return None;
        }
        if !session.ingest_completed() || session.has_active_content() {
            return Some(Arc::clone(session));
        }
        None
    }

    pub fn count_active_sessions_for_source(&self, source_id: &str) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.source_id == source_id && !s.is_closed())
            .count()
    }

    pub fn stats(&self) -> ManagerStats {
        let sessions = self.sessions.read().unwrap();
        ManagerStats {
            active_sessions: sessions.values().filter(|s| !s.is_closed()).count(),
            total_clients: sessions.values().map(|s| s.buffer().client_count()).sum(),
            pool: None,
        }
    }

    async fn run_cleanup_pass(&self) {
        let candidates: Vec<Arc<Session>> = self.sessions.read().unwrap().values().cloned().collect();

        let mut to_remove = Vec::new();
        for session in &candidates {
            if session.is_closed() {
                to_remove.push(session.id);
                continue;
            }

            let config = session.config();
            if session.buffer().client_count() == 0 {
                if session.is_idle_past(config.idle_grace_period) && !session.has_active_content() {
                    to_remove.push(session.id);
                    continue;
                }
                if session.last_activity_elapsed() > config.session_timeout {
                    to_remove.push(session.id);
                }
            }
        }

        if to_remove.is_empty() {
            return;
        }

        let removed_sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap();
            let mut channel_map = self.channel_to_session.write().unwrap();
            let mut removed = Vec::new();
            for id in &to_remove {
                if let Some(session) = sessions.remove(id) {
                    channel_map.retain(|_, v| v != id);
                    removed.push(session);
                }
            }
            removed
        };

        for session in removed_sessions {
            tokio::spawn(async move {
                warn!(session_id = %session.id, "manager reaping session");
                session.close();
            });
        }
    }
}
