//! Session (C13, §4.13). Ties one channel's instance of the classifier,
//! router, connection pool, circuit breaker, buffer/passthrough/ingest,
//! format handlers, and fallback controller together behind one client
//! registry and lifecycle.
//!
//! Grounded on `examples/v0l-zap-stream-core/crates/core/src/pipeline/runner.rs`,
//! which is the teacher's closest analogue: one struct owning a pipeline's
//! component graph, a cancellation token, and a single supervising task
//! that restarts the pipeline on recoverable failure.

use crate::breaker::CircuitBreakerRegistry;
use crate::buffer::{BufferClient, BufferConfig, SharedBuffer};
use crate::client::ClientRequest;
use crate::error::RelayError;
use crate::fallback::{FallbackConfig, FallbackController, FallbackState, RecoveryProbe, SlateSource};
use crate::ingest::IngestDriver;
use crate::pool::{ConnectionPool, PoolGuard};
use crate::profile::{EncodingProfile, SourceClassification};
use crate::router::{Router, RoutingResult};
use crate::stats::SessionStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Sleep between `run_once` retries that haven't yet tripped the fallback
/// controller, so the supervising loop doesn't busy-spin while it
/// accumulates errors toward `FallbackConfig::error_threshold`.
const SUPERVISE_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// One attempt at driving this session's upstream into the shared buffer.
/// Called repeatedly by the supervising loop: once per fallback recovery,
/// so implementations must be safe to invoke again after a prior attempt
/// returned.
#[async_trait::async_trait]
pub trait IngestRun: Send + Sync {
    async fn run_once(
        &self,
        driver: &IngestDriver,
        buffer: &SharedBuffer,
        breaker: &CircuitBreakerRegistry,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError>;
}

/// What [`Session::get_handler`] resolves to. The caller pulls the buffer
/// (or passthrough state, for REPACKAGE/PASSTHROUGH of segmented sources)
/// out of the session separately and drives the matching `handlers::*`
/// function; the core has no HTTP stack of its own (§1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputHandler {
    Hls,
    Dash,
    Mpegts,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub idle_grace_period: std::time::Duration,
    pub session_timeout: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_grace_period: std::time::Duration::from_secs(60),
            session_timeout: std::time::Duration::from_secs(300),
        }
    }
}

pub struct Session {
    pub id: Uuid,
    pub channel_id: String,
    pub source_id: String,
    pub source_url: String,
    pub channel_name: String,
    config: SessionConfig,
    classification: RwLock<Option<SourceClassification>>,
    encoding_profile: RwLock<Option<EncodingProfile>>,
    routing_result: RwLock<Option<RoutingResult>>,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    idle_since: Mutex<Option<Instant>>,
    ingest_completed: AtomicBool,
    closed: AtomicBool,
    fallback_active: AtomicBool,
    shared_buffer: Arc<SharedBuffer>,
    fallback: AsyncMutex<FallbackController>,
    pool_guard: Mutex<Option<PoolGuard>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        channel_id: impl Into<String>,
        source_id: impl Into<String>,
        source_url: impl Into<String>,
        channel_name: impl Into<String>,
        buffer_config: BufferConfig,
        session_config: SessionConfig,
        fallback_config: FallbackConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            source_id: source_id.into(),
            source_url: source_url.into(),
            channel_name: channel_name.into(),
            config: session_config,
            classification: RwLock::new(None),
            encoding_profile: RwLock::new(None),
            routing_result: RwLock::new(None),
            started_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            idle_since: Mutex::new(Some(Instant::now())),
            ingest_completed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fallback_active: AtomicBool::new(false),
            shared_buffer: SharedBuffer::new(buffer_config),
            fallback: AsyncMutex::new(FallbackController::new(fallback_config)),
            pool_guard: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ingest_completed(&self) -> bool {
        self.ingest_completed.load(Ordering::Acquire)
    }

    /// A session with live clients, or one still mid-startup, has active
    /// content and shouldn't be reused-away or reaped (§4.14).
    pub fn has_active_content(&self) -> bool {
        self.shared_buffer.client_count() > 0 || !self.ingest_completed()
    }

    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.shared_buffer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_classification(&self, classification: SourceClassification) {
        *self.classification.write().unwrap() = Some(classification);
    }

    pub fn classification(&self) -> Option<SourceClassification> {
        self.classification.read().unwrap().clone()
    }

    pub fn set_encoding_profile(&self, profile: EncodingProfile) {
        *self.encoding_profile.write().unwrap() = Some(profile);
    }

    /// Acquires a connection-pool slot for `self.source_url`, then spawns
    /// the single long-running supervising task that drives `ingest` and
    /// falls back to `slate`/`probe` on sustained upstream errors,
    /// restarting `ingest` once `fallback` reports recovery. Returns once
    /// the pool slot is held and the task is spawned; pipeline-start
    /// failure (pool acquisition) is fatal for the session (§4.13).
    pub async fn start(
        self: &Arc<Self>,
        pool: Arc<ConnectionPool>,
        breaker: Arc<CircuitBreakerRegistry>,
        ingest: Arc<dyn IngestRun>,
        slate: Arc<dyn SlateSource>,
        probe: Arc<dyn RecoveryProbe>,
    ) -> Result<(), RelayError> {
        let guard = pool
            .acquire(&self.source_url, &self.cancel)
            .await
            .map_err(|e| RelayError::SourceFatal(e.to_string()))?;
        *self.pool_guard.lock().unwrap() = Some(guard);

        let session = self.clone();
        tokio::spawn(async move {
            session.supervise(breaker, ingest, slate, probe).await;
        });

        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        breaker: Arc<CircuitBreakerRegistry>,
        ingest: Arc<dyn IngestRun>,
        slate: Arc<dyn SlateSource>,
        probe: Arc<dyn RecoveryProbe>,
    ) {
        let driver = IngestDriver::new(self.channel_id.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let result = ingest
                .run_once(&driver, &self.shared_buffer, &breaker, &self.cancel)
                .await;

            match result {
                Ok(()) => {
                    self.ingest_completed.store(true, Ordering::Release);
                    break;
                }
                Err(RelayError::SourceFatal(msg)) => {
                    warn!(session_id = %self.id, error = %msg, "ingest failed fatally, closing session");
                    self.ingest_completed.store(true, Ordering::Release);
                    break;
                }
                Err(e) => {
                    let should_fall_back = {
                        let mut fb = self.fallback.lock().await;
                        fb.record_upstream_error(&e.to_string());
                        fb.state() == FallbackState::Fallback
                    };

                    if !should_fall_back {
                        warn!(session_id = %self.id, error = %e, "ingest failed, retrying before fallback");
                        tokio::select! {
                            _ = tokio::time::sleep(SUPERVISE_RETRY_SLEEP) => {}
                            _ = self.cancel.cancelled() => break,
                        }
                        continue;
                    }

                    warn!(session_id = %self.id, error = %e, "ingest failed, entering fallback");
                    self.fallback_active.store(true, Ordering::Release);
                    {
                        let mut fb = self.fallback.lock().await;
                        fb.run_slate_loop(&self.shared_buffer, slate.as_ref(), probe.as_ref(), &self.source_url, &self.cancel)
                            .await;
                    }
                    self.fallback_active.store(false, Ordering::Release);

                    if self.cancel.is_cancelled() {
                        break;
                    }
                    info!(session_id = %self.id, "fallback recovered, restarting ingest");
                }
            }
        }
    }

    pub fn add_client(&self, user_agent: Option<String>, remote_addr: Option<String>) -> Result<Arc<BufferClient>, RelayError> {
        if self.is_closed() {
            return Err(RelayError::ClientGone);
        }
        let client = self.shared_buffer.add_client(user_agent, remote_addr);
        *self.last_activity.lock().unwrap() = Instant::now();
        *self.idle_since.lock().unwrap() = None;
        Ok(client)
    }

    pub fn remove_client(&self, id: Uuid) {
        self.shared_buffer.remove_client(id);
        *self.last_activity.lock().unwrap() = Instant::now();
        if self.shared_buffer.client_count() == 0 {
            *self.idle_since.lock().unwrap() = Some(Instant::now());
        }
    }

    /// Resolves the output handler for `req`, caching the routing decision
    /// the first time it's needed.
    pub fn get_handler(&self, req: &ClientRequest) -> Option<OutputHandler> {
        let classification = self.classification()?;
        let profile = self.encoding_profile.read().unwrap().clone()?;
        let cached = self.routing_result.read().unwrap().clone();
        let result = cached.unwrap_or_else(|| {
            let r = Router::decide_from_request(&classification, None, None, req, &profile);
            *self.routing_result.write().unwrap() = Some(r.clone());
            r
        });

        Some(match result.client_format.as_str() {
            "dash" => OutputHandler::Dash,
            "mpegts" => OutputHandler::Mpegts,
            _ => OutputHandler::Hls,
        })
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            channel_id: self.channel_id.clone(),
            client_count: self.shared_buffer.client_count(),
            buffer: self.shared_buffer.stats(),
            routing_decision: self
                .routing_result
                .read()
                .unwrap()
                .as_ref()
                .map(|r| format!("{:?}", r.decision)),
            fallback_active: self.fallback_active.load(Ordering::Acquire),
            closed: self.is_closed(),
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.shared_buffer.close();
        *self.pool_guard.lock().unwrap() = None;
    }

    pub fn is_idle_past(&self, grace: std::time::Duration) -> bool {
        match *self.idle_since.lock().unwrap() {
            Some(since) => since.elapsed() > grace,
            None => false,
        }
    }

    pub fn last_activity_elapsed(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }
}
