//! Ambient snapshot types shared by [`crate::session`] and
//! [`crate::manager`] (§4.13/§4.14). Plain data, cheap to clone, safe to
//! read without touching live locks held by a writer.

use crate::buffer::BufferStats;
use crate::pool::PoolStats;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub channel_id: String,
    pub client_count: usize,
    pub buffer: BufferStats,
    pub routing_decision: Option<String>,
    pub fallback_active: bool,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub active_sessions: usize,
    pub total_clients: usize,
    pub pool: Option<PoolStats>,
}
