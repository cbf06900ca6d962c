//! Transport seams for the sync protocol. The wire itself (WebSocket hub,
//! SSE, whatever the host app wires up) stays outside this crate; sessions
//! only rely on these contracts: an at-least-once push stream with a link
//! status signal, and a request/response command surface.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::StateSnapshot;

use super::gateway::PushEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Down,
}

/// One joined run's push stream plus the health of the underlying link.
/// The status watch is the reconnect signal: `Down -> Open` means the
/// transport re-established itself and the join must be re-issued.
pub struct PushLink {
    pub events: mpsc::UnboundedReceiver<PushEvent>,
    pub status: watch::Receiver<LinkState>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn join(&self, run_id: Uuid) -> Result<PushLink, SyncError>;
    async fn leave(&self, run_id: Uuid);
}

/// The request/response command surface, mirroring the orchestrator's
/// commands one-to-one.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn fetch_state(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError>;
    async fn start_run(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError>;
    async fn complete_segment(
        &self,
        run_id: Uuid,
        segment_id: i64,
    ) -> Result<StateSnapshot, SyncError>;
    async fn start_offering(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError>;
    async fn set_secondary_eta(
        &self,
        run_id: Uuid,
        eta_sec: i64,
    ) -> Result<StateSnapshot, SyncError>;
    async fn clear_secondary_eta(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError>;
    async fn mark_secondary_ended(
        &self,
        run_id: Uuid,
        ended_at_sec: Option<i64>,
    ) -> Result<StateSnapshot, SyncError>;
}
