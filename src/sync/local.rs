//! In-process transport: wires a `ClientSyncSession` straight to a
//! `RunController` and its gateway. This is what tests and single-process
//! deployments use; a networked host swaps in its own trait impls.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::control::RunController;
use crate::error::SyncError;
use crate::models::StateSnapshot;

use super::gateway::ConnectionId;
use super::transport::{CommandChannel, LinkState, PushLink, PushTransport};

struct LocalJoin {
    connection_id: ConnectionId,
    // held so the link's status receiver stays open for the life of the join
    status_tx: watch::Sender<LinkState>,
}

pub struct LocalTransport {
    controller: RunController,
    joined: Mutex<HashMap<Uuid, LocalJoin>>,
}

impl LocalTransport {
    pub fn new(controller: RunController) -> Self {
        Self {
            controller,
            joined: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PushTransport for LocalTransport {
    async fn join(&self, run_id: Uuid) -> Result<PushLink, SyncError> {
        let subscription = self.controller.gateway().subscribe(run_id);
        let (status_tx, status_rx) = watch::channel(LinkState::Open);

        let mut joined = self.joined.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = joined.insert(
            run_id,
            LocalJoin {
                connection_id: subscription.connection_id,
                status_tx,
            },
        ) {
            self.controller
                .gateway()
                .leave(previous.connection_id, run_id);
        }

        Ok(PushLink {
            events: subscription.events,
            status: status_rx,
        })
    }

    async fn leave(&self, run_id: Uuid) {
        let mut joined = self.joined.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(join) = joined.remove(&run_id) {
            self.controller.gateway().leave(join.connection_id, run_id);
            let _ = join.status_tx.send(LinkState::Down);
        }
    }
}

#[async_trait]
impl CommandChannel for LocalTransport {
    async fn fetch_state(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        self.controller.get_state(run_id).await
    }

    async fn start_run(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        self.controller.start_run(run_id).await
    }

    async fn complete_segment(
        &self,
        run_id: Uuid,
        segment_id: i64,
    ) -> Result<StateSnapshot, SyncError> {
        self.controller.complete_segment(run_id, segment_id).await
    }

    async fn start_offering(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        self.controller.start_offering(run_id).await
    }

    async fn set_secondary_eta(
        &self,
        run_id: Uuid,
        eta_sec: i64,
    ) -> Result<StateSnapshot, SyncError> {
        self.controller.set_secondary_eta(run_id, eta_sec).await
    }

    async fn clear_secondary_eta(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        self.controller.clear_secondary_eta(run_id).await
    }

    async fn mark_secondary_ended(
        &self,
        run_id: Uuid,
        ended_at_sec: Option<i64>,
    ) -> Result<StateSnapshot, SyncError> {
        self.controller
            .mark_secondary_ended(run_id, ended_at_sec)
            .await
    }
}
