//! Run-scoped fan-out. Subscribers join a run's group and receive every
//! event published for that run, in publish order, over an unbounded
//! channel. Delivery is best-effort: a subscriber that went away is pruned
//! and logged, never surfaced to the command that triggered the publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::StateSnapshot;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone)]
pub enum PushEvent {
    StateUpdated(StateSnapshot),
    RundownUpdated(Uuid),
    Error(String),
}

pub type ConnectionId = u64;

/// One membership in a run's group. Dropping the receiver is equivalent to
/// leaving; `leave` just removes the entry eagerly.
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub events: mpsc::UnboundedReceiver<PushEvent>,
}

#[derive(Default)]
pub struct SyncGateway {
    groups: Mutex<HashMap<Uuid, HashMap<ConnectionId, mpsc::UnboundedSender<PushEvent>>>>,
    next_connection_id: AtomicU64,
}

impl SyncGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, run_id: Uuid) -> Subscription {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.entry(run_id).or_default().insert(connection_id, tx);
        log_info!("connection {connection_id} joined run {run_id}");

        Subscription {
            connection_id,
            events: rx,
        }
    }

    pub fn leave(&self, connection_id: ConnectionId, run_id: Uuid) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = groups.get_mut(&run_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                groups.remove(&run_id);
            }
        }
    }

    /// Non-blocking fan-out to the run's group. A slow subscriber cannot
    /// stall the publishing command: sends land in unbounded buffers.
    pub fn publish(&self, run_id: Uuid, event: PushEvent) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let Some(members) = groups.get_mut(&run_id) else {
            return;
        };

        let mut dead = Vec::new();
        for (connection_id, sender) in members.iter() {
            if sender.send(event.clone()).is_err() {
                dead.push(*connection_id);
            }
        }
        for connection_id in dead {
            log_warn!("dropping dead subscriber {connection_id} from run {run_id}");
            members.remove(&connection_id);
        }
        if members.is_empty() {
            groups.remove(&run_id);
        }
    }

    pub fn member_count(&self, run_id: Uuid) -> usize {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.get(&run_id).map_or(0, |members| members.len())
    }
}
