//! One device's live view of one run. The session keeps a local estimate of
//! "server now" current from every snapshot it applies, and stays fresh
//! through transport trouble: pushed updates are the primary source, a 1 s
//! poll loop covers the windows where the push link is connecting or down,
//! and a link recovery re-issues the join plus one explicit re-fetch to
//! close the gap.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::ClockSync;
use crate::error::SyncError;
use crate::models::StateSnapshot;

use super::gateway::PushEvent;
use super::transport::{CommandChannel, LinkState, PushLink, PushTransport};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// State shared between the session handle and its sync worker.
struct SharedView {
    clock: StdMutex<ClockSync>,
    state: watch::Sender<Option<StateSnapshot>>,
}

impl SharedView {
    /// Applies a snapshot unless one at least as new has already been
    /// applied; at-least-once delivery means duplicates do arrive.
    fn apply_snapshot(&self, snapshot: StateSnapshot) {
        {
            let current = self.state.borrow();
            if let Some(existing) = current.as_ref() {
                if snapshot.server_time_utc <= existing.server_time_utc {
                    log_info!(
                        "ignoring stale snapshot for run {} ({} <= {})",
                        snapshot.run_id,
                        snapshot.server_time_utc,
                        existing.server_time_utc
                    );
                    return;
                }
            }
        }

        self.clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(snapshot.server_time_utc, Utc::now());
        self.state.send_replace(Some(snapshot));
    }
}

#[derive(Default)]
struct ConnState {
    run_id: Option<Uuid>,
    worker: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

pub struct ClientSyncSession {
    commands: Arc<dyn CommandChannel>,
    push: Arc<dyn PushTransport>,
    poll_interval: Duration,
    shared: Arc<SharedView>,
    // also the connect gate: locking it awaits any in-flight connect, so a
    // second connect or an early command never races a duplicate attempt
    conn: Mutex<ConnState>,
}

impl ClientSyncSession {
    pub fn new(commands: Arc<dyn CommandChannel>, push: Arc<dyn PushTransport>) -> Self {
        let (state_tx, _) = watch::channel(None);
        Self {
            commands,
            push,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shared: Arc::new(SharedView {
                clock: StdMutex::new(ClockSync::new()),
                state: state_tx,
            }),
            conn: Mutex::new(ConnState::default()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The local view of run state; `None` until a first snapshot lands.
    pub fn state(&self) -> watch::Receiver<Option<StateSnapshot>> {
        self.shared.state.subscribe()
    }

    /// Server-clock estimate all countdown displays should use.
    pub fn server_now(&self) -> DateTime<Utc> {
        self.shared
            .clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .server_now(Utc::now())
    }

    /// Seconds since the last applied snapshot, for the staleness indicator.
    pub fn last_sync_age_secs(&self) -> Option<i64> {
        self.shared
            .clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_sync_age_secs(Utc::now())
    }

    /// Subscribes to a run. Reconnecting to the current run is a no-op;
    /// switching runs leaves the old group before joining the new one.
    pub async fn connect(&self, run_id: Uuid) -> Result<(), SyncError> {
        let mut conn = self.conn.lock().await;
        if conn.run_id == Some(run_id) {
            return Ok(());
        }
        self.teardown(&mut conn).await;

        let link = self.push.join(run_id).await?;
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(sync_loop(
            run_id,
            link,
            self.commands.clone(),
            self.push.clone(),
            self.shared.clone(),
            self.poll_interval,
            cancel.clone(),
        ));

        conn.run_id = Some(run_id);
        conn.worker = Some(worker);
        conn.cancel = Some(cancel);
        Ok(())
    }

    /// Stops polling, leaves the group, clears local connection state. Safe
    /// to call repeatedly, and before any connect ever happened.
    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        self.teardown(&mut conn).await;
        self.shared.state.send_replace(None);
    }

    async fn teardown(&self, conn: &mut ConnState) {
        if let Some(cancel) = conn.cancel.take() {
            cancel.cancel();
        }
        if let Some(worker) = conn.worker.take() {
            if let Err(err) = worker.await {
                log_warn!("sync worker did not shut down cleanly: {err}");
            }
        }
        if let Some(run_id) = conn.run_id.take() {
            self.push.leave(run_id).await;
        }
    }

    async fn connected_run(&self) -> Result<Uuid, SyncError> {
        let conn = self.conn.lock().await;
        conn.run_id
            .ok_or_else(|| SyncError::InvalidState("no run connected".into()))
    }

    // Command methods go over request/response, then re-fetch state rather
    // than waiting on the broadcast alone.

    pub async fn start_run(&self) -> Result<StateSnapshot, SyncError> {
        let run_id = self.connected_run().await?;
        let snapshot = self.commands.start_run(run_id).await?;
        self.refresh(run_id).await;
        Ok(snapshot)
    }

    pub async fn complete_segment(&self, segment_id: i64) -> Result<StateSnapshot, SyncError> {
        let run_id = self.connected_run().await?;
        let snapshot = self.commands.complete_segment(run_id, segment_id).await?;
        self.refresh(run_id).await;
        Ok(snapshot)
    }

    pub async fn start_offering(&self) -> Result<StateSnapshot, SyncError> {
        let run_id = self.connected_run().await?;
        let snapshot = self.commands.start_offering(run_id).await?;
        self.refresh(run_id).await;
        Ok(snapshot)
    }

    pub async fn set_secondary_eta(&self, eta_sec: i64) -> Result<StateSnapshot, SyncError> {
        let run_id = self.connected_run().await?;
        let snapshot = self.commands.set_secondary_eta(run_id, eta_sec).await?;
        self.refresh(run_id).await;
        Ok(snapshot)
    }

    pub async fn clear_secondary_eta(&self) -> Result<StateSnapshot, SyncError> {
        let run_id = self.connected_run().await?;
        let snapshot = self.commands.clear_secondary_eta(run_id).await?;
        self.refresh(run_id).await;
        Ok(snapshot)
    }

    pub async fn mark_secondary_ended(
        &self,
        ended_at_sec: Option<i64>,
    ) -> Result<StateSnapshot, SyncError> {
        let run_id = self.connected_run().await?;
        let snapshot = self
            .commands
            .mark_secondary_ended(run_id, ended_at_sec)
            .await?;
        self.refresh(run_id).await;
        Ok(snapshot)
    }

    async fn refresh(&self, run_id: Uuid) {
        fetch_into(self.commands.as_ref(), run_id, &self.shared).await;
    }
}

async fn fetch_into(commands: &dyn CommandChannel, run_id: Uuid, shared: &SharedView) {
    match commands.fetch_state(run_id).await {
        Ok(snapshot) => shared.apply_snapshot(snapshot),
        // recoverable by design: the next tick or push heals it
        Err(err) => log_warn!("state fetch for run {run_id} failed: {err}"),
    }
}

async fn sync_loop(
    run_id: Uuid,
    mut link: PushLink,
    commands: Arc<dyn CommandChannel>,
    push: Arc<dyn PushTransport>,
    shared: Arc<SharedView>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut poller = time::interval(poll_interval);
    poller.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut push_alive = true;
    let mut status_alive = true;
    let mut polling = *link.status.borrow() != LinkState::Open;
    let mut was_interrupted = false;

    loop {
        let mut rejoin = false;

        tokio::select! {
            _ = cancel.cancelled() => break,

            event = link.events.recv(), if push_alive => match event {
                Some(PushEvent::StateUpdated(snapshot)) => {
                    // push delivery takes priority: suppress polling the
                    // moment a pushed snapshot lands
                    polling = false;
                    shared.apply_snapshot(snapshot);
                }
                Some(PushEvent::RundownUpdated(_)) => {
                    fetch_into(commands.as_ref(), run_id, &shared).await;
                }
                Some(PushEvent::Error(message)) => {
                    log_warn!("push channel error for run {run_id}: {message}");
                }
                None => {
                    push_alive = false;
                    polling = true;
                }
            },

            changed = link.status.changed(), if status_alive => match changed {
                Ok(()) => {
                    let state = *link.status.borrow_and_update();
                    match state {
                        LinkState::Open => {
                            if was_interrupted {
                                rejoin = true;
                            }
                            polling = false;
                        }
                        LinkState::Connecting | LinkState::Down => {
                            was_interrupted = true;
                            polling = true;
                        }
                    }
                }
                Err(_) => {
                    status_alive = false;
                    polling = true;
                }
            },

            _ = poller.tick(), if polling => {
                fetch_into(commands.as_ref(), run_id, &shared).await;
            },
        }

        if rejoin {
            log_info!("push link recovered; re-joining run {run_id}");
            match push.join(run_id).await {
                Ok(new_link) => {
                    link = new_link;
                    push_alive = true;
                    status_alive = true;
                    was_interrupted = false;
                    // one explicit re-fetch closes the disconnect window
                    fetch_into(commands.as_ref(), run_id, &shared).await;
                }
                Err(err) => {
                    log_warn!("re-join of run {run_id} failed: {err}");
                    polling = true;
                }
            }
        }
    }
}
