//! The command surface over run state. Every command validates against the
//! state machine, mutates through the store's atomic section, then derives a
//! fresh snapshot from the just-mutated run and fans it out. Idempotent
//! repeats are absorbed silently and deliberately do not rebroadcast.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{
    RunConfig, Segment, SegmentDraft, SegmentEdit, SegmentReplace, SegmentView, StateSnapshot,
};
use crate::store::{MutateFn, RunStore};
use crate::sync::{PushEvent, SyncGateway};
use crate::timing::{self, TimingConfig};

#[derive(Clone)]
pub struct RunController {
    store: Arc<dyn RunStore>,
    gateway: Arc<SyncGateway>,
    timing: TimingConfig,
}

impl RunController {
    pub fn new(store: Arc<dyn RunStore>, gateway: Arc<SyncGateway>) -> Self {
        Self::with_timing(store, gateway, TimingConfig::default())
    }

    pub fn with_timing(
        store: Arc<dyn RunStore>,
        gateway: Arc<SyncGateway>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            timing,
        }
    }

    pub fn gateway(&self) -> &Arc<SyncGateway> {
        &self.gateway
    }

    pub async fn create_run(
        &self,
        config: RunConfig,
        segments: Vec<SegmentDraft>,
    ) -> Result<Uuid, SyncError> {
        for draft in &segments {
            if draft.planned_sec < 0 {
                return Err(SyncError::InvalidInput(format!(
                    "plannedSec must be non-negative, got {}",
                    draft.planned_sec
                )));
            }
        }
        self.store.create(config, segments).await
    }

    pub async fn get_state(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        let run = self.store.get(run_id).await?;
        Ok(StateSnapshot::build(&run, Utc::now(), &self.timing))
    }

    pub async fn get_segments(&self, run_id: Uuid) -> Result<Vec<SegmentView>, SyncError> {
        let run = self.store.get(run_id).await?;
        let mut segments: Vec<SegmentView> = run.segments.iter().map(SegmentView::from).collect();
        segments.sort_by_key(|s| s.order);
        Ok(segments)
    }

    /// Anchors the master clock. First write wins; repeats are no-ops that
    /// still return the current snapshot.
    pub async fn start_run(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        let now = Utc::now();
        self.mutate_and_publish(
            run_id,
            Box::new(move |run| {
                if run.master_start_at.is_some() {
                    return Ok(false);
                }
                run.master_start_at = Some(now);
                Ok(true)
            }),
        )
        .await
    }

    /// Records the completion mark and drift for a segment. Idempotent on an
    /// already-completed segment.
    pub async fn complete_segment(
        &self,
        run_id: Uuid,
        segment_id: i64,
    ) -> Result<StateSnapshot, SyncError> {
        let now = Utc::now();
        self.mutate_and_publish(
            run_id,
            Box::new(move |run| {
                if !run.is_live() {
                    return Err(SyncError::not_live());
                }
                let Some((actual_sec, drift_sec)) = timing::completion_values(run, segment_id, now)
                else {
                    return Err(SyncError::NotFound);
                };
                let seg = run.segment_mut(segment_id).ok_or(SyncError::NotFound)?;
                if seg.completed {
                    return Ok(false);
                }
                seg.actual_sec = Some(actual_sec);
                seg.drift_sec = Some(drift_sec);
                seg.completed = true;
                Ok(true)
            }),
        )
        .await
    }

    /// Starts the offering (secondary timed) block at the current elapsed
    /// mark. Write-once.
    pub async fn start_offering(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        let now = Utc::now();
        self.mutate_and_publish(
            run_id,
            Box::new(move |run| {
                let Some(elapsed) = timing::elapsed_since_master(run, now) else {
                    return Err(SyncError::not_live());
                };
                if run.offering_started_at_sec.is_some() {
                    return Ok(false);
                }
                run.offering_started_at_sec = Some(elapsed);
                Ok(true)
            }),
        )
        .await
    }

    /// Overwrites the locale track's completion estimate. Never idempotent:
    /// every call refreshes the estimate timestamp and rebroadcasts.
    pub async fn set_secondary_eta(
        &self,
        run_id: Uuid,
        eta_sec: i64,
    ) -> Result<StateSnapshot, SyncError> {
        if eta_sec < 0 {
            return Err(SyncError::InvalidInput(format!(
                "etaSec must be non-negative, got {eta_sec}"
            )));
        }
        let now = Utc::now();
        self.mutate_and_publish(
            run_id,
            Box::new(move |run| {
                run.secondary_eta_sec = Some(eta_sec);
                run.secondary_eta_updated_at = Some(now);
                Ok(true)
            }),
        )
        .await
    }

    /// Withdraws the estimate entirely. Distinct from `set_secondary_eta(0)`,
    /// which reports "ending right now".
    pub async fn clear_secondary_eta(&self, run_id: Uuid) -> Result<StateSnapshot, SyncError> {
        self.mutate_and_publish(
            run_id,
            Box::new(|run| {
                if run.secondary_eta_sec.is_none() && run.secondary_eta_updated_at.is_none() {
                    return Ok(false);
                }
                run.secondary_eta_sec = None;
                run.secondary_eta_updated_at = None;
                Ok(true)
            }),
        )
        .await
    }

    /// Records when the locale track actually ended, defaulting to the
    /// current elapsed mark. Write-once.
    pub async fn mark_secondary_ended(
        &self,
        run_id: Uuid,
        ended_at_sec: Option<i64>,
    ) -> Result<StateSnapshot, SyncError> {
        if let Some(sec) = ended_at_sec {
            if sec < 0 {
                return Err(SyncError::InvalidInput(format!(
                    "endedAtSec must be non-negative, got {sec}"
                )));
            }
        }
        let now = Utc::now();
        self.mutate_and_publish(
            run_id,
            Box::new(move |run| {
                let Some(elapsed) = timing::elapsed_since_master(run, now) else {
                    return Err(SyncError::not_live());
                };
                if run.secondary_ended_at_sec.is_some() {
                    return Ok(false);
                }
                run.secondary_ended_at_sec = Some(ended_at_sec.unwrap_or(elapsed));
                Ok(true)
            }),
        )
        .await
    }

    /// Bulk reconciliation of the segment list. Existing segments matched by
    /// id keep their timing record untouched; absentees are only deleted
    /// while they hold no timing record.
    pub async fn upsert_segments(
        &self,
        run_id: Uuid,
        items: Vec<SegmentEdit>,
    ) -> Result<StateSnapshot, SyncError> {
        for item in &items {
            if item.planned_sec < 0 {
                return Err(SyncError::InvalidInput(format!(
                    "plannedSec must be non-negative, got {}",
                    item.planned_sec
                )));
            }
        }
        self.mutate_and_publish(
            run_id,
            Box::new(move |run| {
                let before = run.segments.clone();

                let keep: HashSet<i64> = items.iter().filter_map(|item| item.id).collect();
                run.segments
                    .retain(|s| keep.contains(&s.id) || s.completed || s.actual_sec.is_some());

                for item in items {
                    match item.id.and_then(|id| {
                        run.segments.iter().position(|s| s.id == id)
                    }) {
                        Some(index) => {
                            let seg = &mut run.segments[index];
                            seg.order = item.order;
                            seg.name = item.name;
                            seg.planned_sec = item.planned_sec;
                        }
                        None => {
                            let id = run.allocate_segment_id();
                            run.segments.push(Segment {
                                id,
                                order: item.order,
                                name: item.name,
                                role: item.role,
                                planned_sec: item.planned_sec,
                                actual_sec: None,
                                drift_sec: None,
                                completed: false,
                            });
                        }
                    }
                }
                run.sort_segments();

                Ok(run.segments != before)
            }),
        )
        .await
    }

    /// Destructive full replace used by the rundown editor. Signals
    /// `RundownUpdated` so editors re-fetch rather than pushing a snapshot.
    pub async fn replace_all_segments(
        &self,
        run_id: Uuid,
        items: Vec<SegmentReplace>,
    ) -> Result<(), SyncError> {
        for item in &items {
            if item.planned_sec < 0 {
                return Err(SyncError::InvalidInput(format!(
                    "plannedSec must be non-negative, got {}",
                    item.planned_sec
                )));
            }
        }
        self.store
            .mutate(
                run_id,
                Box::new(move |run| {
                    run.segments.clear();
                    for (index, item) in items.into_iter().enumerate() {
                        let id = run.allocate_segment_id();
                        run.segments.push(Segment {
                            id,
                            order: item.order.unwrap_or(index as i64),
                            name: item.name.unwrap_or_default(),
                            role: item.role,
                            planned_sec: item.planned_sec,
                            actual_sec: item.actual_sec,
                            drift_sec: item.drift_sec,
                            completed: item.completed.unwrap_or(false),
                        });
                    }
                    run.sort_segments();
                    Ok(true)
                }),
            )
            .await?;

        self.gateway.publish(run_id, PushEvent::RundownUpdated(run_id));
        Ok(())
    }

    async fn mutate_and_publish(
        &self,
        run_id: Uuid,
        apply: MutateFn,
    ) -> Result<StateSnapshot, SyncError> {
        let outcome = self.store.mutate(run_id, apply).await?;
        // always rebuilt from the run the store just persisted, so a
        // broadcast can never trail the command it belongs to
        let snapshot = StateSnapshot::build(&outcome.run, Utc::now(), &self.timing);
        if outcome.changed {
            self.gateway
                .publish(run_id, PushEvent::StateUpdated(snapshot.clone()));
        }
        Ok(snapshot)
    }
}
