//! Process-wide in-memory store: a map of per-run async mutexes, so
//! mutations on the same run serialize while different runs never contend.
//! The durable `SqliteRunStore` shares the same contract.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{Run, RunConfig, SegmentDraft};

use super::{MutateFn, MutateOutcome, RunStore};

#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<Uuid, Arc<Mutex<Run>>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, run_id: Uuid) -> Result<Arc<Mutex<Run>>, SyncError> {
        let guard = self.runs.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&run_id).cloned().ok_or(SyncError::NotFound)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(
        &self,
        config: RunConfig,
        segments: Vec<SegmentDraft>,
    ) -> Result<Uuid, SyncError> {
        let mut run = Run::new(config);
        for draft in segments {
            run.add_segment(draft);
        }
        let run_id = run.id;
        let mut guard = self.runs.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(run_id, Arc::new(Mutex::new(run)));
        Ok(run_id)
    }

    async fn get(&self, run_id: Uuid) -> Result<Run, SyncError> {
        let cell = self.cell(run_id)?;
        let run = cell.lock().await;
        Ok(run.clone())
    }

    async fn mutate(&self, run_id: Uuid, apply: MutateFn) -> Result<MutateOutcome, SyncError> {
        let cell = self.cell(run_id)?;
        let mut run = cell.lock().await;

        // apply against a working copy so a failed mutation leaves the
        // stored run untouched; an Ok(false) outcome is not persisted either,
        // matching the durable store
        let mut working = run.clone();
        let changed = apply(&mut working)?;
        if changed {
            *run = working.clone();
        }

        Ok(MutateOutcome {
            run: working,
            changed,
        })
    }
}
