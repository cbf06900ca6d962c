//! Keyed storage of `Run` aggregates. The `mutate` operation is the single
//! point of serialization per run: a command's read-apply-persist never
//! interleaves with another command on the same run, while different runs
//! proceed independently.

mod memory;
mod sqlite;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{Run, RunConfig, SegmentDraft};

/// Applied inside the store's atomic section. Returns whether observable
/// state changed (drives broadcast suppression for true no-ops); an `Err`
/// aborts persistence and leaves the run untouched.
pub type MutateFn = Box<dyn FnOnce(&mut Run) -> Result<bool, SyncError> + Send>;

#[derive(Debug)]
pub struct MutateOutcome {
    /// The run as persisted, for fresh snapshot derivation.
    pub run: Run,
    pub changed: bool,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(
        &self,
        config: RunConfig,
        segments: Vec<SegmentDraft>,
    ) -> Result<Uuid, SyncError>;

    async fn get(&self, run_id: Uuid) -> Result<Run, SyncError>;

    async fn mutate(&self, run_id: Uuid, apply: MutateFn) -> Result<MutateOutcome, SyncError>;
}
