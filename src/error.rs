use thiserror::Error;

/// Crate-wide failure taxonomy. Commands surface these as structured results;
/// broadcast and polling failures are logged instead of propagated.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("run or segment not found")]
    NotFound,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the whole context chain from the persistence layer
        SyncError::Storage(format!("{err:#}"))
    }
}

impl SyncError {
    pub fn not_live() -> Self {
        SyncError::InvalidState("run not live".into())
    }
}
