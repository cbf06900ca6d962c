//! stagesync coordinates a live, multi-device service-timing session: one
//! authoritative run with a master clock and ordered segments, a locale
//! track reporting its own completion estimate, and any number of observing
//! devices kept in sync through snapshot broadcasts with poll failover.
//!
//! The server side is [`control::RunController`] over a [`store::RunStore`];
//! the device side is [`sync::ClientSyncSession`] over the transport traits
//! in [`sync`]. Wire hosting (HTTP routes, WebSocket hubs) lives outside
//! this crate.

pub mod clock;
pub mod control;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;
pub mod timing;
pub mod utils;

pub use clock::ClockSync;
pub use control::RunController;
pub use error::SyncError;
pub use models::{
    Run, RunConfig, Segment, SegmentDraft, SegmentEdit, SegmentReplace, SegmentRole, StateSnapshot,
};
pub use store::{MemoryRunStore, RunStore, SqliteRunStore};
pub use sync::{
    ClientSyncSession, CommandChannel, LinkState, LocalTransport, PushEvent, PushLink,
    PushTransport, SyncGateway,
};
pub use timing::TimingConfig;
