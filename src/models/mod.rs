pub mod run;
pub mod snapshot;

pub use run::{
    Run, RunConfig, Segment, SegmentDraft, SegmentEdit, SegmentReplace, SegmentRole,
    DEFAULT_BASE_OFFERING_SEC,
};
pub use snapshot::{
    parse_utc, OfferingSuggestion, PrimaryTrack, SecondaryTrack, SegmentView, StateSnapshot,
};
