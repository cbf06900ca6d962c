use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Applied when a run is created with a non-positive offering window.
pub const DEFAULT_BASE_OFFERING_SEC: i64 = 300;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SegmentRole {
    #[default]
    Standard,
    /// Marks the flexible block whose length absorbs accumulated drift.
    /// Assigned at creation time; the lowest-ordered anchor wins.
    OfferingAnchor,
}

impl SegmentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentRole::Standard => "Standard",
            SegmentRole::OfferingAnchor => "OfferingAnchor",
        }
    }
}

/// One planned block of time within a run's primary track.
///
/// `actual_sec` records the absolute elapsed mark since master start at
/// completion time, never a duration. Durations are derived by subtracting
/// the previous completed segment's mark, and only when computing drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: i64,
    pub order: i64,
    pub name: String,
    pub role: SegmentRole,
    pub planned_sec: i64,
    pub actual_sec: Option<i64>,
    pub drift_sec: Option<i64>,
    pub completed: bool,
}

/// Per-run duration configuration, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub preteach_sec: i64,
    pub walk_buffer_sec: i64,
    pub base_offering_sec: i64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            preteach_sec: 0,
            walk_buffer_sec: 0,
            base_offering_sec: DEFAULT_BASE_OFFERING_SEC,
        }
    }
}

impl RunConfig {
    /// Durations are non-negative; a non-positive offering window falls back
    /// to the default.
    pub fn normalized(self) -> Self {
        Self {
            preteach_sec: self.preteach_sec.max(0),
            walk_buffer_sec: self.walk_buffer_sec.max(0),
            base_offering_sec: if self.base_offering_sec <= 0 {
                DEFAULT_BASE_OFFERING_SEC
            } else {
                self.base_offering_sec
            },
        }
    }
}

/// Segment shape accepted at run creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDraft {
    pub name: String,
    pub planned_sec: i64,
    #[serde(default)]
    pub role: SegmentRole,
}

/// One item of a bulk segment reconciliation. `id` matches an existing
/// segment; items without a match are created. `role` only applies on
/// creation, it never retags an existing segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEdit {
    pub id: Option<i64>,
    pub order: i64,
    pub name: String,
    pub planned_sec: i64,
    #[serde(default)]
    pub role: SegmentRole,
}

/// One item of a destructive full replace (rundown editor path). Timing
/// fields pass through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentReplace {
    pub order: Option<i64>,
    pub name: Option<String>,
    pub planned_sec: i64,
    pub actual_sec: Option<i64>,
    pub drift_sec: Option<i64>,
    pub completed: Option<bool>,
    #[serde(default)]
    pub role: SegmentRole,
}

/// The aggregate root for one timed event. Owned exclusively by a `RunStore`;
/// everything else only ever sees transient copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Master clock anchor. Null while the run is in draft; first write wins
    /// and the value never changes afterwards.
    pub master_start_at: Option<DateTime<Utc>>,
    pub preteach_sec: i64,
    pub walk_buffer_sec: i64,
    pub base_offering_sec: i64,
    /// Seconds since master start when the locale track ended. Write-once.
    pub secondary_ended_at_sec: Option<i64>,
    /// Current locale-track completion estimate, overwritable. `Some(0)` is a
    /// real estimate; only `None` means "no ETA set".
    pub secondary_eta_sec: Option<i64>,
    pub secondary_eta_updated_at: Option<DateTime<Utc>>,
    /// Seconds since master start when the offering block began. Write-once.
    pub offering_started_at_sec: Option<i64>,
    pub segments: Vec<Segment>,
    /// Allocator for segment ids, unique within the run.
    pub next_segment_id: i64,
}

impl Run {
    pub fn new(config: RunConfig) -> Self {
        let config = config.normalized();
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            master_start_at: None,
            preteach_sec: config.preteach_sec,
            walk_buffer_sec: config.walk_buffer_sec,
            base_offering_sec: config.base_offering_sec,
            secondary_ended_at_sec: None,
            secondary_eta_sec: None,
            secondary_eta_updated_at: None,
            offering_started_at_sec: None,
            segments: Vec::new(),
            next_segment_id: 1,
        }
    }

    pub fn is_live(&self) -> bool {
        self.master_start_at.is_some()
    }

    pub fn segment(&self, segment_id: i64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == segment_id)
    }

    pub fn segment_mut(&mut self, segment_id: i64) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.id == segment_id)
    }

    pub fn allocate_segment_id(&mut self) -> i64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    /// Appends a segment after the current tail of the order sequence.
    pub fn add_segment(&mut self, draft: SegmentDraft) -> i64 {
        let id = self.allocate_segment_id();
        let order = self
            .segments
            .iter()
            .map(|s| s.order)
            .max()
            .map_or(0, |o| o + 1);
        self.segments.push(Segment {
            id,
            order,
            name: draft.name,
            role: draft.role,
            planned_sec: draft.planned_sec.max(0),
            actual_sec: None,
            drift_sec: None,
            completed: false,
        });
        id
    }

    /// Restores the by-order invariant after edits that touch `order`.
    pub fn sort_segments(&mut self) {
        self.segments.sort_by_key(|s| s.order);
    }
}
