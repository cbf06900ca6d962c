//! The canonical client-facing projection of run state. Every command that
//! returns or broadcasts state goes through `StateSnapshot::build`, so all
//! surfaces carry the exact same shape. Snapshots are recomputed fresh from
//! the just-mutated run and never cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Run, Segment, SegmentRole};
use crate::timing::{self, TimingConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentView {
    pub id: i64,
    pub order: i64,
    pub name: String,
    pub role: SegmentRole,
    pub planned_sec: i64,
    pub actual_sec: Option<i64>,
    pub drift_sec: Option<i64>,
    pub completed: bool,
}

impl From<&Segment> for SegmentView {
    fn from(seg: &Segment) -> Self {
        Self {
            id: seg.id,
            order: seg.order,
            name: seg.name.clone(),
            role: seg.role,
            planned_sec: seg.planned_sec,
            actual_sec: seg.actual_sec,
            drift_sec: seg.drift_sec,
            completed: seg.completed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryTrack {
    pub eta_sec: Option<i64>,
    #[serde(default, with = "utc_ts_opt")]
    pub eta_updated_at_utc: Option<DateTime<Utc>>,
    pub ended_at_sec: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryTrack {
    pub segments: Vec<SegmentView>,
    pub cumulative_drift_sec: i64,
    pub secondary_block_started_at_sec: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfferingSuggestion {
    pub stretch_sec: i64,
    pub offering_target_sec: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub run_id: Uuid,
    #[serde(with = "utc_ts")]
    pub server_time_utc: DateTime<Utc>,
    #[serde(default, with = "utc_ts_opt")]
    pub master_start_utc: Option<DateTime<Utc>>,
    pub master_target_sec: i64,
    pub preteach_sec: i64,
    pub walk_buffer_sec: i64,
    pub base_offering_sec: i64,
    pub secondary: SecondaryTrack,
    pub primary: PrimaryTrack,
    pub offering_suggestion: OfferingSuggestion,
}

impl StateSnapshot {
    /// The single snapshot builder. `now` becomes the server timestamp the
    /// receiving side reconciles its clock against.
    pub fn build(run: &Run, now: DateTime<Utc>, config: &TimingConfig) -> Self {
        let mut segments: Vec<SegmentView> = run.segments.iter().map(SegmentView::from).collect();
        segments.sort_by_key(|s| s.order);

        Self {
            run_id: run.id,
            server_time_utc: now,
            master_start_utc: run.master_start_at,
            master_target_sec: config.master_target_sec,
            preteach_sec: run.preteach_sec,
            walk_buffer_sec: run.walk_buffer_sec,
            base_offering_sec: run.base_offering_sec,
            secondary: SecondaryTrack {
                eta_sec: run.secondary_eta_sec,
                eta_updated_at_utc: run.secondary_eta_updated_at,
                ended_at_sec: run.secondary_ended_at_sec,
            },
            primary: PrimaryTrack {
                segments,
                cumulative_drift_sec: timing::cumulative_drift(run),
                secondary_block_started_at_sec: run.offering_started_at_sec,
            },
            offering_suggestion: timing::offering_suggestion(run, config),
        }
    }
}

/// Parses an ISO-8601 timestamp, treating a missing timezone designator as
/// UTC. The wire contract pins this normalization so platform-default
/// parsing can never reinterpret a bare timestamp as local time.
pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| format!("invalid timestamp '{raw}': {err}"))
}

mod utc_ts {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        super::parse_utc(&raw).map_err(serde::de::Error::custom)
    }
}

mod utc_ts_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => ser.serialize_some(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|s| super::parse_utc(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
