//! Pure drift and prediction math over a `Run` snapshot. No I/O, no clocks:
//! callers pass `now` in, which keeps every derivation testable against a
//! simulated timeline.
//!
//! Conventions, applied uniformly:
//! - `actual_sec` is an absolute elapsed mark since master start.
//! - per-segment duration = this mark minus the previous completed mark.
//! - `drift_sec` = `planned_sec - duration`; positive means the segment
//!   finished under budget.
//! - durations clamp at zero; drift stays signed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{OfferingSuggestion, Run, SegmentRole};

/// Fallback anchor when the locale track has neither ended nor reported an
/// ETA: the expected total run length.
pub const DEFAULT_MASTER_TARGET_SEC: i64 = 35 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    pub master_target_sec: i64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            master_target_sec: DEFAULT_MASTER_TARGET_SEC,
        }
    }
}

/// Whole seconds since the master clock anchor, round-half-up, never
/// negative. `None` while the run is still in draft.
pub fn elapsed_since_master(run: &Run, now: DateTime<Utc>) -> Option<i64> {
    let start = run.master_start_at?;
    let ms = (now - start).num_milliseconds();
    if ms <= 0 {
        return Some(0);
    }
    Some((ms + 500) / 1000)
}

/// The `(actual_sec, drift_sec)` pair a completion at `now` would record.
/// Already-completed segments report their recorded values unchanged, which
/// makes repeated completion calls no-ops. `None` when the segment does not
/// exist or the run has no master clock yet.
pub fn completion_values(run: &Run, segment_id: i64, now: DateTime<Utc>) -> Option<(i64, i64)> {
    let seg = run.segment(segment_id)?;
    if seg.completed {
        return Some((seg.actual_sec.unwrap_or(0), seg.drift_sec.unwrap_or(0)));
    }
    let elapsed = elapsed_since_master(run, now)?;
    let duration = (elapsed - prior_completed_mark(run, seg.order)).max(0);
    Some((elapsed, seg.planned_sec - duration))
}

/// Mark of the greatest-ordered completed segment before `before_order`,
/// or 0 when nothing before it has completed.
fn prior_completed_mark(run: &Run, before_order: i64) -> i64 {
    run.segments
        .iter()
        .filter(|s| s.completed && s.order < before_order)
        .max_by_key(|s| s.order)
        .and_then(|s| s.actual_sec)
        .unwrap_or(0)
}

/// Sum of drift over completed segments; pending segments contribute 0.
pub fn cumulative_drift(run: &Run) -> i64 {
    run.segments
        .iter()
        .filter(|s| s.completed)
        .filter_map(|s| s.drift_sec)
        .sum()
}

/// The locale track's anchor time: real end if recorded and positive, else
/// the current ETA if positive, else the configured master target.
pub fn secondary_anchor_sec(run: &Run, config: &TimingConfig) -> i64 {
    if let Some(ended) = run.secondary_ended_at_sec {
        if ended > 0 {
            return ended;
        }
    }
    if let Some(eta) = run.secondary_eta_sec {
        if eta > 0 {
            return eta;
        }
    }
    config.master_target_sec
}

/// Planned start of the offering block: the planned durations of every
/// segment ordered before the anchor segment. `None` when no segment carries
/// the anchor role.
pub fn planned_offering_start_sec(run: &Run) -> Option<i64> {
    let anchor = run
        .segments
        .iter()
        .filter(|s| s.role == SegmentRole::OfferingAnchor)
        .min_by_key(|s| s.order)?;
    Some(
        run.segments
            .iter()
            .filter(|s| s.order < anchor.order)
            .map(|s| s.planned_sec)
            .sum(),
    )
}

/// How long the offering block should run so its end lands on the locale
/// track's anchor, given where drift has pushed its start. Never below the
/// configured base window.
pub fn predicted_offering_length_sec(run: &Run, config: &TimingConfig) -> i64 {
    let base = run.base_offering_sec;
    let Some(planned_start) = planned_offering_start_sec(run) else {
        return base;
    };
    let start = planned_start + cumulative_drift(run);
    let gap = (secondary_anchor_sec(run, config) - start).max(0);
    base.max(gap)
}

pub fn offering_suggestion(run: &Run, config: &TimingConfig) -> OfferingSuggestion {
    let base = run.base_offering_sec;
    let stretch_sec = (predicted_offering_length_sec(run, config) - base).max(0);
    OfferingSuggestion {
        stretch_sec,
        offering_target_sec: base + stretch_sec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunConfig, SegmentDraft};
    use chrono::Duration;

    fn live_run_started_secs_ago(secs: i64) -> Run {
        let mut run = Run::new(RunConfig::default());
        run.master_start_at = Some(Utc::now() - Duration::seconds(secs));
        run
    }

    fn draft(name: &str, planned_sec: i64, role: SegmentRole) -> SegmentDraft {
        SegmentDraft {
            name: name.into(),
            planned_sec,
            role,
        }
    }

    #[test]
    fn elapsed_is_none_for_draft_runs() {
        let run = Run::new(RunConfig::default());
        assert_eq!(elapsed_since_master(&run, Utc::now()), None);
    }

    #[test]
    fn elapsed_clamps_to_zero_before_start() {
        let mut run = Run::new(RunConfig::default());
        let start = Utc::now();
        run.master_start_at = Some(start);
        assert_eq!(
            elapsed_since_master(&run, start - Duration::seconds(5)),
            Some(0)
        );
    }

    #[test]
    fn elapsed_rounds_half_up() {
        let mut run = Run::new(RunConfig::default());
        let start = Utc::now();
        run.master_start_at = Some(start);
        assert_eq!(
            elapsed_since_master(&run, start + Duration::milliseconds(1499)),
            Some(1)
        );
        assert_eq!(
            elapsed_since_master(&run, start + Duration::milliseconds(1500)),
            Some(2)
        );
    }

    // Pins the sign convention: planned - duration, positive = under budget.
    #[test]
    fn drift_is_planned_minus_duration() {
        let mut run = live_run_started_secs_ago(130);
        let id = run.add_segment(draft("Welcome", 120, SegmentRole::Standard));
        let (actual, drift) = completion_values(&run, id, Utc::now()).unwrap();
        assert_eq!(actual, 130);
        assert_eq!(drift, -10);
    }

    #[test]
    fn duration_subtracts_prior_completed_mark() {
        let mut run = live_run_started_secs_ago(200);
        let first = run.add_segment(draft("Welcome", 120, SegmentRole::Standard));
        let second = run.add_segment(draft("Worship", 60, SegmentRole::Standard));
        {
            let seg = run.segment_mut(first).unwrap();
            seg.completed = true;
            seg.actual_sec = Some(130);
            seg.drift_sec = Some(-10);
        }
        // second runs from mark 130 to 200: 70s against 60 planned
        let (actual, drift) = completion_values(&run, second, Utc::now()).unwrap();
        assert_eq!(actual, 200);
        assert_eq!(drift, -10);
    }

    #[test]
    fn completion_values_are_idempotent_for_completed_segments() {
        let mut run = live_run_started_secs_ago(500);
        let id = run.add_segment(draft("Welcome", 120, SegmentRole::Standard));
        {
            let seg = run.segment_mut(id).unwrap();
            seg.completed = true;
            seg.actual_sec = Some(130);
            seg.drift_sec = Some(-10);
        }
        let (actual, drift) = completion_values(&run, id, Utc::now()).unwrap();
        assert_eq!((actual, drift), (130, -10));
    }

    #[test]
    fn duration_clamps_at_zero_but_drift_stays_signed() {
        let mut run = live_run_started_secs_ago(100);
        let first = run.add_segment(draft("Welcome", 120, SegmentRole::Standard));
        let second = run.add_segment(draft("Worship", 60, SegmentRole::Standard));
        {
            let seg = run.segment_mut(first).unwrap();
            seg.completed = true;
            // mark recorded past the current elapsed time
            seg.actual_sec = Some(150);
        }
        let (actual, drift) = completion_values(&run, second, Utc::now()).unwrap();
        assert_eq!(actual, 100);
        // zero duration, full planned time left over
        assert_eq!(drift, 60);
    }

    #[test]
    fn cumulative_drift_counts_only_completed_segments() {
        let mut run = live_run_started_secs_ago(0);
        let a = run.add_segment(draft("A", 60, SegmentRole::Standard));
        let b = run.add_segment(draft("B", 60, SegmentRole::Standard));
        run.add_segment(draft("C", 60, SegmentRole::Standard));
        {
            let seg = run.segment_mut(a).unwrap();
            seg.completed = true;
            seg.drift_sec = Some(-10);
        }
        {
            let seg = run.segment_mut(b).unwrap();
            seg.completed = true;
            seg.drift_sec = Some(25);
        }
        assert_eq!(cumulative_drift(&run), 15);
    }

    #[test]
    fn anchor_prefers_real_end_then_eta_then_target() {
        let config = TimingConfig::default();
        let mut run = Run::new(RunConfig::default());
        assert_eq!(secondary_anchor_sec(&run, &config), DEFAULT_MASTER_TARGET_SEC);

        run.secondary_eta_sec = Some(1800);
        assert_eq!(secondary_anchor_sec(&run, &config), 1800);

        run.secondary_ended_at_sec = Some(1700);
        assert_eq!(secondary_anchor_sec(&run, &config), 1700);
    }

    #[test]
    fn anchor_ignores_zero_values() {
        let config = TimingConfig::default();
        let mut run = Run::new(RunConfig::default());
        run.secondary_eta_sec = Some(0);
        run.secondary_ended_at_sec = Some(0);
        assert_eq!(secondary_anchor_sec(&run, &config), DEFAULT_MASTER_TARGET_SEC);
    }

    #[test]
    fn planned_offering_start_requires_an_anchor_segment() {
        let mut run = Run::new(RunConfig::default());
        run.add_segment(draft("Welcome", 120, SegmentRole::Standard));
        assert_eq!(planned_offering_start_sec(&run), None);

        run.add_segment(draft("Offering", 0, SegmentRole::OfferingAnchor));
        run.add_segment(draft("Closing", 180, SegmentRole::Standard));
        assert_eq!(planned_offering_start_sec(&run), Some(120));
    }

    #[test]
    fn prediction_closes_the_gap_to_the_anchor() {
        let config = TimingConfig::default();
        let mut run = Run::new(RunConfig {
            base_offering_sec: 300,
            ..RunConfig::default()
        });
        let welcome = run.add_segment(draft("Welcome", 1200, SegmentRole::Standard));
        run.add_segment(draft("Offering", 0, SegmentRole::OfferingAnchor));
        {
            let seg = run.segment_mut(welcome).unwrap();
            seg.completed = true;
            seg.drift_sec = Some(-60); // ran a minute long
        }
        run.secondary_eta_sec = Some(1800);

        // offering starts at 1200 - 60 = 1140; gap to anchor = 660
        assert_eq!(predicted_offering_length_sec(&run, &config), 660);
        let suggestion = offering_suggestion(&run, &config);
        assert_eq!(suggestion.stretch_sec, 360);
        assert_eq!(suggestion.offering_target_sec, 660);
    }

    #[test]
    fn prediction_never_drops_below_base() {
        let config = TimingConfig::default();
        let mut run = Run::new(RunConfig {
            base_offering_sec: 300,
            ..RunConfig::default()
        });
        run.add_segment(draft("Welcome", 1200, SegmentRole::Standard));
        run.add_segment(draft("Offering", 0, SegmentRole::OfferingAnchor));
        // anchor earlier than the planned start: gap clamps to 0
        run.secondary_ended_at_sec = Some(600);
        assert_eq!(predicted_offering_length_sec(&run, &config), 300);

        let suggestion = offering_suggestion(&run, &config);
        assert_eq!(suggestion.stretch_sec, 0);
        assert_eq!(suggestion.offering_target_sec, 300);
    }

    #[test]
    fn prediction_falls_back_to_base_without_anchor() {
        let config = TimingConfig::default();
        let mut run = Run::new(RunConfig::default());
        run.add_segment(draft("Welcome", 120, SegmentRole::Standard));
        assert_eq!(predicted_offering_length_sec(&run, &config), 300);
    }

    #[test]
    fn suggestion_target_always_equals_base_plus_stretch() {
        let config = TimingConfig::default();
        let mut run = Run::new(RunConfig::default());
        run.add_segment(draft("Welcome", 600, SegmentRole::Standard));
        run.add_segment(draft("Offering", 0, SegmentRole::OfferingAnchor));
        for eta in [0, 300, 900, 3600] {
            run.secondary_eta_sec = Some(eta);
            let s = offering_suggestion(&run, &config);
            assert!(s.stretch_sec >= 0);
            assert_eq!(s.offering_target_sec, run.base_offering_sec + s.stretch_sec);
        }
    }
}
