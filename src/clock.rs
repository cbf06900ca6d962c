//! Server-clock reconciliation. Each received snapshot carries the server's
//! send timestamp; comparing it against the local receipt time yields an
//! offset that lets every countdown render against "server now" without
//! further round trips.

use chrono::{DateTime, Duration, Utc};

/// Offset is stored as local-minus-server milliseconds, so
/// `server_now = local_now - offset`. Updated atomically on every snapshot
/// receipt; `server_now` is the only accessor display code should use.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    offset_ms: i64,
    last_sync_at: Option<DateTime<Utc>>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derives the offset from a freshly received server timestamp.
    pub fn observe(&mut self, server_time: DateTime<Utc>, local_now: DateTime<Utc>) {
        self.offset_ms = (local_now - server_time).num_milliseconds();
        self.last_sync_at = Some(local_now);
    }

    pub fn server_now(&self, local_now: DateTime<Utc>) -> DateTime<Utc> {
        local_now - Duration::milliseconds(self.offset_ms)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Seconds since the last successful sync, for the staleness indicator.
    /// `None` before any snapshot has been observed.
    pub fn last_sync_age_secs(&self, local_now: DateTime<Utc>) -> Option<i64> {
        self.last_sync_at
            .map(|at| (local_now - at).num_seconds().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn offset_tracks_a_fast_local_clock() {
        let server = Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap();
        let local = server + Duration::seconds(7);

        let mut clock = ClockSync::new();
        clock.observe(server, local);

        assert_eq!(clock.offset_ms(), 7_000);
        assert_eq!(clock.server_now(local), server);
        // a minute later, server-now still trails local by the same offset
        let later = local + Duration::seconds(60);
        assert_eq!(clock.server_now(later), server + Duration::seconds(60));
    }

    #[test]
    fn offset_tracks_a_slow_local_clock() {
        let server = Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap();
        let local = server - Duration::milliseconds(2_500);

        let mut clock = ClockSync::new();
        clock.observe(server, local);

        assert_eq!(clock.offset_ms(), -2_500);
        assert_eq!(clock.server_now(local), server);
    }

    #[test]
    fn sync_age_starts_unset_and_counts_up() {
        let mut clock = ClockSync::new();
        let now = Utc::now();
        assert_eq!(clock.last_sync_age_secs(now), None);

        clock.observe(now, now);
        assert_eq!(clock.last_sync_age_secs(now + Duration::seconds(9)), Some(9));
    }
}
