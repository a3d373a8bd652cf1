use crate::errors::EngineResult;
use crate::store::Store;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use std::sync::Mutex;

/// Daily cap on trade-creation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase", tag = "tier", content = "max")]
pub enum QuotaLimit {
    Unlimited,
    Limited(u32),
}

/// The quota day containing some instant, and the UTC instant it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QuotaWindow {
    pub day: NaiveDate,
    pub resets_at: DateTime<Utc>,
}

impl QuotaWindow {
    pub fn containing(instant: DateTime<Utc>, offset: FixedOffset) -> Self {
        let day = instant.with_timezone(&offset).date_naive();
        let resets_at = day
            .succ_opt()
            .and_then(|next| next.and_hms_opt(0, 0, 0))
            .and_then(|midnight| offset.from_local_datetime(&midnight).single())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { day, resets_at }
    }

    #[inline]
    fn covers(&self, instant: DateTime<Utc>, offset: FixedOffset) -> bool {
        instant < self.resets_at && instant.with_timezone(&offset).date_naive() == self.day
    }
}

/// Per-user daily attempt counter keyed by `(user, day)` under a fixed
/// reference offset. The reset is implicit: a new day is a new key.
///
/// The current window (day + UTC reset boundary) is derived once and
/// cached until the boundary passes, so every check in the same day keys
/// on the same date regardless of the caller's wall clock.
pub struct QuotaTracker {
    offset: FixedOffset,
    window: Mutex<QuotaWindow>,
}

impl QuotaTracker {
    pub fn new(offset: FixedOffset, now: DateTime<Utc>) -> Self {
        Self {
            offset,
            window: Mutex::new(QuotaWindow::containing(now, offset)),
        }
    }

    /// Window for `now`, recomputed only when `now` has left the cached one.
    pub fn window(&self, now: DateTime<Utc>) -> QuotaWindow {
        let mut cached = match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !cached.covers(now, self.offset) {
            *cached = QuotaWindow::containing(now, self.offset);
            tracing::debug!(day = %cached.day, resets_at = %cached.resets_at, "quota window rolled");
        }
        *cached
    }

    /// Atomic check-and-increment. Unlimited tiers never touch the counter.
    pub async fn try_consume(
        &self,
        store: &dyn Store,
        user_id: &str,
        limit: QuotaLimit,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        match limit {
            QuotaLimit::Unlimited => Ok(true),
            QuotaLimit::Limited(max) => {
                let window = self.window(now);
                let granted = store.try_consume_quota(user_id, window.day, max).await?;
                if !granted {
                    tracing::info!(user = user_id, day = %window.day, max, "daily quota exhausted");
                }
                Ok(granted)
            }
        }
    }

    pub async fn used(&self, store: &dyn Store, user_id: &str, now: DateTime<Utc>) -> EngineResult<u32> {
        let window = self.window(now);
        store.quota_used(user_id, window.day).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_db, SqliteStore};
    use std::sync::Arc;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn plus8() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn test_window_boundary_in_reference_offset() {
        // 15:59:59Z is 23:59:59 at +08:00.
        let w = QuotaWindow::containing(utc("2026-10-19T15:59:59Z"), plus8());
        assert_eq!(w.day, NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
        assert_eq!(w.resets_at, utc("2026-10-19T16:00:00Z"));

        let next = QuotaWindow::containing(utc("2026-10-19T16:00:00Z"), plus8());
        assert_eq!(next.day, NaiveDate::from_ymd_opt(2026, 10, 20).unwrap());
    }

    #[test]
    fn test_cached_window_rolls_only_at_boundary() {
        let tracker = QuotaTracker::new(plus8(), utc("2026-10-19T01:00:00Z"));
        let first = tracker.window(utc("2026-10-19T10:00:00Z"));
        assert_eq!(first, tracker.window(utc("2026-10-19T15:59:59Z")));
        let rolled = tracker.window(utc("2026-10-19T16:00:00Z"));
        assert_ne!(first.day, rolled.day);
    }

    #[tokio::test]
    async fn test_attempt_on_day_d_does_not_count_on_day_d_plus_1() {
        let store = SqliteStore::new(init_memory_db().unwrap());
        let tracker = QuotaTracker::new(plus8(), utc("2026-10-19T00:00:00Z"));
        let limit = QuotaLimit::Limited(1);

        let t1 = utc("2026-10-19T15:59:59Z");
        assert!(tracker.try_consume(&store, "u1", limit, t1).await.unwrap());
        assert!(!tracker.try_consume(&store, "u1", limit, t1).await.unwrap());

        let t2 = utc("2026-10-19T16:00:01Z");
        assert!(tracker.try_consume(&store, "u1", limit, t2).await.unwrap());
        assert_eq!(tracker.used(&store, "u1", t2).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumes_grant_exactly_k() {
        let store = Arc::new(SqliteStore::new(init_memory_db().unwrap()));
        let tracker = Arc::new(QuotaTracker::new(plus8(), utc("2026-10-19T00:00:00Z")));
        let now = utc("2026-10-19T08:00:00Z");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker
                    .try_consume(store.as_ref(), "u1", QuotaLimit::Limited(7), now)
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 7);
    }

    #[tokio::test]
    async fn test_unlimited_bypasses_counter() {
        let store = SqliteStore::new(init_memory_db().unwrap());
        let tracker = QuotaTracker::new(plus8(), utc("2026-10-19T00:00:00Z"));
        let now = utc("2026-10-19T08:00:00Z");
        for _ in 0..50 {
            assert!(tracker
                .try_consume(&store, "u1", QuotaLimit::Unlimited, now)
                .await
                .unwrap());
        }
        assert_eq!(tracker.used(&store, "u1", now).await.unwrap(), 0);
    }
}
