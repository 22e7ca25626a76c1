use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// How many minute buckets to keep per subscription before pruning.
const RETAINED_MINUTES: u64 = 15;

/// In-memory per-minute upstream status counts keyed by subscription name.
///
/// Doubles as the source of the recent-request-rate hint used by the
/// selection scorer.
#[derive(Default)]
pub struct Metrics {
    counts: std::sync::Mutex<HashMap<String, HashMap<u64, HashMap<u16, u64>>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status code occurrence using the current wall-clock time.
    pub fn record(&self, subscription: &str, status: u16) {
        self.record_at(subscription, status, SystemTime::now());
    }

    /// Record a status code occurrence at a provided time (useful for tests).
    pub fn record_at(&self, subscription: &str, status: u16, at: SystemTime) {
        let minute = Self::minute_bucket(at);
        let mut guard = self.counts.lock().expect("metrics store poisoned");
        let per_sub = guard.entry(subscription.to_string()).or_default();
        per_sub.retain(|m, _| *m + RETAINED_MINUTES > minute);
        let per_minute = per_sub.entry(minute).or_default();
        *per_minute.entry(status).or_insert(0) += 1;
    }

    /// Snapshot counts for a subscription. Empty when the name is unknown.
    pub fn snapshot(&self, subscription: &str) -> HashMap<u64, HashMap<u16, u64>> {
        self.counts
            .lock()
            .expect("metrics store poisoned")
            .get(subscription)
            .cloned()
            .unwrap_or_default()
    }

    /// Approximate requests-per-minute for a subscription: the busier of the
    /// current (partial) minute and the previous one.
    pub fn requests_per_minute(&self, subscription: &str) -> u64 {
        self.requests_per_minute_at(subscription, SystemTime::now())
    }

    pub fn requests_per_minute_at(&self, subscription: &str, at: SystemTime) -> u64 {
        let minute = Self::minute_bucket(at);
        let guard = self.counts.lock().expect("metrics store poisoned");
        let Some(per_sub) = guard.get(subscription) else {
            return 0;
        };
        let total = |m: u64| per_sub.get(&m).map_or(0, |c| c.values().sum());
        total(minute).max(minute.checked_sub(1).map_or(0, total))
    }

    fn minute_bucket(at: SystemTime) -> u64 {
        at.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
            / 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_bucket_groups_by_60_seconds() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(59);
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(60);
        assert_eq!(Metrics::minute_bucket(t0), 0);
        assert_eq!(Metrics::minute_bucket(t1), 1);
    }

    #[test]
    fn record_and_snapshot_counts() {
        let metrics = Metrics::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(65);

        metrics.record_at("work", 200, t0);
        metrics.record_at("work", 429, t0);
        metrics.record_at("work", 200, t1);

        let snap = metrics.snapshot("work");
        let first_min = snap.get(&0).unwrap();
        let second_min = snap.get(&1).unwrap();

        assert_eq!(first_min.get(&200), Some(&1));
        assert_eq!(first_min.get(&429), Some(&1));
        assert_eq!(second_min.get(&200), Some(&1));
    }

    #[test]
    fn snapshot_unknown_subscription_is_empty() {
        let metrics = Metrics::new();
        assert!(metrics.snapshot("missing").is_empty());
    }

    #[test]
    fn requests_per_minute_uses_busier_adjacent_bucket() {
        let metrics = Metrics::new();
        let prev = SystemTime::UNIX_EPOCH + Duration::from_secs(600);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(665);

        for _ in 0..12 {
            metrics.record_at("work", 200, prev);
        }
        metrics.record_at("work", 200, now);

        assert_eq!(metrics.requests_per_minute_at("work", now), 12);
        assert_eq!(metrics.requests_per_minute_at("other", now), 0);
    }

    #[test]
    fn old_buckets_are_pruned() {
        let metrics = Metrics::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(0);
        metrics.record_at("work", 200, t0);

        let later = t0 + Duration::from_secs(60 * (RETAINED_MINUTES + 1));
        metrics.record_at("work", 200, later);

        let snap = metrics.snapshot("work");
        assert_eq!(snap.len(), 1);
        assert!(snap.contains_key(&(RETAINED_MINUTES + 1)));
    }
}
