use chrono::Local;

use crate::config::Config;
use crate::usage::UsageRecord;

/// Source of the current month tag (`"YYYY-MM"`).
pub trait Clock: Send + Sync {
    fn month_key(&self) -> String;
}

/// Local wall-clock time, so the quota rolls over at local midnight on the
/// first of the month.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn month_key(&self) -> String {
        Local::now().format("%Y-%m").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub monthly_limit: u64,
}

impl QuotaPolicy {
    pub fn new(monthly_limit: u64) -> Self {
        Self { monthly_limit }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.api_limit)
    }
}

pub fn is_admissible(record: &UsageRecord, limit: u64, month_key: &str) -> bool {
    record.get(month_key) < limit
}

#[cfg(test)]
pub struct FixedClock(pub String);

#[cfg(test)]
impl Clock for FixedClock {
    fn month_key(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(month: &str, count: u64) -> UsageRecord {
        let mut record = UsageRecord::new();
        record.set(month, count);
        record
    }

    #[test]
    fn admits_until_count_reaches_limit() {
        assert!(is_admissible(&UsageRecord::new(), 1, "2024-05"));
        assert!(is_admissible(&record_with("2024-05", 99), 100, "2024-05"));
        assert!(!is_admissible(&record_with("2024-05", 100), 100, "2024-05"));
        assert!(!is_admissible(&record_with("2024-05", 250), 100, "2024-05"));
    }

    #[test]
    fn zero_limit_denies_every_month() {
        assert!(!is_admissible(&UsageRecord::new(), 0, "2024-05"));
        assert!(!is_admissible(&record_with("2024-04", 3), 0, "2024-05"));
    }

    #[test]
    fn only_the_current_month_counts() {
        let record = record_with("2024-04", 100);
        assert!(is_admissible(&record, 100, "2024-05"));
    }

    #[test]
    fn raising_the_limit_never_revokes_admission() {
        for count in 0..6u64 {
            let record = record_with("2024-05", count);
            let mut admitted = false;
            for limit in 0..8u64 {
                let now = is_admissible(&record, limit, "2024-05");
                assert!(!admitted || now, "count={count} limit={limit}");
                assert_eq!(now, count < limit);
                admitted = now;
            }
        }
    }

    #[test]
    fn local_clock_formats_year_and_month() {
        let key = LocalClock.month_key();
        assert_eq!(key.len(), 7);
        assert_eq!(&key[4..5], "-");
        assert!(key[..4].chars().all(|c| c.is_ascii_digit()));
        assert!(key[5..].chars().all(|c| c.is_ascii_digit()));
    }
}
