use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use tracing::warn;

use crate::limits::MAX_SCHEDULING_DAYS;

/// Scheduling rules the engine enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRules {
    /// A booking may start no earlier than `now + min_lead_days`.
    pub min_lead_days: i64,
    /// ...and no later than `now + max_lead_days`.
    pub max_lead_days: i64,
    /// Recurring series are materialized up to `now + horizon_days`.
    pub horizon_days: i64,
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            min_lead_days: 0,
            max_lead_days: 60,
            horizon_days: 40,
        }
    }
}

impl BookingRules {
    /// `now + horizon_days`, or `None` when that isn't a representable date.
    pub fn horizon_from(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        TimeDelta::try_days(self.horizon_days).and_then(|d| now.checked_add_signed(d))
    }
}

/// Process configuration, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub rules: BookingRules,
    pub materialize_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            rules: BookingRules::default(),
            materialize_interval: Duration::from_secs(24 * 3600),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their default;
    /// unparsable or out-of-range values are logged and take it too.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let days = |key: &str, default: i64, allowed: RangeInclusive<i64>| -> i64 {
            let Some(raw) = lookup(key) else {
                return default;
            };
            match raw.trim().parse::<i64>() {
                Ok(v) if allowed.contains(&v) => v,
                Ok(v) => {
                    warn!(
                        key,
                        value = v,
                        min = allowed.start(),
                        max = allowed.end(),
                        "setting out of range, using default {default}"
                    );
                    default
                }
                Err(e) => {
                    warn!(key, value = %raw, "unparsable setting, using default {default}: {e}");
                    default
                }
            }
        };

        let min_lead_days = days(
            "ROOMBOOK_MIN_LEAD_DAYS",
            defaults.rules.min_lead_days,
            0..=MAX_SCHEDULING_DAYS,
        );
        let max_lead_days = days(
            "ROOMBOOK_MAX_LEAD_DAYS",
            defaults.rules.max_lead_days.max(min_lead_days),
            min_lead_days..=MAX_SCHEDULING_DAYS,
        );
        let rules = BookingRules {
            min_lead_days,
            max_lead_days,
            horizon_days: days(
                "ROOMBOOK_HORIZON_DAYS",
                defaults.rules.horizon_days,
                1..=MAX_SCHEDULING_DAYS,
            ),
        };
        let materialize_interval = lookup("ROOMBOOK_MATERIALIZE_INTERVAL_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.materialize_interval);
        let compact_threshold = lookup("ROOMBOOK_COMPACT_THRESHOLD")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.compact_threshold);

        Self {
            data_dir: lookup("ROOMBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            rules,
            materialize_interval,
            compact_threshold,
            metrics_port: lookup("ROOMBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.rules, BookingRules::default());
        assert_eq!(cfg.materialize_interval, Duration::from_secs(86_400));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/bookings.wal"));
    }

    #[test]
    fn overrides_and_garbage() {
        let env: HashMap<&str, &str> = [
            ("ROOMBOOK_MIN_LEAD_DAYS", "1"),
            ("ROOMBOOK_MAX_LEAD_DAYS", "not-a-number"),
            ("ROOMBOOK_HORIZON_DAYS", " 14 "),
            ("ROOMBOOK_MATERIALIZE_INTERVAL_SECS", "60"),
            ("ROOMBOOK_METRICS_PORT", "9100"),
            ("ROOMBOOK_DATA_DIR", "/var/lib/roombook"),
        ]
        .into_iter()
        .collect();
        let cfg = Config::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.rules.min_lead_days, 1);
        assert_eq!(cfg.rules.max_lead_days, 60);
        assert_eq!(cfg.rules.horizon_days, 14);
        assert_eq!(cfg.materialize_interval, Duration::from_secs(60));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/roombook"));
    }

    #[test]
    fn out_of_range_days_fall_back() {
        let env: HashMap<&str, &str> = [
            ("ROOMBOOK_MIN_LEAD_DAYS", "-3"),
            ("ROOMBOOK_MAX_LEAD_DAYS", "9999999999999"),
            ("ROOMBOOK_HORIZON_DAYS", "0"),
        ]
        .into_iter()
        .collect();
        let cfg = Config::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.rules, BookingRules::default());
        assert!(cfg.rules.horizon_from(chrono::NaiveDateTime::MAX).is_none());
    }

    #[test]
    fn max_lead_below_min_lead_is_rejected() {
        let env: HashMap<&str, &str> = [
            ("ROOMBOOK_MIN_LEAD_DAYS", "90"),
            ("ROOMBOOK_MAX_LEAD_DAYS", "30"),
        ]
        .into_iter()
        .collect();
        let cfg = Config::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.rules.min_lead_days, 90);
        assert_eq!(cfg.rules.max_lead_days, 90);

        let env: HashMap<&str, &str> = [("ROOMBOOK_HORIZON_DAYS", "3661")].into_iter().collect();
        let cfg = Config::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.rules.horizon_days, BookingRules::default().horizon_days);
    }
}
