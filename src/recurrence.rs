use std::fmt;
use std::str::FromStr;

use chrono::{Days, Months, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::engine::ValidationError;
use crate::model::TimeRange;

/// How a series repeats. `None` is an explicit variant, never a missing value.
///
/// Stored and audited as its string tag. Decoding is lenient: a tag that
/// doesn't parse comes back as `None`, so it is never materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum Recurrence {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Recurrence {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Recurrence::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::None => "no",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
            Recurrence::Yearly => "yearly",
        }
    }

    /// `t` advanced by `steps` periods. Month and year steps are calendar-aware:
    /// the day of month is kept when it exists in the target month and clamped to
    /// the month's last day otherwise. Returns `None` for `Recurrence::None` or overflow.
    pub fn advance(&self, t: NaiveDateTime, steps: u32) -> Option<NaiveDateTime> {
        match self {
            Recurrence::None => None,
            Recurrence::Daily => t.checked_add_days(Days::new(u64::from(steps))),
            Recurrence::Weekly => t.checked_add_days(Days::new(7 * u64::from(steps))),
            Recurrence::Monthly => t.checked_add_months(Months::new(steps)),
            Recurrence::Yearly => t.checked_add_months(Months::new(steps.checked_mul(12)?)),
        }
    }

    /// The `n`-th occurrence counted from `anchor` (n = 0 is the anchor itself).
    /// Computed from the anchor directly so month-end clamping never accumulates.
    pub fn nth_occurrence(&self, anchor: &TimeRange, n: u32) -> Option<TimeRange> {
        if n == 0 {
            return Some(*anchor);
        }
        let start = self.advance(anchor.start, n)?;
        let end = self.advance(anchor.end, n)?;
        Some(TimeRange::new(start, end))
    }

    /// `range` moved forward by one period.
    pub fn next_occurrence(&self, range: &TimeRange) -> Option<TimeRange> {
        self.nth_occurrence(range, 1)
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Recurrence> for &'static str {
    fn from(r: Recurrence) -> Self {
        r.as_str()
    }
}

impl From<String> for Recurrence {
    fn from(raw: String) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl FromStr for Recurrence {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "no" | "none" => Ok(Recurrence::None),
            "daily" | "day" => Ok(Recurrence::Daily),
            "weekly" | "week" => Ok(Recurrence::Weekly),
            "monthly" | "month" => Ok(Recurrence::Monthly),
            "yearly" | "year" => Ok(Recurrence::Yearly),
            _ => Err(ValidationError::Recurrence(s.to_string())),
        }
    }
}
