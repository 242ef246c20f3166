use chrono::{NaiveDateTime, TimeDelta};

use crate::config::BookingRules;
use crate::model::*;

use super::ValidationError;

/// First approved booking in `rs`, other than `exclude`, that starts on the same
/// date as `range` and overlaps it. Bookings on other dates are never compared.
pub fn find_conflict<'a>(
    rs: &'a RoomSchedule,
    range: &TimeRange,
    exclude: Option<BookingId>,
) -> Option<&'a Booking> {
    rs.on_day(range.date())
        .iter()
        .filter(|b| b.is_approved() && Some(b.id) != exclude)
        .find(|b| range.overlaps(&b.range))
}

pub fn validate_range(range: &TimeRange) -> Result<(), ValidationError> {
    if !range.is_ordered() {
        return Err(ValidationError::EmptyRange {
            start: range.start,
            end: range.end,
        });
    }
    if !range.ends_same_day() {
        return Err(ValidationError::SpansMidnight {
            start: range.start,
            end: range.end,
        });
    }
    Ok(())
}

/// `[now + min_lead_days, now + max_lead_days]`, inclusive.
pub fn booking_window(
    now: NaiveDateTime,
    rules: &BookingRules,
) -> Result<(NaiveDateTime, NaiveDateTime), ValidationError> {
    let offset = |field: &'static str, days: i64| {
        TimeDelta::try_days(days)
            .and_then(|d| now.checked_add_signed(d))
            .ok_or(ValidationError::OutOfCalendar(field))
    };
    Ok((
        offset("min_lead_days", rules.min_lead_days)?,
        offset("max_lead_days", rules.max_lead_days)?,
    ))
}

/// `now + min_lead_days <= start <= now + max_lead_days`.
pub fn validate_window(
    range: &TimeRange,
    now: NaiveDateTime,
    rules: &BookingRules,
) -> Result<(), ValidationError> {
    let (earliest, latest) = booking_window(now, rules)?;
    if range.start < earliest || range.start > latest {
        return Err(ValidationError::OutsideBookingWindow {
            start: range.start,
            earliest,
            latest,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::recurrence::Recurrence;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn stored(id: BookingId, range: TimeRange, status: BookingStatus) -> Booking {
        Booking {
            id,
            series_id: id,
            room_id: 7,
            owner_id: Ulid::nil(),
            range,
            recurrence: Recurrence::None,
            status,
            cancel_reason: String::new(),
            needed_resources: BTreeSet::new(),
            moderator_note: String::new(),
            kind: BookingKind::Coworking,
        }
    }

    #[test]
    fn only_approved_bookings_block() {
        let mut rs = RoomSchedule::new(7);
        let slot = TimeRange::new(at(8, 10, 0), at(8, 11, 0));
        rs.insert(stored(1, slot, BookingStatus::PendingModeration));
        rs.insert(stored(2, slot, BookingStatus::Rejected));
        assert!(find_conflict(&rs, &slot, None).is_none());

        rs.insert(stored(3, slot, BookingStatus::Approved));
        let probe = TimeRange::new(at(8, 10, 30), at(8, 11, 30));
        assert_eq!(find_conflict(&rs, &probe, None).map(|b| b.id), Some(3));
    }

    #[test]
    fn excluded_id_is_skipped() {
        let mut rs = RoomSchedule::new(7);
        let slot = TimeRange::new(at(8, 10, 0), at(8, 11, 0));
        rs.insert(stored(3, slot, BookingStatus::Approved));
        assert!(find_conflict(&rs, &slot, Some(3)).is_none());
        assert!(find_conflict(&rs, &slot, Some(4)).is_some());
    }

    #[test]
    fn other_dates_never_conflict() {
        let mut rs = RoomSchedule::new(7);
        rs.insert(stored(1, TimeRange::new(at(8, 10, 0), at(8, 11, 0)), BookingStatus::Approved));
        let next_day = TimeRange::new(at(9, 10, 0), at(9, 11, 0));
        assert!(find_conflict(&rs, &next_day, None).is_none());
    }

    #[test]
    fn range_validation() {
        assert!(validate_range(&TimeRange::new(at(8, 10, 0), at(8, 11, 0))).is_ok());
        assert!(matches!(
            validate_range(&TimeRange::new(at(8, 11, 0), at(8, 11, 0))),
            Err(ValidationError::EmptyRange { .. })
        ));
        assert!(matches!(
            validate_range(&TimeRange::new(at(8, 12, 0), at(8, 11, 0))),
            Err(ValidationError::EmptyRange { .. })
        ));
        assert!(matches!(
            validate_range(&TimeRange::new(at(8, 23, 0), at(9, 1, 0))),
            Err(ValidationError::SpansMidnight { .. })
        ));
    }

    #[test]
    fn booking_window_bounds_are_inclusive() {
        let rules = BookingRules {
            min_lead_days: 1,
            max_lead_days: 3,
            horizon_days: 40,
        };
        let now = at(1, 9, 0);
        let hour = |start: NaiveDateTime| TimeRange::new(start, start + TimeDelta::hours(1));
        assert!(validate_window(&hour(at(2, 9, 0)), now, &rules).is_ok());
        assert!(validate_window(&hour(at(4, 9, 0)), now, &rules).is_ok());
        assert!(validate_window(&hour(at(2, 8, 59)), now, &rules).is_err());
        assert!(validate_window(&hour(at(4, 9, 1)), now, &rules).is_err());
    }

    #[test]
    fn lead_days_past_the_calendar_are_an_error() {
        let rules = BookingRules {
            min_lead_days: 0,
            max_lead_days: 9_999_999_999_999,
            horizon_days: 40,
        };
        let now = at(1, 9, 0);
        let slot = TimeRange::new(at(2, 9, 0), at(2, 10, 0));
        assert_eq!(
            validate_window(&slot, now, &rules),
            Err(ValidationError::OutOfCalendar("max_lead_days"))
        );
        let rules = BookingRules {
            min_lead_days: i64::MIN,
            ..BookingRules::default()
        };
        assert_eq!(
            booking_window(now, &rules),
            Err(ValidationError::OutOfCalendar("min_lead_days"))
        );
    }
}
