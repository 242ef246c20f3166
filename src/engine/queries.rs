use std::collections::HashMap;

use chrono::{Datelike, Days, NaiveDate};

use crate::model::*;

use super::availability::{merge_overlapping, subtract_ranges};
use super::conflict::find_conflict;
use super::{Engine, EngineError, Entity};

impl Engine {
    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let not_found = || EngineError::NotFound(Entity::Booking(id));
        let room_id = self.room_of(id).ok_or_else(not_found)?;
        let rs = self.room_schedule(room_id).ok_or_else(not_found)?;
        let guard = rs.read().await;
        guard.get(id).cloned().ok_or_else(not_found)
    }

    /// True when no approved booking other than `exclude` overlaps `range` on
    /// its date in `room_id`. Advisory only: writers re-check under the room lock.
    pub async fn is_slot_free(
        &self,
        room_id: RoomId,
        range: &TimeRange,
        exclude: Option<BookingId>,
    ) -> bool {
        let Some(rs) = self.room_schedule(room_id) else {
            return true;
        };
        let guard = rs.read().await;
        find_conflict(&guard, range, exclude).is_none()
    }

    /// All rows of a series, ordered by start.
    pub async fn series_occurrences(&self, series_id: BookingId) -> Vec<Booking> {
        let mut rows = Vec::new();
        for room_id in self.series_rooms(series_id) {
            let Some(rs) = self.room_schedule(room_id) else {
                continue;
            };
            let guard = rs.read().await;
            rows.extend(guard.bookings.iter().filter(|b| b.series_id == series_id).cloned());
        }
        rows.sort_by_key(|b| (b.range.start, b.id));
        rows
    }

    /// The row with the greatest start of every series whose latest row is
    /// approved and recurring. This is the set the horizon sweep tops up.
    pub async fn latest_per_series(&self) -> Vec<Booking> {
        let mut latest: HashMap<BookingId, Booking> = HashMap::new();
        for rs in self.all_schedules() {
            let guard = rs.read().await;
            for b in &guard.bookings {
                match latest.get(&b.series_id) {
                    Some(seen) if (seen.range.start, seen.id) >= (b.range.start, b.id) => {}
                    _ => {
                        latest.insert(b.series_id, b.clone());
                    }
                }
            }
        }
        let mut active: Vec<Booking> = latest
            .into_values()
            .filter(Booking::is_active_series)
            .collect();
        active.sort_by_key(|b| b.series_id);
        active
    }

    /// Bookings in `room_id` starting inside `window`, any status.
    pub async fn room_agenda(&self, room_id: RoomId, window: &TimeRange) -> Vec<Booking> {
        let Some(rs) = self.room_schedule(room_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.starting_within(window).to_vec()
    }

    /// Monday to Sunday week containing `date`.
    pub async fn week_agenda(&self, room_id: RoomId, date: NaiveDate) -> Vec<Booking> {
        let monday = date
            .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            .unwrap_or(NaiveDate::MIN);
        let start = day_bounds(monday).start;
        let end = monday
            .checked_add_days(Days::new(7))
            .map(|d| day_bounds(d).start)
            .unwrap_or(chrono::NaiveDateTime::MAX);
        self.room_agenda(room_id, &TimeRange::new(start, end)).await
    }

    /// Bookings `user` owns or participates in, ordered by start.
    pub async fn bookings_of(&self, user: UserId) -> Vec<Booking> {
        let mut found = Vec::new();
        for rs in self.all_schedules() {
            let guard = rs.read().await;
            found.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| {
                        b.owner_id == user
                            || b.event().is_some_and(|e| e.participants.contains(&user))
                    })
                    .cloned(),
            );
        }
        found.sort_by_key(|b| (b.range.start, b.id));
        found
    }

    /// Parts of `opening` not covered by an approved booking in `room_id`.
    pub async fn free_windows(&self, room_id: RoomId, opening: &TimeRange) -> Vec<TimeRange> {
        if !opening.is_ordered() {
            return Vec::new();
        }
        let Some(rs) = self.room_schedule(room_id) else {
            return vec![*opening];
        };
        let guard = rs.read().await;
        let mut busy: Vec<TimeRange> = guard
            .bookings
            .iter()
            .filter(|b| b.is_approved() && b.range.overlaps(opening))
            .map(|b| TimeRange::new(b.range.start.max(opening.start), b.range.end.min(opening.end)))
            .collect();
        drop(guard);
        busy.sort_by_key(|r| r.start);
        subtract_ranges(&[*opening], &merge_overlapping(&busy))
    }

    fn all_schedules(&self) -> Vec<super::SharedRoomSchedule> {
        let mut rooms: Vec<(RoomId, super::SharedRoomSchedule)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_unstable_by_key(|(id, _)| *id);
        rooms.into_iter().map(|(_, rs)| rs).collect()
    }
}
