use chrono::NaiveDateTime;
use tracing::info;

use crate::model::*;

use super::conflict::{booking_window, validate_range, validate_window};
use super::materialize::extend_series;
use super::mutations::{authorize_edit, validate_fields};
use super::txn::Txn;
use super::{Engine, EngineError, Entity, ValidationError};

/// Insert `booking` and, for an approved recurring booking, its occurrences up
/// to `horizon`. Creation and whole-series rescheduling both go through here,
/// so they can't disagree on what a valid slot is.
///
/// Returns how many extra occurrences were materialized.
pub(super) fn schedule_series(
    txn: &mut Txn<'_>,
    booking: Booking,
    horizon: NaiveDateTime,
) -> Result<usize, EngineError> {
    validate_range(&booking.range)?;
    validate_fields(&booking)?;
    txn.check_slot_free(booking.room_id, &booking.range, None)?;
    txn.insert(booking.clone())?;
    if booking.is_active_series() {
        extend_series(txn, &booking, 1, horizon)
    } else {
        Ok(0)
    }
}

impl Engine {
    /// Apply `patch` to one booking, or to its whole series.
    ///
    /// A whole-series patch that moves, retimes, re-recurs or approves the
    /// series deletes every row from the earliest upcoming one onward and
    /// schedules the patched series again from there. Any other whole-series
    /// patch is copied onto every upcoming row. Rows that already started are
    /// left alone either way.
    pub async fn edit_booking(
        &self,
        actor: &Actor,
        id: BookingId,
        patch: BookingPatch,
        whole_series: bool,
    ) -> Result<Booking, EngineError> {
        let current = self.get_booking(id).await?;
        if let Some(room_id) = patch.room_id
            && room_id != current.room_id
            && !self.catalog.room_exists(room_id).await
        {
            return Err(EngineError::NotFound(Entity::Room(room_id)));
        }
        if let Some(resources) = &patch.needed_resources {
            self.check_resources(resources).await?;
        }

        if !whole_series {
            self.edit_single(actor, id, patch).await
        } else if patch.touches_schedule(&current) {
            self.reschedule_series(actor, id, current.series_id, patch).await
        } else {
            self.update_series_fields(actor, id, current.series_id, patch).await
        }
    }

    async fn edit_single(
        &self,
        actor: &Actor,
        id: BookingId,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let (mut txn, current) = self.lock_booking(id, patch.room_id).await?;
        authorize_edit(actor, &current, &patch)?;

        let next = patch.applied_to(&current);
        validate_range(&next.range)?;
        if next.range != current.range {
            validate_window(&next.range, self.clock.now(), &self.rules)?;
        }
        validate_fields(&next)?;
        if next.is_approved() && patch.touches_schedule(&current) {
            txn.check_slot_free(next.room_id, &next.range, Some(id))?;
        }

        txn.update(current.room_id, next.clone())?;
        txn.commit().await?;
        self.audit_update(actor, &current, &next).await;
        Ok(next)
    }

    async fn reschedule_series(
        &self,
        actor: &Actor,
        id: BookingId,
        series_id: BookingId,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let mut txn = self.lock_series(series_id, patch.room_id).await;
        let edited = txn
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking(id)))?;
        authorize_edit(actor, &edited, &patch)?;

        let rows = txn.series_rows(series_id);
        let pivot = rows
            .iter()
            .find(|b| b.range.start >= now)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Series(series_id)))?;

        // The pivot moves by the same amount the edited occurrence was asked to.
        let mut series_patch = patch.clone();
        if let Some(range) = patch.range {
            let moved = pivot
                .range
                .shifted(range.start - edited.range.start, range.end - edited.range.end);
            let Some(moved) = moved else {
                let (earliest, latest) = booking_window(now, &self.rules)?;
                return Err(ValidationError::OutsideBookingWindow {
                    start: range.start,
                    earliest,
                    latest,
                }
                .into());
            };
            series_patch.range = Some(moved);
        }
        let next = series_patch.applied_to(&pivot);
        validate_range(&next.range)?;
        if next.range != pivot.range {
            validate_window(&next.range, now, &self.rules)?;
        }

        let mut removed = 0usize;
        for row in rows.iter().filter(|b| b.range.start >= pivot.range.start) {
            txn.delete(row)?;
            removed += 1;
        }
        let created = schedule_series(&mut txn, next.clone(), self.horizon_end(now)?)?;
        txn.commit().await?;

        info!(
            series = series_id,
            pivot = pivot.id,
            removed,
            recreated = created + 1,
            room = next.room_id,
            "rescheduled series"
        );
        if created > 0 {
            metrics::counter!(crate::observability::OCCURRENCES_MATERIALIZED_TOTAL)
                .increment(created as u64);
        }
        self.audit_update(actor, &pivot, &next).await;
        Ok(next)
    }

    async fn update_series_fields(
        &self,
        actor: &Actor,
        id: BookingId,
        series_id: BookingId,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let mut txn = self.lock_series(series_id, None::<RoomId>).await;
        let edited = txn
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking(id)))?;
        authorize_edit(actor, &edited, &patch)?;

        // Scheduling fields are no-ops on this path; keep them from touching
        // rows that may sit in other rooms or slots.
        let fields = BookingPatch {
            room_id: None,
            range: None,
            recurrence: None,
            ..patch
        };
        let upcoming: Vec<Booking> = txn
            .series_rows(series_id)
            .into_iter()
            .filter(|b| b.range.start >= now)
            .collect();
        if upcoming.is_empty() {
            return Err(EngineError::NotFound(Entity::Series(series_id)));
        }

        let mut updated = Vec::new();
        for row in upcoming {
            let mut next = row.clone();
            fields.apply_fields(&mut next);
            if next == row {
                continue;
            }
            validate_fields(&next)?;
            if next.is_approved() && !row.is_approved() {
                txn.check_slot_free(row.room_id, &row.range, Some(row.id))?;
            }
            txn.update(row.room_id, next.clone())?;
            updated.push((row, next));
        }
        txn.commit().await?;

        for (before, after) in &updated {
            self.audit_update(actor, before, after).await;
        }
        Ok(updated
            .into_iter()
            .find(|(before, _)| before.id == id)
            .map(|(_, after)| after)
            .unwrap_or(edited))
    }
}
