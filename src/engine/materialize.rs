use chrono::NaiveDateTime;
use tracing::debug;

use crate::limits::MAX_OCCURRENCES_PER_RUN;
use crate::model::*;

use super::txn::Txn;
use super::{Engine, EngineError, ValidationError};

/// Extend `anchor`'s series with occurrences up to `horizon` inside `txn`.
///
/// The run resumes after the latest stored row of the series when that row is
/// at or past the anchor, and copies its content into every new occurrence.
/// Otherwise it starts from the anchor itself, including the anchor's own slot
/// when `skip_first_increment` is set. Occurrences are stepped from the starting
/// row by whole periods, not chained, so month-end clamping can't drift within
/// a run. An occurrence is kept while its start date is on or before the
/// horizon's date. The first occupied slot aborts with `Conflict`.
pub(super) fn materialize_in(
    txn: &mut Txn<'_>,
    anchor: &Booking,
    horizon: NaiveDateTime,
    skip_first_increment: bool,
) -> Result<usize, EngineError> {
    if !anchor.recurrence.is_recurring() {
        return Ok(0);
    }

    let (template, first_step) = match txn.latest_in_series(anchor.series_id) {
        Some(latest) if latest.range.start >= anchor.range.start => (latest, 1),
        _ => (anchor.clone(), if skip_first_increment { 0 } else { 1 }),
    };
    extend_series(txn, &template, first_step, horizon)
}

/// Insert occurrences `first_step, first_step + 1, ...` of `template` until the
/// horizon date is passed. Each one copies `template` apart from its id and range.
pub(super) fn extend_series(
    txn: &mut Txn<'_>,
    template: &Booking,
    first_step: u32,
    horizon: NaiveDateTime,
) -> Result<usize, EngineError> {
    let recurrence = template.recurrence;
    if !recurrence.is_recurring() {
        return Ok(0);
    }

    let mut created = 0usize;
    let mut step = first_step;
    loop {
        let Some(range) = recurrence.nth_occurrence(&template.range, step) else {
            break;
        };
        if range.start.date() > horizon.date() {
            break;
        }
        if created >= MAX_OCCURRENCES_PER_RUN {
            return Err(ValidationError::TooManyOccurrences(template.series_id).into());
        }

        txn.check_slot_free(template.room_id, &range, None)?;

        let occurrence = Booking {
            id: txn.engine().allocate_id(),
            range,
            ..template.clone()
        };
        debug!(
            series = occurrence.series_id,
            id = occurrence.id,
            start = %occurrence.range.start,
            "materialized occurrence"
        );
        txn.insert(occurrence)?;
        created += 1;
        step += 1;
    }
    Ok(created)
}

impl Engine {
    /// Top up one series to `horizon` in its own transaction. Returns the
    /// number of occurrences inserted; running it again with the same inputs
    /// inserts none.
    pub async fn materialize_until(
        &self,
        anchor: &Booking,
        horizon: NaiveDateTime,
        skip_first_increment: bool,
    ) -> Result<usize, EngineError> {
        if !anchor.recurrence.is_recurring() {
            return Ok(0);
        }
        let mut txn = self.lock_series(anchor.series_id, [anchor.room_id]).await;
        let created = materialize_in(&mut txn, anchor, horizon, skip_first_increment)?;
        txn.commit().await?;
        if created > 0 {
            metrics::counter!(crate::observability::OCCURRENCES_MATERIALIZED_TOTAL)
                .increment(created as u64);
        }
        Ok(created)
    }

    /// Begin a transaction over every room holding a row of `series_id`, plus
    /// `extra`. The series index is read before locking, so the room set is
    /// re-checked under the locks and widened until it is stable.
    pub(super) async fn lock_series(
        &self,
        series_id: BookingId,
        extra: impl IntoIterator<Item = RoomId>,
    ) -> Txn<'_> {
        let extra: Vec<RoomId> = extra.into_iter().collect();
        let mut rooms = self.series_rooms(series_id);
        rooms.extend(extra.iter().copied());
        loop {
            let txn = Txn::begin(self, rooms.iter().copied()).await;
            let now_rooms = self.series_rooms(series_id);
            if now_rooms.iter().all(|r| txn.holds(*r)) {
                return txn;
            }
            drop(txn);
            rooms.extend(now_rooms);
        }
    }
}
