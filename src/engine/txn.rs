use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::{OwnedRwLockWriteGuard, RwLockReadGuard};
use tracing::debug;

use crate::model::*;

use super::conflict::find_conflict;
use super::{Engine, EngineError};

/// Exclusive access to a fixed set of rooms for one all-or-nothing mutation.
///
/// Rooms are write-locked in ascending id order, so two transactions over
/// overlapping room sets can't deadlock. Mutations apply to the locked
/// schedules immediately; `commit` writes them to the WAL as one record.
/// Dropping an uncommitted `Txn` puts every touched schedule back the way it was.
pub(crate) struct Txn<'a> {
    engine: &'a Engine,
    _gate: RwLockReadGuard<'a, ()>,
    guards: BTreeMap<RoomId, OwnedRwLockWriteGuard<RoomSchedule>>,
    snapshots: HashMap<RoomId, Vec<Booking>>,
    changes: Vec<Change>,
    committed: bool,
}

impl<'a> Txn<'a> {
    pub(crate) async fn begin(engine: &'a Engine, rooms: impl IntoIterator<Item = RoomId>) -> Txn<'a> {
        let gate = engine.commit_gate.read().await;
        let rooms: BTreeSet<RoomId> = rooms.into_iter().collect();
        let mut guards = BTreeMap::new();
        for room_id in rooms {
            let rs = engine.room_schedule_or_create(room_id);
            guards.insert(room_id, rs.write_owned().await);
        }
        Txn {
            engine,
            _gate: gate,
            guards,
            snapshots: HashMap::new(),
            changes: Vec::new(),
            committed: false,
        }
    }

    pub(crate) fn engine(&self) -> &'a Engine {
        self.engine
    }

    pub(crate) fn holds(&self, room_id: RoomId) -> bool {
        self.guards.contains_key(&room_id)
    }

    pub(crate) fn schedule(&self, room_id: RoomId) -> Result<&RoomSchedule, EngineError> {
        self.guards
            .get(&room_id)
            .map(|g| &**g)
            .ok_or_else(|| EngineError::Store(format!("room {room_id} is not locked by this transaction")))
    }

    fn schedule_mut(&mut self, room_id: RoomId) -> Result<&mut RoomSchedule, EngineError> {
        let guard = self
            .guards
            .get_mut(&room_id)
            .ok_or_else(|| EngineError::Store(format!("room {room_id} is not locked by this transaction")))?;
        self.snapshots
            .entry(room_id)
            .or_insert_with(|| guard.bookings.clone());
        Ok(&mut **guard)
    }

    /// A booking from any locked room.
    pub(crate) fn get(&self, id: BookingId) -> Option<&Booking> {
        self.guards.values().find_map(|g| g.get(id))
    }

    /// Every row of a series found in the locked rooms, ordered by start.
    pub(crate) fn series_rows(&self, series_id: BookingId) -> Vec<Booking> {
        let mut rows: Vec<Booking> = self
            .guards
            .values()
            .flat_map(|g| g.bookings.iter().filter(|b| b.series_id == series_id).cloned())
            .collect();
        rows.sort_by_key(|b| (b.range.start, b.id));
        rows
    }

    /// The series row with the greatest start, ties broken by id.
    pub(crate) fn latest_in_series(&self, series_id: BookingId) -> Option<Booking> {
        self.guards
            .values()
            .flat_map(|g| g.bookings.iter().filter(|b| b.series_id == series_id))
            .max_by_key(|b| (b.range.start, b.id))
            .cloned()
    }

    /// `Conflict` if an approved booking other than `exclude` overlaps `range`
    /// on the same date in `room_id`.
    pub(crate) fn check_slot_free(
        &self,
        room_id: RoomId,
        range: &TimeRange,
        exclude: Option<BookingId>,
    ) -> Result<(), EngineError> {
        let rs = self.schedule(room_id)?;
        match find_conflict(rs, range, exclude) {
            Some(existing) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                Err(EngineError::Conflict {
                    room_id,
                    range: *range,
                    existing: existing.id,
                })
            }
            None => Ok(()),
        }
    }

    pub(crate) fn insert(&mut self, booking: Booking) -> Result<(), EngineError> {
        self.schedule_mut(booking.room_id)?.insert(booking.clone());
        self.changes.push(Change::BookingInserted(booking));
        Ok(())
    }

    /// Replace a stored booking. `prev_room` is where it lives now; a different
    /// `booking.room_id` moves it.
    pub(crate) fn update(&mut self, prev_room: RoomId, booking: Booking) -> Result<(), EngineError> {
        if prev_room == booking.room_id {
            self.schedule_mut(prev_room)?.replace(booking.clone());
            self.changes.push(Change::BookingUpdated(booking));
            return Ok(());
        }
        // Check both rooms up front so a failure leaves nothing half-moved.
        if !self.holds(booking.room_id) {
            return Err(EngineError::Store(format!(
                "room {} is not locked by this transaction",
                booking.room_id
            )));
        }
        self.schedule_mut(prev_room)?.remove(booking.id);
        self.schedule_mut(booking.room_id)?.insert(booking.clone());
        self.changes.push(Change::BookingDeleted {
            id: booking.id,
            series_id: booking.series_id,
            room_id: prev_room,
        });
        self.changes.push(Change::BookingInserted(booking));
        Ok(())
    }

    pub(crate) fn delete(&mut self, booking: &Booking) -> Result<(), EngineError> {
        self.schedule_mut(booking.room_id)?.remove(booking.id);
        self.changes.push(Change::BookingDeleted {
            id: booking.id,
            series_id: booking.series_id,
            room_id: booking.room_id,
        });
        Ok(())
    }

    /// Persist every staged change as one WAL record, then publish them to the indexes.
    pub(crate) async fn commit(mut self) -> Result<(), EngineError> {
        if self.changes.is_empty() {
            self.committed = true;
            return Ok(());
        }
        self.engine.wal_append(self.changes.clone()).await?;
        for change in &self.changes {
            self.engine.index_change(change);
        }
        debug!(changes = self.changes.len(), rooms = self.guards.len(), "committed transaction");
        self.committed = true;
        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (room_id, bookings) in self.snapshots.drain() {
            if let Some(guard) = self.guards.get_mut(&room_id) {
                guard.bookings = bookings;
            }
        }
    }
}
