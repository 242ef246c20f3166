mod availability;
mod conflict;
mod error;
mod materialize;
mod mutations;
mod queries;
mod series;
mod txn;

pub use availability::{merge_overlapping, subtract_ranges};
pub use conflict::{booking_window, find_conflict, validate_range, validate_window};
pub use error::{EngineError, Entity, ValidationError};

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditSink};
use crate::catalog::ResourceCatalog;
use crate::clock::Clock;
use crate::config::BookingRules;
use crate::model::*;
use crate::wal::{TxnRecord, Wal};

use txn::Txn;

pub type SharedRoomSchedule = Arc<RwLock<RoomSchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: TxnRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (TxnRecord, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches commits.
/// Blocks for the first Append, drains whatever else is queued, then does one
/// fsync for the whole batch and answers every sender with the same result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so the failed batch's bytes don't
    // leak into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            // Only reachable if a caller routes an append here directly.
            let result = wal.append_buffered(&record).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// Collaborators the engine calls out to.
#[derive(Clone)]
pub struct Services {
    pub clock: Arc<dyn Clock>,
    pub catalog: Arc<dyn ResourceCatalog>,
    pub audit: Arc<dyn AuditSink>,
    pub rules: BookingRules,
}

pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedRoomSchedule>,
    /// Reverse lookup: booking id → room holding it.
    pub(super) booking_room: DashMap<BookingId, RoomId>,
    /// Series id → ids of every row in the series.
    pub(super) series: DashMap<BookingId, BTreeSet<BookingId>>,
    next_id: AtomicI64,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every live `Txn` holds this shared; compaction takes it exclusively.
    pub(super) commit_gate: RwLock<()>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) catalog: Arc<dyn ResourceCatalog>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) rules: BookingRules,
}

/// Apply a change to its room's schedule (no locking; caller holds the lock).
fn apply_to_schedule(rs: &mut RoomSchedule, change: &Change) {
    match change {
        Change::BookingInserted(b) => rs.insert(b.clone()),
        Change::BookingUpdated(b) => {
            rs.replace(b.clone());
        }
        Change::BookingDeleted { id, .. } => {
            rs.remove(*id);
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, services: Services) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            booking_room: DashMap::new(),
            series: DashMap::new(),
            next_id: AtomicI64::new(1),
            wal_tx,
            commit_gate: RwLock::new(()),
            clock: services.clock,
            catalog: services.catalog,
            audit: services.audit,
            rules: services.rules,
        };

        // Replay runs before anyone else can see the engine, so building the
        // schedules in plain maps first avoids touching the async locks at all.
        let mut schedules: HashMap<RoomId, RoomSchedule> = HashMap::new();
        let mut max_id = 0;
        for change in records.iter().flatten() {
            let room_id = change.room_id();
            let rs = schedules
                .entry(room_id)
                .or_insert_with(|| RoomSchedule::new(room_id));
            apply_to_schedule(rs, change);
            engine.index_change(change);
            if let Change::BookingInserted(b) | Change::BookingUpdated(b) = change {
                max_id = max_id.max(b.id);
            }
        }
        for (room_id, rs) in schedules {
            engine.rooms.insert(room_id, Arc::new(RwLock::new(rs)));
        }
        engine.next_id.store(max_id + 1, Ordering::SeqCst);

        info!(
            transactions = records.len(),
            bookings = engine.booking_room.len(),
            path = %wal_path.display(),
            "replayed booking log"
        );
        Ok(engine)
    }

    pub fn rules(&self) -> &BookingRules {
        &self.rules
    }

    pub fn now(&self) -> chrono::NaiveDateTime {
        self.clock.now()
    }

    /// Last instant recurring series are materialized up to, seen from `now`.
    pub fn horizon_end(&self, now: chrono::NaiveDateTime) -> Result<chrono::NaiveDateTime, EngineError> {
        self.rules
            .horizon_from(now)
            .ok_or(EngineError::Validation(ValidationError::OutOfCalendar("horizon_days")))
    }

    pub(super) fn allocate_id(&self) -> BookingId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Keep `booking_room` and `series` in step with a committed change.
    pub(super) fn index_change(&self, change: &Change) {
        match change {
            Change::BookingInserted(b) | Change::BookingUpdated(b) => {
                self.booking_room.insert(b.id, b.room_id);
                self.series.entry(b.series_id).or_default().insert(b.id);
            }
            Change::BookingDeleted { id, series_id, .. } => {
                self.booking_room.remove(id);
                let emptied = match self.series.get_mut(series_id) {
                    Some(mut ids) => {
                        ids.remove(id);
                        ids.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.series.remove_if(series_id, |_, ids| ids.is_empty());
                }
            }
        }
    }

    pub(super) fn room_schedule(&self, room_id: RoomId) -> Option<SharedRoomSchedule> {
        self.rooms.get(&room_id).map(|e| e.value().clone())
    }

    pub(super) fn room_schedule_or_create(&self, room_id: RoomId) -> SharedRoomSchedule {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomSchedule::new(room_id))))
            .value()
            .clone()
    }

    pub(super) fn room_of(&self, id: BookingId) -> Option<RoomId> {
        self.booking_room.get(&id).map(|e| *e.value())
    }

    pub(super) fn series_rooms(&self, series_id: BookingId) -> BTreeSet<RoomId> {
        let ids: Vec<BookingId> = self
            .series
            .get(&series_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.room_of(id)).collect()
    }

    /// Write one transaction to the WAL via the group-commit writer.
    pub(super) async fn wal_append(&self, record: TxnRecord) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    /// Hand an entry to the audit sink. Sink failures never fail the mutation.
    pub(super) async fn emit_audit(&self, entry: AuditEntry) {
        let table = entry.object_table.clone();
        let object = entry.object_id.clone();
        if let Err(e) = self.audit.record(entry).await {
            warn!(table = %table, object = %object, "audit sink rejected entry: {e}");
        }
    }

    /// Rewrite the WAL as a single transaction holding the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No transaction can be open while this is held, so the snapshot is
        // exactly what has been committed.
        let _gate = self.commit_gate.write().await;

        let mut room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort_unstable();
        let mut snapshot = Vec::new();
        for room_id in room_ids {
            let Some(rs) = self.room_schedule(room_id) else {
                continue;
            };
            let guard = rs.read().await;
            snapshot.extend(guard.bookings.iter().cloned().map(Change::BookingInserted));
        }

        let count = snapshot.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                snapshot,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Store(e.to_string()))?;
        info!(bookings = count, "compacted booking log");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
