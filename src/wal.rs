use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// One committed transaction: every change in it lands or none does.
pub type TxnRecord = Vec<Change>;

/// Encode a single transaction to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &[Change]) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "transaction too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log of committed transactions.
///
/// Format per entry: `[u32: len][bincode: Vec<Change>][u32: crc32]`
/// `len` counts payload bytes only; the checksum covers the payload. A torn
/// last entry (crash mid-write) is discarded whole, so a series edit is never
/// replayed half-applied.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append without flushing. Call `flush_sync()` after the batch.
    pub fn append_buffered(&mut self, record: &[Change]) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Push buffered records to disk and fsync.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file and fsync. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, snapshot: &[Change]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        if !snapshot.is_empty() {
            encode_record(&mut writer, snapshot)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the compacted file over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact transaction on disk, oldest first. Reading stops at the
    /// first short, corrupt or undecodable record.
    pub fn replay(path: &Path) -> io::Result<Vec<TxnRecord>> {
        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        while let Some(record) = read_record(&mut reader)? {
            records.push(record);
        }
        Ok(records)
    }
}

/// `Ok(false)` when the reader ran dry before `buf` was full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Option<TxnRecord>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<TxnRecord>(&payload).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::model::{Booking, BookingKind, BookingStatus, TimeRange};
    use crate::recurrence::Recurrence;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn booking(id: i64) -> Booking {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        Booking {
            id,
            series_id: id,
            room_id: 7,
            owner_id: Ulid::nil(),
            range: TimeRange::new(
                day.and_hms_opt(10, 0, 0).unwrap(),
                day.and_hms_opt(11, 0, 0).unwrap(),
            ),
            recurrence: Recurrence::Weekly,
            status: BookingStatus::Approved,
            cancel_reason: String::new(),
            needed_resources: BTreeSet::from([3]),
            moderator_note: String::new(),
            kind: BookingKind::Coworking,
        }
    }

    #[test]
    fn batched_appends_replay_in_order() {
        let path = tmp_path("append_and_replay.wal");
        let txns = vec![
            vec![Change::BookingInserted(booking(1))],
            vec![
                Change::BookingDeleted { id: 1, series_id: 1, room_id: 7 },
                Change::BookingInserted(booking(2)),
            ],
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for t in &txns {
                wal.append_buffered(t).unwrap();
            }
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap(), txns);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_torn_transaction() {
        let path = tmp_path("torn.wal");
        let first = vec![Change::BookingInserted(booking(1))];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&first).unwrap();
            wal.flush_sync().unwrap();
        }
        // A second multi-change record cut off mid-payload.
        {
            let second = vec![
                Change::BookingInserted(booking(2)),
                Change::BookingInserted(booking(3)),
            ];
            let payload = bincode::serialize(&second).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload[..payload.len() / 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&vec![Change::BookingDeleted { id: 1, series_id: 1, room_id: 1 }]).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_replaces_history_with_snapshot() {
        let path = tmp_path("compact.wal");
        // A series of three, then a whole-series edit that drops the last two.
        let series: Vec<Change> = (1..=3).map(|i| Change::BookingInserted(booking(i))).collect();
        let truncate = vec![
            Change::BookingDeleted { id: 2, series_id: 2, room_id: 7 },
            Change::BookingDeleted { id: 3, series_id: 3, room_id: 7 },
        ];
        let snapshot = vec![Change::BookingInserted(booking(1))];
        let after = vec![Change::BookingInserted(booking(4))];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&series).unwrap();
            wal.append_buffered(&truncate).unwrap();
            wal.flush_sync().unwrap();

            // The log is untouched until the snapshot is swapped in.
            Wal::write_compact_file(wal.path(), &snapshot).unwrap();
            assert_eq!(Wal::replay(&path).unwrap(), vec![series, truncate]);

            wal.swap_compact_file().unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(!path.with_extension("wal.tmp").exists());
            wal.append_buffered(&after).unwrap();
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, after]);

        // Compacting an empty engine leaves an empty log.
        {
            let mut wal = Wal::open(&path).unwrap();
            Wal::write_compact_file(&path, &[]).unwrap();
            wal.swap_compact_file().unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }
}
