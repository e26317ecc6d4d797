//! Hashmap-backed `Finder`: O(1) `get_index`, O(n) memory, plus a
//! transaction-boundary cache so repeated queries against the same
//! transaction don't re-scan the file (§4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{is_row_visible, scan_initial, transaction_end_from_file, transaction_start_from_file, Finder, TombstoneState};
use crate::codec::RowUnion;
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::key;
use crate::row_emitter::RowEmitter;

pub struct InMemoryFinder {
    file_manager: Arc<FileManager>,
    row_size: u32,
    index: RwLock<HashMap<Uuid, u64>>,
    max_timestamp: AtomicU64,
    next_logical: AtomicU64,
    /// Physical row index -> its transaction's start physical index.
    tx_start_cache: RwLock<HashMap<u64, u64>>,
    /// Transaction start physical index -> its terminal physical index, once known.
    tx_end_cache: RwLock<HashMap<u64, u64>>,
    current_tx_start: Mutex<Option<u64>>,
    tombstone: TombstoneState,
}

impl InMemoryFinder {
    pub fn new(file_manager: Arc<FileManager>, row_size: u32, emitter: Option<&Arc<RowEmitter>>) -> Result<Arc<Self>> {
        let initial_size = file_manager.size();
        let this = Arc::new(Self {
            file_manager,
            row_size,
            index: RwLock::new(HashMap::new()),
            max_timestamp: AtomicU64::new(0),
            next_logical: AtomicU64::new(0),
            tx_start_cache: RwLock::new(HashMap::new()),
            tx_end_cache: RwLock::new(HashMap::new()),
            current_tx_start: Mutex::new(None),
            tombstone: TombstoneState::default(),
        });
        scan_initial(&this.file_manager, this.row_size, initial_size, |idx, row| this.observe(idx, &row))?;
        if let Some(emitter) = emitter {
            let weak = Arc::downgrade(&this);
            emitter.subscribe(move |idx, row| match weak.upgrade() {
                Some(this) => this.on_row_added(idx, row),
                None => Ok(()),
            });
        }
        Ok(this)
    }

    fn observe(&self, physical_index: u64, row: &RowUnion) -> Result<()> {
        match row {
            RowUnion::Checksum(_) => Ok(()),
            RowUnion::Data(d) => {
                let tx_start = if d.first_in_transaction {
                    *self.current_tx_start.lock() = Some(physical_index);
                    physical_index
                } else {
                    self.current_tx_start.lock().ok_or_else(|| {
                        Error::corrupt("continuation row observed with no open transaction tracked")
                    })?
                };
                self.tx_start_cache.write().insert(physical_index, tx_start);
                if d.end_control.is_terminal() {
                    self.tx_end_cache.write().insert(tx_start, physical_index);
                    *self.current_tx_start.lock() = None;
                }
                self.max_timestamp.fetch_max(key::timestamp_ms(&d.key), Ordering::AcqRel);
                let logical = self.next_logical.fetch_add(1, Ordering::AcqRel);
                self.index.write().entry(d.key).or_insert(logical);
                Ok(())
            }
            RowUnion::Null(n) => {
                self.max_timestamp.fetch_max(n.max_timestamp, Ordering::AcqRel);
                self.next_logical.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            RowUnion::Partial(_) => Err(Error::corrupt("partial row delivered to finder")),
        }
    }

    fn tx_start(&self, physical: u64) -> Result<u64> {
        if let Some(&start) = self.tx_start_cache.read().get(&physical) {
            return Ok(start);
        }
        transaction_start_from_file(&self.file_manager, self.row_size, physical)
    }

    fn tx_end(&self, start: u64) -> Result<u64> {
        if let Some(&end) = self.tx_end_cache.read().get(&start) {
            return Ok(end);
        }
        transaction_end_from_file(&self.file_manager, self.row_size, start)
    }
}

impl Finder for InMemoryFinder {
    fn get_index(&self, key: &Uuid) -> Result<u64> {
        self.tombstone.check()?;
        let Some(&logical) = self.index.read().get(key) else {
            return Err(Error::key_not_found());
        };
        let physical = crate::codec::logical_to_physical(logical);
        let start = self.tx_start(physical)?;
        let end = self.tx_end(start)?;
        let outcome = super::transaction_outcome(&self.file_manager, self.row_size, end)?;
        if is_row_visible(&self.file_manager, self.row_size, start, end, physical, outcome)? {
            Ok(physical)
        } else {
            Err(Error::key_not_found())
        }
    }

    fn get_transaction_end(&self, index: u64) -> Result<u64> {
        self.tombstone.check()?;
        let start = self.tx_start(index)?;
        self.tx_end(start)
    }

    fn get_transaction_start(&self, index: u64) -> Result<u64> {
        self.tombstone.check()?;
        self.tx_start(index)
    }

    fn on_row_added(&self, physical_index: u64, row: &RowUnion) -> Result<()> {
        self.tombstone.check()?;
        match self.observe(physical_index, row) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.tombstone.poison(&e);
                Err(e)
            }
        }
    }

    fn max_timestamp(&self) -> u64 {
        self.max_timestamp.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, ChecksumRow, DataRow, EndControl};
    use crate::file_manager::Mode;
    use std::io::Write as _;

    const ROW_SIZE: u32 = 128;

    fn uuid_from_ts(ts_ms: u64) -> Uuid {
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, ts_ms / 1000, ((ts_ms % 1000) * 1_000_000) as u32);
        Uuid::new_v7(ts)
    }

    fn new_db(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("db");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&crate::header::Header::new(ROW_SIZE, 5000).unwrap().to_bytes().unwrap()).unwrap();
        f.write_all(&codec::marshal_checksum_row(ChecksumRow { crc: 0 }, ROW_SIZE as usize).unwrap()).unwrap();
        path
    }

    fn append(path: &std::path::Path, bytes: &[u8]) {
        use std::io::Seek;
        let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        f.seek(std::io::SeekFrom::End(0)).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn finds_committed_multi_row_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let key1 = uuid_from_ts(1000);
        let key2 = uuid_from_ts(2000);
        let row1 = DataRow { first_in_transaction: true, key: key1, value: b"1".to_vec(), end_control: EndControl::Continue };
        let row2 = DataRow { first_in_transaction: false, key: key2, value: b"2".to_vec(), end_control: EndControl::Commit };
        append(&path, &codec::marshal_data_row(&row1, ROW_SIZE as usize).unwrap());
        append(&path, &codec::marshal_data_row(&row2, ROW_SIZE as usize).unwrap());

        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = InMemoryFinder::new(Arc::clone(&fm), ROW_SIZE, None).unwrap();
        assert_eq!(finder.get_index(&key1).unwrap(), 1);
        assert_eq!(finder.get_index(&key2).unwrap(), 2);
        assert_eq!(finder.get_transaction_start(2).unwrap(), 1);
        assert_eq!(finder.get_transaction_end(1).unwrap(), 2);
        assert_eq!(finder.max_timestamp(), 2000);
        fm.close();
    }

    #[test]
    fn savepoint_rollback_hides_rows_after_the_savepoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let key1 = uuid_from_ts(1000);
        let key2 = uuid_from_ts(2000);
        let row1 = DataRow { first_in_transaction: true, key: key1, value: b"1".to_vec(), end_control: EndControl::SavepointContinue };
        let row2 = DataRow { first_in_transaction: false, key: key2, value: b"2".to_vec(), end_control: EndControl::Rollback(1) };
        append(&path, &codec::marshal_data_row(&row1, ROW_SIZE as usize).unwrap());
        append(&path, &codec::marshal_data_row(&row2, ROW_SIZE as usize).unwrap());

        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = InMemoryFinder::new(Arc::clone(&fm), ROW_SIZE, None).unwrap();
        assert_eq!(finder.get_index(&key1).unwrap(), 1);
        assert_eq!(finder.get_index(&key2).unwrap_err().kind, crate::error::ErrorKind::KeyNotFound);
        fm.close();
    }

    #[test]
    fn unterminated_transaction_reports_transaction_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let row1 = DataRow { first_in_transaction: true, key: uuid_from_ts(1000), value: b"1".to_vec(), end_control: EndControl::Continue };
        append(&path, &codec::marshal_data_row(&row1, ROW_SIZE as usize).unwrap());

        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = InMemoryFinder::new(Arc::clone(&fm), ROW_SIZE, None).unwrap();
        assert_eq!(finder.get_transaction_end(1).unwrap_err().kind, crate::error::ErrorKind::TransactionActive);
        fm.close();
    }
}
