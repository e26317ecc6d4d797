//! `FuzzyBinarySearch`-backed `Finder`: no hashmap, O(log n + k) `get_index`,
//! O(1) memory (§4.6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::{resolve_visibility, scan_initial, Finder, TombstoneState};
use crate::codec::{self, RowUnion};
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::fuzzy_search::{self, GetOutcome};
use crate::key;
use crate::row_emitter::RowEmitter;

pub struct BinaryFinder {
    file_manager: Arc<FileManager>,
    row_size: u32,
    skew_ms: u64,
    num_keys: AtomicU64,
    max_timestamp: AtomicU64,
    tombstone: TombstoneState,
}

impl BinaryFinder {
    pub fn new(
        file_manager: Arc<FileManager>,
        row_size: u32,
        skew_ms: u64,
        emitter: Option<&Arc<RowEmitter>>,
    ) -> Result<Arc<Self>> {
        let initial_size = file_manager.size();
        let this = Arc::new(Self {
            file_manager,
            row_size,
            skew_ms,
            num_keys: AtomicU64::new(0),
            max_timestamp: AtomicU64::new(0),
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

    fn observe(&self, _physical_index: u64, row: &RowUnion) -> Result<()> {
        match row {
            RowUnion::Data(d) => {
                self.max_timestamp.fetch_max(key::timestamp_ms(&d.key), Ordering::AcqRel);
                self.num_keys.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            RowUnion::Null(n) => {
                self.max_timestamp.fetch_max(n.max_timestamp, Ordering::AcqRel);
                self.num_keys.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            RowUnion::Checksum(_) => Ok(()),
            RowUnion::Partial(_) => Err(Error::corrupt("partial row delivered to finder")),
        }
    }

    fn get_key_at(&self, logical: u64) -> Result<GetOutcome> {
        let physical = codec::logical_to_physical(logical);
        let offset = codec::slot_offset(physical, self.row_size as u64);
        if offset + self.row_size as u64 > self.file_manager.size() {
            return Ok(GetOutcome::OutOfRange);
        }
        let bytes = self.file_manager.read(offset, self.row_size as u64)?;
        match codec::unmarshal_row(&bytes, self.row_size as usize)? {
            RowUnion::Data(d) => Ok(GetOutcome::Found(d.key)),
            RowUnion::Null(n) => Ok(GetOutcome::Found(key::null_sentinel_key(n.max_timestamp))),
            _ => Ok(GetOutcome::OutOfRange),
        }
    }
}

impl Finder for BinaryFinder {
    fn get_index(&self, key: &Uuid) -> Result<u64> {
        self.tombstone.check()?;
        let num_keys = self.num_keys.load(Ordering::Acquire);
        let logical = fuzzy_search::search(key, self.skew_ms, num_keys, &mut |idx| self.get_key_at(idx))?;
        let physical = codec::logical_to_physical(logical);
        if resolve_visibility(&self.file_manager, self.row_size, physical)? {
            Ok(physical)
        } else {
            Err(Error::key_not_found())
        }
    }

    fn get_transaction_end(&self, index: u64) -> Result<u64> {
        self.tombstone.check()?;
        super::transaction_end_from_file(&self.file_manager, self.row_size, index)
    }

    fn get_transaction_start(&self, index: u64) -> Result<u64> {
        self.tombstone.check()?;
        super::transaction_start_from_file(&self.file_manager, self.row_size, index)
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
    use crate::codec::{ChecksumRow, DataRow, EndControl};
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
    fn finds_keys_via_binary_search_across_many_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let mut keys = Vec::new();
        for i in 0..200u64 {
            let key = uuid_from_ts(1000 + i * 10);
            keys.push(key);
            let row = DataRow { first_in_transaction: true, key, value: b"v".to_vec(), end_control: EndControl::Commit };
            append(&path, &codec::marshal_data_row(&row, ROW_SIZE as usize).unwrap());
        }

        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = BinaryFinder::new(Arc::clone(&fm), ROW_SIZE, 5000, None).unwrap();
        for i in [0usize, 50, 150, 199] {
            assert_eq!(finder.get_index(&keys[i]).unwrap(), codec::logical_to_physical(i as u64));
        }
        assert_eq!(finder.max_timestamp(), 1000 + 199 * 10);
        fm.close();
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let row = DataRow { first_in_transaction: true, key: uuid_from_ts(1000), value: b"v".to_vec(), end_control: EndControl::Commit };
        append(&path, &codec::marshal_data_row(&row, ROW_SIZE as usize).unwrap());

        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = BinaryFinder::new(Arc::clone(&fm), ROW_SIZE, 5000, None).unwrap();
        assert_eq!(finder.get_index(&uuid_from_ts(9999)).unwrap_err().kind, crate::error::ErrorKind::KeyNotFound);
        fm.close();
    }
}
