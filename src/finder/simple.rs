//! Linear-scan `Finder`: no precomputed index, fixed memory, O(n) per query
//! (§4.6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::{resolve_visibility, scan_initial, Finder, TombstoneState};
use crate::codec::{self, RowUnion};
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::key;
use crate::row_emitter::RowEmitter;

pub struct SimpleFinder {
    file_manager: Arc<FileManager>,
    row_size: u32,
    max_timestamp: AtomicU64,
    tombstone: TombstoneState,
}

impl SimpleFinder {
    /// Build and run the two-phase initialization. Pass `emitter` to also
    /// subscribe for ongoing updates (read mode); write mode feeds this
    /// finder directly from the active transaction and passes `None`.
    pub fn new(file_manager: Arc<FileManager>, row_size: u32, emitter: Option<&Arc<RowEmitter>>) -> Result<Arc<Self>> {
        let initial_size = file_manager.size();
        let this = Arc::new(Self {
            file_manager,
            row_size,
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
                Ok(())
            }
            RowUnion::Null(n) => {
                self.max_timestamp.fetch_max(n.max_timestamp, Ordering::AcqRel);
                Ok(())
            }
            RowUnion::Checksum(_) => Ok(()),
            RowUnion::Partial(_) => Err(Error::corrupt("partial row delivered to finder")),
        }
    }
}

impl Finder for SimpleFinder {
    fn get_index(&self, key: &Uuid) -> Result<u64> {
        self.tombstone.check()?;
        let size = self.file_manager.size();
        let mut physical = 0u64;
        while codec::slot_offset(physical, self.row_size as u64) + self.row_size as u64 <= size {
            if !codec::is_checksum_slot(physical) {
                let bytes = self.file_manager.read(codec::slot_offset(physical, self.row_size as u64), self.row_size as u64)?;
                let row = codec::unmarshal_row(&bytes, self.row_size as usize)?;
                if let RowUnion::Data(d) = &row {
                    if &d.key == key && resolve_visibility(&self.file_manager, self.row_size, physical)? {
                        return Ok(physical);
                    }
                }
            }
            physical += 1;
        }
        Err(Error::key_not_found())
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
    fn finds_committed_row_and_reports_max_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let key = uuid_from_ts(1000);
        let row = DataRow { first_in_transaction: true, key, value: b"v".to_vec(), end_control: EndControl::Commit };
        append(&path, &codec::marshal_data_row(&row, ROW_SIZE as usize).unwrap());

        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = SimpleFinder::new(Arc::clone(&fm), ROW_SIZE, None).unwrap();
        assert_eq!(finder.get_index(&key).unwrap(), 1);
        assert_eq!(finder.max_timestamp(), 1000);
        fm.close();
    }

    #[test]
    fn rolled_back_row_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let key = uuid_from_ts(1000);
        let row = DataRow { first_in_transaction: true, key, value: b"v".to_vec(), end_control: EndControl::Rollback(0) };
        append(&path, &codec::marshal_data_row(&row, ROW_SIZE as usize).unwrap());

        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = SimpleFinder::new(Arc::clone(&fm), ROW_SIZE, None).unwrap();
        assert_eq!(finder.get_index(&key).unwrap_err().kind, crate::error::ErrorKind::KeyNotFound);
        fm.close();
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = SimpleFinder::new(Arc::clone(&fm), ROW_SIZE, None).unwrap();
        assert_eq!(finder.get_index(&uuid_from_ts(1)).unwrap_err().kind, crate::error::ErrorKind::KeyNotFound);
        fm.close();
    }

    #[test]
    fn tombstone_poisons_every_subsequent_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_db(&dir);
        let fm = FileManager::open(&path, Mode::Read).unwrap();
        let finder = SimpleFinder::new(Arc::clone(&fm), ROW_SIZE, None).unwrap();
        let partial = RowUnion::Partial(crate::codec::PartialDataRow { bytes: vec![1] });
        assert!(finder.on_row_added(99, &partial).is_err());
        assert_eq!(finder.get_index(&uuid_from_ts(1)).unwrap_err().kind, crate::error::ErrorKind::Tombstoned);
        assert_eq!(finder.max_timestamp(), 0);
        fm.close();
    }
}
