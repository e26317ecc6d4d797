//! The `Db` facade (§4.8): owns `FileManager`, `RowEmitter`, `Finder`, and
//! the at-most-one active `Transaction`; enforces mode and single-writer
//! semantics.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::codec::{self, ChecksumRow, RowUnion};
use crate::error::{Error, ErrorKind, Result};
use crate::file_manager::FileManager;
use crate::finder::{BinaryFinder, Finder, InMemoryFinder, SimpleFinder};
use crate::header::Header;
use crate::row_emitter::RowEmitter;
use crate::transaction::{Transaction, TransactionShared};

/// Whether a database is opened for reading only, or for reading and writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Which `Finder` implementation to build on open (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderStrategy {
    Simple,
    InMemory,
    Binary,
}

/// An open frozenDB database.
pub struct Db {
    file_manager: Arc<FileManager>,
    row_size: u32,
    skew_ms: u64,
    // Kept alive for the database's lifetime: `FileManager` and every
    // `Finder` hold only a `Weak` reference to it and rely on this strong
    // one to keep it subscribed and forwarding rows.
    emitter: Arc<RowEmitter>,
    finder: Arc<dyn Finder>,
    shared: Arc<TransactionShared>,
    writer: Option<std::sync::mpsc::Sender<crate::file_manager::WriteRequest>>,
    tx_active: Arc<AtomicBool>,
    resumed_tx: parking_lot::Mutex<Option<Transaction>>,
}

impl Db {
    /// Create a new, empty database file: writes the header and the initial
    /// `ChecksumRow`. Fails if `path` already exists.
    #[instrument(skip(path))]
    pub fn create(path: impl AsRef<Path>, row_size: u32, skew_ms: u64) -> Result<()> {
        let path = path.as_ref();
        let header = Header::new(row_size, skew_ms)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::with_cause(ErrorKind::PathError, "failed to create database file", e))?;
        use std::io::Write as _;
        file.write_all(&header.to_bytes()?)?;
        let initial_checksum = codec::marshal_checksum_row(ChecksumRow { crc: crc32fast::hash(&[]) }, row_size as usize)?;
        file.write_all(&initial_checksum)?;
        file.sync_all()?;
        info!(path = %path.display(), row_size, skew_ms, "created database");
        Ok(())
    }

    /// Open an existing database. Fails if `path` does not exist, the header
    /// is invalid, or (write mode) another writer already holds the lock.
    #[instrument(skip(path))]
    pub fn open(path: impl AsRef<Path>, mode: Mode, strategy: FinderStrategy) -> Result<Self> {
        let path = path.as_ref();
        let fm_mode = match mode {
            Mode::ReadOnly => crate::file_manager::Mode::Read,
            Mode::ReadWrite => crate::file_manager::Mode::Write,
        };
        let file_manager = FileManager::open(path, fm_mode)?;

        let header_bytes = file_manager.read(0, crate::config::HEADER_SIZE)?;
        let header = Header::from_bytes(&header_bytes)?;

        let recovery = crate::recovery::recover(&file_manager, header.row_size)?;

        let emitter = RowEmitter::new(Arc::clone(&file_manager), header.row_size);
        let finder = build_finder(strategy, Arc::clone(&file_manager), header.row_size, header.skew_ms, &emitter)?;

        let physical_rows = (file_manager.size() - crate::config::HEADER_SIZE) / header.row_size as u64;
        let shared = Arc::new(TransactionShared {
            max_timestamp_ms: AtomicU64::new(finder.max_timestamp()),
            completed_rows: AtomicU64::new(codec::logical_count(physical_rows)),
        });

        let (writer, tx_active, resumed_tx) = match mode {
            Mode::ReadWrite => {
                let writer = file_manager.bind_writer()?;
                let tx_active = Arc::new(AtomicBool::new(false));
                let resumed = match recovery.active_transaction {
                    Some(recovered) => {
                        warn!(?recovered, "reopened with an in-flight transaction, resuming it");
                        tx_active.store(true, Ordering::Release);
                        Some(Transaction::resume(
                            writer.clone(),
                            Arc::clone(&file_manager),
                            header.row_size,
                            header.skew_ms,
                            Arc::clone(&shared),
                            recovered,
                            Arc::clone(&tx_active),
                        )?)
                    }
                    None => None,
                };
                (Some(writer), tx_active, resumed)
            }
            Mode::ReadOnly => {
                if recovery.active_transaction.is_some() {
                    warn!("opened for reading while the file's tail shows an in-flight transaction; its rows are not yet visible");
                }
                (None, Arc::new(AtomicBool::new(false)), None)
            }
        };

        info!(path = %path.display(), row_size = header.row_size, ?mode, "opened database");
        Ok(Self {
            file_manager,
            row_size: header.row_size,
            skew_ms: header.skew_ms,
            emitter,
            finder,
            shared,
            writer,
            tx_active,
            resumed_tx: parking_lot::Mutex::new(resumed_tx),
        })
    }

    /// Begin a new transaction. Fails `TransactionActive` if one is already
    /// open (including an auto-resumed one from crash recovery — call
    /// [`Db::get_active_tx`] first to pick that up and close it).
    pub fn begin_tx(&self) -> Result<Transaction> {
        let writer = self.writer.clone().ok_or_else(|| Error::new(ErrorKind::InvalidAction, "database is read-only"))?;
        if self.tx_active.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::TransactionActive, "a transaction is already open"));
        }
        Transaction::begin(writer, Arc::clone(&self.file_manager), self.row_size, self.skew_ms, Arc::clone(&self.shared), Arc::clone(&self.tx_active))
    }

    /// Take the transaction [`Db::open`] auto-resumed from crash recovery, if
    /// any. Returns `None` after the first call, or if nothing was pending.
    pub fn get_active_tx(&self) -> Option<Transaction> {
        self.resumed_tx.lock().take()
    }

    /// Look up the JSON value stored under `key`. `KeyNotFound` if absent or
    /// its transaction was rolled back.
    pub fn get(&self, key: &Uuid) -> Result<serde_json::Value> {
        let physical = self.finder.get_index(key)?;
        let offset = codec::slot_offset(physical, self.row_size as u64);
        let bytes = self.file_manager.read(offset, self.row_size as u64)?;
        match codec::unmarshal_row(&bytes, self.row_size as usize)? {
            RowUnion::Data(row) => serde_json::from_slice(&row.value)
                .map_err(|e| Error::with_cause(ErrorKind::CorruptDatabase, "stored value is not valid JSON", e)),
            other => Err(Error::corrupt(format!("finder pointed at a non-data row: {other:?}"))),
        }
    }

    pub fn max_timestamp(&self) -> u64 {
        self.finder.max_timestamp()
    }

    /// Idempotent: waits for in-flight writes, unsubscribes the finder,
    /// closes the file, releases the lock.
    pub fn close(&self) {
        self.file_manager.close();
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_finder(
    strategy: FinderStrategy,
    file_manager: Arc<FileManager>,
    row_size: u32,
    skew_ms: u64,
    emitter: &Arc<RowEmitter>,
) -> Result<Arc<dyn Finder>> {
    Ok(match strategy {
        FinderStrategy::Simple => SimpleFinder::new(file_manager, row_size, Some(emitter))?,
        FinderStrategy::InMemory => InMemoryFinder::new(file_manager, row_size, Some(emitter))?,
        FinderStrategy::Binary => BinaryFinder::new(file_manager, row_size, skew_ms, Some(emitter))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid_from_ts(ts_ms: u64) -> Uuid {
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, ts_ms / 1000, ((ts_ms % 1000) * 1_000_000) as u32);
        Uuid::new_v7(ts)
    }

    #[test]
    fn create_open_write_commit_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Db::create(&path, 1024, 5000).unwrap();

        let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::InMemory).unwrap();
        let key = uuid_from_ts(1_700_000_000_000);
        let mut tx = db.begin_tx().unwrap();
        tx.add_row(key, br#"{"a":1}"#).unwrap();
        tx.commit().unwrap();

        let value = db.get(&key).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
        assert_eq!(db.max_timestamp(), 1_700_000_000_000);
    }

    #[test]
    fn second_begin_tx_fails_while_one_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Db::create(&path, 1024, 5000).unwrap();
        let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::Simple).unwrap();
        let _tx = db.begin_tx().unwrap();
        assert_eq!(db.begin_tx().unwrap_err().kind, ErrorKind::TransactionActive);
    }

    #[test]
    fn read_only_mode_rejects_begin_tx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Db::create(&path, 1024, 5000).unwrap();
        let db = Db::open(&path, Mode::ReadOnly, FinderStrategy::Simple).unwrap();
        assert_eq!(db.begin_tx().unwrap_err().kind, ErrorKind::InvalidAction);
    }

    #[test]
    fn create_on_existing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Db::create(&path, 1024, 5000).unwrap();
        assert!(Db::create(&path, 1024, 5000).is_err());
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Db::create(&path, 1024, 5000).unwrap();
        let db = Db::open(&path, Mode::ReadOnly, FinderStrategy::Binary).unwrap();
        assert_eq!(db.get(&uuid_from_ts(1)).unwrap_err().kind, ErrorKind::KeyNotFound);
    }
}
