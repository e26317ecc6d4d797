//! The transaction state machine (§4.4): at most one active transaction per
//! database, driving DataRow/NullRow emission and ChecksumRow insertion.
//!
//! Every row's `end_control` is only known once the *next* transaction
//! operation happens — the row after it, or the call that closes the
//! transaction out. So each `add_row` stages its `(key, value)` in memory
//! and defers the actual tail write until that next operation supplies the
//! end control. The row's two-byte opening skeleton (`ROW_START` +
//! `start_control`) is written eagerly, as soon as the row is staged, so
//! the file's tail always shows an in-progress row for [`crate::recovery`]
//! to find.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use uuid::Uuid;

use crate::codec::{self, ChecksumRow, DataRow, EndControl, NullRow};
use crate::config::{CHECKSUM_INTERVAL, MAX_SAVEPOINTS, MAX_TRANSACTION_ROWS, PHYSICAL_BLOCK};
use crate::error::{Error, ErrorKind, Result};
use crate::file_manager::{FileManager, WriteRequest};
use crate::key;

/// State shared across every transaction a database ever opens: the
/// running max timestamp (what `max_timestamp()` reports) and the count of
/// complete data/null rows written so far (what drives checksum cadence).
/// Both only advance once a row is durably flushed, never on staging.
#[derive(Default)]
pub struct TransactionShared {
    pub max_timestamp_ms: AtomicU64,
    pub completed_rows: AtomicU64,
}

impl TransactionShared {
    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp_ms.load(Ordering::Acquire)
    }
}

struct PendingRow {
    first_in_transaction: bool,
    key: Uuid,
    value: Vec<u8>,
}

/// A bounded, in-memory handle to an open transaction. Only one may exist
/// per database at a time; the database facade enforces that.
pub struct Transaction {
    writer: Sender<WriteRequest>,
    file_manager: Arc<FileManager>,
    row_size: u32,
    skew_ms: u64,
    shared: Arc<TransactionShared>,
    pending: Option<PendingRow>,
    local_max_ts: u64,
    n: usize,
    savepoint_count: u8,
    savepoint_pending: bool,
    /// Cleared by [`Db`](crate::db::Db) once this transaction closes, so a
    /// later `begin_tx` knows the slot is free again. Left set if commit or
    /// rollback fails, since the on-disk state is then unknown until reopen.
    active_flag: Arc<AtomicBool>,
}

impl Transaction {
    /// Writes the opening two-byte skeleton (`ROW_START` + `'T'`) and
    /// returns the new, empty transaction.
    pub fn begin(
        writer: Sender<WriteRequest>,
        file_manager: Arc<FileManager>,
        row_size: u32,
        skew_ms: u64,
        shared: Arc<TransactionShared>,
        active_flag: Arc<AtomicBool>,
    ) -> Result<Self> {
        let local_max_ts = shared.max_timestamp();
        let mut tx = Self {
            writer,
            file_manager,
            row_size,
            skew_ms,
            shared,
            pending: None,
            local_max_ts,
            n: 0,
            savepoint_count: 0,
            savepoint_pending: false,
            active_flag,
        };
        tx.send(codec::marshal_open_skeleton(true).to_vec())?;
        Ok(tx)
    }

    /// Pick back up a transaction [`crate::recovery::recover`] found still
    /// open at the tail. `recover` already discarded whatever dangling,
    /// not-yet-complete row was there, so the file's tail is a clean row
    /// boundary — write a fresh skeleton now so the invariant "an open
    /// transaction always has an unflushed skeleton on disk" holds
    /// uniformly.
    pub fn resume(
        writer: Sender<WriteRequest>,
        file_manager: Arc<FileManager>,
        row_size: u32,
        skew_ms: u64,
        shared: Arc<TransactionShared>,
        recovered: crate::recovery::RecoveredTransaction,
        active_flag: Arc<AtomicBool>,
    ) -> Result<Self> {
        let local_max_ts = shared.max_timestamp();
        let tx = Self {
            writer,
            file_manager,
            row_size,
            skew_ms,
            shared,
            pending: None,
            local_max_ts,
            n: recovered.n,
            savepoint_count: recovered.savepoint_count,
            savepoint_pending: false,
            active_flag,
        };
        tx.send(codec::marshal_open_skeleton(recovered.n == 0).to_vec())?;
        Ok(tx)
    }

    pub fn row_count(&self) -> usize {
        self.n
    }

    pub fn savepoint_count(&self) -> u8 {
        self.savepoint_count
    }

    /// Stage a new row. Validates the key, the insertion-order invariant
    /// against both already-flushed and already-staged timestamps, and the
    /// value's fit in the payload area. Flushes the previously staged row
    /// (if any) as a continuation and opens the new row's skeleton.
    pub fn add_row(&mut self, key: Uuid, value: &[u8]) -> Result<()> {
        key::validate_v7(&key)?;
        if self.n >= MAX_TRANSACTION_ROWS {
            return Err(Error::invalid_input(format!(
                "transaction already holds the maximum of {MAX_TRANSACTION_ROWS} rows"
            )));
        }
        let t_new = key::timestamp_ms(&key);
        key::check_insertion_order(t_new, self.local_max_ts, self.skew_ms)?;

        let max_value_len = (self.row_size as usize).saturating_sub(7 + key::KEY_B64_LEN);
        if value.len() > max_value_len {
            return Err(Error::invalid_input(format!(
                "value of {} bytes exceeds the {max_value_len}-byte payload capacity",
                value.len()
            )));
        }

        // The skeleton already on disk for this staged row matches 'T' only
        // when this is the transaction's true first row (n == 0) — not
        // merely "nothing staged right now", which a resumed transaction
        // can also show with n > 0 if its skeleton was already written.
        let is_first_row = self.n == 0;
        if let Some(prev) = self.pending.take() {
            let end_control = if self.savepoint_pending { EndControl::SavepointContinue } else { EndControl::Continue };
            self.flush_pending(prev, end_control)?;
            self.savepoint_pending = false;
            self.send(codec::marshal_open_skeleton(false).to_vec())?;
        }

        self.pending = Some(PendingRow { first_in_transaction: is_first_row, key, value: value.to_vec() });
        self.local_max_ts = self.local_max_ts.max(t_new);
        Ok(())
    }

    /// Marks a savepoint at the currently staged row. Consumed by whichever
    /// row finalizes next (turns its end control into the "savepoint"
    /// variant); up to [`crate::config::MAX_SAVEPOINTS`] per transaction.
    pub fn savepoint(&mut self) -> Result<()> {
        if self.savepoint_count >= MAX_SAVEPOINTS {
            return Err(Error::invalid_input(format!("transaction already holds {MAX_SAVEPOINTS} savepoints")));
        }
        self.savepoint_count += 1;
        self.savepoint_pending = true;
        Ok(())
    }

    /// Finalizes the transaction, rolling back to savepoint `target`
    /// (`0` rolls back everything). Consumes the transaction.
    pub fn rollback(mut self, target: u8) -> Result<()> {
        if target > self.savepoint_count {
            return Err(Error::invalid_input(format!(
                "rollback target {target} exceeds savepoint count {}",
                self.savepoint_count
            )));
        }
        let result = match self.pending.take() {
            Some(prev) => {
                let end_control = if self.savepoint_pending {
                    EndControl::SavepointRollback(target)
                } else {
                    EndControl::Rollback(target)
                };
                self.flush_pending(prev, end_control)
            }
            None => self.flush_null_row_or_require_row(),
        };
        if result.is_ok() {
            self.active_flag.store(false, Ordering::Release);
        }
        result
    }

    /// Finalizes the transaction as committed. If no row was ever added,
    /// emits a `NullRow` instead. Consumes the transaction.
    pub fn commit(mut self) -> Result<()> {
        let result = match self.pending.take() {
            Some(prev) => {
                let end_control = if self.savepoint_pending { EndControl::SavepointCommit } else { EndControl::Commit };
                self.flush_pending(prev, end_control)
            }
            None => self.flush_null_row_or_require_row(),
        };
        if result.is_ok() {
            self.active_flag.store(false, Ordering::Release);
        }
        result
    }

    /// `pending` is `None` either because no row was ever added (`n == 0`,
    /// safe to close with a `NullRow`), or because [`Transaction::resume`]
    /// reconstructed a transaction whose last staged row was lost in the
    /// crash (`n > 0`, dangling skeleton has no known payload). The latter
    /// can't be closed without first supplying a row.
    fn flush_null_row_or_require_row(&mut self) -> Result<()> {
        if self.n == 0 {
            self.flush_null_row()
        } else {
            Err(Error::new(
                ErrorKind::InvalidAction,
                "transaction was recovered with an unfilled pending row; call add_row before commit or rollback",
            ))
        }
    }

    fn flush_pending(&mut self, row: PendingRow, end_control: EndControl) -> Result<()> {
        let data_row = DataRow { first_in_transaction: row.first_in_transaction, key: row.key, value: row.value, end_control };
        let tail = codec::marshal_data_row_tail(&data_row, self.row_size as usize)?;
        self.send(tail)?;
        self.n += 1;
        self.shared.max_timestamp_ms.fetch_max(key::timestamp_ms(&data_row.key), Ordering::AcqRel);
        let completed = self.shared.completed_rows.fetch_add(1, Ordering::AcqRel) + 1;
        self.maybe_insert_checksum(completed)
    }

    /// Completes the still-open `'T'` skeleton from `begin` into a
    /// `NullRow`: the transaction never added a row, and an empty rollback
    /// has no rows to distinguish from an empty commit.
    fn flush_null_row(&mut self) -> Result<()> {
        let null_row = NullRow { max_timestamp: self.local_max_ts };
        let tail = codec::marshal_null_row_tail(&null_row, self.row_size as usize)?;
        self.send(tail)?;
        let completed = self.shared.completed_rows.fetch_add(1, Ordering::AcqRel) + 1;
        self.maybe_insert_checksum(completed)
    }

    fn maybe_insert_checksum(&self, completed_count: u64) -> Result<()> {
        if completed_count == 0 || completed_count % CHECKSUM_INTERVAL != 0 {
            return Ok(());
        }
        let block = completed_count / CHECKSUM_INTERVAL;
        let block_start_physical = (block - 1) * PHYSICAL_BLOCK + 1;
        let byte_start = codec::slot_offset(block_start_physical, self.row_size as u64);
        let byte_len = CHECKSUM_INTERVAL * self.row_size as u64;

        let block_bytes = self.file_manager.read(byte_start, byte_len)?;
        for chunk in block_bytes.chunks(self.row_size as usize) {
            codec::unmarshal_row(chunk, self.row_size as usize)?;
        }
        let crc = crc32fast::hash(&block_bytes);
        let checksum_row = codec::marshal_checksum_row(ChecksumRow { crc }, self.row_size as usize)?;
        self.send(checksum_row)
    }

    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.writer
            .send(WriteRequest { bytes, response: tx })
            .map_err(|_| Error::new(ErrorKind::WriteError, "writer channel closed"))?;
        rx.recv().map_err(|_| Error::new(ErrorKind::WriteError, "writer response channel closed"))?
    }
}
