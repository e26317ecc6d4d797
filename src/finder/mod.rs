//! The `Finder` trait and its three interchangeable implementations (§4.6):
//! `simple` (linear scan), `in_memory` (hashmap), `binary`
//! (`FuzzyBinarySearch`-backed). All three share the transaction-boundary
//! scanning and rollback-visibility logic below, since that part of the
//! contract does not vary by implementation strategy.

pub mod binary;
pub mod in_memory;
pub mod simple;

pub use binary::BinaryFinder;
pub use in_memory::InMemoryFinder;
pub use simple::SimpleFinder;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::codec::{self, EndControl, RowUnion};
use crate::error::{Error, ErrorKind, Result};
use crate::file_manager::FileManager;

/// The common contract every `Finder` implementation presents, independent of
/// how it indexes keys internally.
pub trait Finder: Send + Sync {
    /// Physical index of the first DataRow with `key`, applying rollback
    /// visibility. `KeyNotFound` if absent or invisible.
    ///
    /// Returns a physical index (§3.5), not the bare logical count used
    /// internally to locate the row, so the result composes directly with
    /// [`Finder::get_transaction_start`]/[`Finder::get_transaction_end`]
    /// without an extra conversion at the call site.
    fn get_index(&self, key: &Uuid) -> Result<u64>;
    /// Physical index of the row bearing a terminating end-control for the
    /// transaction containing `index`.
    fn get_transaction_end(&self, index: u64) -> Result<u64>;
    /// Physical index of the `start_control='T'` row for the transaction
    /// containing `index`.
    fn get_transaction_start(&self, index: u64) -> Result<u64>;
    /// Called once per newly completed row, in ascending physical order.
    fn on_row_added(&self, physical_index: u64, row: &RowUnion) -> Result<()>;
    /// Largest UUIDv7 timestamp among all completed DataRows/NullRows, 0 if none.
    fn max_timestamp(&self) -> u64;
}

/// Shared tombstone bookkeeping: once an `on_row_added` call fails, every
/// `get_*` call fails the same way until the database is reopened.
#[derive(Default)]
pub(crate) struct TombstoneState {
    poisoned: RwLock<Option<(ErrorKind, String)>>,
}

impl TombstoneState {
    pub(crate) fn poison(&self, err: &Error) {
        let mut guard = self.poisoned.write();
        if guard.is_none() {
            *guard = Some((err.kind, err.message.clone()));
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.poisoned.read().clone() {
            Some((kind, message)) => Err(Error::tombstoned(Error::new(kind, message))),
            None => Ok(()),
        }
    }
}

fn read_row(file_manager: &FileManager, row_size: u32, physical: u64) -> Result<RowUnion> {
    let bytes = file_manager.read(codec::slot_offset(physical, row_size as u64), row_size as u64)?;
    codec::unmarshal_row(&bytes, row_size as usize)
}

/// Validate that `index` addresses an in-range, non-checksum physical slot.
fn check_addressable(file_manager: &FileManager, row_size: u32, index: u64) -> Result<()> {
    if codec::is_checksum_slot(index) {
        return Err(Error::invalid_input("index refers to a ChecksumRow"));
    }
    let end = codec::slot_offset(index, row_size as u64) + row_size as u64;
    if end > file_manager.size() {
        return Err(Error::invalid_input("index out of range"));
    }
    Ok(())
}

/// Scan forward from `index` to the row closing out its transaction.
/// `TransactionActive` if the file ends before a terminal row is found.
pub(crate) fn transaction_end_from_file(file_manager: &FileManager, row_size: u32, index: u64) -> Result<u64> {
    check_addressable(file_manager, row_size, index)?;
    let size = file_manager.size();
    let mut physical = index;
    loop {
        let offset = codec::slot_offset(physical, row_size as u64);
        if offset + row_size as u64 > size {
            return Err(Error::new(ErrorKind::TransactionActive, "transaction has not been terminated yet"));
        }
        match read_row(file_manager, row_size, physical)? {
            RowUnion::Checksum(_) => physical += 1,
            RowUnion::Null(_) => return Ok(physical),
            RowUnion::Data(d) if d.end_control.is_terminal() => return Ok(physical),
            RowUnion::Data(_) => physical += 1,
            RowUnion::Partial(_) => return Err(Error::new(ErrorKind::TransactionActive, "transaction has not been terminated yet")),
        }
    }
}

/// Scan backward from `index` to its transaction's `start_control='T'` row.
pub(crate) fn transaction_start_from_file(file_manager: &FileManager, row_size: u32, index: u64) -> Result<u64> {
    check_addressable(file_manager, row_size, index)?;
    let mut physical = index;
    loop {
        match read_row(file_manager, row_size, physical)? {
            RowUnion::Null(_) => return Ok(physical),
            RowUnion::Data(d) if d.first_in_transaction => return Ok(physical),
            RowUnion::Checksum(_) | RowUnion::Data(_) => {
                if physical == 0 {
                    return Err(Error::corrupt("no transaction start found scanning backward from row 0"));
                }
                physical -= 1;
            }
            RowUnion::Partial(_) => return Err(Error::corrupt("encountered a partial row while scanning backward")),
        }
    }
}

/// The end-control of the row at `end`, which must already be known
/// terminal (callers get `end` from [`transaction_end_from_file`] or an
/// equivalent cached boundary).
pub(crate) fn transaction_outcome(file_manager: &FileManager, row_size: u32, end: u64) -> Result<EndControl> {
    match read_row(file_manager, row_size, end)? {
        RowUnion::Data(d) if d.end_control.is_terminal() => Ok(d.end_control),
        RowUnion::Null(_) => Ok(EndControl::Null),
        _ => Err(Error::corrupt("transaction end row is not terminal")),
    }
}

/// Apply §3.4's rollback-visibility rule: is the row at `target` (within the
/// transaction spanning `[start, end]`, whose outcome is `outcome`) visible?
///
/// `TC`/`SC` (and the implicit commit a `NullRow` represents) show
/// everything. `R0`/`S0` hide everything. `Rk`/`Sk` with `k >= 1` keep rows
/// up through the row where the k-th savepoint was taken; later rows are
/// invisible. Consecutive `savepoint()` calls with no intervening `add_row`
/// collapse onto one on-disk row, so when fewer than `k` distinct
/// savepoint-marked rows exist, the last one found is used as the boundary —
/// those collapsed savepoint numbers are indistinguishable on disk and share
/// the same visible prefix.
pub(crate) fn is_row_visible(
    file_manager: &FileManager,
    row_size: u32,
    start: u64,
    end: u64,
    target: u64,
    outcome: EndControl,
) -> Result<bool> {
    match outcome {
        EndControl::Commit | EndControl::SavepointCommit | EndControl::Null => Ok(true),
        EndControl::Rollback(0) | EndControl::SavepointRollback(0) => Ok(false),
        EndControl::Rollback(k) | EndControl::SavepointRollback(k) => {
            let mut savepoints_seen = 0u8;
            let mut boundary = None;
            let mut physical = start;
            while physical <= end {
                if !codec::is_checksum_slot(physical) {
                    if let RowUnion::Data(d) = read_row(file_manager, row_size, physical)? {
                        if matches!(
                            d.end_control,
                            EndControl::SavepointContinue | EndControl::SavepointCommit | EndControl::SavepointRollback(_)
                        ) {
                            savepoints_seen += 1;
                            boundary = Some(physical);
                            if savepoints_seen >= k {
                                break;
                            }
                        }
                    }
                }
                physical += 1;
            }
            Ok(boundary.is_some_and(|b| target <= b))
        }
        _ => Err(Error::corrupt("unexpected end control for a transaction outcome")),
    }
}

/// Resolve full visibility for the row at `physical`: walk to its
/// transaction's start/end, read the outcome, and apply the rollback rule.
pub(crate) fn resolve_visibility(file_manager: &FileManager, row_size: u32, physical: u64) -> Result<bool> {
    let start = transaction_start_from_file(file_manager, row_size, physical)?;
    let end = transaction_end_from_file(file_manager, row_size, physical)?;
    let outcome = transaction_outcome(file_manager, row_size, end)?;
    is_row_visible(file_manager, row_size, start, end, physical, outcome)
}

/// Two-phase initialization helper (§4.6): replay every complete, non-checksum
/// row from `HEADER_SIZE` up to `initial_size` through `on_row`. Callers run
/// this before subscribing to `RowEmitter` so the emitter's kickstart covers
/// exactly the gap left open.
pub(crate) fn scan_initial(
    file_manager: &FileManager,
    row_size: u32,
    initial_size: u64,
    mut on_row: impl FnMut(u64, RowUnion) -> Result<()>,
) -> Result<()> {
    let mut physical = 0u64;
    loop {
        let offset = codec::slot_offset(physical, row_size as u64);
        if offset + row_size as u64 > initial_size {
            return Ok(());
        }
        let row = read_row(file_manager, row_size, physical)?;
        if !codec::is_checksum_slot(physical) {
            on_row(physical, row)?;
        }
        physical += 1;
    }
}
