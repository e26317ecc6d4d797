//! Tail-scan reconstruction of an in-flight transaction on open (§4.5).
//!
//! Recovery never reads more than [`RECOVERY_SCAN_LIMIT`] complete rows
//! backward from the file's tail. It does not itself repair anything; it
//! reports what it found and [`crate::transaction::Transaction::resume`]
//! (or the absence of a call to it) is what continues or discards the
//! in-flight transaction.

use crate::codec::{self, EndControl, RowUnion};
use crate::config::RECOVERY_SCAN_LIMIT;
use crate::error::{Error, Result};
use crate::file_manager::FileManager;

/// What a reconstructed in-flight transaction looks like from the outside:
/// just enough for [`crate::transaction::Transaction::resume`] to pick up
/// where the crash left off. The staged (not yet flushed) row itself is
/// unrecoverable by construction — see the module docs on two-phase writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredTransaction {
    pub n: usize,
    pub savepoint_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub active_transaction: Option<RecoveredTransaction>,
}

/// Scan backward from the tail and reconstruct any in-flight transaction.
pub fn recover(file_manager: &FileManager, row_size: u32) -> Result<RecoveryOutcome> {
    let row_size = row_size as u64;
    let size = file_manager.size();
    let header_size = crate::config::HEADER_SIZE;
    if size < header_size + row_size {
        return Err(Error::corrupt("file shorter than header plus the initial checksum row"));
    }

    let body = size - header_size;
    let complete_rows = body / row_size;
    let remainder = body % row_size;
    let dangling_row_in_progress = remainder != 0;

    if dangling_row_in_progress {
        // The tail holds anywhere from the 2-byte opening skeleton up to a
        // partially written payload/end-control/parity — a write
        // interrupted mid-row. None of those bytes are trustworthy (the
        // payload can't be decoded without the rest of the row), so they're
        // discarded; the next write lands exactly at the last complete row.
        file_manager.discard_tail(header_size + complete_rows * row_size)?;
    }

    if complete_rows == 1 && !dangling_row_in_progress {
        // Only the initial ChecksumRow written at creation; nothing else ever happened.
        return Ok(RecoveryOutcome { active_transaction: None });
    }

    let scan_limit = (RECOVERY_SCAN_LIMIT as u64).min(complete_rows);
    let mut n = 0usize;
    let mut savepoint_count = 0u8;
    let mut open_transaction = false;
    let mut resolved = false;

    for offset in 0..scan_limit {
        let physical_idx = complete_rows - 1 - offset;
        let bytes = file_manager.read(codec::slot_offset(physical_idx, row_size), row_size)?;
        match codec::unmarshal_row(&bytes, row_size as usize)? {
            RowUnion::Checksum(_) => continue,
            RowUnion::Null(_) => {
                resolved = true;
                break;
            }
            RowUnion::Partial(_) => {
                return Err(Error::corrupt("encountered a partial row mid-scan, expected only at the tail"));
            }
            RowUnion::Data(row) => {
                if row.end_control.is_terminal() {
                    resolved = true;
                    break;
                }
                open_transaction = true;
                n += 1;
                // A run of back-to-back savepoint() calls with no intervening
                // add_row leaves no extra on-disk marker, so this undercounts
                // that case. It matches the format's real information
                // content: such redundant savepoints bound no row and no
                // rollback target could ever distinguish them.
                if row.end_control == EndControl::SavepointContinue {
                    savepoint_count += 1;
                }
                if row.first_in_transaction {
                    resolved = true;
                    break;
                }
            }
        }
    }

    if !resolved {
        return Err(Error::corrupt(format!(
            "no transaction boundary found within {RECOVERY_SCAN_LIMIT} rows of the tail"
        )));
    }

    if open_transaction {
        return Ok(RecoveryOutcome {
            active_transaction: Some(RecoveredTransaction { n, savepoint_count }),
        });
    }

    // The last complete row was terminal. A discarded dangling row past it
    // can only be a fresh `begin()` that crashed before its first `add_row`.
    if dangling_row_in_progress {
        Ok(RecoveryOutcome {
            active_transaction: Some(RecoveredTransaction { n: 0, savepoint_count: 0 }),
        })
    } else {
        Ok(RecoveryOutcome { active_transaction: None })
    }
}
