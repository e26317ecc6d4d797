//! The two-character `end_control` code trailing every row's payload.

use crate::error::{Error, Result};

/// The terminating code of a row, encoding both its row-variant tag and,
/// for `DataRow`s, whether the row is a mid-transaction continuation, a
/// commit, or a rollback — and whether a savepoint attaches to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndControl {
    /// `TC` — transaction commit, no savepoint on this row.
    Commit,
    /// `SC` — transaction commit, savepoint attached to this row.
    SavepointCommit,
    /// `RE` — row continues the transaction, no savepoint on this row.
    Continue,
    /// `SE` — row continues the transaction, savepoint attached to this row.
    SavepointContinue,
    /// `R0`..`R9` — rollback to savepoint `k`, no savepoint on this row.
    Rollback(u8),
    /// `S0`..`S9` — rollback to savepoint `k`, savepoint attached to this row.
    SavepointRollback(u8),
    /// `NR` — `NullRow`'s only valid end control.
    Null,
    /// `CS` — `ChecksumRow`'s only valid end control.
    Checksum,
}

impl EndControl {
    pub fn to_code(self) -> [u8; 2] {
        match self {
            EndControl::Commit => *b"TC",
            EndControl::SavepointCommit => *b"SC",
            EndControl::Continue => *b"RE",
            EndControl::SavepointContinue => *b"SE",
            EndControl::Rollback(k) => [b'R', digit(k)],
            EndControl::SavepointRollback(k) => [b'S', digit(k)],
            EndControl::Null => *b"NR",
            EndControl::Checksum => *b"CS",
        }
    }

    pub fn from_code(code: [u8; 2]) -> Result<Self> {
        Ok(match &code {
            b"TC" => EndControl::Commit,
            b"SC" => EndControl::SavepointCommit,
            b"RE" => EndControl::Continue,
            b"SE" => EndControl::SavepointContinue,
            b"NR" => EndControl::Null,
            b"CS" => EndControl::Checksum,
            [b'R', d] if d.is_ascii_digit() => EndControl::Rollback(d - b'0'),
            [b'S', d] if d.is_ascii_digit() => EndControl::SavepointRollback(d - b'0'),
            _ => {
                return Err(Error::invalid_input(format!(
                    "unknown end control {:?}",
                    String::from_utf8_lossy(&code)
                )))
            }
        })
    }

    /// Is this a terminating code for a transaction (commit or rollback),
    /// as opposed to a mid-transaction continuation?
    pub fn is_terminal(self) -> bool {
        !matches!(self, EndControl::Continue | EndControl::SavepointContinue)
    }

    /// Is this a rollback code, and if so the target savepoint and whether
    /// this row itself carries a savepoint.
    pub fn as_rollback(self) -> Option<(u8, bool)> {
        match self {
            EndControl::Rollback(k) => Some((k, false)),
            EndControl::SavepointRollback(k) => Some((k, true)),
            _ => None,
        }
    }

    /// Valid as a `DataRow`'s end control.
    pub fn valid_for_data_row(self) -> bool {
        !matches!(self, EndControl::Null | EndControl::Checksum)
    }
}

fn digit(k: u8) -> u8 {
    debug_assert!(k <= 9);
    b'0' + k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_fixed_codes() {
        for ec in [
            EndControl::Commit,
            EndControl::SavepointCommit,
            EndControl::Continue,
            EndControl::SavepointContinue,
            EndControl::Null,
            EndControl::Checksum,
        ] {
            assert_eq!(EndControl::from_code(ec.to_code()).unwrap(), ec);
        }
    }

    #[test]
    fn round_trips_rollback_digits() {
        for k in 0..=9u8 {
            assert_eq!(
                EndControl::from_code(EndControl::Rollback(k).to_code()).unwrap(),
                EndControl::Rollback(k)
            );
            assert_eq!(
                EndControl::from_code(EndControl::SavepointRollback(k).to_code()).unwrap(),
                EndControl::SavepointRollback(k)
            );
        }
    }

    #[test]
    fn rejects_unknown_code() {
        assert!(EndControl::from_code(*b"XY").is_err());
    }
}
