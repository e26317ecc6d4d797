//! On-disk row encoding: the fixed-width, parity-checked row layout from
//! §3.2, and the physical-index arithmetic that interleaves `ChecksumRow`s
//! into the logical row sequence (§3.5).

mod end_control;
mod row;

pub use end_control::EndControl;
pub use row::{
    marshal_checksum_row, marshal_data_row, marshal_data_row_tail, marshal_null_row, marshal_null_row_tail,
    marshal_open_skeleton, unmarshal_row, ChecksumRow, DataRow, NullRow, PartialDataRow, RowUnion, ROW_END, ROW_START,
};

use crate::config::{HEADER_SIZE, PHYSICAL_BLOCK};

/// Byte offset of the `row_size`-byte slot at physical index `physical_idx`
/// (0-based, counting the header as slot -1).
pub fn slot_offset(physical_idx: u64, row_size: u64) -> u64 {
    HEADER_SIZE + physical_idx * row_size
}

/// Is the physical index at `physical_idx` a `ChecksumRow` slot?
///
/// Checksum rows occupy physical indices `k * PHYSICAL_BLOCK` for
/// `k = 0, 1, 2, …` — the very first post-header row (index 0) is the
/// initial checksum row written at file creation.
pub fn is_checksum_slot(physical_idx: u64) -> bool {
    physical_idx % PHYSICAL_BLOCK == 0
}

/// Translate a logical row index (data/null rows only, as `Finder` counts
/// them) to its physical slot index in the file: `P = L + floor(L/10_000) + 1`.
pub fn logical_to_physical(logical_idx: u64) -> u64 {
    logical_idx + logical_idx / (PHYSICAL_BLOCK - 1) + 1
}

/// Translate a physical slot index back to its logical row index. Panics if
/// `physical_idx` lands on a checksum slot; callers must check
/// [`is_checksum_slot`] first.
pub fn physical_to_logical(physical_idx: u64) -> u64 {
    assert!(!is_checksum_slot(physical_idx), "checksum slots have no logical index");
    let block = physical_idx / PHYSICAL_BLOCK;
    physical_idx - block - 1
}

/// Logical row count for a file holding `physical_rows` physical rows
/// (excluding the header), per §3.5: `R - ceil(R / PHYSICAL_BLOCK)`.
pub fn logical_count(physical_rows: u64) -> u64 {
    physical_rows - physical_rows.div_ceil(PHYSICAL_BLOCK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHECKSUM_INTERVAL;

    #[test]
    fn logical_physical_round_trip_within_first_block() {
        for logical in [0u64, 1, 9_999] {
            let physical = logical_to_physical(logical);
            assert!(!is_checksum_slot(physical));
            assert_eq!(physical_to_logical(physical), logical);
        }
    }

    #[test]
    fn checksum_slot_lands_at_block_boundary() {
        assert!(is_checksum_slot(0));
        assert!(is_checksum_slot(PHYSICAL_BLOCK));
        assert!(is_checksum_slot(2 * PHYSICAL_BLOCK));
        assert!(!is_checksum_slot(CHECKSUM_INTERVAL));
    }

    #[test]
    fn logical_physical_round_trip_crosses_checksum_boundary() {
        let logical = CHECKSUM_INTERVAL + 5;
        let physical = logical_to_physical(logical);
        assert_eq!(physical, PHYSICAL_BLOCK + 6);
        assert_eq!(physical_to_logical(physical), logical);
    }

    #[test]
    fn logical_count_matches_spec_formula() {
        assert_eq!(logical_count(PHYSICAL_BLOCK), CHECKSUM_INTERVAL);
        assert_eq!(logical_count(1), 0);
    }
}
