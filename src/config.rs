//! Named constants pulled out of the engine's prose specification.
//!
//! `row_size` and `skew_ms` are per-database values read from the header
//! (see [`crate::header`]); everything here is fixed across every database.

/// Number of complete data/null rows between two `ChecksumRow`s, and the
/// physical-index stride at which `ChecksumRow`s occupy the file.
pub const CHECKSUM_INTERVAL: u64 = 10_000;

/// `CHECKSUM_INTERVAL` plus the checksum row itself: the physical-index
/// period of the file (`k * PHYSICAL_BLOCK` is always a `ChecksumRow`).
pub const PHYSICAL_BLOCK: u64 = CHECKSUM_INTERVAL + 1;

/// Maximum number of complete `DataRow`s a single transaction may hold.
pub const MAX_TRANSACTION_ROWS: usize = 100;

/// Maximum number of savepoints a single transaction may declare.
pub const MAX_SAVEPOINTS: u8 = 9;

/// Maximum number of rows `Recovery` will scan backwards from the tail
/// before declaring the file corrupt.
pub const RECOVERY_SCAN_LIMIT: usize = MAX_TRANSACTION_ROWS + 1;

/// Upper bound on the header's `skew_ms` field: one day, in milliseconds.
pub const MAX_SKEW_MS: u64 = 86_400_000;

/// Size in bytes of the fixed file header.
pub const HEADER_SIZE: u64 = 64;

/// Minimum legal `row_size`.
pub const MIN_ROW_SIZE: u32 = 128;

/// Maximum legal `row_size`.
pub const MAX_ROW_SIZE: u32 = 65536;
