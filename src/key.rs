//! UUIDv7 keys: validation, timestamp extraction, the canonical null
//! sentinel, and the Base64 payload encoding used by every row variant.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Number of Base64 characters a 16-byte UUID encodes to with the standard
/// (padded) alphabet. Fixed for every key, which is the point: the row
/// codec relies on the key prefix always being exactly this wide.
pub const KEY_B64_LEN: usize = 24;

/// Validate that `uuid` is a non-nil UUIDv7: version nibble `0x7`, RFC
/// variant (top two bits of byte 8 are `10`), and not the all-zero nil UUID.
pub fn validate_v7(uuid: &Uuid) -> Result<()> {
    if uuid.is_nil() {
        return Err(Error::invalid_input("nil UUID is not a valid key"));
    }
    if uuid.get_version_num() != 7 {
        return Err(Error::invalid_input(format!(
            "key must be UUIDv7, got version {}",
            uuid.get_version_num()
        )));
    }
    let bytes = uuid.as_bytes();
    if bytes[8] & 0b1100_0000 != 0b1000_0000 {
        return Err(Error::invalid_input("key is not RFC-variant UUID"));
    }
    Ok(())
}

/// Extract the 48-bit big-endian unix-millisecond timestamp from a UUIDv7.
///
/// Does not itself validate the version/variant; call [`validate_v7`] first
/// when the value came from outside this module.
pub fn timestamp_ms(uuid: &Uuid) -> u64 {
    let bytes = uuid.as_bytes();
    let mut ts = [0u8; 8];
    ts[2..8].copy_from_slice(&bytes[0..6]);
    u64::from_be_bytes(ts)
}

/// Build the canonical "null" sentinel key for a `NullRow`: timestamp equal
/// to `max_timestamp`, all random bits zero, version/variant bits set.
pub fn null_sentinel_key(max_timestamp: u64) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0..6].copy_from_slice(&max_timestamp.to_be_bytes()[2..8]);
    bytes[6] = 0x70; // version nibble 7, top nibble of byte 6 zeroed
    bytes[8] = 0x80; // variant bits `10`, rest zero
    Uuid::from_bytes(bytes)
}

/// Is this key the canonical null sentinel for the given max timestamp?
pub fn is_null_sentinel(uuid: &Uuid, max_timestamp: u64) -> bool {
    *uuid == null_sentinel_key(max_timestamp)
}

/// Encode a key to its fixed-width Base64 payload prefix (24 characters, standard padded alphabet).
pub fn encode_key(uuid: &Uuid) -> String {
    STANDARD.encode(uuid.as_bytes())
}

/// Decode a key from a Base64 payload prefix. Structural Base64 failures are
/// `InvalidInput`; a syntactically valid but non-16-byte decode is
/// `CorruptDatabase` since it can only arise from on-disk corruption.
pub fn decode_key(encoded: &str) -> Result<Uuid> {
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| Error::with_cause(crate::error::ErrorKind::InvalidInput, "invalid base64 key", e))?;
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| Error::corrupt("decoded key is not 16 bytes"))?;
    Ok(Uuid::from_bytes(arr))
}

/// Insertion invariant from §3.4: for a new key with timestamp `t_new`
/// inserted while the running max timestamp is `max_timestamp`, require
/// `t_new + skew_ms > max_timestamp`.
pub fn check_insertion_order(t_new: u64, max_timestamp: u64, skew_ms: u64) -> Result<()> {
    if t_new.saturating_add(skew_ms) > max_timestamp {
        Ok(())
    } else {
        Err(Error::invalid_input(format!(
            "timestamp {t_new} violates skew invariant against max {max_timestamp} (skew_ms={skew_ms})"
        )))
    }
}
