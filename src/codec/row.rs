//! Row variants and the marshal/unmarshal pair that moves between them and
//! fixed `row_size`-byte on-disk buffers.
//!
//! Every row shares the same skeleton:
//!
//! ```text
//! byte 0            ROW_START (0x1F)
//! byte 1            start_control ('T' | 'R' | 'C')
//! bytes 2..row_size-5   payload (NUL-padded, row_size-7 bytes)
//! bytes row_size-5..row_size-3   end_control (two ASCII bytes)
//! byte row_size-3   parity1
//! byte row_size-2   parity2
//! byte row_size-1   ROW_END (0x0A)
//! ```
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::key;

use super::end_control::EndControl;

pub const ROW_START: u8 = 0x1F;
pub const ROW_END: u8 = 0x0A;

const START_TRANSACTION: u8 = b'T';
const START_CONTINUE: u8 = b'R';
const START_CHECKSUM: u8 = b'C';

/// A fully parsed row, or the raw bytes of one that failed to fill out to
/// `row_size` before the file ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RowUnion {
    Data(DataRow),
    Null(NullRow),
    Checksum(ChecksumRow),
    Partial(PartialDataRow),
}

/// A value row: a UUIDv7 key, its JSON payload, and the transaction state
/// this row closes out.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub first_in_transaction: bool,
    pub key: Uuid,
    pub value: Vec<u8>,
    pub end_control: EndControl,
}

/// The terminal marker row written when a database is sealed: no key, just
/// the running max timestamp baked into its sentinel key (see [`key`]).
#[derive(Debug, Clone, PartialEq)]
pub struct NullRow {
    pub max_timestamp: u64,
}

/// A periodic integrity row: the CRC32 of every row since the previous
/// `ChecksumRow` (or the header, for the first one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRow {
    pub crc: u32,
}

/// The tail of a file that ends mid-row: fewer than `row_size` bytes,
/// produced by a write that never reached `ROW_END`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialDataRow {
    pub bytes: Vec<u8>,
}

fn xor_all(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

fn payload_len(row_size: usize) -> usize {
    row_size - 7
}

fn write_skeleton(buf: &mut [u8], row_size: usize, start_control: u8, payload: &[u8], end_control: [u8; 2]) -> Result<()> {
    let max_payload = payload_len(row_size);
    if payload.len() > max_payload {
        return Err(Error::invalid_input(format!(
            "payload of {} bytes exceeds row capacity of {max_payload}",
            payload.len()
        )));
    }
    buf[0] = ROW_START;
    buf[1] = start_control;
    buf[2..2 + payload.len()].copy_from_slice(payload);
    buf[row_size - 5..row_size - 3].copy_from_slice(&end_control);

    let parity1 = xor_all(&buf[0..row_size - 3]);
    buf[row_size - 3] = parity1;
    let parity2 = xor_all(&buf[0..row_size - 2]);
    buf[row_size - 2] = parity2;

    buf[row_size - 1] = ROW_END;
    Ok(())
}

/// Marshal a `DataRow` into a fresh `row_size`-byte buffer.
pub fn marshal_data_row(row: &DataRow, row_size: usize) -> Result<Vec<u8>> {
    if !row.end_control.valid_for_data_row() {
        return Err(Error::invalid_input("end control is not valid for a data row"));
    }
    key::validate_v7(&row.key)?;

    let mut payload = key::encode_key(&row.key).into_bytes();
    payload.extend_from_slice(&row.value);

    let mut buf = vec![0u8; row_size];
    write_skeleton(
        &mut buf,
        row_size,
        if row.first_in_transaction { START_TRANSACTION } else { START_CONTINUE },
        &payload,
        row.end_control.to_code(),
    )?;
    Ok(buf)
}

/// Marshal a `NullRow` into a fresh `row_size`-byte buffer.
pub fn marshal_null_row(row: &NullRow, row_size: usize) -> Result<Vec<u8>> {
    let sentinel = key::null_sentinel_key(row.max_timestamp);
    let payload = key::encode_key(&sentinel).into_bytes();

    let mut buf = vec![0u8; row_size];
    write_skeleton(&mut buf, row_size, START_TRANSACTION, &payload, EndControl::Null.to_code())?;
    Ok(buf)
}

/// Marshal a `ChecksumRow` into a fresh `row_size`-byte buffer.
pub fn marshal_checksum_row(row: ChecksumRow, row_size: usize) -> Result<Vec<u8>> {
    let payload = row.crc.to_be_bytes();

    let mut buf = vec![0u8; row_size];
    write_skeleton(&mut buf, row_size, START_CHECKSUM, &payload, EndControl::Checksum.to_code())?;
    Ok(buf)
}

/// Build the two-byte skeleton (`ROW_START` + `start_control`) that
/// `TransactionEngine::begin` appends before any payload is known.
pub fn marshal_open_skeleton(first_in_transaction: bool) -> [u8; 2] {
    [ROW_START, if first_in_transaction { START_TRANSACTION } else { START_CONTINUE }]
}

/// Marshal just the bytes that complete an already-written two-byte
/// skeleton into a full `DataRow`: everything but `buf[0..2]`, which the
/// transaction engine appended earlier as its own write. Parity is computed
/// over the full logical row, so this still needs `row.first_in_transaction`
/// to reconstruct what `buf[0..2]` already holds on disk.
pub fn marshal_data_row_tail(row: &DataRow, row_size: usize) -> Result<Vec<u8>> {
    Ok(marshal_data_row(row, row_size)?[2..].to_vec())
}

/// Marshal just the tail completing an open skeleton into a `NullRow`.
pub fn marshal_null_row_tail(row: &NullRow, row_size: usize) -> Result<Vec<u8>> {
    Ok(marshal_null_row(row, row_size)?[2..].to_vec())
}

/// Validate and parse a full `row_size`-byte buffer into its row variant.
///
/// Structural checks run in order: length, `ROW_START`, `ROW_END`, both
/// parity bytes, then `start_control`/`end_control` against the allowed
/// combinations. Only once those pass is the payload interpreted, where a
/// failure (bad Base64, non-UUIDv7 key, wrong-width CRC) is `CorruptDatabase`
/// rather than `InvalidInput` — the row reached the file looking structurally
/// sound, so whatever is wrong with it is on-disk corruption.
pub fn unmarshal_row(buf: &[u8], row_size: usize) -> Result<RowUnion> {
    if buf.len() != row_size {
        return Ok(RowUnion::Partial(PartialDataRow { bytes: buf.to_vec() }));
    }
    if buf[0] != ROW_START {
        return Err(Error::corrupt("row missing ROW_START sentinel"));
    }
    if buf[row_size - 1] != ROW_END {
        return Err(Error::corrupt("row missing ROW_END sentinel"));
    }

    let parity1 = xor_all(&buf[0..row_size - 3]);
    if parity1 != buf[row_size - 3] {
        return Err(Error::corrupt("row parity1 mismatch"));
    }
    let parity2 = xor_all(&buf[0..row_size - 2]);
    if parity2 != buf[row_size - 2] {
        return Err(Error::corrupt("row parity2 mismatch"));
    }

    let start_control = buf[1];
    let end_code: [u8; 2] = buf[row_size - 5..row_size - 3].try_into().unwrap();
    let payload = &buf[2..row_size - 5];

    match (start_control, &end_code) {
        (START_CHECKSUM, b"CS") => parse_checksum_row(payload),
        (START_TRANSACTION, b"NR") => parse_null_row(payload),
        (START_TRANSACTION, _) | (START_CONTINUE, _) => {
            let end_control = EndControl::from_code(end_code)
                .map_err(|e| Error::new(ErrorKind::CorruptDatabase, e.message))?;
            if !end_control.valid_for_data_row() {
                return Err(Error::corrupt(format!(
                    "end control {:?} not valid for a data row",
                    String::from_utf8_lossy(&end_code)
                )));
            }
            parse_data_row(payload, start_control == START_TRANSACTION, end_control)
        }
        _ => Err(Error::corrupt(format!(
            "unrecognized start_control {:?}",
            start_control as char
        ))),
    }
}

fn parse_data_row(payload: &[u8], first_in_transaction: bool, end_control: EndControl) -> Result<RowUnion> {
    if payload.len() < key::KEY_B64_LEN {
        return Err(Error::corrupt("payload too short to contain a key"));
    }
    let key_str = std::str::from_utf8(&payload[..key::KEY_B64_LEN])
        .map_err(|e| Error::with_cause(ErrorKind::CorruptDatabase, "key is not valid utf-8", e))?;
    let key = key::decode_key(key_str).map_err(|e| Error::new(ErrorKind::CorruptDatabase, e.message))?;
    key::validate_v7(&key).map_err(|e| Error::new(ErrorKind::CorruptDatabase, e.message))?;

    let rest = &payload[key::KEY_B64_LEN..];
    let nul_pos = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let value = rest[..nul_pos].to_vec();
    if rest[nul_pos..].iter().any(|&b| b != 0) {
        return Err(Error::corrupt("non-NUL bytes after value in payload padding"));
    }

    Ok(RowUnion::Data(DataRow {
        first_in_transaction,
        key,
        value,
        end_control,
    }))
}

fn parse_null_row(payload: &[u8]) -> Result<RowUnion> {
    if payload.len() < key::KEY_B64_LEN {
        return Err(Error::corrupt("null row payload too short"));
    }
    let key_str = std::str::from_utf8(&payload[..key::KEY_B64_LEN])
        .map_err(|e| Error::with_cause(ErrorKind::CorruptDatabase, "null row key is not valid utf-8", e))?;
    let sentinel = key::decode_key(key_str).map_err(|e| Error::new(ErrorKind::CorruptDatabase, e.message))?;
    let max_timestamp = key::timestamp_ms(&sentinel);
    if !key::is_null_sentinel(&sentinel, max_timestamp) {
        return Err(Error::corrupt("null row key is not the canonical sentinel"));
    }
    Ok(RowUnion::Null(NullRow { max_timestamp }))
}

fn parse_checksum_row(payload: &[u8]) -> Result<RowUnion> {
    if payload.len() < 4 {
        return Err(Error::corrupt("checksum row payload shorter than 4 bytes"));
    }
    let crc = u32::from_be_bytes(payload[..4].try_into().unwrap());
    if payload[4..].iter().any(|&b| b != 0) {
        return Err(Error::corrupt("non-NUL bytes after CRC in checksum row padding"));
    }
    Ok(RowUnion::Checksum(ChecksumRow { crc }))
}
