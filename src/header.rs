//! The 64-byte file header (§3.1): a JSON object, NUL-padded, terminated by
//! a newline at byte 63.

use serde::{Deserialize, Serialize};

use crate::config::{HEADER_SIZE, MAX_ROW_SIZE, MAX_SKEW_MS, MIN_ROW_SIZE};
use crate::error::{Error, Result};

const SIG: &str = "fDB";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub sig: String,
    pub ver: u32,
    pub row_size: u32,
    pub skew_ms: u64,
}

impl Header {
    pub fn new(row_size: u32, skew_ms: u64) -> Result<Self> {
        let header = Header {
            sig: SIG.to_string(),
            ver: VERSION,
            row_size,
            skew_ms,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sig != SIG {
            return Err(Error::corrupt(format!("unexpected signature {:?}", self.sig)));
        }
        if self.ver != VERSION {
            return Err(Error::corrupt(format!("unsupported header version {}", self.ver)));
        }
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&self.row_size) {
            return Err(Error::invalid_input(format!(
                "row_size {} out of range [{MIN_ROW_SIZE}, {MAX_ROW_SIZE}]",
                self.row_size
            )));
        }
        if self.skew_ms > MAX_SKEW_MS {
            return Err(Error::invalid_input(format!(
                "skew_ms {} exceeds max {MAX_SKEW_MS}",
                self.skew_ms
            )));
        }
        Ok(())
    }

    /// Serialize to the fixed 64-byte on-disk representation.
    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE as usize]> {
        self.validate()?;
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::with_cause(crate::error::ErrorKind::InvalidInput, "header serialize", e))?;

        let mut buf = [0u8; HEADER_SIZE as usize];
        // Reserve the trailing newline sentinel byte.
        if json.len() > buf.len() - 1 {
            return Err(Error::invalid_input("header JSON does not fit in 64 bytes"));
        }
        buf[..json.len()].copy_from_slice(&json);
        buf[HEADER_SIZE as usize - 1] = b'\n';
        Ok(buf)
    }

    /// Parse from the fixed 64-byte on-disk representation.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE as usize {
            return Err(Error::corrupt(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if buf[HEADER_SIZE as usize - 1] != b'\n' {
            return Err(Error::corrupt("header missing terminating newline at byte 63"));
        }

        let nul_pos = buf[..HEADER_SIZE as usize - 1]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::corrupt("header has no NUL padding"))?;

        if buf[nul_pos..HEADER_SIZE as usize - 1].iter().any(|&b| b != 0) {
            return Err(Error::corrupt("header padding bytes are not all NUL"));
        }

        let json = &buf[..nul_pos];
        let header: Header = serde_json::from_slice(json)
            .map_err(|e| Error::with_cause(crate::error::ErrorKind::CorruptDatabase, "header JSON parse", e))?;
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = Header::new(1024, 5000).unwrap();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE as usize);
        assert_eq!(bytes[63], b'\n');
        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_bad_row_size() {
        assert!(Header::new(64, 0).is_err());
        assert!(Header::new(100_000, 0).is_err());
    }

    #[test]
    fn rejects_bad_skew() {
        assert!(Header::new(1024, MAX_SKEW_MS + 1).is_err());
    }

    #[test]
    fn rejects_missing_newline() {
        let header = Header::new(1024, 0).unwrap();
        let mut bytes = header.to_bytes().unwrap();
        bytes[63] = 0;
        assert!(Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_nonzero_padding() {
        let header = Header::new(1024, 0).unwrap();
        let mut bytes = header.to_bytes().unwrap();
        let json_len = serde_json::to_vec(&header).unwrap().len();
        bytes[json_len + 2] = b'x';
        assert!(Header::from_bytes(&bytes).is_err());
    }
}
