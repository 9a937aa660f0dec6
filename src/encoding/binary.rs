//! Fixed-width binary integer encoding: 8 bytes, big-endian. Used for engine
//! keys (journal entry indexes, deque fields, expiration deadlines) where the
//! byte order of the encoding must match the numeric order of the values, and
//! inside serialized journal entries.

use crate::error::{Error, Result};

/// Encodes an unsigned 64-bit integer as 8 big-endian bytes.
pub fn encode_u64(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Decodes 8 big-endian bytes into an unsigned 64-bit integer.
pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::InvalidData(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Encodes a signed 64-bit integer as 8 big-endian bytes.
pub fn encode_i64(n: i64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Decodes 8 big-endian bytes into a signed 64-bit integer.
pub fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::InvalidData(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(i64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_roundtrip() -> Result<()> {
        for n in [1_u64, 2, 123415, 17465798, 16583415634, 18446744073709551613, u64::MAX / 2] {
            assert_eq!(decode_u64(&encode_u64(n))?, n);
        }
        Ok(())
    }

    #[test]
    fn signed_roundtrip() -> Result<()> {
        for n in [1_i64, 2, 123415, 17465798, 16583415634, -1234169761, i64::MAX / 2] {
            assert_eq!(decode_i64(&encode_i64(n))?, n);
        }
        Ok(())
    }

    #[test]
    fn encoding_is_fixed_big_endian() {
        assert_eq!(encode_u64(1), *b"\x00\x00\x00\x00\x00\x00\x00\x01");
        assert_eq!(encode_i64(1), *b"\x00\x00\x00\x00\x00\x00\x00\x01");
        // Byte order must match numeric order.
        assert!(encode_u64(255) < encode_u64(256));
    }

    #[test]
    fn decode_rejects_wrong_width() {
        assert!(decode_u64(b"\x01\x02").is_err());
        assert!(decode_i64(b"123456789").is_err());
    }
}
