//! The engine key layout. The first byte of every key selects a key space:
//!
//! Byte | Space            | Remainder
//! -----|------------------|--------------------------------------------
//! `!`  | Descriptor       | user key
//! `a`  | String           | user key
//! `L`  | Lease            | user key
//! `b`  | Field            | escaped user key ‖ field
//! `c`  | Locality field   | escaped user key ‖ escaped hint ‖ field
//! `d`  | Locality index   | escaped user key ‖ field
//! `e`  | Expiration event | deadline (8-byte big-endian) ‖ user key
//! `~`  | Configuration    | setting name
//! `_`  | Internal         | metadata name (the leading `_` of `__format`
//!      |                  | and friends doubles as the type byte)
//!
//! User keys embedded before another component are escaped by replacing 0x00
//! with 0x00 0xff and terminated with 0x00 0x00, so that the field prefix of
//! one key can never be a prefix of another key's. The escaping preserves
//! lexicographical order.

use crate::encoding::binary;
use crate::error::{Error, Result};

/// Key space type bytes.
pub const DESCRIPTOR: u8 = b'!';
pub const STRING: u8 = b'a';
pub const LEASE: u8 = b'L';
pub const FIELD: u8 = b'b';
pub const LOCALITY_FIELD: u8 = b'c';
pub const LOCALITY_INDEX: u8 = b'd';
pub const EXPIRATION_EVENT: u8 = b'e';
pub const CONFIGURATION: u8 = b'~';

/// Internal metadata keys.
pub const FORMAT: &[u8] = b"__format";
pub const CLOCK: &[u8] = b"__clock";
pub const IN_BULKLOAD: &[u8] = b"__in-bulkload";
pub const LAST_APPLIED: &[u8] = b"__last-applied";

/// The currently supported value of the __format key.
pub const FORMAT_VALUE: &[u8] = b"0";

/// Escapes a byte string for embedding in a composite key: 0x00 becomes
/// 0x00 0xff, and the string is terminated by 0x00 0x00.
fn escape(input: &[u8], out: &mut Vec<u8>) {
    for &b in input {
        out.push(b);
        if b == 0x00 {
            out.push(0xff);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

/// Prepends a type byte to a user key.
fn tagged(space: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(space);
    out.extend_from_slice(key);
    out
}

/// The descriptor key of a user key.
pub fn descriptor(key: &[u8]) -> Vec<u8> {
    tagged(DESCRIPTOR, key)
}

/// Extracts the user key from a descriptor key, if it is one.
pub fn descriptor_user_key(engine_key: &[u8]) -> Option<&[u8]> {
    engine_key.strip_prefix(&[DESCRIPTOR])
}

/// The string value key of a user key.
pub fn string(key: &[u8]) -> Vec<u8> {
    tagged(STRING, key)
}

/// The lease value key of a user key.
pub fn lease(key: &[u8]) -> Vec<u8> {
    tagged(LEASE, key)
}

/// The prefix under which all fields of a collection key are stored.
pub fn field_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + key.len());
    out.push(FIELD);
    escape(key, &mut out);
    out
}

/// The engine key of a single field of a collection key.
pub fn field(key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = field_prefix(key);
    out.extend_from_slice(field);
    out
}

/// The prefix under which all locality-hash fields of a key are stored.
pub fn locality_field_root(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + key.len());
    out.push(LOCALITY_FIELD);
    escape(key, &mut out);
    out
}

/// The prefix of the locality-hash fields of a key under one hint.
pub fn locality_field_prefix(key: &[u8], hint: &[u8]) -> Vec<u8> {
    let mut out = locality_field_root(key);
    escape(hint, &mut out);
    out
}

/// The engine key of a locality-hash field body under a hint.
pub fn locality_field(key: &[u8], hint: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = locality_field_prefix(key, hint);
    out.extend_from_slice(field);
    out
}

/// The prefix under which a key's locality-hash index entries are stored.
pub fn locality_index_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + key.len());
    out.push(LOCALITY_INDEX);
    escape(key, &mut out);
    out
}

/// The engine key of a locality-hash index entry (field → current hint).
pub fn locality_index(key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = locality_index_prefix(key);
    out.extend_from_slice(field);
    out
}

/// The engine key of an expiration event. Events sort by deadline first, so
/// a scan from the start of the space visits them in expiration order.
pub fn expiration_event(deadline: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + key.len());
    out.push(EXPIRATION_EVENT);
    out.extend_from_slice(&binary::encode_u64(deadline));
    out.extend_from_slice(key);
    out
}

/// Splits an expiration event key into deadline and user key.
pub fn parse_expiration_event(engine_key: &[u8]) -> Result<(u64, &[u8])> {
    let rest = engine_key
        .strip_prefix(&[EXPIRATION_EVENT])
        .filter(|rest| rest.len() >= 8)
        .ok_or_else(|| Error::InvalidData("malformed expiration event key".to_string()))?;
    Ok((binary::decode_u64(&rest[..8])?, &rest[8..]))
}

/// The engine key of a configuration setting.
pub fn configuration(name: &[u8]) -> Vec<u8> {
    tagged(CONFIGURATION, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_prefixes_cannot_collide() {
        // A key ending where another begins must not produce the same field
        // prefix, even with embedded zero bytes.
        let a = field(b"ab", b"c");
        let b = field(b"a", b"bc");
        assert_ne!(a, b);

        let a = field(b"a\x00", b"f");
        let b = field(b"a", b"\x00f");
        assert_ne!(a, b);
        assert!(!a.starts_with(&field_prefix(b"a")));
    }

    #[test]
    fn expiration_events_sort_by_deadline() -> Result<()> {
        let early = expiration_event(1000, b"zzz");
        let late = expiration_event(1001, b"aaa");
        assert!(early < late);

        let (deadline, key) = parse_expiration_event(&early)?;
        assert_eq!(deadline, 1000);
        assert_eq!(key, b"zzz");
        Ok(())
    }

    #[test]
    fn internal_keys_share_the_internal_space() {
        // The leading underscore of internal metadata keys is their type
        // byte; none of them may collide with another space.
        for key in [FORMAT, CLOCK, IN_BULKLOAD, LAST_APPLIED] {
            assert_eq!(key[0], b'_');
        }
    }
}
