use crate::encoding::bincode;
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// The datatype of a user key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    String,
    Hash,
    Set,
    Deque,
    Lease,
    LocalityHash,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::String => write!(f, "string"),
            KeyType::Hash => write!(f, "hash"),
            KeyType::Set => write!(f, "set"),
            KeyType::Deque => write!(f, "deque"),
            KeyType::Lease => write!(f, "lease"),
            KeyType::LocalityHash => write!(f, "locality-hash"),
        }
    }
}

/// A deque end. Pushing front allocates indexes downwards, pushing back
/// upwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Front,
    Back,
}

impl Direction {
    /// The index step of this direction: -1 for front, +1 for back.
    pub fn step(self) -> i64 {
        match self {
            Direction::Front => -1,
            Direction::Back => 1,
        }
    }

    /// The opposite end.
    pub fn flip(self) -> Self {
        match self {
            Direction::Front => Direction::Back,
            Direction::Back => Direction::Front,
        }
    }
}

/// Per-key metadata, stored in the descriptor key space. A descriptor exists
/// if and only if the key holds at least one field (or a value, for strings
/// and leases); deleting the last field deletes the descriptor.
///
/// start_index/end_index are overloaded by key type: for deques they are the
/// exclusive outer bounds of the allocated field indexes (so that
/// size = end - start - 1), for leases they hold the acquisition and expiry
/// clock values. Other types leave them at zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    key_type: KeyType,
    size: i64,
    start_index: u64,
    end_index: u64,
}

/// Deque index allocation starts in the middle of the unsigned range, leaving
/// room to grow in both directions.
const DEQUE_ORIGIN: u64 = u64::MAX / 2;

impl KeyDescriptor {
    /// Creates a fresh descriptor for a key of the given type, with no
    /// fields. Deque indexes start out centered.
    pub fn new(key_type: KeyType) -> Self {
        let (start_index, end_index) = match key_type {
            KeyType::Deque => (DEQUE_ORIGIN, DEQUE_ORIGIN),
            _ => (0, 0),
        };
        Self { key_type, size: 0, start_index, end_index }
    }

    /// Decodes a descriptor from its stored representation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Encodes the descriptor for storage.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn set_size(&mut self, size: i64) {
        self.size = size;
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn end_index(&self) -> u64 {
        self.end_index
    }

    pub fn set_start_index(&mut self, index: u64) {
        self.start_index = index;
    }

    pub fn set_end_index(&mut self, index: u64) {
        self.end_index = index;
    }

    /// Returns the outer allocated index at the given deque end.
    pub fn deque_index(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Front => self.start_index,
            Direction::Back => self.end_index,
        }
    }

    /// Sets the outer allocated index at the given deque end.
    pub fn set_deque_index(&mut self, direction: Direction, index: u64) {
        match direction {
            Direction::Front => self.start_index = index,
            Direction::Back => self.end_index = index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip() -> Result<()> {
        let mut desc = KeyDescriptor::new(KeyType::Deque);
        desc.set_size(3);
        desc.set_deque_index(Direction::Front, DEQUE_ORIGIN - 2);
        desc.set_deque_index(Direction::Back, DEQUE_ORIGIN + 2);
        assert_eq!(KeyDescriptor::decode(&desc.encode())?, desc);
        Ok(())
    }

    #[test]
    fn deque_size_invariant() {
        // With both ends exclusive, an empty deque has end - start - 1 == -1
        // only transiently; after the first insert the opposite end is moved
        // so that size = end - start - 1 holds.
        let mut desc = KeyDescriptor::new(KeyType::Deque);
        let index = desc.deque_index(Direction::Back);
        desc.set_deque_index(Direction::Back, index + 1);
        desc.set_deque_index(Direction::Front, index - 1);
        assert_eq!(desc.end_index() - desc.start_index() - 1, 1);
    }
}
