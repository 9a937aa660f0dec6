use super::{Engine, ReadView, ScanIterator, Status, WriteBatch};
use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::ops::Bound;

/// A volatile engine backed by a plain standard-library B-tree map; nothing
/// survives a restart. Snapshots clone the entire map, which is fine for
/// the tests and throwaway deployments this engine is intended for.
#[derive(Default)]
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Engine for Memory {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn write(&mut self, batch: WriteBatch, _sync: bool) -> Result<()> {
        for (key, value) in batch.ops {
            match value {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_from(&mut self, start: &[u8]) -> Box<dyn ScanIterator + '_> {
        Box::new(
            self.data
                .range((Bound::Included(start.to_vec()), Bound::Unbounded))
                .map(|(k, v)| Ok((k.clone(), v.clone()))),
        )
    }

    fn snapshot(&mut self) -> Box<dyn ReadView> {
        Box::new(MemorySnapshot { data: self.data.clone() })
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn checkpoint(&mut self, _path: &std::path::Path) -> Result<()> {
        Err(Error::InvalidInput("checkpoint requires a disk-backed engine".to_string()))
    }

    fn compact(&mut self) -> Result<()> {
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().fold(0, |size, (k, v)| size + k.len() as u64 + v.len() as u64),
            total_disk_size: 0,
            live_disk_size: 0,
            garbage_disk_size: 0,
        })
    }
}

/// A point-in-time copy of a Memory engine.
struct MemorySnapshot {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ReadView for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan_from(&self, start: &[u8]) -> Box<dyn ScanIterator + '_> {
        Box::new(
            self.data
                .range((Bound::Included(start.to_vec()), Bound::Unbounded))
                .map(|(k, v)| Ok((k.clone(), v.clone()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    super::super::engine::tests::test_engine!(Memory::new());
}
