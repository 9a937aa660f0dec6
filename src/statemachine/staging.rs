use super::keys;
use crate::error::Result;
use crate::storage::{Engine, ReadView, ScanIterator, WriteBatch};

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::MutexGuard;

/// Read access shared by write and read staging areas: point lookups and
/// ordered scans. Reads through a write staging area see its own pending
/// writes layered over the engine.
pub trait StagingRead {
    /// Gets a value for a key, if it exists.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns true if the key exists.
    fn exists(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterates in ascending key order starting at the given key (inclusive).
    fn scan_from(&mut self, start: &[u8]) -> Box<dyn ScanIterator + '_>;

    /// Iterates over all key/value pairs starting with prefix.
    fn scan_prefix(&mut self, prefix: &[u8]) -> Box<dyn ScanIterator + '_> {
        let prefix = prefix.to_vec();
        Box::new(
            self.scan_from(&prefix.clone())
                .take_while(move |r| r.as_ref().map_or(true, |(k, _)| k.starts_with(&prefix))),
        )
    }
}

/// A write staging area: a pending-write overlay on top of the engine. All
/// mutations of a single journal entry (which may be a multi-command
/// transaction) accumulate here and are committed as one atomic engine batch
/// together with the last-applied marker.
///
/// Holding the engine lock for the lifetime of the staging area is what
/// serializes writers; StateMachine::begin_write() hands these out.
pub struct WriteStaging<'a> {
    pub(super) engine: MutexGuard<'a, Box<dyn Engine>>,
    /// Pending writes, keyed by engine key. None marks a deletion.
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// In bulk-load mode reads are disabled and descriptor writes dropped;
    /// finalize_bulkload() rebuilds all descriptors in one pass.
    bulkload: bool,
}

impl<'a> WriteStaging<'a> {
    pub(super) fn new(engine: MutexGuard<'a, Box<dyn Engine>>, bulkload: bool) -> Self {
        Self { engine, overlay: BTreeMap::new(), bulkload }
    }

    /// Stages a put.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>) {
        if self.bulkload && key.first() == Some(&keys::DESCRIPTOR) {
            return;
        }
        self.overlay.insert(key.to_vec(), Some(value));
    }

    /// Stages a deletion.
    pub fn del(&mut self, key: &[u8]) {
        assert!(!self.bulkload, "no deletions allowed during bulk load");
        self.overlay.insert(key.to_vec(), None);
    }

    /// Converts the staged writes into an engine batch, in key order.
    pub(super) fn into_batch(self) -> (MutexGuard<'a, Box<dyn Engine>>, WriteBatch) {
        let mut batch = WriteBatch::new();
        for (key, value) in self.overlay {
            match value {
                Some(value) => batch.put(&key, value),
                None => batch.delete(&key),
            }
        }
        (self.engine, batch)
    }
}

impl StagingRead for WriteStaging<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.bulkload {
            // No reads during bulk-load mode.
            return Ok(None);
        }
        match self.overlay.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.engine.get(key),
        }
    }

    fn scan_from(&mut self, start: &[u8]) -> Box<dyn ScanIterator + '_> {
        if self.bulkload {
            return Box::new(std::iter::empty());
        }
        let engine = self.engine.scan_from(start).peekable();
        let overlay =
            self.overlay.range((Bound::Included(start.to_vec()), Bound::Unbounded)).peekable();
        Box::new(MergedScan { engine, overlay })
    }
}

/// A read staging area: an engine snapshot, so that readers don't block
/// writers.
pub struct ReadStaging {
    view: Box<dyn ReadView>,
}

impl ReadStaging {
    pub(super) fn new(view: Box<dyn ReadView>) -> Self {
        Self { view }
    }
}

impl StagingRead for ReadStaging {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.view.get(key)
    }

    fn scan_from(&mut self, start: &[u8]) -> Box<dyn ScanIterator + '_> {
        self.view.scan_from(start)
    }
}

/// Merges an engine scan with the staged overlay. On equal keys the overlay
/// wins; staged deletions suppress engine entries.
struct MergedScan<'a> {
    engine: Peekable<Box<dyn ScanIterator + 'a>>,
    overlay: Peekable<btree_map::Range<'a, Vec<u8>, Option<Vec<u8>>>>,
}

impl Iterator for MergedScan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Find out which side is next. Errors surface immediately.
            let engine_key = match self.engine.peek() {
                Some(Ok((key, _))) => Some(key.clone()),
                Some(Err(_)) => return self.engine.next(),
                None => None,
            };
            let overlay_key = self.overlay.peek().map(|(key, _)| (*key).clone());

            match (engine_key, overlay_key) {
                (None, None) => return None,
                (Some(_), None) => return self.engine.next(),
                (engine, Some(overlay)) => {
                    if let Some(engine) = engine {
                        if engine < overlay {
                            return self.engine.next();
                        }
                        if engine == overlay {
                            self.engine.next();
                        }
                    }
                    match self.overlay.next() {
                        Some((key, Some(value))) => return Some(Ok((key.clone(), value.clone()))),
                        // A staged deletion: skip and continue.
                        Some((_, None)) => continue,
                        None => unreachable!("peeked overlay entry disappeared"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    use std::sync::Mutex;

    fn collect(iter: Box<dyn ScanIterator + '_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        iter.collect()
    }

    #[test]
    fn overlay_reads_and_scans() -> Result<()> {
        let engine: Mutex<Box<dyn Engine>> = Mutex::new(Box::new(Memory::new()));
        {
            let mut guard = engine.lock()?;
            guard.set(b"a", vec![1])?;
            guard.set(b"b", vec![2])?;
            guard.set(b"d", vec![4])?;
        }

        let mut staging = WriteStaging::new(engine.lock()?, false);
        staging.put(b"c", vec![3]);
        staging.put(b"a", vec![9]);
        staging.del(b"b");

        // Reads see own writes.
        assert_eq!(staging.get(b"a")?, Some(vec![9]));
        assert_eq!(staging.get(b"b")?, None);
        assert_eq!(staging.get(b"c")?, Some(vec![3]));
        assert_eq!(staging.get(b"d")?, Some(vec![4]));

        // Scans merge the overlay with the engine, in order.
        assert_eq!(
            collect(staging.scan_from(b"a"))?,
            vec![
                (b"a".to_vec(), vec![9]),
                (b"c".to_vec(), vec![3]),
                (b"d".to_vec(), vec![4]),
            ]
        );

        // The engine is untouched until commit.
        let (mut guard, batch) = staging.into_batch();
        assert_eq!(guard.get(b"a")?, Some(vec![1]));
        assert_eq!(batch.len(), 3);
        Ok(())
    }
}
