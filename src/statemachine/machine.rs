use super::descriptor::{Direction, KeyDescriptor, KeyType};
use super::keys;
use super::pattern::Pattern;
use super::staging::{ReadStaging, StagingRead, WriteStaging};
use super::timekeeper::{ClockValue, Timekeeper};
use crate::encoding::binary;
use crate::error::{Error, Result};
use crate::raft::LogIndex;
use crate::storage::Engine;

use log::{info, warn};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// The replicated state machine: a typed key/value service over an ordered
/// engine, applying each journal entry at most once.
///
/// All writes of one journal entry go through a single WriteStaging, whose
/// commit atomically applies the staged batch together with the new
/// last-applied index. Writers serialize behind the engine lock (held by the
/// staging area); readers take an engine snapshot and proceed without
/// blocking writers.
pub struct StateMachine {
    engine: Mutex<Box<dyn Engine>>,
    applied: Mutex<LogIndex>,
    applied_cv: Condvar,
    timekeeper: Timekeeper,
    bulkload: bool,
}

/// Information about a held lease.
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseInfo {
    pub holder: Vec<u8>,
    pub acquired: ClockValue,
    pub expires: ClockValue,
}

/// The outcome of a lease acquisition. A type conflict on the key is
/// reported as Error::WrongType instead.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaseAcquisition {
    /// The lease was newly acquired.
    Acquired(LeaseInfo),
    /// The holder already held the lease; its deadline was extended.
    Renewed(LeaseInfo),
    /// Another holder owns the lease; its current state is returned.
    FailedDueToOtherOwner(LeaseInfo),
}

impl StateMachine {
    /// Opens a state machine over the given engine. With bulkload set, the
    /// engine must be freshly initialized; descriptor maintenance is then
    /// deferred until finalize_bulkload().
    pub fn open(engine: Box<dyn Engine>, bulkload: bool) -> Result<Self> {
        let mut engine = engine;

        let fresh = engine.get(keys::FORMAT)?.is_none();
        match engine.get(keys::FORMAT)? {
            None => engine.set(keys::FORMAT, keys::FORMAT_VALUE.to_vec())?,
            Some(format) if format == keys::FORMAT_VALUE => {}
            Some(format) => {
                return Err(Error::InvalidData(format!(
                    "unsupported state machine format {format:?}, expected {:?}",
                    keys::FORMAT_VALUE
                )))
            }
        }

        // A state machine left in bulk-load mode by a crash must not be
        // opened normally: its descriptors have never been built.
        let in_bulkload = engine.get(keys::IN_BULKLOAD)?.is_some();
        if in_bulkload && !bulkload {
            return Err(Error::InvalidData(
                "state machine is in bulk-load mode and was never finalized".to_string(),
            ));
        }
        if bulkload {
            if !fresh {
                return Err(Error::InvalidData(
                    "bulk load is only available for newly initialized state machines".to_string(),
                ));
            }
            warn!("Opening state machine in bulk-load mode");
            engine.set(keys::IN_BULKLOAD, b"1".to_vec())?;
        }

        let applied = match engine.get(keys::LAST_APPLIED)? {
            Some(value) => binary::decode_i64(&value)?,
            None => 0,
        };
        let clock = match engine.get(keys::CLOCK)? {
            Some(value) => binary::decode_u64(&value)?,
            None => 0,
        };
        info!("Opened state machine at last-applied {applied}, clock {clock}");

        Ok(Self {
            engine: Mutex::new(engine),
            applied: Mutex::new(applied),
            applied_cv: Condvar::new(),
            timekeeper: Timekeeper::new(clock),
            bulkload,
        })
    }

    /// Begins a write staging area, serializing behind other writers.
    pub fn begin_write(&self) -> WriteStaging<'_> {
        WriteStaging::new(self.engine.lock().expect("lock poisoned"), self.bulkload)
    }

    /// Begins a read staging area over an engine snapshot.
    pub fn begin_read(&self) -> ReadStaging {
        ReadStaging::new(self.engine.lock().expect("lock poisoned").snapshot())
    }

    /// Commits a write staging area at the given journal index, atomically
    /// advancing last-applied. An index of 0 or below marks an out-of-band
    /// write (standalone mode, bulk load), which never advances last-applied
    /// and is only permitted while it is still 0.
    pub fn commit(&self, staging: WriteStaging, index: LogIndex) -> Result<()> {
        let mut applied = self.applied.lock()?;
        if index > 0 {
            assert_eq!(index, *applied + 1, "out-of-order apply of journal entry");
        } else {
            assert_eq!(*applied, 0, "out-of-band write after journal entries were applied");
        }

        let (mut engine, mut batch) = staging.into_batch();
        if index > 0 {
            batch.put(keys::LAST_APPLIED, binary::encode_i64(index).to_vec());
        }
        engine.write(batch, false)?;
        drop(engine);

        if index > 0 {
            *applied = index;
            self.applied_cv.notify_all();
        }
        Ok(())
    }

    /// Returns the last applied journal index.
    pub fn last_applied(&self) -> LogIndex {
        *self.applied.lock().expect("lock poisoned")
    }

    /// Blocks until last-applied reaches the target index or the timeout
    /// elapses, returning the reached value.
    pub fn wait_for_applied(&self, target: LogIndex, timeout: Duration) -> LogIndex {
        let mut applied = self.applied.lock().expect("lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while *applied < target {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) =
                self.applied_cv.wait_timeout(applied, deadline - now).expect("lock poisoned");
            applied = guard;
        }
        *applied
    }

    /// Returns the current dynamic clock value.
    pub fn dynamic_clock(&self) -> ClockValue {
        self.timekeeper.current_time()
    }

    // ----- Descriptor helpers ------------------------------------------------

    fn descriptor(staging: &mut dyn StagingRead, key: &[u8]) -> Result<Option<KeyDescriptor>> {
        staging.get(&keys::descriptor(key))?.as_deref().map(KeyDescriptor::decode).transpose()
    }

    /// Fetches a key's descriptor, requiring the given type if the key
    /// exists.
    fn expect_type(
        staging: &mut dyn StagingRead,
        key: &[u8],
        key_type: KeyType,
    ) -> Result<Option<KeyDescriptor>> {
        match Self::descriptor(staging, key)? {
            Some(desc) if desc.key_type() != key_type => Err(Error::WrongType),
            desc => Ok(desc),
        }
    }

    // ----- String and generic operations -------------------------------------

    /// Returns the datatype of a key, if it exists.
    pub fn key_type(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<Option<KeyType>> {
        Ok(Self::descriptor(staging, key)?.map(|desc| desc.key_type()))
    }

    /// Gets a string value.
    pub fn get(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if Self::expect_type(staging, key, KeyType::String)?.is_none() {
            return Ok(None);
        }
        staging.get(&keys::string(key))
    }

    /// Sets a string value.
    pub fn set(&self, staging: &mut WriteStaging, key: &[u8], value: &[u8]) -> Result<()> {
        let mut op = WriteOperation::new(staging, key, KeyType::String)?;
        op.write_value(value.to_vec());
        op.finalize(value.len() as i64);
        Ok(())
    }

    /// Counts how many of the given keys exist. Duplicates count twice.
    pub fn exists(&self, staging: &mut dyn StagingRead, keys: &[Vec<u8>]) -> Result<i64> {
        let mut count = 0;
        for key in keys {
            if Self::descriptor(staging, key)?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Deletes the given keys with all their fields, returning how many
    /// existed.
    pub fn del(&self, staging: &mut WriteStaging, del_keys: &[Vec<u8>]) -> Result<i64> {
        let mut removed = 0;
        for key in del_keys {
            let Some(desc) = Self::descriptor(staging, key)? else { continue };

            match desc.key_type() {
                KeyType::String => staging.del(&keys::string(key)),
                KeyType::Lease => {
                    staging.del(&keys::lease(key));
                    staging.del(&keys::expiration_event(desc.end_index(), key));
                }
                KeyType::Hash | KeyType::Set | KeyType::Deque => {
                    let count = Self::del_prefix(staging, &keys::field_prefix(key))?;
                    assert_eq!(count, desc.size(), "descriptor size out of sync with fields");
                }
                KeyType::LocalityHash => {
                    let count = Self::del_prefix(staging, &keys::locality_field_root(key))?;
                    assert_eq!(count, desc.size(), "descriptor size out of sync with fields");
                    let count = Self::del_prefix(staging, &keys::locality_index_prefix(key))?;
                    assert_eq!(count, desc.size(), "descriptor size out of sync with indexes");
                }
            }

            staging.del(&keys::descriptor(key));
            removed += 1;
        }
        Ok(removed)
    }

    /// Deletes everything under a prefix, returning the number of deleted
    /// keys.
    fn del_prefix(staging: &mut WriteStaging, prefix: &[u8]) -> Result<i64> {
        let victims: Vec<Vec<u8>> =
            staging.scan_prefix(prefix).map(|r| r.map(|(k, _)| k)).collect::<Result<_>>()?;
        let removed = victims.len() as i64;
        for victim in victims {
            staging.del(&victim);
        }
        Ok(removed)
    }

    /// Returns all user keys matching the given glob pattern.
    pub fn keys(&self, staging: &mut dyn StagingRead, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        let pattern = Pattern::compile(pattern)?;
        let mut prefix = vec![keys::DESCRIPTOR];
        prefix.extend_from_slice(pattern.prefix());

        let mut result = Vec::new();
        let mut scan = staging.scan_prefix(&prefix);
        while let Some((engine_key, _)) = scan.next().transpose()? {
            let key = keys::descriptor_user_key(&engine_key).expect("scanned non-descriptor key");
            if pattern.matches_all() || pattern.matches(key) {
                result.push(key.to_vec());
            }
        }
        Ok(result)
    }

    /// Cursored variant of keys(): iterates at most count descriptors
    /// starting at the cursor, returning matches and the next cursor (None
    /// when the scan is done). The pattern's literal prefix bounds the scan,
    /// so patterns like `fixed-prefix-*` only ever visit their matches.
    pub fn scan(
        &self,
        staging: &mut dyn StagingRead,
        cursor: &[u8],
        pattern: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>)> {
        let pattern = Pattern::compile(pattern)?;
        let start = keys::descriptor(if cursor.is_empty() { pattern.prefix() } else { cursor });
        let mut prefix = vec![keys::DESCRIPTOR];
        prefix.extend_from_slice(pattern.prefix());

        let mut results = Vec::new();
        let mut iterations = 0;
        let mut scan = staging.scan_from(&start);
        while let Some((engine_key, _)) = scan.next().transpose()? {
            if !engine_key.starts_with(&prefix) {
                // No more matches can possibly exist.
                break;
            }
            let key = keys::descriptor_user_key(&engine_key).expect("checked prefix above");

            iterations += 1;
            if iterations > count {
                return Ok((Some(key.to_vec()), results));
            }
            if pattern.matches_all() || pattern.matches(key) {
                results.push(key.to_vec());
            }
        }
        Ok((None, results))
    }

    /// Deletes all user data, preserving internal metadata and the clock.
    pub fn flushall(&self, staging: &mut WriteStaging) -> Result<()> {
        let victims: Vec<Vec<u8>> = staging
            .scan_from(b"")
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|k| !k.starts_with(b"_") && !k.starts_with(&[keys::CONFIGURATION]))
            .collect();
        for victim in victims {
            staging.del(&victim);
        }
        Ok(())
    }

    // ----- Hashes -------------------------------------------------------------

    /// Gets a hash field.
    pub fn hget(
        &self,
        staging: &mut dyn StagingRead,
        key: &[u8],
        field: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if Self::expect_type(staging, key, KeyType::Hash)?.is_none() {
            return Ok(None);
        }
        staging.get(&keys::field(key, field))
    }

    /// Returns true if a hash field exists.
    pub fn hexists(&self, staging: &mut dyn StagingRead, key: &[u8], field: &[u8]) -> Result<bool> {
        Ok(self.hget(staging, key, field)?.is_some())
    }

    /// Returns all field names of a hash, in order.
    pub fn hkeys(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.hgetall(staging, key)?.into_iter().map(|(field, _)| field).collect())
    }

    /// Returns all field values of a hash, in field order.
    pub fn hvals(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.hgetall(staging, key)?.into_iter().map(|(_, value)| value).collect())
    }

    /// Returns all fields and values of a hash, in field order.
    pub fn hgetall(
        &self,
        staging: &mut dyn StagingRead,
        key: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if Self::expect_type(staging, key, KeyType::Hash)?.is_none() {
            return Ok(Vec::new());
        }
        Self::scan_fields(staging, key)
    }

    fn scan_fields(
        staging: &mut dyn StagingRead,
        key: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = keys::field_prefix(key);
        staging
            .scan_prefix(&prefix)
            .map(|r| r.map(|(k, v)| (k[prefix.len()..].to_vec(), v)))
            .collect()
    }

    /// Returns the number of fields in a hash.
    pub fn hlen(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<i64> {
        Ok(Self::expect_type(staging, key, KeyType::Hash)?.map_or(0, |desc| desc.size()))
    }

    /// Cursored iteration over hash fields. An empty cursor starts at the
    /// beginning; the returned cursor is the next unvisited field, or None
    /// when the scan is done.
    pub fn hscan(
        &self,
        staging: &mut dyn StagingRead,
        key: &[u8],
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<(Vec<u8>, Vec<u8>)>)> {
        if Self::expect_type(staging, key, KeyType::Hash)?.is_none() {
            return Ok((None, Vec::new()));
        }
        Self::scan_fields_cursor(staging, key, cursor, count)
    }

    fn scan_fields_cursor(
        staging: &mut dyn StagingRead,
        key: &[u8],
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<(Vec<u8>, Vec<u8>)>)> {
        let prefix = keys::field_prefix(key);
        let mut start = prefix.clone();
        start.extend_from_slice(cursor);

        let mut results = Vec::new();
        let mut scan = staging.scan_from(&start);
        while let Some((engine_key, value)) = scan.next().transpose()? {
            if !engine_key.starts_with(&prefix) {
                break;
            }
            let field = engine_key[prefix.len()..].to_vec();
            if results.len() >= count {
                return Ok((Some(field), results));
            }
            results.push((field, value));
        }
        Ok((None, results))
    }

    /// Sets a hash field, returning true if the field was created.
    pub fn hset(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        let created = !op.field_exists(field)?;
        op.write_field(field, value.to_vec());
        let size = op.size() + created as i64;
        op.finalize(size);
        Ok(created)
    }

    /// Sets multiple hash fields.
    pub fn hmset(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        pairs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        let mut created = 0;
        for (field, value) in pairs {
            if !op.field_exists(field)? {
                created += 1;
            }
            op.write_field(field, value.clone());
        }
        let size = op.size() + created;
        op.finalize(size);
        Ok(())
    }

    /// Sets a hash field only if it does not exist, returning whether it was
    /// set.
    pub fn hsetnx(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if op.field_exists(field)? {
            op.cancel();
            return Ok(false);
        }
        op.write_field(field, value.to_vec());
        let size = op.size() + 1;
        op.finalize(size);
        Ok(true)
    }

    /// Deletes hash fields, returning how many existed.
    pub fn hdel(&self, staging: &mut WriteStaging, key: &[u8], fields: &[Vec<u8>]) -> Result<i64> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        let mut removed = 0;
        for field in fields {
            if op.delete_field(field)? {
                removed += 1;
            }
        }
        let size = op.size() - removed;
        op.finalize(size);
        Ok(removed)
    }

    /// Increments an integer hash field, returning the new value. The stored
    /// value must parse as a decimal integer.
    pub fn hincrby(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        field: &[u8],
        increment: i64,
    ) -> Result<i64> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        let current = match op.get_field(field)? {
            Some(value) => match parse_i64(&value) {
                Some(n) => Some(n),
                None => {
                    op.cancel();
                    return Err(Error::InvalidInput(
                        "hash value is not an integer or out of range".to_string(),
                    ));
                }
            },
            None => None,
        };
        let Some(result) = current.unwrap_or(0).checked_add(increment) else {
            op.cancel();
            return Err(Error::InvalidInput("increment or decrement would overflow".to_string()));
        };
        op.write_field(field, result.to_string().into_bytes());
        let size = op.size() + current.is_none() as i64;
        op.finalize(size);
        Ok(result)
    }

    /// Increments a floating-point hash field, returning the new value.
    pub fn hincrbyfloat(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        field: &[u8],
        increment: f64,
    ) -> Result<f64> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        let current = match op.get_field(field)? {
            Some(value) => match parse_f64(&value) {
                Some(n) => Some(n),
                None => {
                    op.cancel();
                    return Err(Error::InvalidInput(
                        "hash value is not a float".to_string(),
                    ));
                }
            },
            None => None,
        };
        let result = current.unwrap_or(0.0) + increment;
        op.write_field(field, format!("{result}").into_bytes());
        let size = op.size() + current.is_none() as i64;
        op.finalize(size);
        Ok(result)
    }

    /// Copies a hash to a new key. The target must not exist; an empty
    /// source is a no-op.
    pub fn hclone(&self, staging: &mut WriteStaging, source: &[u8], target: &[u8]) -> Result<()> {
        let mut op = WriteOperation::new(staging, target, KeyType::Hash)?;
        if op.key_exists() {
            op.cancel();
            return Err(Error::InvalidInput("target key already exists, will not overwrite".into()));
        }
        op.cancel();

        match Self::expect_type(staging, source, KeyType::Hash)? {
            None => Ok(()),
            Some(desc) => {
                let fields = Self::scan_fields(staging, source)?;
                assert_eq!(fields.len() as i64, desc.size(), "descriptor size out of sync");

                let mut op = WriteOperation::new(staging, target, KeyType::Hash)?;
                let size = fields.len() as i64;
                for (field, value) in fields {
                    op.write_field(&field, value);
                }
                op.finalize(size);
                Ok(())
            }
        }
    }

    // ----- Sets ---------------------------------------------------------------

    /// Adds elements to a set, returning how many were newly added.
    pub fn sadd(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        elements: &[Vec<u8>],
    ) -> Result<i64> {
        let mut op = WriteOperation::new(staging, key, KeyType::Set)?;
        let mut added = 0;
        for element in elements {
            if !op.field_exists(element)? {
                op.write_field(element, b"1".to_vec());
                added += 1;
            }
        }
        let size = op.size() + added;
        op.finalize(size);
        Ok(added)
    }

    /// Removes elements from a set, returning how many existed.
    pub fn srem(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        elements: &[Vec<u8>],
    ) -> Result<i64> {
        let mut op = WriteOperation::new(staging, key, KeyType::Set)?;
        let mut removed = 0;
        for element in elements {
            if op.delete_field(element)? {
                removed += 1;
            }
        }
        let size = op.size() - removed;
        op.finalize(size);
        Ok(removed)
    }

    /// Returns true if the element is a member of the set.
    pub fn sismember(
        &self,
        staging: &mut dyn StagingRead,
        key: &[u8],
        element: &[u8],
    ) -> Result<bool> {
        if Self::expect_type(staging, key, KeyType::Set)?.is_none() {
            return Ok(false);
        }
        staging.exists(&keys::field(key, element))
    }

    /// Returns all members of a set, in order.
    pub fn smembers(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        if Self::expect_type(staging, key, KeyType::Set)?.is_none() {
            return Ok(Vec::new());
        }
        Ok(Self::scan_fields(staging, key)?.into_iter().map(|(member, _)| member).collect())
    }

    /// Returns the cardinality of a set.
    pub fn scard(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<i64> {
        Ok(Self::expect_type(staging, key, KeyType::Set)?.map_or(0, |desc| desc.size()))
    }

    /// Cursored iteration over set members; see hscan().
    pub fn sscan(
        &self,
        staging: &mut dyn StagingRead,
        key: &[u8],
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>)> {
        if Self::expect_type(staging, key, KeyType::Set)?.is_none() {
            return Ok((None, Vec::new()));
        }
        let (next, pairs) = Self::scan_fields_cursor(staging, key, cursor, count)?;
        Ok((next, pairs.into_iter().map(|(member, _)| member).collect()))
    }

    /// Moves an element between sets, returning true if it was moved.
    pub fn smove(
        &self,
        staging: &mut WriteStaging,
        source: &[u8],
        destination: &[u8],
        element: &[u8],
    ) -> Result<bool> {
        // Check both types up front, so a type mismatch on the destination
        // doesn't leave a half-done move.
        Self::expect_type(staging, destination, KeyType::Set)?;
        let mut op = WriteOperation::new(staging, source, KeyType::Set)?;
        if !op.delete_field(element)? {
            op.cancel();
            return Ok(false);
        }
        let size = op.size() - 1;
        op.finalize(size);

        self.sadd(staging, destination, &[element.to_vec()])?;
        Ok(true)
    }

    // ----- Deques -------------------------------------------------------------

    /// Pushes elements onto one end of a deque, returning the new length.
    pub fn deque_push(
        &self,
        staging: &mut WriteStaging,
        direction: Direction,
        key: &[u8],
        elements: &[Vec<u8>],
    ) -> Result<i64> {
        let mut op = WriteOperation::new(staging, key, KeyType::Deque)?;
        let step = direction.step();
        let start = op.descriptor().deque_index(direction);
        for (i, element) in elements.iter().enumerate() {
            let index = start.wrapping_add_signed(step * i as i64);
            op.write_field(&binary::encode_u64(index), element.clone());
        }

        let added = elements.len() as i64;
        let outer = start.wrapping_add_signed(step * added);
        op.descriptor_mut().set_deque_index(direction, outer);
        // On first insert, the opposite bound moves one step past the other
        // side so that size = end - start - 1.
        if op.size() == 0 {
            op.descriptor_mut()
                .set_deque_index(direction.flip(), start.wrapping_add_signed(-step));
        }
        let length = op.size() + added;
        op.finalize(length);
        Ok(length)
    }

    /// Pops an element from one end of a deque.
    pub fn deque_pop(
        &self,
        staging: &mut WriteStaging,
        direction: Direction,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut op = WriteOperation::new(staging, key, KeyType::Deque)?;
        if op.size() == 0 {
            op.cancel();
            return Ok(None);
        }

        let outer = op.descriptor().deque_index(direction);
        let victim = outer.wrapping_add_signed(-direction.step());
        let field = binary::encode_u64(victim);
        let item = op.get_field(&field)?.expect("deque field missing");
        assert!(op.delete_field(&field)?, "deque field missing");
        op.descriptor_mut().set_deque_index(direction, victim);
        let size = op.size() - 1;
        op.finalize(size);
        Ok(Some(item))
    }

    /// Returns the length of a deque.
    pub fn deque_len(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<i64> {
        Ok(Self::expect_type(staging, key, KeyType::Deque)?.map_or(0, |desc| desc.size()))
    }

    /// Trims a deque from the front so that at most max_to_keep elements
    /// remain, returning how many were removed.
    pub fn deque_trim_front(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        max_to_keep: i64,
    ) -> Result<i64> {
        let mut op = WriteOperation::new(staging, key, KeyType::Deque)?;
        let to_remove = op.size() - max_to_keep;
        if to_remove <= 0 {
            op.cancel();
            return Ok(0);
        }

        let start = op.descriptor().start_index();
        for i in 1..=to_remove {
            let field = binary::encode_u64(start.wrapping_add_signed(i));
            assert!(op.delete_field(&field)?, "deque field missing");
        }
        op.descriptor_mut().set_start_index(start.wrapping_add_signed(to_remove));
        op.finalize(max_to_keep);
        Ok(to_remove)
    }

    // ----- Locality hashes ----------------------------------------------------

    /// Sets a locality-hash field under the given locality hint, returning
    /// true if the field was created. A changed hint relocates the stored
    /// field.
    pub fn lhset(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        field: &[u8],
        hint: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let mut op = WriteOperation::new(staging, key, KeyType::LocalityHash)?;
        let created = Self::lhset_in(&mut op, key, field, hint, value)?;
        let size = op.size() + created as i64;
        op.finalize(size);
        Ok(created)
    }

    /// Sets multiple locality-hash fields, given as (field, hint, value)
    /// triplets.
    pub fn lhmset(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        triplets: &[(Vec<u8>, Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        let mut op = WriteOperation::new(staging, key, KeyType::LocalityHash)?;
        let mut created = 0;
        for (field, hint, value) in triplets {
            created += Self::lhset_in(&mut op, key, field, hint, value)? as i64;
        }
        let size = op.size() + created;
        op.finalize(size);
        Ok(())
    }

    fn lhset_in(
        op: &mut WriteOperation,
        key: &[u8],
        field: &[u8],
        hint: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        match op.get_locality_index(field)? {
            Some(previous) if previous == hint => {
                op.write_locality_field(hint, field, value.to_vec());
                Ok(false)
            }
            Some(previous) => {
                // The hint changed: relocate the stored field.
                op.delete_locality_field(&previous, field)?;
                op.write_locality_field(hint, field, value.to_vec());
                op.write_locality_index(field, hint.to_vec());
                Ok(false)
            }
            None => {
                op.write_locality_field(hint, field, value.to_vec());
                op.write_locality_index(field, hint.to_vec());
                Ok(true)
            }
        }
    }

    /// Deletes locality-hash fields, returning how many existed.
    pub fn lhdel(&self, staging: &mut WriteStaging, key: &[u8], fields: &[Vec<u8>]) -> Result<i64> {
        let mut op = WriteOperation::new(staging, key, KeyType::LocalityHash)?;
        let mut removed = 0;
        for field in fields {
            if let Some(hint) = op.get_locality_index(field)? {
                op.delete_locality_index(field);
                assert!(op.delete_locality_field(&hint, field)?, "locality field missing");
                removed += 1;
            }
        }
        let size = op.size() - removed;
        op.finalize(size);
        Ok(removed)
    }

    /// Gets a locality-hash field. The hint is advisory: a correct hint hits
    /// directly, a wrong or missing one falls back to the field index.
    pub fn lhget(
        &self,
        staging: &mut dyn StagingRead,
        key: &[u8],
        field: &[u8],
        hint: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        if Self::expect_type(staging, key, KeyType::LocalityHash)?.is_none() {
            return Ok(None);
        }

        if let Some(hint) = hint {
            if let Some(value) = staging.get(&keys::locality_field(key, hint, field))? {
                return Ok(Some(value));
            }
        }
        let Some(actual) = staging.get(&keys::locality_index(key, field))? else {
            return Ok(None);
        };
        if let Some(hint) = hint {
            warn!(
                "Stale locality hint for field {}: given {}, actual {}",
                String::from_utf8_lossy(field),
                String::from_utf8_lossy(hint),
                String::from_utf8_lossy(&actual)
            );
        }
        staging.get(&keys::locality_field(key, &actual, field))
    }

    /// Returns the number of fields in a locality hash.
    pub fn lhlen(&self, staging: &mut dyn StagingRead, key: &[u8]) -> Result<i64> {
        Ok(Self::expect_type(staging, key, KeyType::LocalityHash)?.map_or(0, |desc| desc.size()))
    }

    // ----- Configuration ------------------------------------------------------

    /// Gets a configuration setting.
    pub fn config_get(&self, staging: &mut dyn StagingRead, name: &[u8]) -> Result<Option<Vec<u8>>> {
        staging.get(&keys::configuration(name))
    }

    /// Sets a configuration setting.
    pub fn config_set(&self, staging: &mut WriteStaging, name: &[u8], value: &[u8]) -> Result<()> {
        staging.put(&keys::configuration(name), value.to_vec());
        Ok(())
    }

    /// Returns all configuration settings as (name, value) pairs.
    pub fn config_getall(
        &self,
        staging: &mut dyn StagingRead,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        staging
            .scan_prefix(&[keys::CONFIGURATION])
            .map(|r| r.map(|(k, v)| (k[1..].to_vec(), v)))
            .collect()
    }

    // ----- Clock and leases ---------------------------------------------------

    /// Advances the persisted clock to the given value, releasing all leases
    /// whose deadline has passed. Panics if the clock would go backwards;
    /// ingested clock values must be filtered through maybe_advance_clock().
    pub fn advance_clock(&self, staging: &mut WriteStaging, new_value: ClockValue) -> Result<()> {
        let previous = Self::staged_clock(staging)?;
        assert!(previous <= new_value, "state machine clock went back: {previous} -> {new_value}");

        // Clear out any leases past the deadline, in expiration order.
        let expired: Vec<Vec<u8>> = staging
            .scan_prefix(&[keys::EXPIRATION_EVENT])
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .take_while(|k| {
                keys::parse_expiration_event(k).map_or(false, |(deadline, _)| deadline <= new_value)
            })
            .collect();
        for event in expired {
            let (_, key) = keys::parse_expiration_event(&event)?;
            let key = key.to_vec();
            let released = self.lease_release(staging, &key, 0)?;
            assert!(released, "expiration event without lease");
        }

        staging.put(keys::CLOCK, binary::encode_u64(new_value).to_vec());
        Ok(())
    }

    /// Reads the persisted clock through the staging area.
    fn staged_clock(staging: &mut WriteStaging) -> Result<ClockValue> {
        match StagingRead::get(staging, keys::CLOCK)? {
            Some(value) => binary::decode_u64(&value),
            None => Ok(0),
        }
    }

    /// Advances the clock if the ingested value is ahead of it, returning
    /// the effective clock value.
    pub fn maybe_advance_clock(
        &self,
        staging: &mut WriteStaging,
        clock_update: ClockValue,
    ) -> Result<ClockValue> {
        let current = Self::staged_clock(staging)?;
        if current < clock_update {
            self.advance_clock(staging, clock_update)?;
            return Ok(clock_update);
        }
        Ok(current)
    }

    /// Registers a committed clock value with the in-memory timekeeper. Must
    /// be called after the staging area carrying an advance_clock() commits.
    /// Values behind the clock are ignored.
    pub fn synchronize_clock(&self, value: ClockValue) {
        self.timekeeper.observe(value)
    }

    /// Acquires or extends a lease. The clock is advanced first, so an
    /// expired lease is released before the ownership check.
    pub fn lease_acquire(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        holder: &[u8],
        clock_update: ClockValue,
        duration: u64,
    ) -> Result<LeaseAcquisition> {
        assert!(!holder.is_empty(), "lease holder must not be empty");
        let now = self.maybe_advance_clock(staging, clock_update)?;

        let mut op = WriteOperation::new(staging, key, KeyType::Lease)?;
        if let Some(old_holder) = op.get_value()? {
            if old_holder != holder {
                let info = LeaseInfo {
                    holder: old_holder,
                    acquired: op.descriptor().start_index(),
                    expires: op.descriptor().end_index(),
                };
                op.cancel();
                return Ok(LeaseAcquisition::FailedDueToOtherOwner(info));
            }
        }

        // Either this is an extension by the same holder, or a new lease.
        let extended = op.key_exists();
        if extended {
            // Wipe out the old pending expiration event first.
            let old_event = keys::expiration_event(op.descriptor().end_index(), key);
            assert!(op.staging().exists(&old_event)?, "lease without expiration event");
            op.staging().del(&old_event);
        }

        let expires = now + duration;
        op.descriptor_mut().set_start_index(now);
        op.descriptor_mut().set_end_index(expires);
        op.staging().put(&keys::expiration_event(expires, key), b"1".to_vec());
        op.write_value(holder.to_vec());

        let info = LeaseInfo { holder: holder.to_vec(), acquired: now, expires };
        op.finalize_force(holder.len() as i64);
        if extended {
            return Ok(LeaseAcquisition::Renewed(info));
        }
        Ok(LeaseAcquisition::Acquired(info))
    }

    /// Releases a lease, returning false if no lease was held.
    pub fn lease_release(
        &self,
        staging: &mut WriteStaging,
        key: &[u8],
        clock_update: ClockValue,
    ) -> Result<bool> {
        // advance_clock() releases expired leases through this function;
        // a zero clock update skips the advance to avoid recursing.
        if clock_update != 0 {
            self.maybe_advance_clock(staging, clock_update)?;
        }

        let mut op = WriteOperation::new(staging, key, KeyType::Lease)?;
        if !op.key_exists() {
            op.finalize(0);
            return Ok(false);
        }

        let event = keys::expiration_event(op.descriptor().end_index(), key);
        assert!(op.staging().exists(&event)?, "lease without expiration event");
        op.staging().del(&event);

        let lease_key = keys::lease(key);
        assert!(op.staging().exists(&lease_key)?, "lease descriptor without value");
        op.staging().del(&lease_key);

        op.finalize(0);
        Ok(true)
    }

    /// Returns the current holder and validity window of a lease.
    pub fn lease_get(
        &self,
        staging: &mut dyn StagingRead,
        key: &[u8],
    ) -> Result<Option<LeaseInfo>> {
        let Some(desc) = Self::expect_type(staging, key, KeyType::Lease)? else {
            return Ok(None);
        };
        let holder = staging.get(&keys::lease(key))?.expect("lease descriptor without value");
        Ok(Some(LeaseInfo {
            holder,
            acquired: desc.start_index(),
            expires: desc.end_index(),
        }))
    }

    // ----- Maintenance --------------------------------------------------------

    /// Finalizes a bulk load: compacts the engine, rebuilds all descriptors
    /// by scanning values and counting fields per key, and leaves bulk-load
    /// mode. String and hash payloads are supported; set fields are
    /// indistinguishable from hash fields and come back as hashes.
    pub fn finalize_bulkload(&self) -> Result<()> {
        info!("Finalizing bulk load: compacting and rebuilding key descriptors");
        let mut engine = self.engine.lock()?;
        if engine.get(keys::IN_BULKLOAD)?.is_none() {
            return Err(Error::InvalidInput("not in bulk-load mode".to_string()));
        }
        engine.compact()?;

        let mut batch = crate::storage::WriteBatch::new();

        // Strings: one descriptor per value.
        let strings: Vec<(Vec<u8>, i64)> = engine
            .scan_prefix(&[keys::STRING])
            .map(|r| r.map(|(k, v)| (k[1..].to_vec(), v.len() as i64)))
            .collect::<Result<_>>()?;
        for (key, len) in strings {
            let mut desc = KeyDescriptor::new(KeyType::String);
            desc.set_size(len);
            batch.put(&keys::descriptor(&key), desc.encode());
        }

        // Fields: group by (escaped) key prefix and count.
        let mut current: Option<(Vec<u8>, i64)> = None;
        let fields: Vec<Vec<u8>> = engine
            .scan_prefix(&[keys::FIELD])
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        for engine_key in fields {
            let separator = find_terminator(&engine_key[1..])
                .ok_or_else(|| Error::InvalidData("unterminated field key".to_string()))?;
            let prefix = engine_key[..1 + separator + 2].to_vec();
            match &mut current {
                Some((p, count)) if *p == prefix => *count += 1,
                _ => {
                    if let Some((prefix, count)) = current.take() {
                        Self::put_rebuilt_descriptor(&mut batch, &prefix, count)?;
                    }
                    current = Some((prefix, 1));
                }
            }
        }
        if let Some((prefix, count)) = current.take() {
            Self::put_rebuilt_descriptor(&mut batch, &prefix, count)?;
        }

        batch.delete(keys::IN_BULKLOAD);
        engine.write(batch, true)?;
        info!("Bulk load finalized");
        Ok(())
    }

    fn put_rebuilt_descriptor(
        batch: &mut crate::storage::WriteBatch,
        field_prefix: &[u8],
        count: i64,
    ) -> Result<()> {
        let key = unescape(&field_prefix[1..field_prefix.len() - 2])?;
        let mut desc = KeyDescriptor::new(KeyType::Hash);
        desc.set_size(count);
        batch.put(&keys::descriptor(&key), desc.encode());
        Ok(())
    }

    /// Verifies that every descriptor agrees with the stored values: strings
    /// and leases have their value, collections have exactly size fields.
    /// Returns the number of checked keys.
    pub fn verify_checksum(&self) -> Result<u64> {
        let mut staging = self.begin_read();
        let descriptors: Vec<(Vec<u8>, KeyDescriptor)> = staging
            .scan_prefix(&[keys::DESCRIPTOR])
            .map(|r| {
                r.and_then(|(k, v)| {
                    Ok((
                        keys::descriptor_user_key(&k).expect("scanned non-descriptor").to_vec(),
                        KeyDescriptor::decode(&v)?,
                    ))
                })
            })
            .collect::<Result<_>>()?;

        let mut checked = 0;
        for (key, desc) in descriptors {
            let actual = match desc.key_type() {
                KeyType::String => staging.exists(&keys::string(&key))? as i64 * desc.size(),
                KeyType::Lease => staging.exists(&keys::lease(&key))? as i64 * desc.size(),
                KeyType::Hash | KeyType::Set | KeyType::Deque => {
                    staging.scan_prefix(&keys::field_prefix(&key)).count() as i64
                }
                KeyType::LocalityHash => {
                    let fields = staging.scan_prefix(&keys::locality_field_root(&key)).count();
                    let indexes = staging.scan_prefix(&keys::locality_index_prefix(&key)).count();
                    if fields != indexes {
                        return Err(Error::InvalidData(format!(
                            "locality hash {:?}: {fields} fields but {indexes} index entries",
                            String::from_utf8_lossy(&key)
                        )));
                    }
                    fields as i64
                }
            };
            if actual != desc.size() {
                return Err(Error::InvalidData(format!(
                    "key {:?}: descriptor size {} but found {actual}",
                    String::from_utf8_lossy(&key),
                    desc.size()
                )));
            }
            checked += 1;
        }
        Ok(checked)
    }

    /// Creates an online backup in the given directory.
    pub fn checkpoint(&self, path: &std::path::Path) -> Result<()> {
        self.engine.lock()?.checkpoint(path)
    }

    /// Triggers a manual engine compaction.
    pub fn manual_compaction(&self) -> Result<()> {
        self.engine.lock()?.compact()
    }

    /// Returns engine status.
    pub fn status(&self) -> Result<crate::storage::Status> {
        self.engine.lock()?.status()
    }
}

/// A single-key write: locks in the key's descriptor, verifies the expected
/// type, tracks mutations, and on finalize either stores the updated
/// descriptor or deletes it when the key has become empty. Every operation
/// must be finalized or cancelled.
struct WriteOperation<'a, 'b> {
    staging: &'a mut WriteStaging<'b>,
    key: Vec<u8>,
    descriptor: KeyDescriptor,
    existed: bool,
    finalized: bool,
}

impl<'a, 'b> WriteOperation<'a, 'b> {
    /// Starts a write operation, failing with Error::WrongType if the key
    /// exists with a different type.
    fn new(
        staging: &'a mut WriteStaging<'b>,
        key: &[u8],
        expected: KeyType,
    ) -> Result<Self> {
        let descriptor = StateMachine::descriptor(staging, key)?;
        let existed = descriptor.is_some();
        if let Some(desc) = &descriptor {
            if desc.key_type() != expected {
                return Err(Error::WrongType);
            }
        }
        Ok(Self {
            staging,
            key: key.to_vec(),
            descriptor: descriptor.unwrap_or_else(|| KeyDescriptor::new(expected)),
            existed,
            finalized: false,
        })
    }

    fn key_exists(&self) -> bool {
        self.existed
    }

    fn size(&self) -> i64 {
        self.descriptor.size()
    }

    fn descriptor(&self) -> &KeyDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut KeyDescriptor {
        &mut self.descriptor
    }

    fn staging(&mut self) -> &mut WriteStaging<'b> {
        self.staging
    }

    /// Writes the single value of a string or lease key.
    fn write_value(&mut self, value: Vec<u8>) {
        let key = match self.descriptor.key_type() {
            KeyType::String => keys::string(&self.key),
            KeyType::Lease => keys::lease(&self.key),
            other => panic!("writing without a field makes no sense for {other}"),
        };
        self.staging.put(&key, value);
    }

    /// Reads the single value of a string or lease key.
    fn get_value(&mut self) -> Result<Option<Vec<u8>>> {
        let key = match self.descriptor.key_type() {
            KeyType::String => keys::string(&self.key),
            KeyType::Lease => keys::lease(&self.key),
            other => panic!("reading without a field makes no sense for {other}"),
        };
        self.staging.get(&key)
    }

    fn write_field(&mut self, field: &[u8], value: Vec<u8>) {
        self.staging.put(&keys::field(&self.key, field), value);
    }

    fn get_field(&mut self, field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.staging.get(&keys::field(&self.key, field))
    }

    fn field_exists(&mut self, field: &[u8]) -> Result<bool> {
        self.staging.exists(&keys::field(&self.key, field))
    }

    /// Deletes a field, returning whether it existed.
    fn delete_field(&mut self, field: &[u8]) -> Result<bool> {
        let key = keys::field(&self.key, field);
        if !self.staging.exists(&key)? {
            return Ok(false);
        }
        self.staging.del(&key);
        Ok(true)
    }

    fn write_locality_field(&mut self, hint: &[u8], field: &[u8], value: Vec<u8>) {
        self.staging.put(&keys::locality_field(&self.key, hint, field), value);
    }

    fn delete_locality_field(&mut self, hint: &[u8], field: &[u8]) -> Result<bool> {
        let key = keys::locality_field(&self.key, hint, field);
        if !self.staging.exists(&key)? {
            return Ok(false);
        }
        self.staging.del(&key);
        Ok(true)
    }

    fn write_locality_index(&mut self, field: &[u8], hint: Vec<u8>) {
        self.staging.put(&keys::locality_index(&self.key, field), hint);
    }

    fn get_locality_index(&mut self, field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.staging.get(&keys::locality_index(&self.key, field))
    }

    fn delete_locality_index(&mut self, field: &[u8]) {
        self.staging.del(&keys::locality_index(&self.key, field));
    }

    /// Finishes the operation: a size of zero deletes the descriptor, any
    /// other size stores the updated descriptor if it changed.
    fn finalize(mut self, new_size: i64) {
        self.finalize_inner(new_size, false)
    }

    /// Like finalize(), but always rewrites the descriptor. Needed when only
    /// the index window changed, e.g. lease extensions.
    fn finalize_force(mut self, new_size: i64) {
        self.finalize_inner(new_size, true)
    }

    fn finalize_inner(&mut self, new_size: i64, force: bool) {
        assert!(!self.finalized, "write operation already finalized");
        assert!(new_size >= 0, "invalid key size {new_size}");
        if new_size == 0 {
            self.staging.del(&keys::descriptor(&self.key));
        } else if self.descriptor.size() != new_size || force {
            self.descriptor.set_size(new_size);
            self.staging.put(&keys::descriptor(&self.key), self.descriptor.encode());
        }
        self.finalized = true;
    }

    /// Abandons the operation without touching the descriptor.
    fn cancel(mut self) {
        self.finalized = true;
    }
}

impl Drop for WriteOperation<'_, '_> {
    fn drop(&mut self) {
        debug_assert!(self.finalized, "write operation dropped without being finalized");
    }
}

/// Parses a decimal integer from bytes, rejecting any surrounding noise.
fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parses a decimal float from bytes.
fn parse_f64(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Finds the position of the 0x00 0x00 terminator of an escaped key.
fn find_terminator(bytes: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == 0x00 {
            if bytes[i + 1] == 0x00 {
                return Some(i);
            }
            i += 2; // skip the escape pair
        } else {
            i += 1;
        }
    }
    None
}

/// Reverses the composite-key escaping of statemachine::keys.
fn unescape(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x00 {
            if bytes.get(i + 1) != Some(&0xff) {
                return Err(Error::InvalidData("malformed escaped key".to_string()));
            }
            out.push(0x00);
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    /// A state machine over a fresh memory engine, plus a write counter so
    /// tests can commit entries with consecutive journal indexes.
    struct Harness {
        sm: StateMachine,
        next_index: LogIndex,
    }

    impl Harness {
        fn new() -> Harness {
            let sm = StateMachine::open(Box::new(Memory::new()), false).expect("open failed");
            Harness { sm, next_index: 1 }
        }

        /// Runs a write closure inside a fresh staging area and commits it.
        fn write<T>(
            &mut self,
            f: impl FnOnce(&StateMachine, &mut WriteStaging) -> Result<T>,
        ) -> Result<T> {
            let mut staging = self.sm.begin_write();
            let result = f(&self.sm, &mut staging)?;
            self.sm.commit(staging, self.next_index)?;
            self.next_index += 1;
            Ok(result)
        }

        fn read<T>(&self, f: impl FnOnce(&StateMachine, &mut ReadStaging) -> Result<T>) -> Result<T> {
            let mut staging = self.sm.begin_read();
            f(&self.sm, &mut staging)
        }
    }

    #[test]
    fn string_roundtrip() -> Result<()> {
        let mut h = Harness::new();
        h.write(|sm, s| sm.set(s, b"asdf", b"1234"))?;
        assert_eq!(h.read(|sm, s| sm.get(s, b"asdf"))?, Some(b"1234".to_vec()));
        assert_eq!(h.read(|sm, s| sm.get(s, b"missing"))?, None);

        assert_eq!(h.read(|sm, s| sm.exists(s, &[b"asdf".to_vec(), b"missing".to_vec()]))?, 1);
        assert_eq!(h.write(|sm, s| sm.del(s, &[b"asdf".to_vec(), b"missing".to_vec()]))?, 1);
        assert_eq!(h.read(|sm, s| sm.get(s, b"asdf"))?, None);
        assert_eq!(h.sm.verify_checksum()?, 0);
        Ok(())
    }

    #[test]
    fn type_conflicts_are_rejected() -> Result<()> {
        let mut h = Harness::new();
        h.write(|sm, s| sm.set(s, b"str", b"v"))?;
        h.write(|sm, s| sm.hset(s, b"hash", b"f", b"v"))?;

        assert_eq!(
            h.write(|sm, s| sm.hset(s, b"str", b"f", b"v")).unwrap_err(),
            Error::WrongType
        );
        assert_eq!(h.read(|sm, s| sm.get(s, b"hash")).unwrap_err(), Error::WrongType);
        assert_eq!(
            h.write(|sm, s| sm.sadd(s, b"hash", &[b"a".to_vec()])).unwrap_err(),
            Error::WrongType
        );
        Ok(())
    }

    #[test]
    fn at_most_once_application() -> Result<()> {
        let h = Harness::new();
        assert_eq!(h.sm.last_applied(), 0);

        // An abandoned staging area leaves no trace.
        let mut staging = h.sm.begin_write();
        h.sm.set(&mut staging, b"gone", b"v")?;
        drop(staging);

        // Indexes must advance one at a time.
        let mut staging = h.sm.begin_write();
        h.sm.set(&mut staging, b"k", b"v")?;
        h.sm.commit(staging, 1)?;
        assert_eq!(h.sm.last_applied(), 1);

        let mut staging = h.sm.begin_write();
        h.sm.set(&mut staging, b"k", b"v2")?;
        h.sm.commit(staging, 2)?;
        assert_eq!(h.sm.last_applied(), 2);

        // Replaying an already-applied index is a bug and must panic.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let staging = h.sm.begin_write();
            h.sm.commit(staging, 2).ok();
        }));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn hash_operations() -> Result<()> {
        let mut h = Harness::new();
        assert!(h.write(|sm, s| sm.hset(s, b"h", b"f1", b"v1"))?);
        assert!(!h.write(|sm, s| sm.hset(s, b"h", b"f1", b"v1b"))?);
        h.write(|sm, s| sm.hmset(s, b"h", &[(b"f2".to_vec(), b"v2".to_vec()), (b"f3".to_vec(), b"v3".to_vec())]))?;

        assert_eq!(h.read(|sm, s| sm.hget(s, b"h", b"f1"))?, Some(b"v1b".to_vec()));
        assert_eq!(h.read(|sm, s| sm.hlen(s, b"h"))?, 3);
        assert!(h.read(|sm, s| sm.hexists(s, b"h", b"f2"))?);
        assert_eq!(
            h.read(|sm, s| sm.hkeys(s, b"h"))?,
            vec![b"f1".to_vec(), b"f2".to_vec(), b"f3".to_vec()]
        );

        assert!(!h.write(|sm, s| sm.hsetnx(s, b"h", b"f1", b"nope"))?);
        assert!(h.write(|sm, s| sm.hsetnx(s, b"h", b"f4", b"v4"))?);
        assert_eq!(h.read(|sm, s| sm.hget(s, b"h", b"f1"))?, Some(b"v1b".to_vec()));

        assert_eq!(h.write(|sm, s| sm.hdel(s, b"h", &[b"f1".to_vec(), b"nope".to_vec()]))?, 1);
        assert_eq!(h.read(|sm, s| sm.hlen(s, b"h"))?, 3);
        h.sm.verify_checksum()?;

        // Deleting the last field deletes the descriptor.
        h.write(|sm, s| {
            sm.hdel(s, b"h", &[b"f2".to_vec(), b"f3".to_vec(), b"f4".to_vec()]).map(|_| ())
        })?;
        assert_eq!(h.read(|sm, s| sm.exists(s, &[b"h".to_vec()]))?, 0);
        assert_eq!(h.sm.verify_checksum()?, 0);
        Ok(())
    }

    #[test]
    fn hscan_cursor_walk() -> Result<()> {
        let mut h = Harness::new();
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (1..=9)
            .map(|i| (format!("f{i}").into_bytes(), format!("v{i}").into_bytes()))
            .collect();
        h.write(|sm, s| sm.hmset(s, b"hash", &pairs))?;

        let (cursor, page) = h.read(|sm, s| sm.hscan(s, b"hash", b"", 3))?;
        assert_eq!(cursor, Some(b"f4".to_vec()));
        assert_eq!(
            page,
            vec![
                (b"f1".to_vec(), b"v1".to_vec()),
                (b"f2".to_vec(), b"v2".to_vec()),
                (b"f3".to_vec(), b"v3".to_vec()),
            ]
        );

        let (cursor, page) = h.read(|sm, s| sm.hscan(s, b"hash", b"f4", 3))?;
        assert_eq!(cursor, Some(b"f7".to_vec()));
        assert_eq!(
            page,
            vec![
                (b"f4".to_vec(), b"v4".to_vec()),
                (b"f5".to_vec(), b"v5".to_vec()),
                (b"f6".to_vec(), b"v6".to_vec()),
            ]
        );

        let (cursor, page) = h.read(|sm, s| sm.hscan(s, b"hash", b"f7", 3))?;
        assert_eq!(cursor, None);
        assert_eq!(page.len(), 3);
        Ok(())
    }

    #[test]
    fn hincrby_parses_and_rejects() -> Result<()> {
        let mut h = Harness::new();
        assert_eq!(h.write(|sm, s| sm.hincrby(s, b"h1", b"f", 3))?, 3);
        assert_eq!(h.write(|sm, s| sm.hincrby(s, b"h1", b"f", -5))?, -2);
        assert_eq!(h.read(|sm, s| sm.hget(s, b"h1", b"f"))?, Some(b"-2".to_vec()));

        h.write(|sm, s| sm.hset(s, b"h1", b"text", b"abc").map(|_| ()))?;
        assert!(h.write(|sm, s| sm.hincrby(s, b"h1", b"text", 1)).is_err());
        // The failed increment must not have corrupted anything.
        assert_eq!(h.read(|sm, s| sm.hget(s, b"h1", b"text"))?, Some(b"abc".to_vec()));
        h.sm.verify_checksum()?;
        Ok(())
    }

    #[test]
    fn set_operations() -> Result<()> {
        let mut h = Harness::new();
        assert_eq!(
            h.write(|sm, s| sm.sadd(s, b"myset", &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]))?,
            3
        );
        assert_eq!(
            h.read(|sm, s| sm.smembers(s, b"myset"))?,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert!(h.read(|sm, s| sm.sismember(s, b"myset", b"b"))?);
        assert!(!h.read(|sm, s| sm.sismember(s, b"myset", b"z"))?);

        assert_eq!(h.write(|sm, s| sm.srem(s, b"myset", &[b"a".to_vec(), b"b".to_vec()]))?, 2);
        assert_eq!(h.read(|sm, s| sm.scard(s, b"myset"))?, 1);

        assert!(h.write(|sm, s| sm.smove(s, b"myset", b"other", b"c"))?);
        assert!(!h.write(|sm, s| sm.smove(s, b"myset", b"other", b"c"))?);
        assert_eq!(h.read(|sm, s| sm.scard(s, b"other"))?, 1);
        assert_eq!(h.read(|sm, s| sm.exists(s, &[b"myset".to_vec()]))?, 0);
        h.sm.verify_checksum()?;
        Ok(())
    }

    #[test]
    fn deque_push_pop() -> Result<()> {
        let mut h = Harness::new();
        let items: Vec<Vec<u8>> =
            [b"i1", b"i2", b"i3", b"i4"].iter().map(|i| i.to_vec()).collect();
        assert_eq!(h.write(|sm, s| sm.deque_push(s, Direction::Front, b"L", &items))?, 4);

        assert_eq!(
            h.write(|sm, s| sm.deque_pop(s, Direction::Front, b"L"))?,
            Some(b"i4".to_vec())
        );
        assert_eq!(
            h.write(|sm, s| sm.deque_pop(s, Direction::Back, b"L"))?,
            Some(b"i1".to_vec())
        );
        assert_eq!(h.read(|sm, s| sm.deque_len(s, b"L"))?, 2);
        h.sm.verify_checksum()?;

        assert_eq!(h.write(|sm, s| sm.deque_pop(s, Direction::Front, b"L"))?, Some(b"i3".to_vec()));
        assert_eq!(h.write(|sm, s| sm.deque_pop(s, Direction::Front, b"L"))?, Some(b"i2".to_vec()));
        assert_eq!(h.write(|sm, s| sm.deque_pop(s, Direction::Front, b"L"))?, None);
        assert_eq!(h.read(|sm, s| sm.exists(s, &[b"L".to_vec()]))?, 0);
        Ok(())
    }

    #[test]
    fn deque_trim_front() -> Result<()> {
        let mut h = Harness::new();
        let items: Vec<Vec<u8>> = (1..=5).map(|i| format!("i{i}").into_bytes()).collect();
        h.write(|sm, s| sm.deque_push(s, Direction::Back, b"L", &items))?;

        assert_eq!(h.write(|sm, s| sm.deque_trim_front(s, b"L", 2))?, 3);
        assert_eq!(h.read(|sm, s| sm.deque_len(s, b"L"))?, 2);
        assert_eq!(h.write(|sm, s| sm.deque_pop(s, Direction::Front, b"L"))?, Some(b"i4".to_vec()));
        assert_eq!(h.write(|sm, s| sm.deque_pop(s, Direction::Front, b"L"))?, Some(b"i5".to_vec()));

        assert_eq!(h.write(|sm, s| sm.deque_trim_front(s, b"L", 7))?, 0);
        h.sm.verify_checksum()?;
        Ok(())
    }

    #[test]
    fn keys_and_scan() -> Result<()> {
        let mut h = Harness::new();
        for key in [b"user:1".as_slice(), b"user:2", b"user:3", b"other"] {
            h.write(|sm, s| sm.set(s, key, b"v"))?;
        }

        assert_eq!(
            h.read(|sm, s| sm.keys(s, b"user:*"))?,
            vec![b"user:1".to_vec(), b"user:2".to_vec(), b"user:3".to_vec()]
        );
        assert_eq!(h.read(|sm, s| sm.keys(s, b"*"))?.len(), 4);

        // Cursored scan visits the keyspace in pages.
        let (cursor, page) = h.read(|sm, s| sm.scan(s, b"", b"user:*", 2))?;
        assert_eq!(page, vec![b"user:1".to_vec(), b"user:2".to_vec()]);
        let cursor = cursor.expect("must have more");
        let (cursor, page) = h.read(|sm, s| sm.scan(s, &cursor, b"user:*", 2))?;
        assert_eq!(page, vec![b"user:3".to_vec()]);
        assert_eq!(cursor, None);
        Ok(())
    }

    #[test]
    fn locality_hash() -> Result<()> {
        let mut h = Harness::new();
        assert!(h.write(|sm, s| sm.lhset(s, b"lh", b"f1", b"hintA", b"v1"))?);
        assert!(!h.write(|sm, s| sm.lhset(s, b"lh", b"f1", b"hintA", b"v2"))?);
        assert_eq!(h.read(|sm, s| sm.lhlen(s, b"lh"))?, 1);

        // Correct hint, wrong hint, and no hint must all find the value.
        assert_eq!(
            h.read(|sm, s| sm.lhget(s, b"lh", b"f1", Some(b"hintA")))?,
            Some(b"v2".to_vec())
        );
        assert_eq!(
            h.read(|sm, s| sm.lhget(s, b"lh", b"f1", Some(b"wrong")))?,
            Some(b"v2".to_vec())
        );
        assert_eq!(h.read(|sm, s| sm.lhget(s, b"lh", b"f1", None))?, Some(b"v2".to_vec()));

        // A changed hint relocates the field.
        assert!(!h.write(|sm, s| sm.lhset(s, b"lh", b"f1", b"hintB", b"v3"))?);
        assert_eq!(
            h.read(|sm, s| sm.lhget(s, b"lh", b"f1", Some(b"hintB")))?,
            Some(b"v3".to_vec())
        );
        assert_eq!(h.read(|sm, s| sm.lhlen(s, b"lh"))?, 1);
        h.sm.verify_checksum()?;

        assert_eq!(h.write(|sm, s| sm.lhdel(s, b"lh", &[b"f1".to_vec()]))?, 1);
        assert_eq!(h.read(|sm, s| sm.exists(s, &[b"lh".to_vec()]))?, 0);
        assert_eq!(h.sm.verify_checksum()?, 0);
        Ok(())
    }

    #[test]
    fn lease_lifecycle() -> Result<()> {
        let mut h = Harness::new();

        let outcome = h.write(|sm, s| sm.lease_acquire(s, b"lock", b"holder1", 1000, 500))?;
        let LeaseAcquisition::Acquired(info) = outcome else {
            panic!("expected acquisition, got {outcome:?}")
        };
        assert_eq!(info.expires, 1500);

        // Same holder extends, different holder is refused.
        let outcome = h.write(|sm, s| sm.lease_acquire(s, b"lock", b"holder1", 1200, 500))?;
        assert!(matches!(outcome, LeaseAcquisition::Renewed(ref i) if i.expires == 1700));
        let outcome = h.write(|sm, s| sm.lease_acquire(s, b"lock", b"holder2", 1300, 500))?;
        assert!(matches!(outcome, LeaseAcquisition::FailedDueToOtherOwner(ref i) if i.holder == b"holder1"));

        let info = h.read(|sm, s| sm.lease_get(s, b"lock"))?.expect("lease must exist");
        assert_eq!(info.holder, b"holder1".to_vec());
        h.sm.verify_checksum()?;

        // Advancing the clock past the deadline releases the lease, after
        // which another holder acquires it.
        let outcome = h.write(|sm, s| sm.lease_acquire(s, b"lock", b"holder2", 2000, 500))?;
        assert!(matches!(outcome, LeaseAcquisition::Acquired(_)));

        assert!(h.write(|sm, s| sm.lease_release(s, b"lock", 0))?);
        assert!(!h.write(|sm, s| sm.lease_release(s, b"lock", 0))?);
        assert_eq!(h.sm.verify_checksum()?, 0);
        Ok(())
    }

    #[test]
    fn config_space_is_separate() -> Result<()> {
        let mut h = Harness::new();
        h.write(|sm, s| sm.config_set(s, b"trimming.limit", b"1000000"))?;
        h.write(|sm, s| sm.set(s, b"trimming.limit", b"user value"))?;

        assert_eq!(
            h.read(|sm, s| sm.config_get(s, b"trimming.limit"))?,
            Some(b"1000000".to_vec())
        );
        assert_eq!(h.read(|sm, s| sm.get(s, b"trimming.limit"))?, Some(b"user value".to_vec()));
        assert_eq!(
            h.read(|sm, s| sm.config_getall(s))?,
            vec![(b"trimming.limit".to_vec(), b"1000000".to_vec())]
        );

        // flushall preserves configuration and internal metadata.
        h.write(|sm, s| sm.flushall(s))?;
        assert_eq!(h.read(|sm, s| sm.get(s, b"trimming.limit"))?, None);
        assert_eq!(
            h.read(|sm, s| sm.config_get(s, b"trimming.limit"))?,
            Some(b"1000000".to_vec())
        );
        Ok(())
    }

    #[test]
    fn bulkload_rebuilds_descriptors() -> Result<()> {
        let sm = StateMachine::open(Box::new(Memory::new()), true).expect("open failed");
        let mut staging = sm.begin_write();
        sm.hset(&mut staging, b"h1", b"f1", b"v1")?;
        sm.hset(&mut staging, b"h1", b"f2", b"v2")?;
        sm.hset(&mut staging, b"h2", b"g1", b"w1")?;
        sm.set(&mut staging, b"str", b"value")?;
        sm.commit(staging, 0)?;

        sm.finalize_bulkload()?;
        assert_eq!(sm.verify_checksum()?, 3);

        let mut staging = sm.begin_read();
        assert_eq!(sm.hlen(&mut staging, b"h1")?, 2);
        assert_eq!(sm.hget(&mut staging, b"h1", b"f2")?, Some(b"v2".to_vec()));
        assert_eq!(sm.hlen(&mut staging, b"h2")?, 1);
        assert_eq!(sm.get(&mut staging, b"str")?, Some(b"value".to_vec()));
        Ok(())
    }

    #[test]
    fn unfinalized_bulkload_refuses_to_open() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("quarkdb")?;
        let path = dir.path().join("sm");

        let engine = crate::storage::BitCask::new(path.clone())?;
        let sm = StateMachine::open(Box::new(engine), true)?;
        drop(sm);

        let engine = crate::storage::BitCask::new(path)?;
        assert!(StateMachine::open(Box::new(engine), false).is_err());
        Ok(())
    }
}
