use super::members::{Membership, RaftMembers};
use super::types::{ClusterID, FsyncPolicy, LogIndex, RaftEntry, RaftServer, Term, VotedFor};
use crate::encoding::binary;
use crate::error::{Error, Result};
use crate::statemachine::pattern::Pattern;
use crate::storage::{Engine, WriteBatch};

use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Journal metadata keys.
const CURRENT_TERM: &[u8] = b"__current-term";
const VOTED_FOR: &[u8] = b"__voted-for";
const LOG_SIZE: &[u8] = b"__log-size";
const LOG_START: &[u8] = b"__log-start";
const CLUSTER_ID: &[u8] = b"__cluster-id";
const COMMIT_INDEX: &[u8] = b"__commit-index";
const MEMBERS: &[u8] = b"__members";
const MEMBERSHIP_EPOCH: &[u8] = b"__membership-epoch";
const PREVIOUS_MEMBERS: &[u8] = b"__previous-members";
const PREVIOUS_MEMBERSHIP_EPOCH: &[u8] = b"__previous-membership-epoch";
const FSYNC_POLICY: &[u8] = b"__fsync-policy";

/// The engine key of a journal entry.
fn entry_key(index: LogIndex) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'E');
    key.extend_from_slice(&binary::encode_i64(index));
    key
}

/// The durable Raft log: an append-only sequence of entries [log_start,
/// log_size) over an ordered engine, together with the persistent term and
/// vote, the commit index, and the cluster member set.
///
/// Invariants:
/// * Entry terms never decrease with the index, and stay at or below the
///   current term.
/// * The current term never decreases, and a vote cast for a term never
///   changes within it.
/// * Entries at or below the commit index are immutable: they can neither be
///   overwritten nor removed, only trimmed from the front once applied.
/// * Entry 0 is the genesis membership entry and is never overwritten.
/// * Membership updates take effect on append; the previous member set is
///   kept for rollback of uncommitted epochs.
pub struct RaftJournal {
    inner: Mutex<JournalState>,
    /// Signals appends to wake replicators blocked in wait_for_updates().
    log_updated: Condvar,
    /// Signals commit-index advances to wake the commit applier.
    commit_notifier: Condvar,
}

struct JournalState {
    engine: Box<dyn Engine>,
    current_term: Term,
    voted_for: VotedFor,
    log_size: LogIndex,
    log_start: LogIndex,
    commit_index: LogIndex,
    term_of_last_entry: Term,
    cluster_id: ClusterID,
    members: RaftMembers,
    membership_epoch: LogIndex,
    fsync_policy: FsyncPolicy,
}

impl RaftJournal {
    /// Wipes the engine and initializes a fresh journal for the given
    /// cluster, with the genesis membership entry at start_index.
    pub fn initialize(
        mut engine: Box<dyn Engine>,
        cluster_id: ClusterID,
        nodes: Vec<RaftServer>,
        start_index: LogIndex,
        fsync_policy: FsyncPolicy,
    ) -> Result<Self> {
        let victims: Vec<Vec<u8>> =
            engine.scan_from(b"").map(|r| r.map(|(k, _)| k)).collect::<Result<_>>()?;
        let mut batch = WriteBatch::new();
        for victim in victims {
            batch.delete(&victim);
        }

        let members = RaftMembers::new(nodes, Vec::new());
        batch.put(CURRENT_TERM, binary::encode_i64(0).to_vec());
        batch.put(VOTED_FOR, VotedFor::None.encode());
        batch.put(LOG_SIZE, binary::encode_i64(start_index + 1).to_vec());
        batch.put(LOG_START, binary::encode_i64(start_index).to_vec());
        batch.put(CLUSTER_ID, cluster_id.as_bytes().to_vec());
        batch.put(COMMIT_INDEX, binary::encode_i64(start_index).to_vec());
        batch.put(MEMBERS, members.encode());
        batch.put(MEMBERSHIP_EPOCH, binary::encode_i64(start_index).to_vec());
        batch.put(FSYNC_POLICY, fsync_policy.as_str().as_bytes().to_vec());

        let genesis = RaftEntry::membership_update(0, &members.encode(), &cluster_id);
        batch.put(&entry_key(start_index), genesis.encode());

        engine.write(batch, true)?;
        Self::open(engine)
    }

    /// Opens an existing journal.
    pub fn open(mut engine: Box<dyn Engine>) -> Result<Self> {
        // Ensure the fsync policy is initialized, for journals created by
        // older versions.
        if engine.get(FSYNC_POLICY)?.is_none() {
            engine
                .set(FSYNC_POLICY, FsyncPolicy::SyncImportantUpdates.as_str().as_bytes().to_vec())?;
        }

        let current_term = get_i64(&mut engine, CURRENT_TERM)?;
        let log_size = get_i64(&mut engine, LOG_SIZE)?;
        let log_start = get_i64(&mut engine, LOG_START)?;
        let commit_index = get_i64(&mut engine, COMMIT_INDEX)?;
        let cluster_id = String::from_utf8(get_raw(&mut engine, CLUSTER_ID)?)?;
        let voted_for = VotedFor::decode(&get_raw(&mut engine, VOTED_FOR)?)?;
        let membership_epoch = get_i64(&mut engine, MEMBERSHIP_EPOCH)?;
        let members = RaftMembers::decode(&get_raw(&mut engine, MEMBERS)?)?;
        let fsync_policy =
            FsyncPolicy::parse(&String::from_utf8(get_raw(&mut engine, FSYNC_POLICY)?)?)?;

        let last = engine.get(&entry_key(log_size - 1))?.ok_or_else(|| {
            Error::InvalidData(format!("journal corruption: entry {} missing", log_size - 1))
        })?;
        let term_of_last_entry = RaftEntry::decode_term(&last)?;

        info!(
            "Opened raft journal: term {current_term}, entries [{log_start}, {log_size}), \
             commit index {commit_index}, membership epoch {membership_epoch}"
        );
        Ok(Self {
            inner: Mutex::new(JournalState {
                engine,
                current_term,
                voted_for,
                log_size,
                log_start,
                commit_index,
                term_of_last_entry,
                cluster_id,
                members,
                membership_epoch,
                fsync_policy,
            }),
            log_updated: Condvar::new(),
            commit_notifier: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.inner.lock().expect("lock poisoned")
    }

    // ----- Accessors ---------------------------------------------------------

    pub fn current_term(&self) -> Term {
        self.lock().current_term
    }

    pub fn voted_for(&self) -> VotedFor {
        self.lock().voted_for.clone()
    }

    pub fn log_size(&self) -> LogIndex {
        self.lock().log_size
    }

    pub fn log_start(&self) -> LogIndex {
        self.lock().log_start
    }

    pub fn commit_index(&self) -> LogIndex {
        self.lock().commit_index
    }

    pub fn term_of_last_entry(&self) -> Term {
        self.lock().term_of_last_entry
    }

    pub fn cluster_id(&self) -> ClusterID {
        self.lock().cluster_id.clone()
    }

    pub fn fsync_policy(&self) -> FsyncPolicy {
        self.lock().fsync_policy
    }

    pub fn set_fsync_policy(&self, policy: FsyncPolicy) -> Result<()> {
        let mut state = self.lock();
        if state.fsync_policy != policy {
            state.engine.set(FSYNC_POLICY, policy.as_str().as_bytes().to_vec())?;
            state.fsync_policy = policy;
        }
        Ok(())
    }

    /// Returns the current member set and epoch.
    pub fn membership(&self) -> Membership {
        let state = self.lock();
        Membership {
            nodes: state.members.nodes.clone(),
            observers: state.members.observers.clone(),
            epoch: state.membership_epoch,
        }
    }

    /// Returns the full voting members.
    pub fn nodes(&self) -> Vec<RaftServer> {
        self.lock().members.nodes.clone()
    }

    // ----- Term and vote -----------------------------------------------------

    /// Atomically persists a new term and vote. Fails if the term would
    /// regress, or if a different vote was already cast in the same term.
    pub fn set_current_term(&self, term: Term, vote: VotedFor) -> Result<bool> {
        let mut state = self.lock();

        // Terms never go back in time, and the vote for a term never
        // changes.
        if term < state.current_term {
            return Ok(false);
        }
        if term == state.current_term && !state.voted_for.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        batch.put(CURRENT_TERM, binary::encode_i64(term).to_vec());
        batch.put(VOTED_FOR, vote.encode());
        Self::commit_batch(&mut state, batch, None, true)?;

        state.current_term = term;
        state.voted_for = vote;
        Ok(true)
    }

    // ----- Commit index ------------------------------------------------------

    /// Advances the commit index, waking the commit applier. Regressions are
    /// ignored; marking a non-existent entry as committed is a bug.
    pub fn set_commit_index(&self, index: LogIndex) -> Result<bool> {
        let mut state = self.lock();
        if index < state.commit_index {
            warn!(
                "Attempted to set commit index in the past: {} -> {index}",
                state.commit_index
            );
            return Ok(false);
        }
        assert!(
            index < state.log_size,
            "commit index {index} beyond log size {}",
            state.log_size
        );
        if state.commit_index < index {
            state.engine.set(COMMIT_INDEX, binary::encode_i64(index).to_vec())?;
            state.commit_index = index;
            self.commit_notifier.notify_all();
        }
        Ok(true)
    }

    /// Blocks until the commit index advances past the given value or the
    /// timeout elapses, returning the current commit index.
    pub fn wait_for_commits(&self, current_commit: LogIndex, timeout: Duration) -> LogIndex {
        let mut state = self.lock();
        if current_commit < state.commit_index {
            return state.commit_index;
        }
        let (guard, _) =
            self.commit_notifier.wait_timeout(state, timeout).expect("lock poisoned");
        state = guard;
        state.commit_index
    }

    /// Blocks until a new entry is appended past current_size or the timeout
    /// elapses.
    pub fn wait_for_updates(&self, current_size: LogIndex, timeout: Duration) {
        let state = self.lock();
        if current_size < state.log_size {
            return; // race, there's an update already
        }
        let _unused = self.log_updated.wait_timeout(state, timeout).expect("lock poisoned");
    }

    /// Wakes all threads blocked on journal progress, e.g. for shutdown.
    pub fn notify_waiting_threads(&self) {
        let _state = self.lock();
        self.log_updated.notify_all();
        self.commit_notifier.notify_all();
    }

    // ----- Appending ---------------------------------------------------------

    /// Appends an entry at the given index, which must equal the log size.
    /// Returns false (with a warning) if the preconditions don't hold, since
    /// replication races make them reachable in normal operation.
    pub fn append(&self, index: LogIndex, entry: &RaftEntry, important: bool) -> Result<bool> {
        let mut state = self.lock();
        self.append_locked(&mut state, index, entry, important)
    }

    fn append_locked(
        &self,
        state: &mut JournalState,
        index: LogIndex,
        entry: &RaftEntry,
        important: bool,
    ) -> Result<bool> {
        if index != state.log_size {
            warn!(
                "Attempted to insert journal entry at invalid position: index {index}, \
                 log size {}",
                state.log_size
            );
            return Ok(false);
        }
        if entry.term > state.current_term {
            warn!(
                "Attempted to insert journal entry with higher term than the current one: \
                 {} vs {}",
                entry.term, state.current_term
            );
            return Ok(false);
        }
        if entry.term < state.term_of_last_entry {
            warn!(
                "Attempted to insert journal entry with lower term {}, while the last one \
                 is {}",
                entry.term, state.term_of_last_entry
            );
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        let mut important = important;

        if entry.is_membership_update() {
            assert_eq!(entry.request.len(), 3, "malformed membership update entry");

            // Membership updates take effect immediately upon append, not
            // commit (as per the Raft PhD thesis). The commit applier will
            // apply a no-op for them. The previous member set is persisted
            // so an uncommitted epoch can be rolled back.
            if entry.request[2] == state.cluster_id.as_bytes() {
                let new_members = RaftMembers::decode(&entry.request[1])?;
                batch.put(MEMBERS, entry.request[1].clone());
                batch.put(MEMBERSHIP_EPOCH, binary::encode_i64(index).to_vec());
                batch.put(PREVIOUS_MEMBERS, state.members.encode());
                batch.put(
                    PREVIOUS_MEMBERSHIP_EPOCH,
                    binary::encode_i64(state.membership_epoch).to_vec(),
                );
                info!(
                    "Transitioning into a new membership epoch: {} => {index}. New members: {}",
                    state.membership_epoch,
                    String::from_utf8_lossy(&entry.request[1])
                );
                state.members = new_members;
                state.membership_epoch = index;
            } else {
                error!(
                    "Received membership update for cluster {}, but mine is {}; \
                     the update entry will be ignored",
                    String::from_utf8_lossy(&entry.request[2]),
                    state.cluster_id
                );
            }
            important = true;
        }

        batch.put(&entry_key(index), entry.encode());
        Self::commit_batch(state, batch, Some(index + 1), important)?;
        state.term_of_last_entry = entry.term;
        self.log_updated.notify_all();
        Ok(true)
    }

    /// Appends a leadership marker for a freshly ascended leader.
    pub fn append_leadership_marker(
        &self,
        index: LogIndex,
        term: Term,
        leader: &RaftServer,
    ) -> Result<bool> {
        self.append(index, &RaftEntry::leadership_marker(term, leader), true)
    }

    /// Applies a batch, updating the persisted log size if given. Important
    /// writes are fsynced according to the fsync policy.
    fn commit_batch(
        state: &mut JournalState,
        mut batch: WriteBatch,
        new_log_size: Option<LogIndex>,
        important: bool,
    ) -> Result<()> {
        if let Some(size) = new_log_size {
            assert!(
                size > state.commit_index,
                "attempted to remove committed entries by setting log size to {size} \
                 while commit index is {}",
                state.commit_index
            );
            if size != state.log_size {
                batch.put(LOG_SIZE, binary::encode_i64(size).to_vec());
            }
        }
        state.engine.write(batch, state.fsync_policy.should_sync(important))?;
        if let Some(size) = new_log_size {
            state.log_size = size;
        }
        Ok(())
    }

    // ----- Membership changes ------------------------------------------------

    /// Appends a membership-update entry with the given mutation applied to
    /// the current member set. Refused while the current epoch is still
    /// uncommitted.
    fn membership_update(
        &self,
        term: Term,
        mutate: impl FnOnce(&mut RaftMembers) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.commit_index < state.membership_epoch {
            return Err(Error::InvalidInput(format!(
                "the current membership epoch has not been committed yet: {}",
                state.membership_epoch
            )));
        }

        let mut new_members = state.members.clone();
        mutate(&mut new_members)?;

        let entry = RaftEntry::membership_update(term, &new_members.encode(), &state.cluster_id);
        let index = state.log_size;
        if !self.append_locked(&mut state, index, &entry, true)? {
            return Err(Error::Unavailable);
        }
        Ok(())
    }

    pub fn add_observer(&self, term: Term, observer: &RaftServer) -> Result<()> {
        self.membership_update(term, |members| members.add_observer(observer))
    }

    pub fn remove_member(&self, term: Term, member: &RaftServer) -> Result<()> {
        self.membership_update(term, |members| members.remove_member(member))
    }

    pub fn promote_observer(&self, term: Term, observer: &RaftServer) -> Result<()> {
        self.membership_update(term, |members| members.promote_observer(observer))
    }

    pub fn demote_to_observer(&self, term: Term, member: &RaftServer) -> Result<()> {
        self.membership_update(term, |members| members.demote_to_observer(member))
    }

    // ----- Conflict resolution and trimming ----------------------------------

    /// Removes all entries in [from, log_size), e.g. when a new leader
    /// overwrites an inconsistent log suffix. Removing committed entries is
    /// a bug. If the removed range crosses the current membership epoch, the
    /// previous member set is restored.
    pub fn remove_entries(&self, from: LogIndex) -> Result<bool> {
        let mut state = self.lock();
        if state.log_size <= from {
            return Ok(false);
        }
        assert!(
            from > state.commit_index,
            "attempted to remove committed entries: commit index {}, from {from}",
            state.commit_index
        );
        warn!("Removing inconsistent log entries: [{from}, {})", state.log_size);

        let mut batch = WriteBatch::new();
        for index in from..state.log_size {
            batch.delete(&entry_key(index));
        }

        if from <= state.membership_epoch {
            // Rolling back an uncommitted membership epoch. Extremely
            // uncommon, so make noise about it.
            let previous_epoch = get_i64(&mut state.engine, PREVIOUS_MEMBERSHIP_EPOCH)?;
            let previous_members = get_raw(&mut state.engine, PREVIOUS_MEMBERS)?;
            batch.put(MEMBERSHIP_EPOCH, binary::encode_i64(previous_epoch).to_vec());
            batch.put(MEMBERS, previous_members.clone());
            error!(
                "Rolling back an uncommitted membership epoch: {} => {previous_epoch}. \
                 Restored members: {}",
                state.membership_epoch,
                String::from_utf8_lossy(&previous_members)
            );
            state.members = RaftMembers::decode(&previous_members)?;
            state.membership_epoch = previous_epoch;
        }

        Self::commit_batch(&mut state, batch, Some(from), true)?;
        let last = state.engine.get(&entry_key(from - 1))?.ok_or_else(|| {
            Error::InvalidData(format!("journal corruption: entry {} missing", from - 1))
        })?;
        state.term_of_last_entry = RaftEntry::decode_term(&last)?;
        Ok(true)
    }

    /// Deletes all entries in [log_start, new_start). Only committed (and
    /// thus applied or replicated) entries may be trimmed.
    pub fn trim_until(&self, new_start: LogIndex) -> Result<()> {
        let mut state = self.lock();
        if new_start <= state.log_start {
            return Ok(()); // no entries to trim
        }
        assert!(
            new_start <= state.log_size,
            "attempted to trim journal past its end: log size {}, new start {new_start}",
            state.log_size
        );
        assert!(
            new_start <= state.commit_index,
            "attempted to trim non-committed entries: commit index {}, new start {new_start}",
            state.commit_index
        );

        info!("Trimming raft journal from #{} until #{new_start}", state.log_start);
        let mut batch = WriteBatch::new();
        for index in state.log_start..new_start {
            batch.delete(&entry_key(index));
        }
        batch.put(LOG_START, binary::encode_i64(new_start).to_vec());
        Self::commit_batch(&mut state, batch, None, false)?;
        state.log_start = new_start;
        Ok(())
    }

    /// Checks whether the journal contains an entry at the given index with
    /// the given term.
    pub fn match_entries(&self, index: LogIndex, term: Term) -> Result<bool> {
        let mut state = self.lock();
        if state.log_size <= index {
            return Ok(false);
        }
        match state.engine.get(&entry_key(index))? {
            Some(serialized) => Ok(RaftEntry::decode_term(&serialized)? == term),
            None => Ok(false),
        }
    }

    /// Returns the first index at which the given entries differ from the
    /// journal, stopping at the log size.
    pub fn compare_entries(&self, start: LogIndex, entries: &[RaftEntry]) -> Result<LogIndex> {
        let mut state = self.lock();
        let end_index = std::cmp::min(state.log_size, start + entries.len() as LogIndex);
        let start_index = std::cmp::max(start, state.log_start);
        if start != start_index {
            error!(
                "Tried to compare entries that have already been trimmed; assuming they \
                 contain no inconsistencies. Log start: {}, compare from: {start}",
                state.log_start
            );
        }

        for index in start_index..end_index {
            let mine = Self::fetch_locked(&mut state, index)?.ok_or_else(|| {
                Error::InvalidData(format!("journal corruption: entry {index} missing"))
            })?;
            let theirs = &entries[(index - start) as usize];
            if mine != *theirs {
                warn!(
                    "Detected inconsistency for entry #{index}. Mine: {mine}. \
                     The leader sent: {theirs}"
                );
                return Ok(index);
            }
        }
        Ok(end_index)
    }

    // ----- Fetching ----------------------------------------------------------

    /// Fetches an entry by index, or None if it does not exist. Deliberately
    /// does not check the [log_start, log_size) bounds, to catch
    /// inconsistencies between the counters and the stored entries.
    pub fn fetch(&self, index: LogIndex) -> Result<Option<RaftEntry>> {
        let mut state = self.lock();
        Self::fetch_locked(&mut state, index)
    }

    fn fetch_locked(state: &mut JournalState, index: LogIndex) -> Result<Option<RaftEntry>> {
        state.engine.get(&entry_key(index))?.as_deref().map(RaftEntry::decode).transpose()
    }

    /// Fetches an entry that must exist.
    pub fn fetch_or_fail(&self, index: LogIndex) -> Result<RaftEntry> {
        self.fetch(index)?
            .ok_or_else(|| Error::InvalidData(format!("unable to fetch entry {index}")))
    }

    /// Fetches the serialized form of an entry.
    pub fn fetch_serialized(&self, index: LogIndex) -> Result<Option<Vec<u8>>> {
        self.lock().engine.get(&entry_key(index))
    }

    /// Fetches the last n entries with their indexes.
    pub fn fetch_last(&self, n: usize) -> Result<Vec<(LogIndex, RaftEntry)>> {
        let (log_size, log_start) = {
            let state = self.lock();
            (state.log_size, state.log_start)
        };
        let start = std::cmp::max(log_size - n as LogIndex, log_start);
        let mut entries = Vec::new();
        for index in start..log_size {
            entries.push((index, self.fetch_or_fail(index)?));
        }
        Ok(entries)
    }

    /// Builds a replication payload: up to limit serialized entries starting
    /// at next_index, together with the term of the last included entry.
    /// Returns None if an entry is missing (e.g. trimmed concurrently).
    pub fn build_payload(
        &self,
        next_index: LogIndex,
        limit: i64,
    ) -> Result<Option<(Vec<Vec<u8>>, Term)>> {
        let mut state = self.lock();
        let size = std::cmp::min(limit, state.log_size - next_index);
        let mut entries = Vec::with_capacity(std::cmp::max(size, 0) as usize);
        let mut last_term = -1;
        for index in next_index..next_index + size {
            match state.engine.get(&entry_key(index))? {
                Some(serialized) => {
                    last_term = RaftEntry::decode_term(&serialized)?;
                    entries.push(serialized);
                }
                None => {
                    error!("Could not fetch entry {index} while building payload, aborting");
                    return Ok(None);
                }
            }
        }
        Ok(Some((entries, last_term)))
    }

    /// Scans journal contents from a starting index, returning entries whose
    /// serialized form matches the glob pattern (empty pattern matches all),
    /// plus the next cursor (None when exhausted).
    pub fn scan_contents(
        &self,
        start: LogIndex,
        count: usize,
        pattern: &[u8],
    ) -> Result<(Vec<(LogIndex, RaftEntry)>, Option<LogIndex>)> {
        let matcher = if pattern.is_empty() { None } else { Some(Pattern::compile(pattern)?) };
        let (log_size, log_start) = {
            let state = self.lock();
            (state.log_size, state.log_start)
        };

        let mut out = Vec::new();
        let mut index = std::cmp::max(start, log_start);
        let mut visited = 0;
        while index < log_size && visited < count {
            let serialized = self.fetch_serialized(index)?.ok_or_else(|| {
                Error::InvalidData(format!("journal corruption: entry {index} missing"))
            })?;
            if matcher.as_ref().map_or(true, |m| m.matches(&serialized)) {
                out.push((index, RaftEntry::decode(&serialized)?));
            }
            visited += 1;
            index += 1;
        }
        let cursor = if index < log_size { Some(index) } else { None };
        Ok((out, cursor))
    }

    // ----- Maintenance -------------------------------------------------------

    /// Flushes the engine; called periodically by the fsync thread.
    pub fn flush(&self) -> Result<()> {
        self.lock().engine.flush()
    }

    /// Creates an online backup of the journal in the given directory.
    pub fn checkpoint(&self, path: &std::path::Path) -> Result<()> {
        self.lock().engine.checkpoint(path)
    }

    /// Triggers a manual engine compaction.
    pub fn manual_compaction(&self) -> Result<()> {
        self.lock().engine.compact()
    }

    /// Returns engine status.
    pub fn status(&self) -> Result<crate::storage::Status> {
        self.lock().engine.status()
    }
}

fn get_raw(engine: &mut Box<dyn Engine>, key: &[u8]) -> Result<Vec<u8>> {
    engine.get(key)?.ok_or_else(|| {
        Error::InvalidData(format!("missing journal key {}", String::from_utf8_lossy(key)))
    })
}

fn get_i64(engine: &mut Box<dyn Engine>, key: &[u8]) -> Result<i64> {
    binary::decode_i64(&get_raw(engine, key)?)
}

/// Issues periodic journal flushes in the background, bounding how much an
/// async fsync policy can lose on a crash.
pub struct FsyncThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl FsyncThread {
    pub fn spawn(journal: Arc<RaftJournal>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("journal-fsync".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if let Err(err) = journal.flush() {
                        error!("Journal fsync failed: {err}");
                    }
                }
            })
            .expect("failed to spawn fsync thread");
        Self { shutdown, handle: Some(handle) }
    }
}

impl Drop for FsyncThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    fn server(i: u16) -> RaftServer {
        RaftServer::new(format!("n{i}"), 7000 + i)
    }

    fn fresh() -> Result<RaftJournal> {
        RaftJournal::initialize(
            Box::new(Memory::new()),
            "test-cluster".to_string(),
            vec![server(1), server(2), server(3)],
            0,
            FsyncPolicy::SyncImportantUpdates,
        )
    }

    fn entry(term: Term, cmd: &str) -> RaftEntry {
        RaftEntry::new(term, cmd.split(' ').map(|t| t.as_bytes().to_vec()).collect())
    }

    #[test]
    fn initialize_writes_genesis() -> Result<()> {
        let journal = fresh()?;
        assert_eq!(journal.current_term(), 0);
        assert_eq!(journal.log_start(), 0);
        assert_eq!(journal.log_size(), 1);
        assert_eq!(journal.commit_index(), 0);
        assert_eq!(journal.voted_for(), VotedFor::None);

        let genesis = journal.fetch_or_fail(0)?;
        assert!(genesis.is_membership_update());
        assert_eq!(genesis.term, 0);

        let membership = journal.membership();
        assert_eq!(membership.epoch, 0);
        assert_eq!(membership.nodes, vec![server(1), server(2), server(3)]);
        Ok(())
    }

    #[test]
    fn append_enforces_term_and_position() -> Result<()> {
        let journal = fresh()?;
        assert!(journal.set_current_term(2, VotedFor::None)?);

        assert!(journal.append(1, &entry(1, "SET a 1"), false)?);
        assert!(journal.append(2, &entry(2, "SET a 2"), false)?);

        // Wrong position.
        assert!(!journal.append(5, &entry(2, "SET a 3"), false)?);
        // Higher term than the current one.
        assert!(!journal.append(3, &entry(3, "SET a 3"), false)?);
        // Lower term than the last entry.
        assert!(!journal.append(3, &entry(1, "SET a 3"), false)?);

        assert_eq!(journal.log_size(), 3);
        assert_eq!(journal.term_of_last_entry(), 2);
        Ok(())
    }

    #[test]
    fn term_and_vote_rules() -> Result<()> {
        let journal = fresh()?;
        assert!(journal.set_current_term(1, VotedFor::Node(server(1)))?);
        // The vote for a term never changes.
        assert!(!journal.set_current_term(1, VotedFor::Node(server(2)))?);
        // Terms never regress.
        assert!(!journal.set_current_term(0, VotedFor::None)?);
        // A new term resets the vote.
        assert!(journal.set_current_term(2, VotedFor::None)?);
        assert_eq!(journal.voted_for(), VotedFor::None);
        assert!(journal.set_current_term(2, VotedFor::Blocked)?);
        assert_eq!(journal.voted_for(), VotedFor::Blocked);
        Ok(())
    }

    #[test]
    fn reopen_preserves_state() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("quarkdb")?;
        let path = dir.path().join("journal");

        let journal = RaftJournal::initialize(
            Box::new(crate::storage::BitCask::new(path.clone())?),
            "test-cluster".to_string(),
            vec![server(1), server(2)],
            0,
            FsyncPolicy::Always,
        )?;
        journal.set_current_term(3, VotedFor::Node(server(2)))?;
        journal.append(1, &entry(3, "SET a 1"), false)?;
        journal.set_commit_index(1)?;
        drop(journal);

        let journal = RaftJournal::open(Box::new(crate::storage::BitCask::new(path)?))?;
        assert_eq!(journal.current_term(), 3);
        assert_eq!(journal.voted_for(), VotedFor::Node(server(2)));
        assert_eq!(journal.log_size(), 2);
        assert_eq!(journal.commit_index(), 1);
        assert_eq!(journal.cluster_id(), "test-cluster");
        assert_eq!(journal.fetch_or_fail(1)?, entry(3, "SET a 1"));
        Ok(())
    }

    #[test]
    fn match_and_compare_entries() -> Result<()> {
        let journal = fresh()?;
        journal.set_current_term(1, VotedFor::None)?;
        journal.append(1, &entry(1, "SET a 1"), false)?;
        journal.append(2, &entry(1, "SET b 2"), false)?;

        assert!(journal.match_entries(2, 1)?);
        assert!(!journal.match_entries(2, 0)?);
        assert!(!journal.match_entries(7, 1)?);

        // Identical prefix, divergence at index 2.
        let theirs = vec![entry(1, "SET a 1"), entry(1, "SET x 9"), entry(1, "SET y 9")];
        assert_eq!(journal.compare_entries(1, &theirs)?, 2);

        // Full match runs off the end of our log.
        let theirs = vec![entry(1, "SET a 1"), entry(1, "SET b 2"), entry(1, "SET c 3")];
        assert_eq!(journal.compare_entries(1, &theirs)?, 3);
        Ok(())
    }

    #[test]
    fn remove_entries_rolls_back_membership() -> Result<()> {
        let journal = fresh()?;
        journal.set_current_term(1, VotedFor::None)?;
        journal.append(1, &entry(1, "SET a 1"), false)?;
        journal.set_commit_index(1)?;

        let before = journal.membership();

        // Append (but do not commit) a membership update; it takes effect
        // immediately.
        journal.add_observer(1, &server(4))?;
        let during = journal.membership();
        assert_eq!(during.epoch, 2);
        assert_eq!(during.observers, vec![server(4)]);

        // A second change is refused while the epoch is uncommitted.
        assert!(journal.add_observer(1, &server(5)).is_err());

        // A new leader overwrites the uncommitted entry: the previous member
        // set and epoch come back exactly.
        assert!(journal.remove_entries(2)?);
        let after = journal.membership();
        assert_eq!(after, before);
        assert_eq!(journal.log_size(), 2);
        Ok(())
    }

    #[test]
    fn trimming() -> Result<()> {
        let journal = fresh()?;
        journal.set_current_term(1, VotedFor::None)?;
        for i in 1..=5 {
            journal.append(i, &entry(1, &format!("SET k{i} v")), false)?;
        }
        journal.set_commit_index(3)?;

        journal.trim_until(2)?;
        assert_eq!(journal.log_start(), 2);
        assert_eq!(journal.fetch(1)?, None);
        assert_eq!(journal.fetch_or_fail(2)?, entry(1, "SET k2 v"));

        // Trimming uncommitted entries is a bug.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            journal.trim_until(5).ok();
        }));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn payloads_and_scans() -> Result<()> {
        let journal = fresh()?;
        journal.set_current_term(1, VotedFor::None)?;
        for i in 1..=4 {
            journal.append(i, &entry(1, &format!("SET k{i} v")), false)?;
        }

        let (payload, last_term) = journal.build_payload(1, 2)?.expect("payload must build");
        assert_eq!(payload.len(), 2);
        assert_eq!(last_term, 1);
        assert_eq!(RaftEntry::decode(&payload[0])?, entry(1, "SET k1 v"));

        // A limit beyond the log end is capped.
        let (payload, _) = journal.build_payload(3, 100)?.expect("payload must build");
        assert_eq!(payload.len(), 2);

        let last = journal.fetch_last(2)?;
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].0, 3);

        let (matches, cursor) = journal.scan_contents(0, 3, b"")?;
        assert_eq!(matches.len(), 3);
        assert_eq!(cursor, Some(3));
        let (matches, cursor) = journal.scan_contents(3, 10, b"*k4*")?;
        assert_eq!(matches.len(), 1);
        assert_eq!(cursor, None);
        Ok(())
    }
}
