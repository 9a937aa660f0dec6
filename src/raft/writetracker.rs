use super::journal::RaftJournal;
use super::lease::RaftCommitTracker;
use super::types::{LogIndex, RaftEntry, Term};
use crate::error::Result;
use crate::redis::{EncodedResponse, PendingQueue, RedisDispatcher, Transaction};

use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks the state of pending writes and applies committed journal entries
/// to the state machine.
///
/// On the leader, every write is (i) appended to the journal, (ii)
/// registered on its connection's pending queue, (iii) replicated, (iv)
/// committed, (v) applied here at last-applied = index, (vi) resolved into
/// the queue, which (vii) flushes everything in submission order. The
/// commit applier below is the only thread that applies entries, on leaders
/// and followers alike, which keeps journal order equal to apply order.
pub struct RaftWriteTracker {
    journal: Arc<RaftJournal>,
    dispatcher: Arc<RedisDispatcher>,
    commit_tracker: Arc<RaftCommitTracker>,
    blocked: Mutex<HashMap<LogIndex, Arc<PendingQueue>>>,
    shutdown: AtomicBool,
    applier: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RaftWriteTracker {
    /// Creates the tracker and spawns the commit applier thread.
    pub fn new(
        journal: Arc<RaftJournal>,
        dispatcher: Arc<RedisDispatcher>,
        commit_tracker: Arc<RaftCommitTracker>,
    ) -> Arc<Self> {
        let tracker = Arc::new(Self {
            journal,
            dispatcher,
            commit_tracker,
            blocked: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            applier: Mutex::new(None),
        });

        let worker = tracker.clone();
        let handle = std::thread::Builder::new()
            .name("commit-applier".to_string())
            .spawn(move || worker.apply_commits())
            .expect("failed to spawn commit applier");
        *tracker.applier.lock().expect("lock poisoned") = Some(handle);
        tracker
    }

    /// The number of writes still blocked on commit progress.
    pub fn blocked_writes(&self) -> usize {
        self.blocked.lock().expect("lock poisoned").len()
    }

    /// Appends a client write to the journal at the next index and registers
    /// it on the connection's queue. Returns false if the journal refused
    /// the entry (e.g. a term race during leadership changes).
    ///
    /// Serializing on the blocked map keeps index reservation atomic, and
    /// keeps the applier from resolving an entry before its queue is
    /// registered.
    pub fn append(
        &self,
        term: Term,
        tx: Transaction,
        queue: Arc<PendingQueue>,
    ) -> Result<bool> {
        let mut blocked = self.blocked.lock()?;
        let index = self.journal.log_size();
        let entry = RaftEntry::new(term, tx.to_entry_request());
        if !self.journal.append(index, &entry, false)? {
            return Ok(false);
        }
        queue.add_pending_write(index, tx.expected_responses());
        blocked.insert(index, queue);
        drop(blocked);

        // A single-node cluster has quorum on its own; multi-node clusters
        // advance through replica acknowledgements.
        self.commit_tracker.recompute()?;
        Ok(true)
    }

    /// Answers every blocked write with the given response and forgets them,
    /// e.g. with an unavailable error when the leader steps down.
    pub fn flush_queues(&self, message: &EncodedResponse) {
        let queues: Vec<Arc<PendingQueue>> =
            self.blocked.lock().expect("lock poisoned").drain().map(|(_, queue)| queue).collect();
        for queue in queues {
            queue.flush_pending(message);
        }
    }

    /// Requests applier shutdown and joins it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.journal.notify_waiting_threads();
        if let Some(handle) = self.applier.lock().expect("lock poisoned").take() {
            handle.join().ok();
        }
    }

    /// The commit applier: waits for commit-index progress and applies each
    /// newly committed entry exactly once.
    fn apply_commits(&self) {
        let sm = self.dispatcher.state_machine().clone();
        while !self.shutdown.load(Ordering::Relaxed) {
            let applied = sm.last_applied();
            let commit =
                self.journal.wait_for_commits(applied, Duration::from_millis(500));
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            for index in applied + 1..=commit {
                self.apply_single_commit(index);
            }
        }
    }

    /// Applies the committed entry at the given index. Failures here are
    /// process-fatal: partially applying a committed entry would violate
    /// at-most-once application.
    fn apply_single_commit(&self, index: LogIndex) {
        let entry = self
            .journal
            .fetch_or_fail(index)
            .expect("committed journal entry must be fetchable");
        let queue = self.blocked.lock().expect("lock poisoned").remove(&index);

        // Membership updates took effect on append, leadership markers carry
        // no state: both apply as no-ops that only advance last-applied.
        if entry.is_membership_update() || entry.is_leadership_marker() {
            let sm = self.dispatcher.state_machine();
            let staging = sm.begin_write();
            sm.commit(staging, index).expect("failed to advance last-applied");
            debug!("Applied marker entry at index {index}");
            return;
        }

        let tx = Transaction::from_entry_request(&entry.request)
            .expect("committed journal entry must parse");
        let responses = self.dispatcher.apply(&tx, index);
        if let Some(queue) = queue {
            queue.fulfill_write(index, EncodedResponse::concat(responses), &self.dispatcher);
        }
    }
}
