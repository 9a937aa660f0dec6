use super::journal::RaftJournal;
use super::lease::{RaftCommitTracker, RaftLease};
use super::message::{AppendEntriesRequest, HeartbeatRequest};
use super::state::{RaftState, StateSnapshot};
use super::talker::RaftTalker;
use super::timeouts::ContactDetails;
use super::trimmer::{RaftTrimmer, TrimmingBlock};
use super::types::{LogIndex, RaftServer, ReplicaStatus, ReplicationStatus, Term};
use crate::error::Result;

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Streaming pushes at most this many entries per append.
const STREAMING_PAYLOAD: i64 = 512;

/// Streaming keeps at most this many appends in flight before the sender
/// waits for acknowledgements.
const STREAMING_WINDOW: usize = 512;

/// Conservative replication doubles its payload up to this limit.
const MAX_PAYLOAD: i64 = 1024;

/// Switch to streaming once the target is stable at this payload size.
const STREAMING_THRESHOLD: i64 = 8;

/// Lift a target's trimming block after it has been offline this long; it
/// will be resilvered when it comes back.
const OFFLINE_GRACE: Duration = Duration::from_secs(60);

/// Starts resilvering of a fallen-behind target. Implemented by the shard
/// directory, which owns the engine files being copied.
pub trait ResilveringTrigger: Send + Sync {
    /// Begins (or continues) resilvering; must not block the replicator.
    fn trigger_resilvering(&self, target: &RaftServer);
}

/// A no-op trigger, for deployments without resilvering and for tests.
pub struct NoResilvering;

impl ResilveringTrigger for NoResilvering {
    fn trigger_resilvering(&self, _target: &RaftServer) {}
}

/// Drives replication while this node is leader: one tracker per target
/// (voter or observer), each with a heartbeat thread and a replication
/// thread that moves between conservative and streaming modes.
pub struct RaftReplicator {
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
    lease: Arc<RaftLease>,
    commit_tracker: Arc<RaftCommitTracker>,
    trimmer: Arc<RaftTrimmer>,
    contact: ContactDetails,
    resilvering: Arc<dyn ResilveringTrigger>,
    inner: Mutex<ReplicatorState>,
}

struct ReplicatorState {
    snapshot: Option<Arc<StateSnapshot>>,
    targets: HashMap<RaftServer, ReplicaTracker>,
}

impl RaftReplicator {
    pub fn new(
        journal: Arc<RaftJournal>,
        state: Arc<RaftState>,
        lease: Arc<RaftLease>,
        commit_tracker: Arc<RaftCommitTracker>,
        trimmer: Arc<RaftTrimmer>,
        contact: ContactDetails,
        resilvering: Arc<dyn ResilveringTrigger>,
    ) -> Self {
        Self {
            journal,
            state,
            lease,
            commit_tracker,
            trimmer,
            contact,
            resilvering,
            inner: Mutex::new(ReplicatorState { snapshot: None, targets: HashMap::new() }),
        }
    }

    /// Activates replication for a leadership stint.
    pub fn activate(&self, snapshot: StateSnapshot) {
        info!("Activating replicator for term {}", snapshot.term);
        {
            let mut inner = self.inner.lock().expect("lock poisoned");
            assert!(inner.targets.is_empty(), "replicator already active");
            inner.snapshot = Some(Arc::new(snapshot));
        }
        self.commit_tracker.reset();
        self.reconfigure();
        // A single-node cluster reaches quorum with its own log; larger
        // clusters advance through replica acknowledgements.
        self.commit_tracker.recompute().ok();
    }

    /// Rebuilds the target set from the current membership, e.g. after a
    /// membership epoch change. Full nodes feed the lease and commit
    /// trackers; observers are replicated to but affect neither.
    pub fn reconfigure(&self) {
        let membership = self.journal.membership();
        info!("Reconfiguring replicator for membership epoch {}", membership.epoch);

        let myself = self.state.myself();
        let full_nodes: Vec<RaftServer> =
            membership.nodes.iter().filter(|node| *node != myself).cloned().collect();
        assert!(
            !membership.observers.contains(myself),
            "found myself in the list of observers, even though I'm leader"
        );
        let mut targets = full_nodes.clone();
        targets.extend(membership.observers.iter().cloned());

        self.commit_tracker.update_targets(&full_nodes);
        self.lease.update_targets(&full_nodes);

        let mut inner = self.inner.lock().expect("lock poisoned");
        let Some(snapshot) = inner.snapshot.clone() else { return };

        // Stop trackers for removed targets.
        let stale: Vec<RaftServer> =
            inner.targets.keys().filter(|server| !targets.contains(server)).cloned().collect();
        for server in stale {
            if let Some(tracker) = inner.targets.remove(&server) {
                tracker.stop(&self.journal);
            }
        }

        // Start trackers for new ones.
        for target in targets {
            if !inner.targets.contains_key(&target) {
                let tracker = ReplicaTracker::launch(
                    target.clone(),
                    snapshot.clone(),
                    self.journal.clone(),
                    self.state.clone(),
                    self.lease.clone(),
                    self.commit_tracker.clone(),
                    self.trimmer.clone(),
                    self.contact.clone(),
                    self.resilvering.clone(),
                );
                inner.targets.insert(target, tracker);
            }
        }
    }

    /// Stops all trackers, e.g. when leadership ends.
    pub fn deactivate(&self) {
        info!("De-activating replicator");
        let mut inner = self.inner.lock().expect("lock poisoned");
        for (_, tracker) in inner.targets.drain() {
            tracker.stop(&self.journal);
        }
        inner.snapshot = None;
        self.commit_tracker.reset();
    }

    /// The aggregate replication status, for RAFT_INFO and membership
    /// quorum checks.
    pub fn status(&self) -> ReplicationStatus {
        let inner = self.inner.lock().expect("lock poisoned");
        let replicas =
            inner.targets.values().map(|tracker| tracker.status.lock().expect("lock poisoned").clone()).collect();
        ReplicationStatus { replicas, shaky_quorum: self.lease.shaky() }
    }
}

impl Drop for RaftReplicator {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// One replication target: the replication thread plus a heartbeat thread.
struct ReplicaTracker {
    shutdown: Arc<AtomicBool>,
    status: Arc<Mutex<ReplicaStatus>>,
    replication: Option<std::thread::JoinHandle<()>>,
    heartbeat: Option<std::thread::JoinHandle<()>>,
}

impl ReplicaTracker {
    #[allow(clippy::too_many_arguments)]
    fn launch(
        target: RaftServer,
        snapshot: Arc<StateSnapshot>,
        journal: Arc<RaftJournal>,
        state: Arc<RaftState>,
        lease: Arc<RaftLease>,
        commit_tracker: Arc<RaftCommitTracker>,
        trimmer: Arc<RaftTrimmer>,
        contact: ContactDetails,
        resilvering: Arc<dyn ResilveringTrigger>,
    ) -> Self {
        assert!(target != *state.myself(), "attempted to run replication on myself");

        let shutdown = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(ReplicaStatus {
            target: target.clone(),
            online: false,
            log_size: -1,
        }));

        let flow = ReplicationFlow {
            target: target.clone(),
            snapshot: snapshot.clone(),
            journal,
            state: state.clone(),
            lease: lease.clone(),
            commit_tracker,
            trimming_block: trimmer.block(),
            contact: contact.clone(),
            resilvering,
            shutdown: shutdown.clone(),
            status: status.clone(),
        };
        let replication = std::thread::Builder::new()
            .name(format!("replicator-{target}"))
            .spawn(move || flow.run())
            .expect("failed to spawn replication thread");

        let beat_shutdown = shutdown.clone();
        let beat_target = target.clone();
        let heartbeat = std::thread::Builder::new()
            .name(format!("heartbeat-{target}"))
            .spawn(move || {
                send_heartbeats(beat_target, snapshot, state, lease, contact, beat_shutdown)
            })
            .expect("failed to spawn heartbeat thread");

        Self {
            shutdown,
            status,
            replication: Some(replication),
            heartbeat: Some(heartbeat),
        }
    }

    fn stop(mut self, journal: &RaftJournal) {
        self.shutdown.store(true, Ordering::Relaxed);
        journal.notify_waiting_threads();
        if let Some(handle) = self.replication.take() {
            handle.join().ok();
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.join().ok();
        }
    }
}

/// The heartbeat flow: cheap liveness at the heartbeat interval, feeding the
/// lease tracker on positive replies.
fn send_heartbeats(
    target: RaftServer,
    snapshot: Arc<StateSnapshot>,
    state: Arc<RaftState>,
    lease: Arc<RaftLease>,
    contact: ContactDetails,
    shutdown: Arc<AtomicBool>,
) {
    let talker = RaftTalker::new(target.clone(), contact.clone());
    let request =
        HeartbeatRequest { term: snapshot.term, leader: state.myself().clone() };

    while !shutdown.load(Ordering::Relaxed) && state.is_snapshot_current(&snapshot) {
        let sent = Instant::now();
        match talker.heartbeat(&request, contact.timeouts.heartbeat) {
            Ok(response) => {
                state.observed(response.term, None).ok();
                if snapshot.term >= response.term && response.node_recognized_as_leader {
                    lease.heartbeat(&target, sent);
                }
            }
            Err(_) => talker.disconnect(),
        }
        state.wait(contact.timeouts.heartbeat);
    }
}

/// Tracks whether the target looks alive, and for how long it has been
/// gone.
struct OnlineTracker {
    online: bool,
    last_seen: Instant,
}

impl OnlineTracker {
    fn new() -> Self {
        Self { online: false, last_seen: Instant::now() }
    }

    fn seen_online(&mut self) {
        self.online = true;
        self.last_seen = Instant::now();
    }

    fn seen_offline(&mut self) {
        self.online = false;
    }

    fn offline_for_long(&self) -> bool {
        !self.online && self.last_seen.elapsed() > OFFLINE_GRACE
    }
}

/// An in-flight streamed append awaiting acknowledgement.
struct PendingAck {
    sent: Instant,
    pushed_from: LogIndex,
    payload_size: i64,
    last_entry_term: Term,
}

/// The replication flow for one target.
struct ReplicationFlow {
    target: RaftServer,
    snapshot: Arc<StateSnapshot>,
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
    lease: Arc<RaftLease>,
    commit_tracker: Arc<RaftCommitTracker>,
    trimming_block: TrimmingBlock,
    contact: ContactDetails,
    resilvering: Arc<dyn ResilveringTrigger>,
    shutdown: Arc<AtomicBool>,
    status: Arc<Mutex<ReplicaStatus>>,
}

impl ReplicationFlow {
    fn active(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed) && self.state.is_snapshot_current(&self.snapshot)
    }

    fn update_status(&self, online: bool, log_size: LogIndex) {
        let mut status = self.status.lock().expect("lock poisoned");
        status.online = online;
        status.log_size = log_size;
    }

    /// Builds and sends one append, returning the payload size and the term
    /// of its last entry. Returns None on conditions that end this
    /// leadership (missing entries, higher-term entries).
    fn send_payload(
        &self,
        talker: &RaftTalker,
        next_index: LogIndex,
        payload_limit: i64,
    ) -> Result<Option<(i64, Term)>> {
        let Some(prev_entry) = self.journal.fetch(next_index - 1)? else {
            warn!(
                "Unable to fetch entry {} when tracking {}; log starts at {}",
                next_index - 1,
                self.target,
                self.journal.log_start()
            );
            self.state.observed(self.snapshot.term + 1, None)?;
            return Ok(None);
        };
        if self.snapshot.term < prev_entry.term {
            warn!("Last journal entry has a higher term than my snapshot, halting replication");
            self.state.observed(self.snapshot.term + 1, None)?;
            return Ok(None);
        }

        // The commit index must be captured before reading the entries. If a
        // new leader overwrites inconsistent entries after we build the
        // batch, sending the new commit index with the old entries could
        // mark inconsistent entries as committed on the target.
        let commit_index = self.journal.commit_index();

        let Some((entries, last_entry_term)) =
            self.journal.build_payload(next_index, payload_limit)?
        else {
            self.state.observed(self.snapshot.term + 1, None)?;
            return Ok(None);
        };
        let payload_size = entries.len() as i64;

        let request = AppendEntriesRequest {
            term: self.snapshot.term,
            leader: self.state.myself().clone(),
            prev_index: next_index - 1,
            prev_term: prev_entry.term,
            commit_index,
            entries,
        };
        talker.send_append_entries(&request)?;
        Ok(Some((payload_size, last_entry_term)))
    }

    /// The main replication loop. Starts in conservative mode (one entry per
    /// append, waiting for each acknowledgement), doubling the payload while
    /// the target keeps up, and hands over to streaming once it looks
    /// stable.
    fn run(self) {
        let talker = RaftTalker::new(self.target.clone(), self.contact.clone());
        let mut next_index = self.journal.log_size();
        let mut online = OnlineTracker::new();
        let mut payload_limit: i64 = 1;
        let mut last_log_size: LogIndex = -1;
        let mut warn_streaming_hiccup = false;
        let mut need_resilvering = false;

        while self.active() {
            if warn_streaming_hiccup {
                warn!(
                    "Hiccup during streaming replication of {}, switching back to \
                     conservative replication",
                    self.target
                );
                warn_streaming_hiccup = false;
            }

            // Target looks stable: start the continuous stream.
            if online.online && payload_limit >= STREAMING_THRESHOLD {
                info!("Target {} appears stable, initiating streaming replication", self.target);
                next_index = self.stream_updates(&talker, next_index);
                // Whatever happened, the connection state is unknown now;
                // reconnect and stabilize the target conservatively.
                talker.disconnect();
                warn_streaming_hiccup = true;
                online.seen_online();
                payload_limit = 1;
                continue;
            }

            assert!(next_index > 0, "next index must never reach the genesis entry");
            if next_index <= self.journal.log_start() {
                next_index = self.journal.log_size();
            }

            let sent = Instant::now();
            let response = self
                .send_payload(&talker, next_index, payload_limit)
                .ok()
                .flatten()
                .and_then(|(payload_size, last_entry_term)| {
                    talker
                        .receive_append_entries(self.contact.timeouts.heartbeat)
                        .ok()
                        .map(|resp| (resp, payload_size, last_entry_term))
                });

            let Some((response, payload_size, last_entry_term)) = response else {
                if !self.active() {
                    break;
                }
                talker.disconnect();
                if online.online {
                    payload_limit = 1;
                    info!("Replication target {} went offline", self.target);
                    online.seen_offline();
                }
                self.next_round(&mut online, need_resilvering, next_index, last_log_size);
                continue;
            };

            if !online.online {
                online.seen_online();
                info!(
                    "Replication target {} came back online, lagging approximately {} \
                     entries behind me",
                    self.target,
                    self.journal.log_size() - response.log_size
                );
            } else {
                online.seen_online();
            }
            last_log_size = response.log_size;

            self.state.observed(response.term, None).ok();
            if self.snapshot.term < response.term {
                continue; // our term ended; the loop condition exits
            }
            self.lease.heartbeat(&self.target, sent);

            // Target has fallen off the start of our journal: it needs a
            // full state transfer.
            if response.log_size <= self.journal.log_start() {
                next_index = self.journal.log_size();
                if !need_resilvering {
                    info!(
                        "Unable to replicate onto {}: its log size {} is behind my log \
                         start {}; resilvering needed",
                        self.target,
                        response.log_size,
                        self.journal.log_start()
                    );
                    need_resilvering = true;
                    payload_limit = 1;
                }
                self.resilvering.trigger_resilvering(&self.target);
                self.next_round(&mut online, need_resilvering, next_index, last_log_size);
                continue;
            }
            need_resilvering = false;

            // Our view of the target's journal was wrong: back up one entry
            // per round, or jump back if its log is shorter than we thought.
            if !response.outcome {
                if next_index >= 2 && next_index <= response.log_size {
                    next_index -= 1;
                } else if response.log_size > 0 {
                    next_index = response.log_size;
                }
                self.next_round(&mut online, need_resilvering, next_index, last_log_size);
                continue;
            }

            if next_index + payload_size != response.log_size {
                warn!(
                    "Mismatch in expected log size for {}: nextIndex {} + payload {} != {}",
                    self.target, next_index, payload_size, response.log_size
                );
            }

            // Only update the commit tracker once we're replicating entries
            // from our own term (figure 8 and section 5.4.2 of the Raft
            // paper).
            if last_entry_term == self.snapshot.term {
                self.commit_tracker.update(&self.target, response.log_size - 1).ok();
            }

            next_index = response.log_size;
            if payload_limit < MAX_PAYLOAD {
                payload_limit *= 2;
            }
            self.next_round(&mut online, need_resilvering, next_index, last_log_size);
        }
        info!("Shutting down replica tracker for {}", self.target);
    }

    /// End-of-round bookkeeping: progress or lift the trimming block, record
    /// status, and wait for more work.
    fn next_round(
        &self,
        online: &mut OnlineTracker,
        need_resilvering: bool,
        next_index: LogIndex,
        log_size: LogIndex,
    ) {
        if online.offline_for_long() {
            // Don't let a permanently offline node block journal trimming
            // indefinitely; it will be resilvered upon reconnection.
            self.trimming_block.lift();
        } else {
            self.trimming_block.enforce(next_index - 2);
        }
        self.update_status(online.online, log_size);

        if !online.online || need_resilvering {
            self.state.wait(self.contact.timeouts.heartbeat);
        } else if next_index >= self.journal.log_size() {
            self.journal.wait_for_updates(next_index, self.contact.timeouts.heartbeat);
        }
        // Otherwise: don't wait, fire the next round of updates.
    }

    /// Streaming mode: push payloads optimistically up to a bounded window
    /// while an acknowledgement thread pops replies in order. Returns the
    /// next index to replicate from; the caller stabilizes the target
    /// conservatively after any anomaly.
    fn stream_updates(&self, talker: &RaftTalker, first_next_index: LogIndex) -> LogIndex {
        let streaming = Arc::new(AtomicBool::new(true));
        // The channel capacity is the in-flight window: the sender blocks
        // once that many appends await acknowledgement.
        let (ack_tx, ack_rx) = crossbeam::channel::bounded::<PendingAck>(STREAMING_WINDOW);

        let monitor =
            AckMonitor { flow: self, talker, streaming: streaming.clone(), acks: ack_rx };

        let mut next_index = first_next_index;
        std::thread::scope(|scope| {
            let ack_handle = scope.spawn(move || monitor.run());

            'sender: while self.active() && streaming.load(Ordering::Relaxed) {
                match self.send_payload(talker, next_index, STREAMING_PAYLOAD) {
                    Ok(Some((payload_size, last_entry_term))) => {
                        let mut ack = PendingAck {
                            sent: Instant::now(),
                            pushed_from: next_index,
                            payload_size,
                            last_entry_term,
                        };
                        loop {
                            match ack_tx.send_timeout(ack, self.contact.timeouts.heartbeat) {
                                Ok(()) => break,
                                Err(SendTimeoutError::Timeout(returned)) => {
                                    if !self.active() || !streaming.load(Ordering::Relaxed) {
                                        break 'sender;
                                    }
                                    ack = returned;
                                }
                                Err(SendTimeoutError::Disconnected(_)) => break 'sender,
                            }
                        }

                        // Assume a positive response and keep pushing if
                        // there are more entries.
                        next_index += payload_size;
                        if next_index >= self.journal.log_size() {
                            self.journal
                                .wait_for_updates(next_index, self.contact.timeouts.heartbeat);
                        }
                    }
                    Ok(None) | Err(_) => {
                        warn!(
                            "Unexpected error when sending streamed payload to {}, \
                             halting replication",
                            self.target
                        );
                        break;
                    }
                }
            }

            streaming.store(false, Ordering::Relaxed);
            drop(ack_tx);
            ack_handle.join().ok();
        });

        // No guarantee this is the target's actual log size; the caller
        // figures it out.
        next_index
    }
}

/// The single consumer of streamed acknowledgements. Any mismatch,
/// refusal, timeout or higher-term observation stops the stream.
struct AckMonitor<'a> {
    flow: &'a ReplicationFlow,
    talker: &'a RaftTalker,
    streaming: Arc<AtomicBool>,
    acks: Receiver<PendingAck>,
}

impl AckMonitor<'_> {
    fn run(self) {
        let heartbeat = self.flow.contact.timeouts.heartbeat;

        while self.flow.active() && self.streaming.load(Ordering::Relaxed) {
            let item = match self.acks.recv_timeout(heartbeat) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let response = match self.talker.receive_append_entries(heartbeat) {
                Ok(response) => response,
                Err(_) => {
                    // The target needs to be stabilized; stop streaming.
                    self.streaming.store(false, Ordering::Relaxed);
                    return;
                }
            };

            self.flow.state.observed(response.term, None).ok();
            if !response.outcome
                || response.term != self.flow.snapshot.term
                || response.log_size != item.pushed_from + item.payload_size
            {
                if response.log_size != item.pushed_from + item.payload_size {
                    warn!(
                        "Mismatch in expected log size when streaming to {}: response {} \
                         vs pushed {} + {}",
                        self.flow.target, response.log_size, item.pushed_from, item.payload_size
                    );
                }
                self.streaming.store(false, Ordering::Relaxed);
                return;
            }

            // Acknowledgement checks out: record progress.
            self.flow.update_status(true, response.log_size);
            self.flow.lease.heartbeat(&self.flow.target, item.sent);
            if item.last_entry_term == self.flow.snapshot.term {
                self.flow.commit_tracker.update(&self.flow.target, response.log_size - 1).ok();
            }
            self.flow.trimming_block.enforce(response.log_size - 2);
        }
        self.streaming.store(false, Ordering::Relaxed);
    }
}
