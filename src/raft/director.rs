use super::journal::RaftJournal;
use super::lease::RaftLease;
use super::message::{VoteRequest, VoteResponse};
use super::replicator::RaftReplicator;
use super::state::RaftState;
use super::talker::RaftTalker;
use super::timeouts::{ContactDetails, HeartbeatTracker};
use super::trimmer::RaftTrimmer;
use super::types::{quorum_size, LogIndex, RaftStatus, Vote};
use super::writetracker::RaftWriteTracker;
use crate::redis::formatter;

use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Journal trimming configuration: trim once the journal spans more than
/// `threshold` entries, keeping the last `keep` committed entries around.
#[derive(Clone, Copy, Debug)]
pub struct TrimConfig {
    pub threshold: LogIndex,
    pub keep: LogIndex,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self { threshold: 1_000_000, keep: 900_000 }
    }
}

/// The outcome of an election round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ElectionOutcome {
    Elected,
    NotElected,
    Vetoed,
}

/// The single Raft orchestrator: runs the follower election timer and the
/// leader loop (exactly one of the two at any time), campaigns with a
/// mandatory pre-vote stage, and owns the journal trimmer thread. The commit
/// applier lives in the write tracker.
pub struct RaftDirector {
    state: Arc<RaftState>,
    journal: Arc<RaftJournal>,
    main: Mutex<Option<std::thread::JoinHandle<()>>>,
    trimmer_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct DirectorContext {
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
    replicator: Arc<RaftReplicator>,
    write_tracker: Arc<RaftWriteTracker>,
    heartbeat_tracker: Arc<HeartbeatTracker>,
    lease: Arc<RaftLease>,
    contact: ContactDetails,
}

impl RaftDirector {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        journal: Arc<RaftJournal>,
        state: Arc<RaftState>,
        replicator: Arc<RaftReplicator>,
        write_tracker: Arc<RaftWriteTracker>,
        heartbeat_tracker: Arc<HeartbeatTracker>,
        lease: Arc<RaftLease>,
        trimmer: Arc<RaftTrimmer>,
        trim_config: TrimConfig,
        contact: ContactDetails,
    ) -> Self {
        let context = DirectorContext {
            journal: journal.clone(),
            state: state.clone(),
            replicator,
            write_tracker,
            heartbeat_tracker,
            lease,
            contact,
        };
        let main = std::thread::Builder::new()
            .name("raft-director".to_string())
            .spawn(move || main_loop(context))
            .expect("failed to spawn director");

        let trim_state = state.clone();
        let trimmer_thread = std::thread::Builder::new()
            .name("journal-trimmer".to_string())
            .spawn(move || {
                while !trim_state.in_shutdown() {
                    if let Err(err) = trimmer.trim(trim_config.threshold, trim_config.keep) {
                        error!("Journal trimming failed: {err}");
                    }
                    trim_state.wait(Duration::from_secs(1));
                }
            })
            .expect("failed to spawn trimmer");

        Self {
            state,
            journal,
            main: Mutex::new(Some(main)),
            trimmer_thread: Mutex::new(Some(trimmer_thread)),
        }
    }

    /// Shuts the director down and joins its threads.
    pub fn shutdown(&self) {
        self.state.shutdown();
        self.journal.notify_waiting_threads();
        if let Some(handle) = self.trimmer_thread.lock().expect("lock poisoned").take() {
            handle.join().ok();
        }
        if let Some(handle) = self.main.lock().expect("lock poisoned").take() {
            handle.join().ok();
        }
    }
}

impl Drop for RaftDirector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn main_loop(ctx: DirectorContext) {
    ctx.heartbeat_tracker.heartbeat();
    loop {
        ctx.heartbeat_tracker.refresh_random_timeout();
        let snapshot = ctx.state.snapshot();

        match snapshot.status {
            RaftStatus::Shutdown => return,
            RaftStatus::Follower | RaftStatus::Observer => act_as_follower(&ctx),
            RaftStatus::Leader => {
                act_as_leader(&ctx);
                ctx.heartbeat_tracker.heartbeat();
            }
            RaftStatus::Candidate => {
                // Elections run synchronously inside act_as_follower.
                unreachable!("director observed candidate status")
            }
        }
    }
}

/// Waits out the randomized election timeout, campaigning once heartbeats
/// stop arriving -- but only full members ever campaign.
fn act_as_follower(ctx: &DirectorContext) {
    let snapshot = ctx.state.snapshot();
    let random_timeout = ctx.heartbeat_tracker.random_timeout();
    loop {
        let now = ctx.state.snapshot();
        if now.term != snapshot.term || now.status != snapshot.status {
            return;
        }

        ctx.state.wait(random_timeout);
        if ctx.heartbeat_tracker.timed_out() {
            if ctx.journal.membership().contains(ctx.state.myself()) {
                info!(
                    "{}: timeout after {:?}, I am not receiving heartbeats. Attempting to \
                     start election.",
                    ctx.state.myself(),
                    random_timeout
                );
                run_for_leader(ctx);
                return;
            }
            warn!(
                "I am not receiving heartbeats, but I am not a full member in membership \
                 epoch {}; will keep waiting",
                ctx.journal.membership().epoch
            );
        }
    }
}

/// Replicates while leadership lasts. Returns when the term, status or
/// membership epoch changes, or when quorum contact is lost for a full
/// lease; pending writes are flushed with an unavailable error on the way
/// out.
fn act_as_leader(ctx: &DirectorContext) {
    let snapshot = ctx.state.snapshot();
    let membership = ctx.journal.membership();
    ctx.replicator.activate(snapshot.clone());

    while membership.epoch == ctx.journal.membership().epoch
        && snapshot.term == ctx.state.current_term()
        && ctx.state.snapshot().status == RaftStatus::Leader
    {
        if ctx.lease.shaky() {
            // We can no longer prove we have quorum contact; linearizable
            // service is not possible, so step down.
            warn!(
                "Lost contact with a quorum for a full lease duration, stepping down as \
                 leader for term {}",
                snapshot.term
            );
            ctx.state.observed(snapshot.term + 1, None).ok();
            break;
        }
        ctx.state.wait(ctx.contact.timeouts.heartbeat);
    }

    ctx.replicator.deactivate();
    ctx.write_tracker.flush_queues(&formatter::unavailable());
}

/// Campaigns for leadership. The pre-vote stage is mandatory: a partitioned
/// node that keeps timing out must not inflate the term and disrupt a
/// healthy cluster when it rejoins.
fn run_for_leader(ctx: &DirectorContext) {
    // Don't reuse the caller's snapshot, it could have changed in-between.
    let snapshot = ctx.state.snapshot();

    let last_index = ctx.journal.log_size() - 1;
    let Ok(last_entry) = ctx.journal.fetch_or_fail(last_index) else {
        error!("Unable to fetch journal entry {last_index} when running for leader");
        return;
    };
    let request = VoteRequest {
        term: snapshot.term + 1,
        candidate: ctx.state.myself().clone(),
        last_index,
        last_term: last_entry.term,
    };

    // Probe electability without modifying any state.
    match perform_election(ctx, &request, true) {
        ElectionOutcome::Elected => {}
        outcome => {
            info!("Pre-vote round failed ({outcome:?}), not advancing term {}", snapshot.term);
            return;
        }
    }

    // The cluster would elect us: advance the term for real.
    if ctx.state.observed(snapshot.term + 1, None).is_err() {
        return;
    }
    match ctx.state.become_candidate(snapshot.term + 1) {
        Ok(true) => {}
        _ => return,
    }

    match perform_election(ctx, &request, false) {
        ElectionOutcome::Elected => {
            if ctx.state.ascend(snapshot.term + 1).unwrap_or(false) {
                // The leadership marker commits entries from earlier terms
                // and must precede any replication of this term.
                let index = ctx.journal.log_size();
                ctx.journal
                    .append_leadership_marker(index, snapshot.term + 1, ctx.state.myself())
                    .ok();
            }
        }
        outcome => {
            info!("Election for term {} failed ({outcome:?})", snapshot.term + 1);
            ctx.state.drop_out(snapshot.term + 1).ok();
        }
    }
}

/// One voting round: broadcast the request to all full members and tally.
/// Any veto aborts the candidacy; a quorum of grants (including our own)
/// elects.
fn perform_election(ctx: &DirectorContext, request: &VoteRequest, pre_vote: bool) -> ElectionOutcome {
    info!("Starting election round: {}", request.describe(pre_vote));
    let nodes = ctx.journal.membership().nodes;
    let contenders: Vec<_> =
        nodes.iter().filter(|node| *node != ctx.state.myself()).cloned().collect();

    let responses: Vec<Option<VoteResponse>> = std::thread::scope(|scope| {
        let handles: Vec<_> = contenders
            .iter()
            .map(|target| {
                let target = target.clone();
                let contact = ctx.contact.clone();
                scope.spawn(move || {
                    let talker = RaftTalker::new(target, contact.clone());
                    talker.request_vote(request, pre_vote, contact.timeouts.low).ok()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap_or(None)).collect()
    });

    let mut granted = 1; // we vote for ourselves
    let mut refused = 0;
    let mut vetoes = 0;
    for response in responses.into_iter().flatten() {
        ctx.state.observed(response.term, None).ok();
        match response.vote {
            Vote::Granted => granted += 1,
            Vote::Refused => refused += 1,
            Vote::Veto => vetoes += 1,
        }
    }
    info!(
        "Election round for term {} tally: {granted} granted, {refused} refused, \
         {vetoes} vetoed",
        request.term
    );

    if vetoes > 0 {
        return ElectionOutcome::Vetoed;
    }
    if granted >= quorum_size(nodes.len()) {
        return ElectionOutcome::Elected;
    }
    ElectionOutcome::NotElected
}
