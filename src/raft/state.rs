use super::journal::RaftJournal;
use super::types::{RaftServer, RaftStatus, Term, VotedFor};
use crate::error::Result;

use log::{error, info, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A consistent snapshot of the Raft state. Reading term and status through
/// separate calls would race; anything that needs both must take a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSnapshot {
    pub term: Term,
    pub status: RaftStatus,
    pub leader: Option<RaftServer>,
    pub voted_for: VotedFor,
}

/// The node's volatile Raft state: current term, vote, recognized leader and
/// role, backed by the journal for persistence of term and vote. All
/// transitions are guarded: an out-of-date term argument means the caller
/// lost a race and the transition is a no-op.
pub struct RaftState {
    journal: Arc<RaftJournal>,
    myself: RaftServer,
    inner: Mutex<Inner>,
    /// Signalled on every state change; the director's election timer and
    /// leader loop wait on this.
    changed: Condvar,
}

struct Inner {
    term: Term,
    status: RaftStatus,
    leader: Option<RaftServer>,
    voted_for: VotedFor,
}

impl RaftState {
    pub fn new(journal: Arc<RaftJournal>, myself: RaftServer) -> Self {
        let status = if journal.membership().contains(&myself) {
            RaftStatus::Follower
        } else {
            RaftStatus::Observer
        };
        let inner = Inner {
            term: journal.current_term(),
            status,
            leader: None,
            voted_for: journal.voted_for(),
        };
        Self { journal, myself, inner: Mutex::new(inner), changed: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock poisoned")
    }

    pub fn myself(&self) -> &RaftServer {
        &self.myself
    }

    /// Returns the current term without the full snapshot. Callers that also
    /// need status or leader must use snapshot() instead.
    pub fn current_term(&self) -> Term {
        self.lock().term
    }

    /// Returns a consistent snapshot of the state.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            term: inner.term,
            status: inner.status,
            leader: inner.leader.clone(),
            voted_for: inner.voted_for.clone(),
        }
    }

    /// True if the given snapshot still reflects the current term and
    /// status.
    pub fn is_snapshot_current(&self, snapshot: &StateSnapshot) -> bool {
        let inner = self.lock();
        inner.term == snapshot.term && inner.status == snapshot.status
    }

    pub fn in_shutdown(&self) -> bool {
        self.lock().status == RaftStatus::Shutdown
    }

    /// Blocks until the state changes or the timeout elapses.
    pub fn wait(&self, timeout: Duration) {
        let inner = self.lock();
        let _unused = self.changed.wait_timeout(inner, timeout).expect("lock poisoned");
    }

    /// Terminal transition; wakes all waiters.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.status = RaftStatus::Shutdown;
        self.changed.notify_all();
    }

    /// Registers an observation of a term (and possibly a leader) from the
    /// cluster. A higher term steps the node down to follower and persists
    /// the new term; discovering the leader for the current term fixes it.
    /// Whenever the leader for a term becomes known, the vote is poisoned so
    /// a crash cannot cause this node to vote again in that term.
    pub fn observed(&self, term: Term, leader: Option<RaftServer>) -> Result<bool> {
        let mut inner = self.lock();

        if term > inner.term {
            info!("Progressing raft state: {} => {term}", inner.term);
            if let Some(leader) = &leader {
                info!("Recognizing {leader} as leader for term {term}");
            }
            if inner.status != RaftStatus::Observer && inner.status != RaftStatus::Shutdown {
                inner.status = RaftStatus::Follower;
            }
            inner.term = term;
            inner.leader = leader;
            inner.voted_for = match inner.leader {
                Some(_) => VotedFor::Blocked,
                None => VotedFor::None,
            };
            self.persist(&mut inner)?;
            self.changed.notify_all();
            return Ok(true);
        }

        if term == inner.term && inner.leader.is_none() {
            if let Some(leader) = leader {
                info!("Recognizing {leader} as leader for term {term}");
                inner.leader = Some(leader);
                // Block any more votes for the current term.
                if inner.voted_for.is_none() {
                    inner.voted_for = VotedFor::Blocked;
                    self.persist(&mut inner)?;
                }
                self.changed.notify_all();
                return Ok(true);
            }
            return Ok(false);
        }

        if term == inner.term {
            if let (Some(current), Some(observed)) = (&inner.leader, &leader) {
                if current != observed {
                    error!(
                        "Attempted to change leader for term {term}: {current} => {observed}"
                    );
                }
            }
        }
        Ok(false)
    }

    /// Becomes a candidate for the given term, voting for ourselves. Only a
    /// follower with no recognized leader and no cast vote may campaign.
    pub fn become_candidate(&self, for_term: Term) -> Result<bool> {
        let mut inner = self.lock();
        if for_term != inner.term {
            return Ok(false); // lost a race, term has moved on
        }
        if inner.status != RaftStatus::Follower {
            error!("Attempted to become a candidate while {}", inner.status);
            return Ok(false);
        }
        if let Some(leader) = &inner.leader {
            error!(
                "Attempted to become a candidate for term {for_term} with known leader {leader}"
            );
            return Ok(false);
        }
        if !inner.voted_for.is_none() {
            error!("Attempted to become a candidate for term {for_term} after voting");
            return Ok(false);
        }

        inner.voted_for = VotedFor::Node(self.myself.clone());
        self.persist(&mut inner)?;
        inner.status = RaftStatus::Candidate;
        self.changed.notify_all();
        Ok(true)
    }

    /// Ascends as leader for the given term, after winning the election.
    pub fn ascend(&self, for_term: Term) -> Result<bool> {
        let mut inner = self.lock();
        if for_term != inner.term {
            return Ok(false); // lost a race, term has moved on
        }
        if inner.status != RaftStatus::Candidate {
            error!("Attempted to ascend without being a candidate for term {for_term}");
            return Ok(false);
        }
        if let Some(leader) = &inner.leader {
            error!("Attempted to ascend for term {for_term} with known leader {leader}");
            return Ok(false);
        }
        if inner.voted_for != VotedFor::Node(self.myself.clone()) {
            error!("Attempted to ascend in term {for_term} without having voted for myself");
            return Ok(false);
        }

        inner.leader = Some(self.myself.clone());
        inner.status = RaftStatus::Leader;
        info!("Ascending as leader for term {for_term}. Long may I reign.");
        self.changed.notify_all();
        Ok(true)
    }

    /// Abandons a failed candidacy by stepping into the next term as
    /// follower.
    pub fn drop_out(&self, for_term: Term) -> Result<bool> {
        self.observed(for_term, None)
    }

    /// Grants our vote for the given term. The caller must have already
    /// established that the requester's log is at least as up-to-date as
    /// ours.
    pub fn grant_vote(&self, for_term: Term, candidate: &RaftServer) -> Result<bool> {
        let mut inner = self.lock();
        if inner.status != RaftStatus::Follower {
            warn!("Attempted to vote for {candidate} while {}", inner.status);
            return Ok(false);
        }
        if for_term != inner.term {
            return Ok(false); // term has progressed since the check
        }
        if let Some(leader) = &inner.leader {
            error!(
                "Attempted to vote for {candidate} in term {for_term} with established \
                 leader {leader}"
            );
            return Ok(false);
        }
        if !inner.voted_for.is_none() {
            error!(
                "Attempted to change vote for term {for_term}: {:?} => {candidate}",
                inner.voted_for
            );
            return Ok(false);
        }

        info!("Granting vote for term {for_term} to {candidate}");
        inner.voted_for = VotedFor::Node(candidate.clone());
        self.persist(&mut inner)?;
        self.changed.notify_all();
        Ok(true)
    }

    /// An observer that has become part of the member set joins as follower.
    pub fn join_cluster(&self, for_term: Term) -> Result<bool> {
        let mut inner = self.lock();
        if for_term != inner.term {
            return Ok(false);
        }
        if inner.status != RaftStatus::Observer {
            error!("Attempted to join cluster, but I'm already not an observer");
            return Ok(false);
        }
        if !self.journal.membership().contains(&self.myself) {
            error!("Attempted to join cluster, but I'm not part of the member set");
            return Ok(false);
        }
        inner.status = RaftStatus::Follower;
        self.changed.notify_all();
        Ok(true)
    }

    /// A node removed from the member set becomes an observer.
    pub fn become_observer(&self, for_term: Term) -> Result<bool> {
        let mut inner = self.lock();
        if for_term != inner.term {
            return Ok(false);
        }
        if inner.status != RaftStatus::Follower && inner.status != RaftStatus::Candidate {
            error!("Attempted to become an observer while {}", inner.status);
            return Ok(false);
        }
        if self.journal.membership().contains(&self.myself) {
            error!("Attempted to become an observer while still in the member set");
            return Ok(false);
        }
        inner.status = RaftStatus::Observer;
        self.changed.notify_all();
        Ok(true)
    }

    /// Persists term and vote through the journal. Must be called after any
    /// change to either, before the transition returns.
    fn persist(&self, inner: &mut Inner) -> Result<()> {
        self.journal.set_current_term(inner.term, inner.voted_for.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::FsyncPolicy;
    use crate::storage::Memory;

    fn server(i: u16) -> RaftServer {
        RaftServer::new(format!("n{i}"), 7000 + i)
    }

    fn setup() -> (Arc<RaftJournal>, RaftState) {
        let journal = Arc::new(
            RaftJournal::initialize(
                Box::new(Memory::new()),
                "test-cluster".to_string(),
                vec![server(1), server(2), server(3)],
                0,
                FsyncPolicy::SyncImportantUpdates,
            )
            .expect("journal init failed"),
        );
        let state = RaftState::new(journal.clone(), server(1));
        (journal, state)
    }

    #[test]
    fn election_happy_path() -> Result<()> {
        let (journal, state) = setup();
        assert_eq!(state.snapshot().status, RaftStatus::Follower);

        // Cannot campaign without advancing the term first.
        state.observed(1, None)?;
        assert!(state.become_candidate(1)?);
        assert_eq!(state.snapshot().status, RaftStatus::Candidate);
        assert_eq!(journal.voted_for(), VotedFor::Node(server(1)));
        assert_eq!(journal.current_term(), 1);

        assert!(state.ascend(1)?);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, RaftStatus::Leader);
        assert_eq!(snapshot.leader, Some(server(1)));
        Ok(())
    }

    #[test]
    fn observed_higher_term_steps_down() -> Result<()> {
        let (journal, state) = setup();
        state.observed(1, None)?;
        state.become_candidate(1)?;
        state.ascend(1)?;

        // A higher term with a known leader poisons the vote.
        assert!(state.observed(2, Some(server(2)))?);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, RaftStatus::Follower);
        assert_eq!(snapshot.leader, Some(server(2)));
        assert_eq!(snapshot.voted_for, VotedFor::Blocked);
        assert_eq!(journal.voted_for(), VotedFor::Blocked);

        // The leader for a term never changes.
        assert!(!state.observed(2, Some(server(3)))?);
        assert_eq!(state.snapshot().leader, Some(server(2)));
        Ok(())
    }

    #[test]
    fn vote_rules() -> Result<()> {
        let (_journal, state) = setup();
        state.observed(3, None)?;
        assert!(state.grant_vote(3, &server(2))?);
        // Only one vote per term.
        assert!(!state.grant_vote(3, &server(3))?);
        // Stale term is ignored.
        assert!(!state.grant_vote(2, &server(3))?);

        // Discovering a leader blocks votes in that term after a crash.
        state.observed(4, Some(server(2)))?;
        assert!(!state.grant_vote(4, &server(3))?);
        Ok(())
    }

    #[test]
    fn candidacy_guards() -> Result<()> {
        let (_journal, state) = setup();

        // Known leader for the term forbids campaigning.
        state.observed(1, Some(server(2)))?;
        assert!(!state.become_candidate(1)?);

        // Dropping out of a failed election moves to the next term.
        state.observed(2, None)?;
        assert!(state.become_candidate(2)?);
        assert!(state.drop_out(3)?);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, RaftStatus::Follower);
        assert_eq!(snapshot.term, 3);
        Ok(())
    }

    #[test]
    fn observer_transitions() -> Result<()> {
        let journal = Arc::new(
            RaftJournal::initialize(
                Box::new(Memory::new()),
                "test-cluster".to_string(),
                vec![server(1), server(2)],
                0,
                FsyncPolicy::SyncImportantUpdates,
            )
            .expect("journal init failed"),
        );
        // n5 is not in the member set: it starts as observer.
        let state = RaftState::new(journal.clone(), server(5));
        assert_eq!(state.snapshot().status, RaftStatus::Observer);

        // Observers don't become followers on higher terms.
        state.observed(1, Some(server(1)))?;
        assert_eq!(state.snapshot().status, RaftStatus::Observer);

        // Once added to the member set, the observer joins as follower.
        journal.add_observer(1, &server(5))?;
        journal.set_commit_index(1)?;
        journal.promote_observer(1, &server(5))?;
        assert!(state.join_cluster(1)?);
        assert_eq!(state.snapshot().status, RaftStatus::Follower);
        Ok(())
    }
}
