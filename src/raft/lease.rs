use super::journal::RaftJournal;
use super::types::{quorum_size, LogIndex, RaftServer};
use crate::error::Result;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tracks each replica's match index (the highest journal index known to be
/// replicated on it) and derives the commit index: an entry is committed
/// once a quorum of voters stores it. The leader itself always counts
/// towards the quorum.
///
/// Only tracks full voting members; observers never affect commits.
pub struct RaftCommitTracker {
    journal: Arc<RaftJournal>,
    inner: Mutex<HashMap<RaftServer, LogIndex>>,
}

impl RaftCommitTracker {
    pub fn new(journal: Arc<RaftJournal>) -> Self {
        Self { journal, inner: Mutex::new(HashMap::new()) }
    }

    /// Replaces the tracked voter set (the full members minus the leader),
    /// dropping stale entries and zeroing new ones.
    pub fn update_targets(&self, targets: &[RaftServer]) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.retain(|server, _| targets.contains(server));
        for target in targets {
            inner.entry(target.clone()).or_insert(-1);
        }
    }

    /// Clears all match indexes, e.g. when a new term begins.
    pub fn reset(&self) {
        self.inner.lock().expect("lock poisoned").clear();
    }

    /// Raises a replica's match index and recomputes the commit index.
    pub fn update(&self, target: &RaftServer, match_index: LogIndex) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(current) = inner.get_mut(target) else {
                return Ok(()); // not a voter (observer), ignore
            };
            if *current >= match_index {
                return Ok(());
            }
            *current = match_index;
        }
        self.recompute()
    }

    /// Recomputes the commit index from the current match indexes and the
    /// leader's own log. Called after leader appends too, so single-node
    /// clusters commit without any followers.
    pub fn recompute(&self) -> Result<()> {
        let mut matches: Vec<LogIndex> =
            self.inner.lock().expect("lock poisoned").values().copied().collect();
        // The leader trivially stores its whole log.
        matches.push(self.journal.log_size() - 1);
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = quorum_size(matches.len());
        let candidate = matches[quorum - 1];
        if candidate > self.journal.commit_index() {
            self.journal.set_commit_index(candidate)?;
        }
        Ok(())
    }
}

/// Tracks when each voting replica last acknowledged the leader, and derives
/// the leader lease deadline: the point in time at which the leader can no
/// longer prove it has quorum contact and must consider its authority shaky.
pub struct RaftLease {
    inner: Mutex<HashMap<RaftServer, Instant>>,
    lease_duration: Duration,
}

impl RaftLease {
    pub fn new(lease_duration: Duration) -> Self {
        Self { inner: Mutex::new(HashMap::new()), lease_duration }
    }

    /// Replaces the tracked voter set (the full members minus the leader).
    pub fn update_targets(&self, targets: &[RaftServer]) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.retain(|server, _| targets.contains(server));
        for target in targets {
            inner.entry(target.clone()).or_insert(now);
        }
    }

    /// Records a positive contact (heartbeat or append acknowledgement) with
    /// a replica. Contact timestamps never move backwards.
    pub fn heartbeat(&self, target: &RaftServer, when: Instant) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(last) = inner.get_mut(target) {
            if *last < when {
                *last = when;
            }
        }
    }

    /// The instant at which quorum contact expires: the moment the
    /// quorum'th-freshest contact (counting the leader itself) becomes older
    /// than the lease duration.
    pub fn shaky_quorum_deadline(&self) -> Instant {
        let inner = self.inner.lock().expect("lock poisoned");
        let cluster_size = inner.len() + 1;
        let needed_contacts = quorum_size(cluster_size) - 1;
        if needed_contacts == 0 {
            // A single-node cluster always has quorum.
            return Instant::now() + self.lease_duration;
        }

        let mut contacts: Vec<Instant> = inner.values().copied().collect();
        contacts.sort_unstable_by(|a, b| b.cmp(a));
        contacts[needed_contacts - 1] + self.lease_duration
    }

    /// True if the leader has lost quorum contact for a full lease duration.
    pub fn shaky(&self) -> bool {
        self.shaky_quorum_deadline() < Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{FsyncPolicy, RaftEntry, VotedFor};
    use crate::storage::Memory;

    fn server(i: u16) -> RaftServer {
        RaftServer::new(format!("n{i}"), 7000 + i)
    }

    fn journal() -> Arc<RaftJournal> {
        let journal = RaftJournal::initialize(
            Box::new(Memory::new()),
            "test-cluster".to_string(),
            vec![server(1), server(2), server(3)],
            0,
            FsyncPolicy::SyncImportantUpdates,
        )
        .expect("journal init failed");
        journal.set_current_term(1, VotedFor::None).expect("set term failed");
        for i in 1..=4 {
            let entry = RaftEntry::new(1, vec![b"SET".to_vec(), vec![i as u8], vec![1]]);
            journal.append(i, &entry, false).expect("append failed");
        }
        Arc::new(journal)
    }

    #[test]
    fn quorum_commit() -> Result<()> {
        let journal = journal();
        let tracker = RaftCommitTracker::new(journal.clone());
        tracker.update_targets(&[server(2), server(3)]);

        // Leader alone (log size 5) is not a quorum of 3.
        tracker.recompute()?;
        assert_eq!(journal.commit_index(), 0);

        // One follower at 2: quorum of 2 stores [0, 2].
        tracker.update(&server(2), 2)?;
        assert_eq!(journal.commit_index(), 2);

        // The slower follower catching up to 1 changes nothing.
        tracker.update(&server(3), 1)?;
        assert_eq!(journal.commit_index(), 2);

        // Faster follower advances the quorum.
        tracker.update(&server(3), 4)?;
        assert_eq!(journal.commit_index(), 4);

        // Match indexes never regress the commit index.
        tracker.update(&server(2), 1)?;
        assert_eq!(journal.commit_index(), 4);
        Ok(())
    }

    #[test]
    fn observers_are_ignored() -> Result<()> {
        let journal = journal();
        let tracker = RaftCommitTracker::new(journal.clone());
        tracker.update_targets(&[server(2), server(3)]);

        tracker.update(&server(9), 4)?;
        assert_eq!(journal.commit_index(), 0);
        Ok(())
    }

    #[test]
    fn lease_deadline_follows_quorum() {
        let lease = RaftLease::new(Duration::from_millis(100));
        lease.update_targets(&[server(2), server(3)]);

        let early = Instant::now();
        let late = early + Duration::from_secs(10);
        lease.heartbeat(&server(2), late);
        lease.heartbeat(&server(3), early);

        // Cluster of 3: the leader plus one fresh follower is a quorum, so
        // the deadline follows the freshest contact.
        assert_eq!(lease.shaky_quorum_deadline(), late + Duration::from_millis(100));
        assert!(!lease.shaky());

        // Contacts never move backwards.
        lease.heartbeat(&server(2), early);
        assert_eq!(lease.shaky_quorum_deadline(), late + Duration::from_millis(100));
    }
}
