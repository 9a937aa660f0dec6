use super::journal::RaftJournal;
use super::types::LogIndex;
use crate::error::Result;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Coordinates journal trimming with replication. Each replica tracker holds
/// a trimming block: an advisory lower bound under which the trimmer may not
/// trim, so entries still needed by an online follower stay available.
pub struct RaftTrimmer {
    journal: Arc<RaftJournal>,
    blocks: Mutex<HashMap<u64, LogIndex>>,
    next_block: AtomicU64,
}

impl RaftTrimmer {
    pub fn new(journal: Arc<RaftJournal>) -> Self {
        Self { journal, blocks: Mutex::new(HashMap::new()), next_block: AtomicU64::new(0) }
    }

    /// Registers a new trimming block, initially fully blocking.
    pub fn block(self: &Arc<Self>) -> TrimmingBlock {
        let id = self.next_block.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().expect("lock poisoned").insert(id, 0);
        TrimmingBlock { trimmer: self.clone(), id }
    }

    fn enforce(&self, id: u64, bound: LogIndex) {
        self.blocks.lock().expect("lock poisoned").insert(id, std::cmp::max(bound, 0));
    }

    fn lift(&self, id: u64) {
        self.blocks.lock().expect("lock poisoned").insert(id, LogIndex::MAX);
    }

    fn remove(&self, id: u64) {
        self.blocks.lock().expect("lock poisoned").remove(&id);
    }

    /// The lowest index any block still needs.
    fn lowest_block(&self) -> LogIndex {
        self.blocks
            .lock()
            .expect("lock poisoned")
            .values()
            .copied()
            .min()
            .unwrap_or(LogIndex::MAX)
    }

    /// Trims the journal once its span exceeds the threshold, keeping at
    /// least `keep` committed entries and everything any block still needs.
    pub fn trim(&self, threshold: LogIndex, keep: LogIndex) -> Result<()> {
        let log_start = self.journal.log_start();
        let span = self.journal.log_size() - log_start;
        if span < threshold {
            return Ok(());
        }

        let mut target = std::cmp::max(log_start, self.journal.commit_index() - keep);
        target = std::cmp::min(target, self.lowest_block());
        if target > log_start {
            self.journal.trim_until(target)?;
        }
        Ok(())
    }
}

/// A replica's hold on the journal tail. Dropping the block releases it.
pub struct TrimmingBlock {
    trimmer: Arc<RaftTrimmer>,
    id: u64,
}

impl TrimmingBlock {
    /// Forbids trimming at or above the given index.
    pub fn enforce(&self, bound: LogIndex) {
        self.trimmer.enforce(self.id, bound);
    }

    /// Releases the hold, e.g. for a target offline so long that it will be
    /// resilvered anyway.
    pub fn lift(&self) {
        self.trimmer.lift(self.id);
    }
}

impl Drop for TrimmingBlock {
    fn drop(&mut self) {
        self.trimmer.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{FsyncPolicy, RaftEntry, RaftServer, VotedFor};
    use crate::storage::Memory;

    fn journal() -> Arc<RaftJournal> {
        let journal = RaftJournal::initialize(
            Box::new(Memory::new()),
            "test-cluster".to_string(),
            vec![RaftServer::new("n1", 7001)],
            0,
            FsyncPolicy::SyncImportantUpdates,
        )
        .expect("journal init failed");
        journal.set_current_term(1, VotedFor::None).expect("set term failed");
        for i in 1..=10 {
            let entry = RaftEntry::new(1, vec![b"SET".to_vec(), vec![i as u8], vec![1]]);
            journal.append(i, &entry, false).expect("append failed");
        }
        journal.set_commit_index(8).expect("commit failed");
        Arc::new(journal)
    }

    #[test]
    fn trims_up_to_committed_minus_keep() -> Result<()> {
        let journal = journal();
        let trimmer = Arc::new(RaftTrimmer::new(journal.clone()));

        // Span below threshold: nothing happens.
        trimmer.trim(100, 2)?;
        assert_eq!(journal.log_start(), 0);

        trimmer.trim(5, 2)?;
        assert_eq!(journal.log_start(), 6);
        Ok(())
    }

    #[test]
    fn blocks_hold_the_tail() -> Result<()> {
        let journal = journal();
        let trimmer = Arc::new(RaftTrimmer::new(journal.clone()));

        let block = trimmer.block();
        block.enforce(3);
        trimmer.trim(5, 0)?;
        assert_eq!(journal.log_start(), 3);

        // Lifting the block lets the trimmer proceed to the commit bound.
        block.lift();
        trimmer.trim(5, 2)?;
        assert_eq!(journal.log_start(), 6);

        // A dropped block no longer holds anything.
        drop(block);
        trimmer.trim(2, 0)?;
        assert_eq!(journal.log_start(), 8);
        Ok(())
    }
}
