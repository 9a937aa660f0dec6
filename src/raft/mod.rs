//! The Raft replication subsystem: a durable journal of Redis commands,
//! persistent term/vote/leader state, per-follower replication trackers with
//! conservative and streaming modes, a director thread orchestrating
//! elections (with a mandatory pre-vote stage), and the write tracker that
//! resolves per-connection pending queues as entries commit.

mod director;
mod dispatcher;
mod journal;
mod lease;
mod members;
mod message;
mod replicator;
mod state;
mod talker;
mod timeouts;
mod trimmer;
mod types;
mod writetracker;

pub use director::{RaftDirector, TrimConfig};
pub use dispatcher::RaftDispatcher;
pub use journal::{FsyncThread, RaftJournal};
pub use lease::{RaftCommitTracker, RaftLease};
pub use members::{Membership, RaftMembers};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, HeartbeatRequest, HeartbeatResponse,
    VoteRequest, VoteResponse,
};
pub use replicator::{NoResilvering, RaftReplicator, ResilveringTrigger};
pub use state::{RaftState, StateSnapshot};
pub use talker::RaftTalker;
pub use timeouts::{ContactDetails, HeartbeatTracker, Timeouts};
pub use trimmer::{RaftTrimmer, TrimmingBlock};
pub use types::{
    ClusterID, FsyncPolicy, LogIndex, RaftEntry, RaftServer, RaftStatus, ReplicaStatus,
    ReplicationStatus, Term, Vote, VotedFor, quorum_size,
};
pub use writetracker::RaftWriteTracker;
