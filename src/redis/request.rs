use crate::error::{Error, Result};

/// A parsed client request: an ordered sequence of opaque binary tokens.
pub type RedisRequest = Vec<Vec<u8>>;

/// Returns the uppercased command name of a request.
pub fn command_name(request: &RedisRequest) -> String {
    request
        .first()
        .map(|token| String::from_utf8_lossy(token).to_ascii_uppercase())
        .unwrap_or_default()
}

/// How a command interacts with the store, which decides its dispatch path:
/// reads serve locally (on the leader, or under stale reads), writes go
/// through the journal, and the control planes bypass the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Read,
    Write,
    /// Connection-local control: PING, CLIENT, MONITOR, push-type toggles.
    Control,
    /// Pub/sub surface.
    Pubsub,
    /// RAFT_* commands, serviced by the raft dispatcher.
    Raft,
    /// QUARKDB_* commands, serviced by the node.
    Quarkdb,
}

/// The command catalogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    // Strings and generic.
    Get,
    Set,
    Del,
    Exists,
    Keys,
    Scan,
    Flushall,
    Type,
    // Hashes.
    Hget,
    Hset,
    Hmset,
    Hsetnx,
    Hdel,
    Hexists,
    Hkeys,
    Hgetall,
    Hlen,
    Hvals,
    Hincrby,
    Hincrbyfloat,
    Hincrbymulti,
    Hscan,
    Hclone,
    // Sets.
    Sadd,
    Srem,
    Sismember,
    Smembers,
    Scard,
    Smove,
    Sscan,
    // Deques.
    Lpush,
    Rpush,
    Lpop,
    Rpop,
    Llen,
    DequeTrimFront,
    // Locality hashes.
    Lhset,
    Lhmset,
    Lhdel,
    Lhget,
    Lhlen,
    // Configuration.
    ConfigGet,
    ConfigSet,
    ConfigGetall,
    // Leases.
    LeaseAcquire,
    LeaseGet,
    LeaseRelease,
    // Connection-local control.
    Ping,
    Echo,
    Client,
    Monitor,
    ActivatePushTypes,
    ActivateStaleReads,
    Debug,
    // Pub/sub.
    Subscribe,
    Unsubscribe,
    // Raft.
    RaftHandshake,
    RaftInfo,
    RaftFetch,
    RaftFetchLast,
    RaftJournalScan,
    RaftHeartbeat,
    RaftAppendEntries,
    RaftRequestVote,
    RaftRequestPreVote,
    RaftAddObserver,
    RaftRemoveMember,
    RaftPromoteObserver,
    RaftDemoteToObserver,
    RaftAttemptCoup,
    RaftSetFsyncPolicy,
    // QuarkDB.
    QuarkdbInfo,
    QuarkdbVersion,
    QuarkdbHealth,
    QuarkdbCheckpoint,
    QuarkdbManualCompaction,
    QuarkdbVerifyChecksum,
    QuarkdbBulkloadFinalize,
    QuarkdbStartResilvering,
    QuarkdbResilveringCopyFile,
    QuarkdbFinishResilvering,
    QuarkdbCancelResilvering,
}

impl Command {
    /// Looks up a command by request, returning its kind as well.
    pub fn parse(request: &RedisRequest) -> Option<(Command, CommandKind)> {
        use Command::*;
        use CommandKind::*;
        let name = command_name(request);
        let entry = match name.as_str() {
            "GET" => (Get, Read),
            "SET" => (Set, Write),
            "DEL" => (Del, Write),
            "EXISTS" => (Exists, Read),
            "KEYS" => (Keys, Read),
            "SCAN" => (Scan, Read),
            "FLUSHALL" => (Flushall, Write),
            "TYPE" => (Type, Read),
            "HGET" => (Hget, Read),
            "HSET" => (Hset, Write),
            "HMSET" => (Hmset, Write),
            "HSETNX" => (Hsetnx, Write),
            "HDEL" => (Hdel, Write),
            "HEXISTS" => (Hexists, Read),
            "HKEYS" => (Hkeys, Read),
            "HGETALL" => (Hgetall, Read),
            "HLEN" => (Hlen, Read),
            "HVALS" => (Hvals, Read),
            "HINCRBY" => (Hincrby, Write),
            "HINCRBYFLOAT" => (Hincrbyfloat, Write),
            "HINCRBYMULTI" => (Hincrbymulti, Write),
            "HSCAN" => (Hscan, Read),
            "HCLONE" => (Hclone, Write),
            "SADD" => (Sadd, Write),
            "SREM" => (Srem, Write),
            "SISMEMBER" => (Sismember, Read),
            "SMEMBERS" => (Smembers, Read),
            "SCARD" => (Scard, Read),
            "SMOVE" => (Smove, Write),
            "SSCAN" => (Sscan, Read),
            "LPUSH" => (Lpush, Write),
            "RPUSH" => (Rpush, Write),
            "LPOP" => (Lpop, Write),
            "RPOP" => (Rpop, Write),
            "LLEN" => (Llen, Read),
            "DEQUE-TRIM-FRONT" => (DequeTrimFront, Write),
            "LHSET" => (Lhset, Write),
            "LHMSET" => (Lhmset, Write),
            "LHDEL" => (Lhdel, Write),
            "LHGET" => (Lhget, Read),
            "LHLEN" => (Lhlen, Read),
            "CONFIG_GET" => (ConfigGet, Read),
            "CONFIG_SET" => (ConfigSet, Write),
            "CONFIG_GETALL" => (ConfigGetall, Read),
            "LEASE_ACQUIRE" => (LeaseAcquire, Write),
            "LEASE_GET" => (LeaseGet, Write), // advances the clock, so it journals
            "LEASE_RELEASE" => (LeaseRelease, Write),
            "PING" => (Ping, Control),
            "ECHO" => (Echo, Control),
            "CLIENT" => (Client, Control),
            "MONITOR" => (Monitor, Control),
            "ACTIVATE_PUSH_TYPES" => (ActivatePushTypes, Control),
            "ACTIVATE-STALE-READS" => (ActivateStaleReads, Control),
            "DEBUG" => (Debug, Control),
            "SUBSCRIBE" => (Subscribe, Pubsub),
            "UNSUBSCRIBE" => (Unsubscribe, Pubsub),
            "RAFT_HANDSHAKE" => (RaftHandshake, Raft),
            "RAFT_INFO" => (RaftInfo, Raft),
            "RAFT_FETCH" => (RaftFetch, Raft),
            "RAFT_FETCH_LAST" => (RaftFetchLast, Raft),
            "RAFT_JOURNAL_SCAN" => (RaftJournalScan, Raft),
            "RAFT_HEARTBEAT" => (RaftHeartbeat, Raft),
            "RAFT_APPEND_ENTRIES" => (RaftAppendEntries, Raft),
            "RAFT_REQUEST_VOTE" => (RaftRequestVote, Raft),
            "RAFT_REQUEST_PRE_VOTE" => (RaftRequestPreVote, Raft),
            "RAFT_ADD_OBSERVER" => (RaftAddObserver, Raft),
            "RAFT_REMOVE_MEMBER" => (RaftRemoveMember, Raft),
            "RAFT_PROMOTE_OBSERVER" => (RaftPromoteObserver, Raft),
            "RAFT_DEMOTE_TO_OBSERVER" => (RaftDemoteToObserver, Raft),
            "RAFT_ATTEMPT_COUP" => (RaftAttemptCoup, Raft),
            "RAFT_SET_FSYNC_POLICY" => (RaftSetFsyncPolicy, Raft),
            "QUARKDB_INFO" => (QuarkdbInfo, Quarkdb),
            "QUARKDB_VERSION" => (QuarkdbVersion, Quarkdb),
            "QUARKDB_HEALTH" => (QuarkdbHealth, Quarkdb),
            "QUARKDB_CHECKPOINT" => (QuarkdbCheckpoint, Quarkdb),
            "QUARKDB_MANUAL_COMPACTION" => (QuarkdbManualCompaction, Quarkdb),
            "QUARKDB_VERIFY_CHECKSUM" => (QuarkdbVerifyChecksum, Quarkdb),
            "QUARKDB_BULKLOAD_FINALIZE" => (QuarkdbBulkloadFinalize, Quarkdb),
            "QUARKDB_START_RESILVERING" => (QuarkdbStartResilvering, Quarkdb),
            "QUARKDB_RESILVERING_COPY_FILE" => (QuarkdbResilveringCopyFile, Quarkdb),
            "QUARKDB_FINISH_RESILVERING" => (QuarkdbFinishResilvering, Quarkdb),
            "QUARKDB_CANCEL_RESILVERING" => (QuarkdbCancelResilvering, Quarkdb),
            _ => return None,
        };
        Some(entry)
    }
}

/// A write transaction: one or more requests appended to the journal as a
/// single entry and applied atomically. Most transactions are "phantom"
/// wrappers around a single client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    requests: Vec<RedisRequest>,
    phantom: bool,
}

impl Transaction {
    /// Wraps a single request.
    pub fn single(request: RedisRequest) -> Self {
        Self { requests: vec![request], phantom: true }
    }

    pub fn requests(&self) -> &[RedisRequest] {
        &self.requests
    }

    /// The number of responses the client expects from this transaction.
    pub fn expected_responses(&self) -> usize {
        self.requests.len()
    }

    /// Serializes the transaction into journal-entry tokens.
    pub fn to_entry_request(&self) -> Vec<Vec<u8>> {
        assert!(self.phantom, "only phantom transactions reach the journal for now");
        self.requests[0].clone()
    }

    /// Reconstructs a transaction from a journal entry's request.
    pub fn from_entry_request(request: &[Vec<u8>]) -> Result<Self> {
        if request.is_empty() {
            return Err(Error::InvalidData("empty journal entry request".to_string()));
        }
        Ok(Self::single(request.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let request = vec![b"get".to_vec(), b"key".to_vec()];
        assert_eq!(Command::parse(&request), Some((Command::Get, CommandKind::Read)));

        let request = vec![b"Raft_Append_Entries".to_vec()];
        assert_eq!(
            Command::parse(&request),
            Some((Command::RaftAppendEntries, CommandKind::Raft))
        );

        assert_eq!(Command::parse(&vec![b"NOPE".to_vec()]), None);
        assert_eq!(Command::parse(&Vec::new()), None);
    }

    #[test]
    fn writes_are_classified_as_writes() {
        for name in ["SET", "DEL", "HSET", "SADD", "LPUSH", "LEASE_ACQUIRE", "LEASE_GET"] {
            let request = vec![name.as_bytes().to_vec()];
            let (_, kind) = Command::parse(&request).expect("command must exist");
            assert_eq!(kind, CommandKind::Write, "{name}");
        }
    }
}
