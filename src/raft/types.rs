use crate::encoding::binary;
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};

/// A leader term. Starts at 0 for the genesis entry and only ever increases.
pub type Term = i64;

/// A journal index. Entries are numbered [log_start, log_size); -1 marks an
/// absent index.
pub type LogIndex = i64;

/// An opaque cluster identifier, preventing cross-cluster contamination on
/// membership updates.
pub type ClusterID = String;

/// The first token of a membership-update journal entry.
pub const UPDATE_MEMBERS_MARKER: &[u8] = b"JOURNAL_UPDATE_MEMBERS";

/// The first token of a leadership-marker journal entry, appended once per
/// leader ascension.
pub const LEADERSHIP_MARKER: &[u8] = b"JOURNAL_LEADERSHIP_MARKER";

/// Returns the quorum size (strict majority) of a cluster of the given size.
pub fn quorum_size(members: usize) -> usize {
    members / 2 + 1
}

/// A node identity: hostname and port.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaftServer {
    pub host: String,
    pub port: u16,
}

impl RaftServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parses a "host:port" string.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("cannot parse server: {s}")))?;
        if host.is_empty() {
            return Err(Error::InvalidInput(format!("cannot parse server: {s}")));
        }
        let port =
            port.parse().map_err(|_| Error::InvalidInput(format!("cannot parse server: {s}")))?;
        Ok(Self { host: host.to_string(), port })
    }
}

impl std::fmt::Display for RaftServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The vote cast in a term, persisted in the journal. Once cast, a vote for
/// a term never changes. Blocked is a poisoned vote: it is written when a
/// node fixes the leader for a term, so that a crash cannot cause it to vote
/// in that term afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VotedFor {
    None,
    Node(RaftServer),
    Blocked,
}

impl VotedFor {
    /// The serialized form of the blocked sentinel.
    const BLOCKED: &'static str = "#voting-blocked-for-this-term";

    pub fn is_none(&self) -> bool {
        *self == VotedFor::None
    }

    /// Serializes the vote for journal storage.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            VotedFor::None => Vec::new(),
            VotedFor::Node(server) => server.to_string().into_bytes(),
            VotedFor::Blocked => Self::BLOCKED.as_bytes().to_vec(),
        }
    }

    /// Parses a vote from journal storage.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(VotedFor::None);
        }
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidData("invalid vote encoding".to_string()))?;
        if s == Self::BLOCKED {
            return Ok(VotedFor::Blocked);
        }
        Ok(VotedFor::Node(RaftServer::parse(s)?))
    }
}

/// A node's Raft role. Observers are replicated to but have no vote and
/// never campaign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftStatus {
    Leader,
    Follower,
    Candidate,
    Observer,
    Shutdown,
}

impl std::fmt::Display for RaftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftStatus::Leader => write!(f, "LEADER"),
            RaftStatus::Follower => write!(f, "FOLLOWER"),
            RaftStatus::Candidate => write!(f, "CANDIDATE"),
            RaftStatus::Observer => write!(f, "OBSERVER"),
            RaftStatus::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// A vote RPC reply. A veto is stronger than a refusal: it tells the
/// candidate its log is strictly less up-to-date than the responder's, so it
/// must abort the election and not retry immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Granted,
    Refused,
    Veto,
}

impl Vote {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Granted => "granted",
            Vote::Refused => "refused",
            Vote::Veto => "veto",
        }
    }

    pub fn parse(s: &[u8]) -> Result<Self> {
        match s {
            b"granted" => Ok(Vote::Granted),
            b"refused" => Ok(Vote::Refused),
            b"veto" => Ok(Vote::Veto),
            other => Err(Error::InvalidData(format!(
                "invalid vote: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// The journal fsync policy. Important writes (term and vote changes,
/// membership updates, leadership markers) sync under both Always and
/// SyncImportantUpdates; ordinary entries only under Always. A background
/// thread issues periodic flushes regardless.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsyncPolicy {
    Always,
    Async,
    SyncImportantUpdates,
}

impl FsyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsyncPolicy::Always => "always",
            FsyncPolicy::Async => "async",
            FsyncPolicy::SyncImportantUpdates => "sync-important-updates",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(FsyncPolicy::Always),
            "async" => Ok(FsyncPolicy::Async),
            "sync-important-updates" => Ok(FsyncPolicy::SyncImportantUpdates),
            other => Err(Error::InvalidInput(format!("invalid fsync policy: {other}"))),
        }
    }

    /// Should a write with the given importance be synced?
    pub fn should_sync(&self, important: bool) -> bool {
        match self {
            FsyncPolicy::Always => true,
            FsyncPolicy::Async => false,
            FsyncPolicy::SyncImportantUpdates => important,
        }
    }
}

/// A journal entry: the term it was proposed in and the Redis command it
/// carries. Three request shapes exist, distinguished by the first token:
/// ordinary data commands, leadership markers, and membership updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftEntry {
    pub term: Term,
    pub request: Vec<Vec<u8>>,
}

impl RaftEntry {
    pub fn new(term: Term, request: Vec<Vec<u8>>) -> Self {
        Self { term, request }
    }

    /// Builds a membership-update entry.
    pub fn membership_update(term: Term, members: &[u8], cluster_id: &ClusterID) -> Self {
        Self::new(
            term,
            vec![
                UPDATE_MEMBERS_MARKER.to_vec(),
                members.to_vec(),
                cluster_id.as_bytes().to_vec(),
            ],
        )
    }

    /// Builds a leadership-marker entry.
    pub fn leadership_marker(term: Term, leader: &RaftServer) -> Self {
        Self::new(
            term,
            vec![
                LEADERSHIP_MARKER.to_vec(),
                term.to_string().into_bytes(),
                leader.to_string().into_bytes(),
            ],
        )
    }

    /// True if this entry is a membership update.
    pub fn is_membership_update(&self) -> bool {
        self.request.first().map(Vec::as_slice) == Some(UPDATE_MEMBERS_MARKER)
    }

    /// True if this entry is a leadership marker.
    pub fn is_leadership_marker(&self) -> bool {
        self.request.first().map(Vec::as_slice) == Some(LEADERSHIP_MARKER)
    }

    /// True if this entry must be fsynced under sync-important-updates.
    pub fn is_important(&self) -> bool {
        self.is_membership_update() || self.is_leadership_marker()
    }

    /// Serializes the entry: the term as 8 big-endian bytes, then each
    /// request token as an 8-byte length followed by its bytes.
    pub fn encode(&self) -> Vec<u8> {
        let size = 8 + self.request.iter().map(|t| 8 + t.len()).sum::<usize>();
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&binary::encode_i64(self.term));
        for token in &self.request {
            out.extend_from_slice(&binary::encode_i64(token.len() as i64));
            out.extend_from_slice(token);
        }
        out
    }

    /// Deserializes an entry.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::InvalidData("truncated journal entry".to_string()));
        }
        let term = binary::decode_i64(&bytes[..8])?;
        let mut request = Vec::new();
        let mut pos = 8;
        while pos < bytes.len() {
            if pos + 8 > bytes.len() {
                return Err(Error::InvalidData("truncated journal entry token".to_string()));
            }
            let len = binary::decode_i64(&bytes[pos..pos + 8])? as usize;
            pos += 8;
            if pos + len > bytes.len() {
                return Err(Error::InvalidData("truncated journal entry token".to_string()));
            }
            request.push(bytes[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(Self { term, request })
    }

    /// Extracts just the term from a serialized entry.
    pub fn decode_term(bytes: &[u8]) -> Result<Term> {
        if bytes.len() < 8 {
            return Err(Error::InvalidData("truncated journal entry".to_string()));
        }
        binary::decode_i64(&bytes[..8])
    }
}

impl std::fmt::Display for RaftEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "term: {} ->", self.term)?;
        for token in &self.request {
            write!(f, " {}", String::from_utf8_lossy(token))?;
        }
        Ok(())
    }
}

/// How far a single replica has fallen behind before the leader stops
/// considering it up-to-date for membership changes.
const UP_TO_DATE_LAG: LogIndex = 30_000;

/// A replication target's status, as tracked by its replica tracker.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaStatus {
    pub target: RaftServer,
    pub online: bool,
    pub log_size: LogIndex,
}

impl ReplicaStatus {
    /// An online replica within a bounded distance of the leader's log is
    /// up-to-date.
    pub fn up_to_date(&self, leader_log_size: LogIndex) -> bool {
        self.online && self.log_size >= 0 && leader_log_size - self.log_size < UP_TO_DATE_LAG
    }

    pub fn describe(&self, leader_log_size: LogIndex) -> String {
        if !self.online {
            return format!("{} | OFFLINE", self.target);
        }
        let state = if self.up_to_date(leader_log_size) { "UP-TO-DATE" } else { "LAGGING" };
        format!("{} | ONLINE | {} | LOG-SIZE {}", self.target, state, self.log_size)
    }
}

/// The aggregate replication status of a leader.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicationStatus {
    pub replicas: Vec<ReplicaStatus>,
    pub shaky_quorum: bool,
}

impl ReplicationStatus {
    /// Counts replicas that are up-to-date with the given leader log size.
    pub fn replicas_up_to_date(&self, leader_log_size: LogIndex) -> usize {
        self.replicas.iter().filter(|r| r.up_to_date(leader_log_size)).count()
    }

    /// Removes the replicas for the given servers, e.g. to evaluate a
    /// membership change. Ignores servers without a replica entry.
    pub fn remove_replicas(&mut self, servers: &[RaftServer]) {
        self.replicas.retain(|r| !servers.contains(&r.target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_parse_roundtrip() -> Result<()> {
        let server = RaftServer::parse("example.com:7777")?;
        assert_eq!(server, RaftServer::new("example.com", 7777));
        assert_eq!(RaftServer::parse(&server.to_string())?, server);

        assert!(RaftServer::parse("noport").is_err());
        assert!(RaftServer::parse(":123").is_err());
        assert!(RaftServer::parse("host:notanumber").is_err());
        Ok(())
    }

    #[test]
    fn entry_encode_roundtrip() -> Result<()> {
        let entry = RaftEntry::new(7, vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
        let encoded = entry.encode();
        assert_eq!(RaftEntry::decode(&encoded)?, entry);
        assert_eq!(RaftEntry::decode_term(&encoded)?, 7);

        // Empty tokens and binary content survive.
        let entry = RaftEntry::new(0, vec![Vec::new(), vec![0, 255, 0]]);
        assert_eq!(RaftEntry::decode(&entry.encode())?, entry);
        Ok(())
    }

    #[test]
    fn entry_classification() {
        let leadership = RaftEntry::leadership_marker(4, &RaftServer::new("n1", 7777));
        assert!(leadership.is_leadership_marker());
        assert!(!leadership.is_membership_update());
        assert!(leadership.is_important());

        let membership = RaftEntry::membership_update(4, b"n1:7777|", &"cluster".to_string());
        assert!(membership.is_membership_update());
        assert!(membership.is_important());

        let data = RaftEntry::new(4, vec![b"SET".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        assert!(!data.is_important());
    }

    #[test]
    fn voted_for_encoding() -> Result<()> {
        for vote in [
            VotedFor::None,
            VotedFor::Node(RaftServer::new("host", 1234)),
            VotedFor::Blocked,
        ] {
            assert_eq!(VotedFor::decode(&vote.encode())?, vote);
        }
        Ok(())
    }

    #[test]
    fn quorums() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }
}
