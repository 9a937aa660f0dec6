use super::types::{LogIndex, RaftServer, Term, Vote};
use crate::error::{Error, Result};
use crate::redis::resp::Reply;
use crate::redis::{formatter, EncodedResponse, RedisRequest};

/// The Raft RPC payloads, and their encodings on the Redis wire protocol.
/// Requests travel as command arrays, responses as arrays of bulk strings.

/// RAFT_HEARTBEAT: low-cost liveness, carrying no entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub term: Term,
    pub leader: RaftServer,
}

impl HeartbeatRequest {
    pub fn to_request(&self) -> RedisRequest {
        vec![
            b"RAFT_HEARTBEAT".to_vec(),
            self.term.to_string().into_bytes(),
            self.leader.to_string().into_bytes(),
        ]
    }

    pub fn parse(request: &RedisRequest) -> Result<Self> {
        let [_, term, leader] = request.as_slice() else {
            return Err(Error::InvalidInput("malformed heartbeat request".to_string()));
        };
        Ok(Self { term: parse_i64(term)?, leader: RaftServer::parse(&lossless(leader)?)? })
    }
}

/// The response to a heartbeat: our term, whether we recognize the sender
/// as leader, and if not, the reason why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub term: Term,
    pub node_recognized_as_leader: bool,
    pub err: String,
}

impl HeartbeatResponse {
    pub fn encode(&self) -> EncodedResponse {
        formatter::vector(&[
            self.term.to_string().into_bytes(),
            (self.node_recognized_as_leader as i64).to_string().into_bytes(),
            self.err.clone().into_bytes(),
        ])
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let Some([term, recognized, err]) = array_of(reply)? else {
            return Err(Error::InvalidData("malformed heartbeat response".to_string()));
        };
        Ok(Self {
            term: parse_i64(&term)?,
            node_recognized_as_leader: parse_i64(&recognized)? != 0,
            err: String::from_utf8_lossy(&err).to_string(),
        })
    }
}

/// RAFT_APPEND_ENTRIES: replicates a batch of serialized journal entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader: RaftServer,
    pub prev_index: LogIndex,
    pub prev_term: Term,
    pub commit_index: LogIndex,
    /// Serialized entries; kept opaque so payloads forward without a
    /// decode/encode round-trip.
    pub entries: Vec<Vec<u8>>,
}

impl AppendEntriesRequest {
    pub fn to_request(&self) -> RedisRequest {
        let mut request = vec![
            b"RAFT_APPEND_ENTRIES".to_vec(),
            self.term.to_string().into_bytes(),
            self.leader.to_string().into_bytes(),
            self.prev_index.to_string().into_bytes(),
            self.prev_term.to_string().into_bytes(),
            self.commit_index.to_string().into_bytes(),
            self.entries.len().to_string().into_bytes(),
        ];
        request.extend(self.entries.iter().cloned());
        request
    }

    pub fn parse(request: &RedisRequest) -> Result<Self> {
        if request.len() < 7 {
            return Err(Error::InvalidInput("malformed append-entries request".to_string()));
        }
        let count: usize = parse_i64(&request[6])?
            .try_into()
            .map_err(|_| Error::InvalidInput("malformed append-entries request".to_string()))?;
        if request.len() != 7 + count {
            return Err(Error::InvalidInput("malformed append-entries request".to_string()));
        }
        Ok(Self {
            term: parse_i64(&request[1])?,
            leader: RaftServer::parse(&lossless(&request[2])?)?,
            prev_index: parse_i64(&request[3])?,
            prev_term: parse_i64(&request[4])?,
            commit_index: parse_i64(&request[5])?,
            entries: request[7..].to_vec(),
        })
    }
}

/// The response to an append: our term, our log size, and whether the
/// entries were accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub log_size: LogIndex,
    pub outcome: bool,
    pub err: String,
}

impl AppendEntriesResponse {
    pub fn new(term: Term, log_size: LogIndex, outcome: bool, err: impl Into<String>) -> Self {
        Self { term, log_size, outcome, err: err.into() }
    }

    pub fn encode(&self) -> EncodedResponse {
        formatter::vector(&[
            self.term.to_string().into_bytes(),
            self.log_size.to_string().into_bytes(),
            (self.outcome as i64).to_string().into_bytes(),
            self.err.clone().into_bytes(),
        ])
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let Some([term, log_size, outcome, err]) = array_of(reply)? else {
            return Err(Error::InvalidData("malformed append-entries response".to_string()));
        };
        Ok(Self {
            term: parse_i64(&term)?,
            log_size: parse_i64(&log_size)?,
            outcome: parse_i64(&outcome)? != 0,
            err: String::from_utf8_lossy(&err).to_string(),
        })
    }
}

/// RAFT_REQUEST_VOTE and RAFT_REQUEST_PRE_VOTE share this shape. A pre-vote
/// probes electability without anybody changing state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: RaftServer,
    pub last_index: LogIndex,
    pub last_term: Term,
}

impl VoteRequest {
    pub fn to_request(&self, pre_vote: bool) -> RedisRequest {
        let command = if pre_vote { "RAFT_REQUEST_PRE_VOTE" } else { "RAFT_REQUEST_VOTE" };
        vec![
            command.as_bytes().to_vec(),
            self.term.to_string().into_bytes(),
            self.candidate.to_string().into_bytes(),
            self.last_index.to_string().into_bytes(),
            self.last_term.to_string().into_bytes(),
        ]
    }

    pub fn parse(request: &RedisRequest) -> Result<Self> {
        let [_, term, candidate, last_index, last_term] = request.as_slice() else {
            return Err(Error::InvalidInput("malformed vote request".to_string()));
        };
        Ok(Self {
            term: parse_i64(term)?,
            candidate: RaftServer::parse(&lossless(candidate)?)?,
            last_index: parse_i64(last_index)?,
            last_term: parse_i64(last_term)?,
        })
    }

    pub fn describe(&self, pre_vote: bool) -> String {
        format!(
            "{} [candidate={}, term={}, lastIndex={}, lastTerm={}]",
            if pre_vote { "pre-vote request" } else { "vote request" },
            self.candidate,
            self.term,
            self.last_index,
            self.last_term
        )
    }
}

/// The response to a vote or pre-vote request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: Term,
    pub vote: Vote,
}

impl VoteResponse {
    pub fn encode(&self) -> EncodedResponse {
        formatter::vector(&[
            self.term.to_string().into_bytes(),
            self.vote.as_str().as_bytes().to_vec(),
        ])
    }

    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let Some([term, vote]) = array_of(reply)? else {
            return Err(Error::InvalidData("malformed vote response".to_string()));
        };
        Ok(Self { term: parse_i64(&term)?, vote: Vote::parse(&vote)? })
    }
}

fn parse_i64(token: &[u8]) -> Result<i64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidData(format!("invalid integer: {token:?}")))
}

fn lossless(token: &[u8]) -> Result<String> {
    String::from_utf8(token.to_vec())
        .map_err(|_| Error::InvalidData("invalid utf-8 token".to_string()))
}

/// Unpacks a reply into a fixed-size array of byte strings.
fn array_of<const N: usize>(reply: &Reply) -> Result<Option<[Vec<u8>; N]>> {
    let Reply::Array(elements) = reply else {
        return Err(Error::InvalidData(format!("expected array reply, got {reply:?}")));
    };
    let bytes: Vec<Vec<u8>> = elements
        .iter()
        .map(|e| e.as_bytes().map(|b| b.to_vec()))
        .collect::<Option<_>>()
        .ok_or_else(|| Error::InvalidData("non-string element in reply".to_string()))?;
    Ok(bytes.try_into().ok())
}
