use super::journal::RaftJournal;
use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, HeartbeatRequest, HeartbeatResponse,
    VoteRequest, VoteResponse,
};
use super::replicator::RaftReplicator;
use super::state::RaftState;
use super::timeouts::{ContactDetails, HeartbeatTracker};
use super::types::{quorum_size, RaftEntry, RaftServer, RaftStatus, Vote};
use super::writetracker::RaftWriteTracker;
use crate::error::Result;
use crate::redis::dispatcher::timestamp_lease_request;
use crate::redis::{
    formatter, Command, Connection, EncodedResponse, RedisDispatcher, RedisRequest, Transaction,
};
use crate::statemachine::StateMachine;

use itertools::Itertools as _;
use log::{info, warn};
use std::sync::Arc;

/// Services everything on a raft-mode shard: RAFT_* RPCs from peers,
/// membership changes from administrators, and the data command path with
/// its leader redirects.
pub struct RaftDispatcher {
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
    sm: Arc<StateMachine>,
    redis: Arc<RedisDispatcher>,
    write_tracker: Arc<RaftWriteTracker>,
    replicator: Arc<RaftReplicator>,
    heartbeat_tracker: Arc<HeartbeatTracker>,
    contact: ContactDetails,
}

impl RaftDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        journal: Arc<RaftJournal>,
        state: Arc<RaftState>,
        sm: Arc<StateMachine>,
        redis: Arc<RedisDispatcher>,
        write_tracker: Arc<RaftWriteTracker>,
        replicator: Arc<RaftReplicator>,
        heartbeat_tracker: Arc<HeartbeatTracker>,
        contact: ContactDetails,
    ) -> Self {
        Self {
            journal,
            state,
            sm,
            redis,
            write_tracker,
            replicator,
            heartbeat_tracker,
            contact,
        }
    }

    pub fn redis_dispatcher(&self) -> &Arc<RedisDispatcher> {
        &self.redis
    }

    pub fn state(&self) -> &Arc<RaftState> {
        &self.state
    }

    pub fn journal(&self) -> &Arc<RaftJournal> {
        &self.journal
    }

    // ----- Data command path -------------------------------------------------

    /// Services a read. Reads execute locally on the leader; followers
    /// redirect unless the connection opted into stale reads. A read behind
    /// pending writes queues so responses keep submission order.
    pub fn service_read(&self, conn: &Connection, request: RedisRequest) {
        let snapshot = self.state.snapshot();
        let is_leader = snapshot.status == RaftStatus::Leader;
        if !is_leader && !conn.stale_reads() {
            conn.queue.append_response(self.redirect(&snapshot.leader));
            return;
        }

        if let Some(request) = conn.queue.queue_read(request) {
            conn.queue.append_response(self.redis.dispatch_read(&request));
        }
    }

    /// Services a write: appends it to the journal and parks the response
    /// slot on the connection's queue until the entry commits and applies.
    pub fn service_write(&self, conn: &Connection, mut request: RedisRequest) {
        let snapshot = self.state.snapshot();
        if snapshot.status != RaftStatus::Leader {
            conn.queue.append_response(self.redirect(&snapshot.leader));
            return;
        }

        // Lease commands ingest the leader's clock, so that every replica
        // applies identical timestamps.
        timestamp_lease_request(&mut request, self.sm.dynamic_clock());

        let tx = Transaction::single(request);
        match self.write_tracker.append(snapshot.term, tx, conn.queue.clone()) {
            Ok(true) => {} // the commit applier resolves the queue
            Ok(false) | Err(_) => conn.queue.append_response(formatter::unavailable()),
        }
    }

    fn redirect(&self, leader: &Option<RaftServer>) -> EncodedResponse {
        match leader {
            Some(leader) => formatter::moved(0, leader),
            None => formatter::unavailable(),
        }
    }

    // ----- RAFT_* command path -----------------------------------------------

    /// Services a RAFT_* command, returning its response.
    pub fn service_raft(
        &self,
        conn: &Connection,
        command: Command,
        request: &RedisRequest,
    ) -> EncodedResponse {
        match command {
            Command::RaftHandshake => self.handshake(conn, request),
            Command::RaftHeartbeat => self.authorized(conn, request, Self::heartbeat),
            Command::RaftAppendEntries => self.authorized(conn, request, Self::append_entries),
            Command::RaftRequestVote => {
                self.authorized(conn, request, |s, r| s.request_vote(r, false))
            }
            Command::RaftRequestPreVote => {
                self.authorized(conn, request, |s, r| s.request_vote(r, true))
            }
            Command::RaftInfo => self.info(),
            Command::RaftFetch => self.fetch(request),
            Command::RaftFetchLast => self.fetch_last(request),
            Command::RaftJournalScan => self.journal_scan(request),
            Command::RaftAttemptCoup => self.attempt_coup(),
            Command::RaftSetFsyncPolicy => self.set_fsync_policy(request),
            Command::RaftAddObserver
            | Command::RaftRemoveMember
            | Command::RaftPromoteObserver
            | Command::RaftDemoteToObserver => self.membership_change(command, request),
            _ => formatter::err("internal dispatching error"),
        }
    }

    /// Peer RPCs require a completed handshake; anything else on the
    /// connection is either a confused client or a node from another
    /// cluster.
    fn authorized(
        &self,
        conn: &Connection,
        request: &RedisRequest,
        handler: fn(&Self, &RedisRequest) -> EncodedResponse,
    ) -> EncodedResponse {
        if !conn.raft_authorized() {
            return formatter::err("raft handshake was not performed on this connection");
        }
        handler(self, request)
    }

    /// RAFT_HANDSHAKE <version> <cluster-id> <timeouts>: the first command
    /// on every inter-node connection. Mismatches are rejected.
    fn handshake(&self, conn: &Connection, request: &RedisRequest) -> EncodedResponse {
        let [_, _version, cluster_id, timeouts] = request.as_slice() else {
            return formatter::err_args("RAFT_HANDSHAKE");
        };
        if cluster_id != self.contact.cluster_id.as_bytes() {
            warn!(
                "Rejecting handshake: peer is in cluster {}, I am in {}",
                String::from_utf8_lossy(cluster_id),
                self.contact.cluster_id
            );
            return formatter::err("handshake failed: cluster id mismatch");
        }
        if timeouts != self.contact.timeouts.encode().as_bytes() {
            warn!(
                "Rejecting handshake: peer uses timeouts {}, I use {}",
                String::from_utf8_lossy(timeouts),
                self.contact.timeouts.encode()
            );
            return formatter::err("handshake failed: timeouts mismatch");
        }
        conn.authorize_raft();
        formatter::ok()
    }

    /// RAFT_HEARTBEAT: liveness only, no replication.
    fn heartbeat(&self, request: &RedisRequest) -> EncodedResponse {
        let request = match HeartbeatRequest::parse(request) {
            Ok(request) => request,
            Err(err) => return formatter::err(&err.to_string()),
        };
        if request.leader == *self.state.myself() {
            return formatter::err("received heartbeat from myself");
        }

        self.state.observed(request.term, Some(request.leader.clone())).ok();
        let snapshot = self.state.snapshot();

        let recognized = snapshot.term == request.term
            && snapshot.leader.as_ref() == Some(&request.leader);
        if recognized {
            self.heartbeat_tracker.heartbeat();
        }
        let err = if recognized {
            String::new()
        } else {
            format!("not recognized as leader for term {}", request.term)
        };
        HeartbeatResponse { term: snapshot.term, node_recognized_as_leader: recognized, err }
            .encode()
    }

    /// RAFT_APPEND_ENTRIES: the replication workhorse.
    fn append_entries(&self, request: &RedisRequest) -> EncodedResponse {
        let request = match AppendEntriesRequest::parse(request) {
            Ok(request) => request,
            Err(err) => return formatter::err(&err.to_string()),
        };
        match self.append_entries_inner(&request) {
            Ok(response) => response.encode(),
            Err(err) => formatter::err(&err.to_string()),
        }
    }

    fn append_entries_inner(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let refuse = |term, err: &str| {
            Ok(AppendEntriesResponse::new(term, self.journal.log_size(), false, err))
        };

        let snapshot = self.state.snapshot();
        if request.term < snapshot.term {
            return refuse(snapshot.term, "stale term");
        }

        self.state.observed(request.term, Some(request.leader.clone()))?;
        let snapshot = self.state.snapshot();
        if snapshot.leader.as_ref() != Some(&request.leader) {
            return refuse(snapshot.term, "leader not recognized");
        }
        self.heartbeat_tracker.heartbeat();

        if !self.journal.match_entries(request.prev_index, request.prev_term)? {
            // Our log diverges before the payload; the leader backs up.
            return refuse(snapshot.term, "log mismatch");
        }

        let entries: Vec<RaftEntry> =
            request.entries.iter().map(|bytes| RaftEntry::decode(bytes)).collect::<Result<_>>()?;
        let first_divergent = self.journal.compare_entries(request.prev_index + 1, &entries)?;
        let payload_end = request.prev_index + 1 + entries.len() as i64;
        if first_divergent < payload_end {
            self.journal.remove_entries(first_divergent)?;
            for index in first_divergent..payload_end {
                let entry = &entries[(index - request.prev_index - 1) as usize];
                if !self.journal.append(index, entry, entry.is_important())? {
                    return refuse(snapshot.term, "journal append refused");
                }
            }
            self.reconcile_role(snapshot.term)?;
        }

        let commit =
            std::cmp::min(request.commit_index, self.journal.log_size() - 1);
        self.journal.set_commit_index(commit)?;

        Ok(AppendEntriesResponse::new(snapshot.term, self.journal.log_size(), true, ""))
    }

    /// Membership updates take effect on append; follow any role change they
    /// imply for this node.
    fn reconcile_role(&self, term: super::types::Term) -> Result<()> {
        let in_members = self.journal.membership().contains(self.state.myself());
        let status = self.state.snapshot().status;
        if status == RaftStatus::Observer && in_members {
            self.state.join_cluster(term)?;
        } else if (status == RaftStatus::Follower || status == RaftStatus::Candidate)
            && !in_members
        {
            self.state.become_observer(term)?;
        }
        Ok(())
    }

    /// RAFT_REQUEST_VOTE / RAFT_REQUEST_PRE_VOTE. A pre-vote answers as the
    /// real vote would, but changes no state and never advances our term.
    fn request_vote(&self, request: &RedisRequest, pre_vote: bool) -> EncodedResponse {
        let request = match VoteRequest::parse(request) {
            Ok(request) => request,
            Err(err) => return formatter::err(&err.to_string()),
        };
        info!("Received {}", request.describe(pre_vote));

        let my_last_index = self.journal.log_size() - 1;
        let my_last_term = self.journal.term_of_last_entry();

        // A log strictly less up-to-date than ours can never win: veto, so
        // the candidate aborts instead of retrying. Vetoing before observing
        // the term keeps a doomed candidate from inflating it.
        let strictly_behind = request.last_term < my_last_term
            || (request.last_term == my_last_term && request.last_index < my_last_index);
        if strictly_behind {
            return VoteResponse { term: self.state.current_term(), vote: Vote::Veto }.encode();
        }
        let is_member = self.journal.membership().contains(&request.candidate);

        if pre_vote {
            // Reply as the actual vote would be cast, but persist nothing
            // and leave the term alone.
            let snapshot = self.state.snapshot();
            let vote = if !is_member || request.term <= snapshot.term {
                Vote::Refused
            } else {
                Vote::Granted
            };
            return VoteResponse { term: snapshot.term, vote }.encode();
        }

        self.state.observed(request.term, None).ok();
        let snapshot = self.state.snapshot();
        let vote = if !is_member || request.term != snapshot.term {
            Vote::Refused
        } else {
            match self.state.grant_vote(request.term, &request.candidate) {
                Ok(true) => Vote::Granted,
                _ => Vote::Refused,
            }
        };
        VoteResponse { term: snapshot.term, vote }.encode()
    }

    /// Membership RPCs: leader-only, refused while the current epoch is
    /// uncommitted, and refused when the post-change cluster would lack a
    /// quorum of up-to-date replicas.
    fn membership_change(&self, command: Command, request: &RedisRequest) -> EncodedResponse {
        let [_, server] = request.as_slice() else {
            return formatter::err_args("membership update");
        };
        let server = match RaftServer::parse(&String::from_utf8_lossy(server)) {
            Ok(server) => server,
            Err(err) => return formatter::err(&err.to_string()),
        };

        let snapshot = self.state.snapshot();
        if snapshot.status != RaftStatus::Leader {
            return self.redirect(&snapshot.leader);
        }

        if !self.quorum_remains_healthy(command, &server) {
            return formatter::err(
                "membership update blocked, new cluster would not have an up-to-date quorum",
            );
        }

        let result = match command {
            Command::RaftAddObserver => self.journal.add_observer(snapshot.term, &server),
            Command::RaftRemoveMember => self.journal.remove_member(snapshot.term, &server),
            Command::RaftPromoteObserver => self.journal.promote_observer(snapshot.term, &server),
            Command::RaftDemoteToObserver => {
                self.journal.demote_to_observer(snapshot.term, &server)
            }
            _ => unreachable!("non-membership command"),
        };
        match result {
            Ok(()) => formatter::ok(),
            Err(err) => formatter::err(&err.to_string()),
        }
    }

    /// Judges whether the voter set after a membership change would still
    /// hold a quorum of up-to-date replicas, based on the replicator's view.
    fn quorum_remains_healthy(&self, command: Command, server: &RaftServer) -> bool {
        let membership = self.journal.membership();
        let mut voters = membership.nodes.clone();
        match command {
            Command::RaftRemoveMember | Command::RaftDemoteToObserver => {
                voters.retain(|node| node != server);
            }
            Command::RaftPromoteObserver => voters.push(server.clone()),
            // Adding an observer never affects the voter set.
            Command::RaftAddObserver => return true,
            _ => unreachable!("non-membership command"),
        }

        let log_size = self.journal.log_size();
        let status = self.replicator.status();
        let up_to_date = voters
            .iter()
            .filter(|voter| {
                *voter == self.state.myself()
                    || status
                        .replicas
                        .iter()
                        .any(|replica| replica.target == **voter && replica.up_to_date(log_size))
            })
            .count();
        up_to_date >= quorum_size(voters.len())
    }

    /// RAFT_INFO: the human-facing state dump.
    fn info(&self) -> EncodedResponse {
        let snapshot = self.state.snapshot();
        let membership = self.journal.membership();
        let replication = self.replicator.status();
        let log_size = self.journal.log_size();

        let mut lines = vec![
            format!("TERM {}", snapshot.term),
            format!("LOG-START {}", self.journal.log_start()),
            format!("LOG-SIZE {log_size}"),
            format!(
                "LEADER {}",
                snapshot.leader.as_ref().map(|l| l.to_string()).unwrap_or_default()
            ),
            format!("CLUSTER-ID {}", self.contact.cluster_id),
            format!("COMMIT-INDEX {}", self.journal.commit_index()),
            format!("LAST-APPLIED {}", self.sm.last_applied()),
            format!("BLOCKED-WRITES {}", self.write_tracker.blocked_writes()),
            "----------".to_string(),
            format!("MYSELF {}", self.state.myself()),
            format!("VERSION {}", env!("CARGO_PKG_VERSION")),
            format!("STATUS {}", snapshot.status),
            format!("JOURNAL-FSYNC-POLICY {}", self.journal.fsync_policy().as_str()),
            "----------".to_string(),
            format!("MEMBERSHIP-EPOCH {}", membership.epoch),
            format!("NODES {}", membership.nodes.iter().join(",")),
            format!("OBSERVERS {}", membership.observers.iter().join(",")),
            format!("QUORUM-SIZE {}", quorum_size(membership.nodes.len())),
        ];
        if !replication.replicas.is_empty() {
            lines.push("----------".to_string());
            for replica in &replication.replicas {
                lines.push(format!("REPLICA {}", replica.describe(log_size)));
            }
        }
        formatter::status_vector(&lines)
    }

    /// RAFT_FETCH index: the raw serialized entry.
    fn fetch(&self, request: &RedisRequest) -> EncodedResponse {
        let [_, index] = request.as_slice() else {
            return formatter::err_args("RAFT_FETCH");
        };
        let Some(index) = parse_index(index) else {
            return formatter::err("value is not an integer or out of range");
        };
        match self.journal.fetch_serialized(index) {
            Ok(Some(serialized)) => formatter::string(&serialized),
            Ok(None) => formatter::null(),
            Err(err) => formatter::err(&err.to_string()),
        }
    }

    /// RAFT_FETCH_LAST n: the last n entries, newest last.
    fn fetch_last(&self, request: &RedisRequest) -> EncodedResponse {
        let [_, count] = request.as_slice() else {
            return formatter::err_args("RAFT_FETCH_LAST");
        };
        let Some(count) = parse_index(count).filter(|n| *n >= 0) else {
            return formatter::err("value is not an integer or out of range");
        };
        match self.journal.fetch_last(count as usize) {
            Ok(entries) => formatter::status_vector(
                &entries
                    .iter()
                    .map(|(index, entry)| format!("#{index} {entry}"))
                    .collect::<Vec<_>>(),
            ),
            Err(err) => formatter::err(&err.to_string()),
        }
    }

    /// RAFT_JOURNAL_SCAN cursor [MATCH pattern] [COUNT n].
    fn journal_scan(&self, request: &RedisRequest) -> EncodedResponse {
        if request.len() < 2 {
            return formatter::err_args("RAFT_JOURNAL_SCAN");
        }
        let Some(start) = parse_index(&request[1]) else {
            return formatter::err("value is not an integer or out of range");
        };
        let mut pattern: Vec<u8> = Vec::new();
        let mut count = 50;
        let mut rest = &request[2..];
        while let [option, value, tail @ ..] = rest {
            match option.to_ascii_uppercase().as_slice() {
                b"MATCH" => pattern = value.clone(),
                b"COUNT" => match parse_index(value) {
                    Some(n) if n > 0 => count = n as usize,
                    _ => return formatter::err("syntax error"),
                },
                _ => return formatter::err("syntax error"),
            }
            rest = tail;
        }
        if !rest.is_empty() {
            return formatter::err("syntax error");
        }

        match self.journal.scan_contents(start, count, &pattern) {
            Ok((entries, cursor)) => {
                let mut lines = vec![format!(
                    "CURSOR {}",
                    cursor.map(|c| c.to_string()).unwrap_or_else(|| "0".to_string())
                )];
                lines.extend(
                    entries.iter().map(|(index, entry)| format!("#{index} {entry}")),
                );
                formatter::status_vector(&lines)
            }
            Err(err) => formatter::err(&err.to_string()),
        }
    }

    /// RAFT_ATTEMPT_COUP: asks the current leader to step down, giving the
    /// other nodes a chance at the throne.
    fn attempt_coup(&self) -> EncodedResponse {
        let snapshot = self.state.snapshot();
        if snapshot.status != RaftStatus::Leader {
            return formatter::err("I am not the leader, cannot step down");
        }
        info!("Received coup d'etat request, stepping down as leader");
        match self.state.observed(snapshot.term + 1, None) {
            Ok(_) => formatter::status("vive la revolution"),
            Err(err) => formatter::err(&err.to_string()),
        }
    }

    fn set_fsync_policy(&self, request: &RedisRequest) -> EncodedResponse {
        let [_, policy] = request.as_slice() else {
            return formatter::err_args("RAFT_SET_FSYNC_POLICY");
        };
        let policy = match super::types::FsyncPolicy::parse(&String::from_utf8_lossy(policy)) {
            Ok(policy) => policy,
            Err(err) => return formatter::err(&err.to_string()),
        };
        match self.journal.set_fsync_policy(policy) {
            Ok(()) => formatter::ok(),
            Err(err) => formatter::err(&err.to_string()),
        }
    }
}

fn parse_index(token: &[u8]) -> Option<i64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::lease::{RaftCommitTracker, RaftLease};
    use crate::raft::replicator::NoResilvering;
    use crate::raft::trimmer::RaftTrimmer;
    use crate::raft::types::{FsyncPolicy, LogIndex, Term, VotedFor};
    use crate::raft::Timeouts;
    use crate::redis::resp::Reply;
    use crate::redis::BufferedReader;
    use crate::storage::Memory;

    use std::time::Duration;

    fn server(i: u16) -> RaftServer {
        RaftServer::new(format!("n{i}"), 7000 + i)
    }

    /// A fully wired raft dispatcher for node n1 of a 3-node cluster, over
    /// memory engines and with no live peers.
    struct Harness {
        dispatcher: RaftDispatcher,
        conn: Connection,
        write_tracker: Arc<RaftWriteTracker>,
    }

    impl Harness {
        fn new() -> Self {
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
            let sm = Arc::new(
                StateMachine::open(Box::new(Memory::new()), false).expect("open failed"),
            );
            let state = Arc::new(RaftState::new(journal.clone(), server(1)));
            let redis = Arc::new(crate::redis::RedisDispatcher::new(sm.clone()));
            let commit_tracker = Arc::new(RaftCommitTracker::new(journal.clone()));
            let write_tracker =
                RaftWriteTracker::new(journal.clone(), redis.clone(), commit_tracker.clone());
            let timeouts = Timeouts::aggressive();
            let contact = ContactDetails::new("test-cluster".to_string(), timeouts.clone());
            let lease = Arc::new(RaftLease::new(timeouts.low));
            let trimmer = Arc::new(RaftTrimmer::new(journal.clone()));
            let replicator = Arc::new(RaftReplicator::new(
                journal.clone(),
                state.clone(),
                lease,
                commit_tracker.clone(),
                trimmer,
                contact.clone(),
                Arc::new(NoResilvering),
            ));
            let heartbeat_tracker = Arc::new(HeartbeatTracker::new(timeouts));
            let dispatcher = RaftDispatcher::new(
                journal,
                state,
                sm,
                redis,
                write_tracker.clone(),
                replicator,
                heartbeat_tracker,
                contact,
            );

            let conn = Connection::with_sink(Box::new(std::io::sink()));
            conn.authorize_raft();
            Self { dispatcher, conn, write_tracker }
        }

        fn raft(&self, parts: &[&str]) -> EncodedResponse {
            let request: RedisRequest = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
            let (command, _) = crate::redis::Command::parse(&request).expect("unknown command");
            self.dispatcher.service_raft(&self.conn, command, &request)
        }

        fn append(
            &self,
            term: Term,
            leader: u16,
            prev_index: LogIndex,
            prev_term: Term,
            commit_index: LogIndex,
            entries: &[RaftEntry],
        ) -> AppendEntriesResponse {
            let request = AppendEntriesRequest {
                term,
                leader: server(leader),
                prev_index,
                prev_term,
                commit_index,
                entries: entries.iter().map(|e| e.encode()).collect(),
            };
            let encoded = self.raft_request(&request.to_request());
            AppendEntriesResponse::from_reply(&encoded).expect("must parse")
        }

        fn vote(&self, request: &VoteRequest, pre_vote: bool) -> VoteResponse {
            let encoded = self.raft_request(&request.to_request(pre_vote));
            VoteResponse::from_reply(&encoded).expect("must parse")
        }

        fn raft_request(&self, request: &RedisRequest) -> Reply {
            let (command, _) = crate::redis::Command::parse(request).expect("unknown command");
            let response = self.dispatcher.service_raft(&self.conn, command, request);
            let mut reader = BufferedReader::new(std::io::Cursor::new(response.0));
            Reply::fetch(&mut reader).expect("must parse reply")
        }

        fn entry(term: Term, cmd: &str) -> RaftEntry {
            RaftEntry::new(term, cmd.split(' ').map(|t| t.as_bytes().to_vec()).collect())
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.write_tracker.shutdown();
        }
    }

    #[test]
    fn handshake_is_validated() {
        let h = Harness::new();
        let conn = Connection::with_sink(Box::new(std::io::sink()));

        let timeouts = Timeouts::aggressive().encode();
        let request: RedisRequest = vec![
            b"RAFT_HANDSHAKE".to_vec(),
            b"0.1.0".to_vec(),
            b"other-cluster".to_vec(),
            timeouts.clone().into_bytes(),
        ];
        let response = h.dispatcher.service_raft(&conn, Command::RaftHandshake, &request);
        assert!(response.0.starts_with(b"-ERR handshake failed"));
        assert!(!conn.raft_authorized());

        let request: RedisRequest = vec![
            b"RAFT_HANDSHAKE".to_vec(),
            b"0.1.0".to_vec(),
            b"test-cluster".to_vec(),
            timeouts.into_bytes(),
        ];
        let response = h.dispatcher.service_raft(&conn, Command::RaftHandshake, &request);
        assert_eq!(response.0, b"+OK\r\n");
        assert!(conn.raft_authorized());

        // RPCs without a handshake are refused.
        let unshaken = Connection::with_sink(Box::new(std::io::sink()));
        let heartbeat: RedisRequest =
            vec![b"RAFT_HEARTBEAT".to_vec(), b"1".to_vec(), b"n2:7002".to_vec()];
        let response = h.dispatcher.service_raft(&unshaken, Command::RaftHeartbeat, &heartbeat);
        assert!(response.0.starts_with(b"-ERR raft handshake"));
    }

    #[test]
    fn append_entries_replicates_and_commits() {
        let h = Harness::new();

        // n2 becomes leader for term 1 and replicates two entries.
        let entries = [Harness::entry(1, "SET asdf 1234"), Harness::entry(1, "SET other 5678")];
        let response = h.append(1, 2, 0, 0, 0, &entries);
        assert!(response.outcome);
        assert_eq!(response.term, 1);
        assert_eq!(response.log_size, 3);

        // The node recognized n2 as leader and poisoned its vote.
        let snapshot = h.dispatcher.state().snapshot();
        assert_eq!(snapshot.leader, Some(server(2)));
        assert_eq!(snapshot.voted_for, VotedFor::Blocked);

        // Committing applies through to the state machine.
        let response = h.append(1, 2, 2, 1, 2, &[]);
        assert!(response.outcome);
        let sm = h.dispatcher.redis_dispatcher().state_machine().clone();
        assert_eq!(sm.wait_for_applied(2, Duration::from_secs(5)), 2);
        let read = h
            .dispatcher
            .redis_dispatcher()
            .dispatch_read(&vec![b"GET".to_vec(), b"asdf".to_vec()]);
        assert_eq!(read.0, b"$4\r\n1234\r\n");
    }

    #[test]
    fn append_entries_refuses_stale_and_mismatched() {
        let h = Harness::new();
        let response = h.append(1, 2, 0, 0, 0, &[Harness::entry(1, "SET a 1")]);
        assert!(response.outcome);

        // Stale term.
        let response = h.append(0, 3, 1, 1, 0, &[]);
        assert!(!response.outcome);
        assert_eq!(response.term, 1);

        // Unknown previous entry: refuse so the leader backs up.
        let response = h.append(1, 2, 7, 1, 0, &[Harness::entry(1, "SET b 2")]);
        assert!(!response.outcome);
        assert_eq!(response.log_size, 2);
    }

    #[test]
    fn append_entries_overwrites_uncommitted_conflicts() {
        let h = Harness::new();
        let response =
            h.append(1, 2, 0, 0, 0, &[Harness::entry(1, "SET a 1"), Harness::entry(1, "SET b 2")]);
        assert!(response.outcome);

        // A new leader for term 2 overwrites the uncommitted suffix.
        let response = h.append(2, 3, 1, 1, 0, &[Harness::entry(2, "SET b 3")]);
        assert!(response.outcome);
        assert_eq!(response.log_size, 3);
        let entry = h.dispatcher.journal().fetch_or_fail(2).expect("entry must exist");
        assert_eq!(entry, Harness::entry(2, "SET b 3"));
    }

    /// Pre-vote safety: a candidate with a strictly less up-to-date log is
    /// vetoed and never advances this node's term.
    #[test]
    fn pre_vote_veto_protects_the_term() {
        let h = Harness::new();
        let entries: Vec<RaftEntry> =
            (1..=5).map(|i| Harness::entry(1, &format!("SET k{i} v"))).collect();
        let response = h.append(1, 2, 0, 0, 5, &entries);
        assert!(response.outcome);

        // n3 was offline and missed entries e2..e5; it keeps timing out and
        // asks for a pre-vote with its stale log.
        let stale = VoteRequest { term: 2, candidate: server(3), last_index: 1, last_term: 1 };
        let response = h.vote(&stale, true);
        assert_eq!(response.vote, Vote::Veto);
        // Crucially, our term did not move.
        assert_eq!(h.dispatcher.state().current_term(), 1);

        // The real vote is vetoed as well, and still changes nothing.
        let response = h.vote(&stale, false);
        assert_eq!(response.vote, Vote::Veto);

        // A candidate with a complete log does get a pre-vote grant.
        let fresh = VoteRequest { term: 2, candidate: server(3), last_index: 5, last_term: 1 };
        let response = h.vote(&fresh, true);
        assert_eq!(response.vote, Vote::Granted);
        // Pre-votes must not modify state.
        assert_eq!(h.dispatcher.state().current_term(), 1);
        assert_eq!(h.dispatcher.state().snapshot().voted_for, VotedFor::Blocked);
    }

    #[test]
    fn votes_are_granted_once_per_term() {
        let h = Harness::new();
        let request = VoteRequest { term: 1, candidate: server(2), last_index: 0, last_term: 0 };
        assert_eq!(h.vote(&request, false).vote, Vote::Granted);

        // Same term, different candidate: refused.
        let other = VoteRequest { term: 1, candidate: server(3), last_index: 0, last_term: 0 };
        assert_eq!(h.vote(&other, false).vote, Vote::Refused);

        // Non-members never get a vote.
        let outsider = VoteRequest { term: 2, candidate: server(9), last_index: 0, last_term: 0 };
        assert_eq!(h.vote(&outsider, false).vote, Vote::Refused);
    }

    /// Membership updates are blocked when the post-change voter set would
    /// lack an up-to-date quorum. With no live replicas, removing any voter
    /// leaves only this node up-to-date out of two.
    #[test]
    fn membership_update_requires_up_to_date_quorum() {
        let h = Harness::new();

        // Make ourselves leader so membership commands are accepted at all.
        h.dispatcher.state().observed(1, None).ok();
        h.dispatcher.state().become_candidate(1).ok();
        h.dispatcher.state().ascend(1).ok();

        let response = h.raft(&["RAFT_REMOVE_MEMBER", "n3:7003"]);
        assert_eq!(
            response.0,
            b"-ERR membership update blocked, new cluster would not have an up-to-date quorum\r\n"
                .to_vec()
        );

        // Adding an observer doesn't touch the voter set and goes through.
        let response = h.raft(&["RAFT_ADD_OBSERVER", "n4:7004"]);
        assert_eq!(response.0, b"+OK\r\n");
        let membership = h.dispatcher.journal().membership();
        assert_eq!(membership.observers, vec![server(4)]);
        assert_eq!(membership.epoch, 1);
    }

    #[test]
    fn fetch_and_info() {
        let h = Harness::new();
        let response = h.append(1, 2, 0, 0, 0, &[Harness::entry(1, "SET a 1")]);
        assert!(response.outcome);

        let reply = h.raft_request(&vec![b"RAFT_FETCH".to_vec(), b"1".to_vec()]);
        let Reply::String(serialized) = reply else { panic!("expected bulk string") };
        assert_eq!(
            RaftEntry::decode(&serialized).expect("must decode"),
            Harness::entry(1, "SET a 1")
        );

        let reply = h.raft_request(&vec![b"RAFT_INFO".to_vec()]);
        let Reply::Array(lines) = reply else { panic!("expected array") };
        let lines: Vec<String> = lines
            .iter()
            .map(|l| String::from_utf8_lossy(l.as_bytes().unwrap()).to_string())
            .collect();
        assert!(lines.contains(&"TERM 1".to_string()));
        assert!(lines.contains(&"LOG-SIZE 2".to_string()));
        assert!(lines.contains(&"STATUS FOLLOWER".to_string()));
        assert!(lines.contains(&"QUORUM-SIZE 2".to_string()));
    }
}
