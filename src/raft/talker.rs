use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, HeartbeatRequest, HeartbeatResponse,
    VoteRequest, VoteResponse,
};
use super::timeouts::ContactDetails;
use super::types::RaftServer;
use crate::error::{Error, Result};
use crate::redis::resp::Reply;
use crate::redis::{BufferedReader, RedisRequest};

use log::debug;
use std::io::Write as _;
use std::net::{TcpStream, ToSocketAddrs as _};
use std::sync::Mutex;
use std::time::Duration;

/// A client for Raft RPCs towards a single peer. Connections are
/// (re)established lazily, and every fresh connection starts with a
/// RAFT_HANDSHAKE carrying the version, cluster ID and timeouts; the peer
/// drops mismatched connections.
///
/// The write and read halves lock separately, so the streaming replicator
/// can keep pushing payloads while its ack thread drains responses in
/// order.
pub struct RaftTalker {
    target: RaftServer,
    contact: ContactDetails,
    writer: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<ReadHalf>>,
}

struct ReadHalf {
    /// A control handle on the socket, for per-receive read timeouts.
    control: TcpStream,
    reader: BufferedReader<TcpStream>,
}

impl RaftTalker {
    pub fn new(target: RaftServer, contact: ContactDetails) -> Self {
        Self { target, contact, writer: Mutex::new(None), reader: Mutex::new(None) }
    }

    pub fn target(&self) -> &RaftServer {
        &self.target
    }

    /// Establishes the connection if necessary, performing the handshake.
    /// Lock order is writer before reader, everywhere both are taken.
    fn ensure_connected(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        if writer.is_some() {
            return Ok(());
        }
        let mut reader = self.reader.lock()?;

        let timeout = self.contact.timeouts.heartbeat;
        let address = format!("{}", self.target)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::IO(format!("cannot resolve {}", self.target)))?;
        let stream = TcpStream::connect_timeout(&address, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;

        let control = stream.try_clone()?;
        let mut read_half = ReadHalf { control: control.try_clone()?, reader: BufferedReader::new(control) };
        let mut write_half = stream;

        // First command on every inter-node connection.
        let handshake: RedisRequest = vec![
            b"RAFT_HANDSHAKE".to_vec(),
            env!("CARGO_PKG_VERSION").as_bytes().to_vec(),
            self.contact.cluster_id.as_bytes().to_vec(),
            self.contact.timeouts.encode().into_bytes(),
        ];
        write_half.write_all(&encode_request(&handshake))?;
        match Reply::fetch(&mut read_half.reader)? {
            Reply::Status(_) => {}
            other => {
                return Err(Error::IO(format!(
                    "handshake with {} rejected: {other:?}",
                    self.target
                )))
            }
        }

        debug!("Connected to {}", self.target);
        *writer = Some(write_half);
        *reader = Some(read_half);
        Ok(())
    }

    /// Tears the connection down after any error; the next call reconnects.
    pub fn disconnect(&self) {
        *self.writer.lock().expect("lock poisoned") = None;
        *self.reader.lock().expect("lock poisoned") = None;
    }

    /// Sends a request without waiting for its response.
    pub fn send(&self, request: &RedisRequest) -> Result<()> {
        self.ensure_connected()?;
        let mut writer = self.writer.lock()?;
        let Some(stream) = writer.as_mut() else {
            return Err(Error::IO("not connected".to_string()));
        };
        if let Err(err) = stream.write_all(&encode_request(request)) {
            drop(writer);
            self.disconnect();
            return Err(err.into());
        }
        Ok(())
    }

    /// Receives the next in-order reply, with a per-attempt deadline.
    pub fn receive(&self, timeout: Duration) -> Result<Reply> {
        let mut reader = self.reader.lock()?;
        let Some(half) = reader.as_mut() else {
            return Err(Error::IO("not connected".to_string()));
        };
        half.control.set_read_timeout(Some(timeout))?;
        match Reply::fetch(&mut half.reader) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                drop(reader);
                self.disconnect();
                Err(err)
            }
        }
    }

    /// A request/response round-trip.
    fn execute(&self, request: &RedisRequest, timeout: Duration) -> Result<Reply> {
        self.send(request)?;
        self.receive(timeout)
    }

    pub fn heartbeat(
        &self,
        request: &HeartbeatRequest,
        timeout: Duration,
    ) -> Result<HeartbeatResponse> {
        HeartbeatResponse::from_reply(&self.execute(&request.to_request(), timeout)?)
    }

    pub fn append_entries(
        &self,
        request: &AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse> {
        let reply = self.execute(&request.to_request(), timeout)?;
        parse_append_entries_reply(&reply)
    }

    /// Pushes an append without waiting, for streaming replication.
    pub fn send_append_entries(&self, request: &AppendEntriesRequest) -> Result<()> {
        self.send(&request.to_request())
    }

    /// Pops the next streamed append acknowledgement.
    pub fn receive_append_entries(&self, timeout: Duration) -> Result<AppendEntriesResponse> {
        parse_append_entries_reply(&self.receive(timeout)?)
    }

    pub fn request_vote(
        &self,
        request: &VoteRequest,
        pre_vote: bool,
        timeout: Duration,
    ) -> Result<VoteResponse> {
        VoteResponse::from_reply(&self.execute(&request.to_request(pre_vote), timeout)?)
    }

    /// Executes an arbitrary command, e.g. the resilvering file pushes.
    pub fn custom(&self, request: &RedisRequest, timeout: Duration) -> Result<Reply> {
        self.execute(request, timeout)
    }
}

fn parse_append_entries_reply(reply: &Reply) -> Result<AppendEntriesResponse> {
    // A node that can't service the append (e.g. mid-resilvering) answers
    // with an error reply rather than a response vector.
    if let Reply::Error(message) = reply {
        return Err(Error::IO(String::from_utf8_lossy(message).to_string()));
    }
    AppendEntriesResponse::from_reply(reply)
}

/// Encodes a request as a RESP command array.
pub fn encode_request(request: &RedisRequest) -> Vec<u8> {
    let mut out = format!("*{}\r\n", request.len()).into_bytes();
    for token in request {
        out.extend_from_slice(format!("${}\r\n", token.len()).as_bytes());
        out.extend_from_slice(token);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_arrays() {
        let request: RedisRequest = vec![b"GET".to_vec(), b"key".to_vec()];
        assert_eq!(encode_request(&request), b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }
}
