//! End-to-end tests against a real 3-node Raft cluster running in-process:
//! leader election through the pre-vote stage, write replication, redirects
//! and stale reads, all over loopback TCP.

use quarkdb::node::QuarkDBNode;
use quarkdb::raft::{RaftServer, Timeouts, TrimConfig};
use quarkdb::redis::resp::Reply;
use quarkdb::redis::BufferedReader;
use quarkdb::shard::{EngineKind, ShardConfig, ShardMode};
use quarkdb::Server;

use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

/// How long to wait for cluster-wide conditions before giving up.
const DEADLINE: Duration = Duration::from_secs(30);

struct TestCluster {
    nodes: Vec<RaftServer>,
}

impl TestCluster {
    /// Starts a cluster of the given size on ephemeral loopback ports, all
    /// nodes backed by in-memory engines.
    fn run(size: usize) -> Self {
        // Reserve the ports first, so every node knows the full member set.
        let listeners: Vec<TcpListener> =
            (0..size).map(|_| TcpListener::bind("127.0.0.1:0").expect("must bind")).collect();
        let nodes: Vec<RaftServer> = listeners
            .iter()
            .map(|l| {
                let addr = l.local_addr().expect("must have address");
                RaftServer::new(addr.ip().to_string(), addr.port())
            })
            .collect();

        for (myself, listener) in nodes.iter().cloned().zip(listeners) {
            let node = QuarkDBNode::new(ShardConfig {
                base_dir: tempfile::TempDir::with_prefix("quarkdb").unwrap().into_path(),
                engine: EngineKind::Memory,
                mode: ShardMode::Raft {
                    myself,
                    nodes: nodes.clone(),
                    cluster_id: "test-cluster".to_string(),
                    timeouts: Timeouts::aggressive(),
                    trim: TrimConfig::default(),
                },
                bulkload: false,
            })
            .expect("node must start");
            std::thread::spawn(move || Server::new(node).serve_listener(listener));
        }
        Self { nodes }
    }

    fn client(&self, index: usize) -> Client {
        Client::connect(&self.nodes[index])
    }

    /// Polls RAFT_INFO on every node until exactly one leader emerges,
    /// returning its index.
    fn wait_for_leader(&self) -> usize {
        let started = Instant::now();
        loop {
            assert!(started.elapsed() < DEADLINE, "no leader elected within the deadline");
            for index in 0..self.nodes.len() {
                let mut client = self.client(index);
                if client.info_field("STATUS").as_deref() == Some("LEADER") {
                    return index;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Retries a closure until it returns true or the deadline passes.
    fn eventually(&self, what: &str, mut f: impl FnMut() -> bool) {
        let started = Instant::now();
        while !f() {
            assert!(started.elapsed() < DEADLINE, "timed out waiting for: {what}");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

struct Client {
    stream: TcpStream,
    reader: BufferedReader<TcpStream>,
}

impl Client {
    fn connect(target: &RaftServer) -> Self {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .expect("must connect");
        stream.set_read_timeout(Some(DEADLINE)).expect("must set timeout");
        let reader = BufferedReader::new(stream.try_clone().expect("must clone"));
        Self { stream, reader }
    }

    fn execute(&mut self, parts: &[&str]) -> Reply {
        let mut out = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            out.extend_from_slice(part.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&out).expect("must send");
        Reply::fetch(&mut self.reader).expect("must receive")
    }

    /// Fetches a field from RAFT_INFO, e.g. "STATUS" or "LEADER".
    fn info_field(&mut self, field: &str) -> Option<String> {
        let Reply::Array(lines) = self.execute(&["RAFT_INFO"]) else { return None };
        for line in lines {
            let line = String::from_utf8_lossy(line.as_bytes()?).to_string();
            if let Some(value) = line.strip_prefix(&format!("{field} ")) {
                return Some(value.to_string());
            }
        }
        None
    }
}

#[test]
fn cluster_elects_replicates_and_redirects() {
    let cluster = TestCluster::run(3);
    let leader = cluster.wait_for_leader();

    // Writes succeed on the leader.
    let mut client = cluster.client(leader);
    assert_eq!(client.execute(&["SET", "asdf", "1234"]), Reply::Status(b"OK".to_vec()));
    assert_eq!(client.execute(&["GET", "asdf"]), Reply::String(b"1234".to_vec()));

    // Followers redirect both reads and writes to the leader. Right after
    // the election a follower may not have heard from the leader yet, so
    // poll until the redirect points at it.
    let follower = (leader + 1) % 3;
    let leader_endpoint = cluster.nodes[leader].to_string();
    cluster.eventually("follower redirects to the leader", || {
        let mut client = cluster.client(follower);
        match client.execute(&["GET", "asdf"]) {
            Reply::Error(message) => {
                let message = String::from_utf8_lossy(&message).to_string();
                message.starts_with("MOVED 0 ") && message.contains(&leader_endpoint)
            }
            _ => false,
        }
    });

    // With stale reads activated, the follower serves the value once the
    // entry has been applied everywhere.
    cluster.eventually("follower catches up", || {
        let mut client = cluster.client(follower);
        assert_eq!(
            client.execute(&["ACTIVATE-STALE-READS"]),
            Reply::Status(b"OK".to_vec())
        );
        client.execute(&["GET", "asdf"]) == Reply::String(b"1234".to_vec())
    });

    // All three state machines eventually agree.
    cluster.eventually("all replicas converge", || {
        (0..3).all(|index| {
            let mut client = cluster.client(index);
            client.execute(&["ACTIVATE-STALE-READS"]);
            client.execute(&["GET", "asdf"]) == Reply::String(b"1234".to_vec())
        })
    });
}

#[test]
fn cluster_pipelines_writes_in_order() {
    let cluster = TestCluster::run(3);
    let leader = cluster.wait_for_leader();
    let mut client = cluster.client(leader);

    // A burst of counter increments pipelined through consensus must apply
    // in submission order.
    for expected in 1..=20 {
        let reply = client.execute(&["HINCRBY", "counter", "f", "1"]);
        assert_eq!(reply, Reply::Integer(expected));
    }

    assert_eq!(client.execute(&["HGET", "counter", "f"]), Reply::String(b"20".to_vec()));
}

#[test]
fn coup_forces_a_new_election() {
    let cluster = TestCluster::run(3);
    let leader = cluster.wait_for_leader();

    let mut client = cluster.client(leader);
    let Reply::Status(_) = client.execute(&["RAFT_ATTEMPT_COUP"]) else {
        panic!("expected the leader to accept the coup");
    };

    // Some node (possibly the same one) takes over again.
    let new_leader = cluster.wait_for_leader();
    let mut client = cluster.client(new_leader);
    assert_eq!(client.execute(&["SET", "after-coup", "1"]), Reply::Status(b"OK".to_vec()));
}

/// The unavailability surface: a single raft node out of three has no quorum
/// and must refuse writes rather than serve them.
#[test]
fn lone_node_has_no_quorum() {
    // Start only one node of a 3-member cluster.
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind");
    let addr = listener.local_addr().expect("must have address");
    let myself = RaftServer::new(addr.ip().to_string(), addr.port());
    let nodes = vec![
        myself.clone(),
        RaftServer::new("127.0.0.1", 1), // nobody listens here
        RaftServer::new("127.0.0.1", 2),
    ];
    let node = QuarkDBNode::new(ShardConfig {
        base_dir: tempfile::TempDir::with_prefix("quarkdb").unwrap().into_path(),
        engine: EngineKind::Memory,
        mode: ShardMode::Raft {
            myself,
            nodes,
            cluster_id: "test-cluster".to_string(),
            timeouts: Timeouts::aggressive(),
            trim: TrimConfig::default(),
        },
        bulkload: false,
    })
    .expect("node must start");
    std::thread::spawn(move || Server::new(node).serve_listener(listener));

    let target = RaftServer::new(addr.ip().to_string(), addr.port());
    let mut client = Client::connect(&target);

    // Give it a few election timeouts' worth of time: without a quorum of
    // pre-votes it must never ascend.
    std::thread::sleep(Duration::from_millis(500));
    match client.execute(&["SET", "k", "v"]) {
        Reply::Error(message) => {
            let message = String::from_utf8_lossy(&message).to_string();
            assert!(message.contains("unavailable"), "unexpected error: {message}");
        }
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(client.info_field("STATUS").as_deref(), Some("FOLLOWER"));
}
