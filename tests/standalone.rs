//! End-to-end tests against a standalone QuarkDB server over a real TCP
//! connection: the full parse → dispatch → state machine → format path.

use quarkdb::node::QuarkDBNode;
use quarkdb::redis::resp::Reply;
use quarkdb::redis::BufferedReader;
use quarkdb::shard::{EngineKind, ShardConfig, ShardMode};
use quarkdb::Server;

use std::io::Write as _;
use std::net::{SocketAddr, TcpListener, TcpStream};

/// Starts a standalone in-memory server on an ephemeral port.
fn start_server() -> SocketAddr {
    let node = QuarkDBNode::new(ShardConfig {
        base_dir: tempfile::TempDir::with_prefix("quarkdb").unwrap().into_path(),
        engine: EngineKind::Memory,
        mode: ShardMode::Standalone,
        bulkload: false,
    })
    .expect("node must start");

    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind");
    let addr = listener.local_addr().expect("must have address");
    std::thread::spawn(move || Server::new(node).serve_listener(listener));
    addr
}

/// A minimal test client.
struct Client {
    stream: TcpStream,
    reader: BufferedReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("must connect");
        let reader = BufferedReader::new(stream.try_clone().expect("must clone"));
        Self { stream, reader }
    }

    fn send(&mut self, parts: &[&str]) {
        let mut out = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            out.extend_from_slice(part.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&out).expect("must send");
    }

    fn receive(&mut self) -> Reply {
        Reply::fetch(&mut self.reader).expect("must receive")
    }

    fn execute(&mut self, parts: &[&str]) -> Reply {
        self.send(parts);
        self.receive()
    }
}

fn bulk(s: &str) -> Reply {
    Reply::String(s.as_bytes().to_vec())
}

fn array(elements: Vec<Reply>) -> Reply {
    Reply::Array(elements)
}

#[test]
fn string_roundtrip() {
    let mut client = Client::connect(start_server());
    assert_eq!(client.execute(&["PING"]), Reply::Status(b"PONG".to_vec()));
    assert_eq!(client.execute(&["SET", "asdf", "1234"]), Reply::Status(b"OK".to_vec()));
    assert_eq!(client.execute(&["GET", "asdf"]), bulk("1234"));
    assert_eq!(client.execute(&["GET", "missing"]), Reply::Null);

    // A second connection sees the same state.
    let mut other = Client::connect(start_server());
    assert_eq!(other.execute(&["GET", "asdf"]), Reply::Null); // different server
}

#[test]
fn set_scenario() {
    let mut client = Client::connect(start_server());
    assert_eq!(client.execute(&["SADD", "myset", "a", "b", "c"]), Reply::Integer(3));
    assert_eq!(
        client.execute(&["SMEMBERS", "myset"]),
        array(vec![bulk("a"), bulk("b"), bulk("c")])
    );
    assert_eq!(client.execute(&["SREM", "myset", "a", "b"]), Reply::Integer(2));
    assert_eq!(client.execute(&["SCARD", "myset"]), Reply::Integer(1));
}

#[test]
fn deque_scenario() {
    let mut client = Client::connect(start_server());
    assert_eq!(client.execute(&["LPUSH", "L", "i1", "i2", "i3", "i4"]), Reply::Integer(4));
    assert_eq!(client.execute(&["LPOP", "L"]), bulk("i4"));
    assert_eq!(client.execute(&["RPOP", "L"]), bulk("i1"));
    assert_eq!(client.execute(&["LLEN", "L"]), Reply::Integer(2));
}

#[test]
fn hincrbymulti_scenario() {
    let mut client = Client::connect(start_server());
    assert_eq!(
        client.execute(&["HINCRBYMULTI", "h1", "f", "3", "h2", "g", "4"]),
        Reply::Integer(7)
    );
    assert_eq!(
        client.execute(&["HINCRBYMULTI", "h1", "f", "-5", "h2", "g", "20", "h4", "k", "13"]),
        Reply::Integer(35)
    );
    assert_eq!(client.execute(&["HGET", "h1", "f"]), bulk("-2"));
    assert_eq!(client.execute(&["HGET", "h2", "g"]), bulk("24"));
    assert_eq!(client.execute(&["HGET", "h4", "k"]), bulk("13"));
}

#[test]
fn hscan_cursor_walk() {
    let mut client = Client::connect(start_server());
    let mut request = vec!["HMSET".to_string(), "hash".to_string()];
    for i in 1..=9 {
        request.push(format!("f{i}"));
        request.push(format!("v{i}"));
    }
    let request: Vec<&str> = request.iter().map(String::as_str).collect();
    assert_eq!(client.execute(&request), Reply::Status(b"OK".to_vec()));

    assert_eq!(
        client.execute(&["HSCAN", "hash", "0", "COUNT", "3"]),
        array(vec![
            bulk("next:f4"),
            array(vec![
                bulk("f1"),
                bulk("v1"),
                bulk("f2"),
                bulk("v2"),
                bulk("f3"),
                bulk("v3"),
            ]),
        ])
    );
    assert_eq!(
        client.execute(&["HSCAN", "hash", "next:f4", "COUNT", "3"]),
        array(vec![
            bulk("next:f7"),
            array(vec![
                bulk("f4"),
                bulk("v4"),
                bulk("f5"),
                bulk("v5"),
                bulk("f6"),
                bulk("v6"),
            ]),
        ])
    );
    let Reply::Array(last) = client.execute(&["HSCAN", "hash", "next:f7", "COUNT", "3"]) else {
        panic!("expected array");
    };
    assert_eq!(last[0], bulk("0"));
}

#[test]
fn wrong_type_and_errors() {
    let mut client = Client::connect(start_server());
    client.execute(&["SET", "str", "v"]);

    let Reply::Error(message) = client.execute(&["SADD", "str", "a"]) else {
        panic!("expected error");
    };
    assert!(String::from_utf8_lossy(&message).starts_with("ERR WRONGTYPE"));

    let Reply::Error(message) = client.execute(&["GET"]) else { panic!("expected error") };
    assert_eq!(
        String::from_utf8_lossy(&message),
        "ERR wrong number of arguments for 'get' command"
    );

    let Reply::Error(message) = client.execute(&["FROBNICATE"]) else {
        panic!("expected error")
    };
    assert!(String::from_utf8_lossy(&message).starts_with("ERR unknown command"));
}

#[test]
fn pipelined_requests_answer_in_order() {
    let mut client = Client::connect(start_server());

    // Issue R1, W, R2 back to back without reading any response.
    client.send(&["GET", "asdf"]);
    client.send(&["SET", "asdf", "1234"]);
    client.send(&["GET", "asdf"]);

    assert_eq!(client.receive(), Reply::Null);
    assert_eq!(client.receive(), Reply::Status(b"OK".to_vec()));
    assert_eq!(client.receive(), bulk("1234"));
}

#[test]
fn leases_over_the_wire() {
    let mut client = Client::connect(start_server());
    assert_eq!(
        client.execute(&["LEASE_ACQUIRE", "lock", "holder1", "10000"]),
        Reply::Status(b"ACQUIRED".to_vec())
    );
    assert_eq!(
        client.execute(&["LEASE_ACQUIRE", "lock", "holder1", "10000"]),
        Reply::Status(b"RENEWED".to_vec())
    );
    let Reply::Error(message) = client.execute(&["LEASE_ACQUIRE", "lock", "holder2", "10000"])
    else {
        panic!("expected error");
    };
    assert!(String::from_utf8_lossy(&message).contains("lease already held"));

    assert_eq!(client.execute(&["LEASE_RELEASE", "lock"]), Reply::Status(b"OK".to_vec()));
}

#[test]
fn monitor_broadcasts_commands() {
    let addr = start_server();
    let mut monitor = Client::connect(addr);
    assert_eq!(client_ok(&mut monitor, &["MONITOR"]), true);

    let mut client = Client::connect(addr);
    client.execute(&["SET", "watched", "1"]);

    // The monitor connection receives the command as a status line.
    let Reply::Status(line) = monitor.receive() else { panic!("expected status") };
    let line = String::from_utf8_lossy(&line).to_string();
    assert!(line.contains("\"SET\""), "unexpected monitor line: {line}");
    assert!(line.contains("\"watched\""));
}

fn client_ok(client: &mut Client, parts: &[&str]) -> bool {
    matches!(client.execute(parts), Reply::Status(ref s) if s == b"OK")
}

#[test]
fn quarkdb_commands() {
    let mut client = Client::connect(start_server());
    assert_eq!(
        client.execute(&["QUARKDB_VERSION"]),
        bulk(env!("CARGO_PKG_VERSION"))
    );
    let Reply::Array(lines) = client.execute(&["QUARKDB_INFO"]) else {
        panic!("expected array")
    };
    assert!(!lines.is_empty());
    let Reply::Status(health) = client.execute(&["QUARKDB_HEALTH"]).into_first() else {
        panic!("expected status lines")
    };
    assert_eq!(health, b"GREEN".to_vec());
}

/// Helper to peel the first element off an array reply.
trait IntoFirst {
    fn into_first(self) -> Reply;
}

impl IntoFirst for Reply {
    fn into_first(self) -> Reply {
        match self {
            Reply::Array(mut elements) => elements.remove(0),
            other => other,
        }
    }
}
