use crate::error::Result;
use crate::node::QuarkDBNode;
use crate::redis::{BufferedReader, Connection, FlushGuard, RedisParser};

use log::{debug, error, info};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// The QuarkDB TCP server: accepts Redis clients and Raft peers on the same
/// port, one handler thread per connection.
pub struct Server {
    node: Arc<QuarkDBNode>,
}

impl Server {
    pub fn new(node: Arc<QuarkDBNode>) -> Self {
        Self { node }
    }

    /// Serves connections forever.
    pub fn serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        info!("Listening on {addr}");
        self.serve_listener(listener)
    }

    /// Serves connections on an already-bound listener, e.g. a test port.
    pub fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("Failed to accept connection: {err}");
                    continue;
                }
            };
            let node = self.node.clone();
            std::thread::Builder::new()
                .name("connection".to_string())
                .spawn(move || {
                    if let Err(err) = serve_connection(node, stream) {
                        debug!("Connection closed: {err}");
                    }
                })
                .expect("failed to spawn connection handler");
        }
        Ok(())
    }
}

/// Reads requests off one connection until it closes, dispatching each
/// through the node. Responses flow through the connection's pending queue
/// so that pipelined requests resolve in submission order; a flush guard
/// pushes out whatever the batch produced before we block on the socket
/// again.
fn serve_connection(node: Arc<QuarkDBNode>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    debug!("New connection from {peer}");

    let connection = Connection::new(stream.try_clone()?);
    let mut reader = BufferedReader::new(stream);

    loop {
        let request = match RedisParser::fetch(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => break, // clean close
            Err(err) => {
                debug!("Dropping connection from {peer}: {err}");
                break;
            }
        };
        let _flush = FlushGuard::new(&connection.writer);
        node.dispatch(&connection, request);
    }

    connection.queue.detach_connection();
    debug!("Connection from {peer} closed");
    Ok(())
}
