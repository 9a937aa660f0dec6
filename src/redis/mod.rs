//! The Redis wire protocol: RESP framing over buffered readers and writers,
//! the command table, response formatting, per-connection pending queues,
//! and the dispatcher that executes data commands against the state machine.

pub mod connection;
pub mod dispatcher;
mod formatter_impl;
pub mod monitor;
pub mod request;
pub mod resp;

pub use connection::{Connection, ConnectionWriter, FlushGuard, PendingQueue};
pub use dispatcher::RedisDispatcher;
pub use formatter_impl::{formatter, EncodedResponse};
pub use monitor::CommandMonitor;
pub use request::{Command, CommandKind, RedisRequest, Transaction};
pub use resp::{BufferedReader, RedisParser};
