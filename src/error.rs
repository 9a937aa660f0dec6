use serde_derive::{Deserialize, Serialize};

/// QuarkDB errors. All variants are expected runtime conditions and are
/// returned as values; invariant violations (bugs) panic instead, since
/// continuing after e.g. a partially applied journal entry would corrupt the
/// store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data, e.g. a corrupt journal entry or key descriptor.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed command argument.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A datatype conflict on a key, surfaced to clients as WRONGTYPE.
    WrongType,
    /// The node can't service the request, e.g. writes during leader
    /// step-down or while the shard is detached.
    Unavailable,
    /// The node is not the leader; clients must redirect.
    NotLeader,
    /// Attempted to write through a read-only handle.
    ReadOnly,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "{msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::WrongType => {
                write!(f, "WRONGTYPE Operation against a key holding the wrong kind of value")
            }
            Error::Unavailable => write!(f, "unavailable"),
            Error::NotLeader => write!(f, "not leader"),
            Error::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*)).into()) };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*)).into()) };
}

/// A QuarkDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        // A poisoned mutex means another thread panicked while holding it,
        // and the shared state can no longer be trusted.
        panic!("lock poisoned: {err}")
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Unavailable
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::Unavailable
    }
}
