//! RESP response encoding. Everything a connection ever writes is built
//! here, so response shapes stay consistent between the dispatchers and the
//! pending-queue flush paths.

use crate::error::Error;
use crate::raft::RaftServer;

/// A fully formatted RESP response, ready to be written to a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedResponse(pub Vec<u8>);

impl EncodedResponse {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Concatenates multiple responses, e.g. a transaction's replies.
    pub fn concat(responses: impl IntoIterator<Item = EncodedResponse>) -> EncodedResponse {
        let mut out = Vec::new();
        for response in responses {
            out.extend_from_slice(&response.0);
        }
        EncodedResponse(out)
    }
}

/// The formatter namespace, used as `formatter::ok()` etc.
pub mod formatter {
    use super::*;

    pub fn ok() -> EncodedResponse {
        EncodedResponse(b"+OK\r\n".to_vec())
    }

    pub fn pong() -> EncodedResponse {
        EncodedResponse(b"+PONG\r\n".to_vec())
    }

    pub fn status(msg: &str) -> EncodedResponse {
        EncodedResponse(format!("+{msg}\r\n").into_bytes())
    }

    pub fn err(msg: &str) -> EncodedResponse {
        EncodedResponse(format!("-ERR {msg}\r\n").into_bytes())
    }

    pub fn err_args(cmd: &str) -> EncodedResponse {
        err(&format!("wrong number of arguments for '{}' command", cmd.to_lowercase()))
    }

    pub fn unavailable() -> EncodedResponse {
        err("unavailable")
    }

    pub fn noauth(msg: &str) -> EncodedResponse {
        EncodedResponse(format!("-NOAUTH {msg}\r\n").into_bytes())
    }

    pub fn moved(shard_id: i64, location: &RaftServer) -> EncodedResponse {
        EncodedResponse(format!("-MOVED {shard_id} {location}\r\n").into_bytes())
    }

    pub fn integer(number: i64) -> EncodedResponse {
        EncodedResponse(format!(":{number}\r\n").into_bytes())
    }

    pub fn null() -> EncodedResponse {
        EncodedResponse(b"$-1\r\n".to_vec())
    }

    pub fn string(value: &[u8]) -> EncodedResponse {
        let mut out = format!("${}\r\n", value.len()).into_bytes();
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
        EncodedResponse(out)
    }

    /// A nil-able bulk string: None encodes as null.
    pub fn opt_string(value: Option<&[u8]>) -> EncodedResponse {
        match value {
            Some(value) => string(value),
            None => null(),
        }
    }

    pub fn vector<V: AsRef<[u8]>>(values: &[V]) -> EncodedResponse {
        let mut out = format!("*{}\r\n", values.len()).into_bytes();
        for value in values {
            out.extend_from_slice(&string(value.as_ref()).0);
        }
        EncodedResponse(out)
    }

    /// An array of simple strings, used by RAFT_INFO and friends.
    pub fn status_vector<V: AsRef<str>>(values: &[V]) -> EncodedResponse {
        let mut out = format!("*{}\r\n", values.len()).into_bytes();
        for value in values {
            out.extend_from_slice(format!("+{}\r\n", value.as_ref()).into_bytes().as_slice());
        }
        EncodedResponse(out)
    }

    /// A cursored scan reply: [marker, [elements...]].
    pub fn scan<V: AsRef<[u8]>>(marker: &[u8], values: &[V]) -> EncodedResponse {
        let mut out = b"*2\r\n".to_vec();
        out.extend_from_slice(&string(marker).0);
        out.extend_from_slice(&vector(values).0);
        EncodedResponse(out)
    }

    /// A subscribe/unsubscribe confirmation: the standard three-element
    /// array in RESP2, or a four-element push frame with a leading "pubsub"
    /// marker when push types are active.
    pub fn subscription(
        action: &str,
        channel: &[u8],
        count: i64,
        push_types: bool,
    ) -> EncodedResponse {
        let mut out = Vec::new();
        if push_types {
            out.extend_from_slice(b">4\r\n");
            out.extend_from_slice(&string(b"pubsub").0);
        } else {
            out.extend_from_slice(b"*3\r\n");
        }
        out.extend_from_slice(&string(action.as_bytes()).0);
        out.extend_from_slice(&string(channel).0);
        out.extend_from_slice(&integer(count).0);
        EncodedResponse(out)
    }

    /// Encodes an error value. Type mismatches keep their WRONGTYPE text
    /// inside the -ERR prefix; unavailability and redirects have their own
    /// spellings at the call sites that know the leader.
    pub fn from_error(error: &Error) -> EncodedResponse {
        match error {
            Error::Unavailable => unavailable(),
            error => err(&error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes() {
        assert_eq!(formatter::ok().0, b"+OK\r\n");
        assert_eq!(formatter::err("boom").0, b"-ERR boom\r\n");
        assert_eq!(
            formatter::err_args("GET").0,
            b"-ERR wrong number of arguments for 'get' command\r\n"
        );
        assert_eq!(formatter::integer(-7).0, b":-7\r\n");
        assert_eq!(formatter::string(b"ab").0, b"$2\r\nab\r\n");
        assert_eq!(formatter::null().0, b"$-1\r\n");
        assert_eq!(
            formatter::vector(&[b"a".as_slice(), b"bc"]).0,
            b"*2\r\n$1\r\na\r\n$2\r\nbc\r\n"
        );
        assert_eq!(
            formatter::moved(0, &RaftServer::new("n1", 7777)).0,
            b"-MOVED 0 n1:7777\r\n"
        );
        assert_eq!(
            formatter::scan(b"next:f4", &[b"f1".as_slice()]).0,
            b"*2\r\n$7\r\nnext:f4\r\n*1\r\n$2\r\nf1\r\n"
        );
    }

    #[test]
    fn subscription_shapes() {
        assert_eq!(
            formatter::subscription("subscribe", b"ch", 1, false).0,
            b"*3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n"
        );
        assert_eq!(
            formatter::subscription("subscribe", b"ch", 1, true).0,
            b">4\r\n$6\r\npubsub\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n"
        );
    }

    #[test]
    fn wrongtype_keeps_its_prefix() {
        let encoded = formatter::from_error(&Error::WrongType);
        assert!(encoded.0.starts_with(b"-ERR WRONGTYPE"));
        assert_eq!(formatter::from_error(&Error::Unavailable).0, b"-ERR unavailable\r\n");
    }
}
