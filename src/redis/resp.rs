use super::request::RedisRequest;
use crate::error::{Error, Result};

use std::collections::VecDeque;
use std::io::Read;

/// The chunk size of the buffered reader.
const BUFFER_SIZE: usize = 16 * 1024;

/// A buffered reader over a byte stream: an append-only deque of fixed-size
/// chunks filled from the source, with an all-or-nothing consume. Reads
/// block until the requested data arrives or the stream ends.
pub struct BufferedReader<R: Read> {
    source: R,
    buffers: VecDeque<Vec<u8>>,
    /// Read offset into the front buffer.
    position_read: usize,
    /// Write offset into the back buffer.
    position_write: usize,
    /// The stream has ended; no more fills are possible.
    eof: bool,
}

impl<R: Read> BufferedReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffers: VecDeque::from([vec![0; BUFFER_SIZE]]),
            position_read: 0,
            position_write: 0,
            eof: false,
        }
    }

    /// The number of buffered, unconsumed bytes.
    fn available(&self) -> usize {
        self.buffers.len() * BUFFER_SIZE - self.position_read - (BUFFER_SIZE - self.position_write)
    }

    /// Reads once from the source into the back buffer, returning how many
    /// bytes arrived (0 on EOF).
    fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        if self.position_write == BUFFER_SIZE {
            self.buffers.push_back(vec![0; BUFFER_SIZE]);
            self.position_write = 0;
        }
        let back = self.buffers.back_mut().expect("buffer deque is never empty");
        let n = self.source.read(&mut back[self.position_write..])?;
        self.position_write += n;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Blocks until len bytes are buffered, then consumes and returns them.
    /// Returns None if the stream ends first.
    pub fn consume(&mut self, len: usize) -> Result<Option<Vec<u8>>> {
        while self.available() < len {
            if self.fill()? == 0 {
                return Ok(None);
            }
        }

        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let in_front = std::cmp::min(BUFFER_SIZE - self.position_read, remaining);
            let front = self.buffers.front().expect("buffer deque is never empty");
            out.extend_from_slice(&front[self.position_read..self.position_read + in_front]);
            self.position_read += in_front;
            remaining -= in_front;
            if self.position_read == BUFFER_SIZE {
                self.buffers.pop_front();
                self.position_read = 0;
                if self.buffers.is_empty() {
                    self.buffers.push_back(vec![0; BUFFER_SIZE]);
                    self.position_write = 0;
                }
            }
        }
        Ok(Some(out))
    }

    /// Consumes and returns the next CRLF-terminated line, without the
    /// terminator. Returns None if the stream ends at a line boundary with
    /// nothing buffered.
    pub fn consume_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.find_crlf(scanned) {
                let mut line = self.consume(pos + 2)?.expect("scanned bytes must be buffered");
                line.truncate(pos);
                return Ok(Some(line));
            }
            scanned = self.available().saturating_sub(1);
            if self.fill()? == 0 {
                if self.available() == 0 {
                    return Ok(None);
                }
                return Err(Error::InvalidData("connection closed mid-line".to_string()));
            }
        }
    }

    /// Searches the buffered bytes for a CRLF, starting at the given offset.
    fn find_crlf(&self, from: usize) -> Option<usize> {
        let available = self.available();
        if available < 2 {
            return None;
        }
        let mut previous_cr = false;
        for offset in from.saturating_sub(1)..available {
            let byte = self.byte_at(offset);
            if previous_cr && byte == b'\n' {
                return Some(offset - 1);
            }
            previous_cr = byte == b'\r';
        }
        None
    }

    fn byte_at(&self, offset: usize) -> u8 {
        let absolute = self.position_read + offset;
        self.buffers[absolute / BUFFER_SIZE][absolute % BUFFER_SIZE]
    }
}

/// A RESP request parser: clients send arrays of bulk strings. Inline
/// commands (plain space-separated lines) are accepted too, which makes
/// debugging with netcat bearable.
pub struct RedisParser;

impl RedisParser {
    /// Fetches the next request, blocking until one arrives. Returns None on
    /// a clean end of stream between requests.
    pub fn fetch<R: Read>(reader: &mut BufferedReader<R>) -> Result<Option<RedisRequest>> {
        let Some(line) = reader.consume_line()? else {
            return Ok(None);
        };

        match line.first() {
            Some(b'*') => {
                let elements = parse_int(&line[1..])?;
                if !(0..=1024 * 1024).contains(&elements) {
                    return Err(Error::InvalidData(format!("invalid array size {elements}")));
                }
                let mut request = Vec::with_capacity(elements as usize);
                for _ in 0..elements {
                    request.push(Self::fetch_bulk_string(reader)?);
                }
                Ok(Some(request))
            }
            Some(_) => {
                // Inline command.
                let request: RedisRequest = line
                    .split(|b| *b == b' ')
                    .filter(|token| !token.is_empty())
                    .map(|token| token.to_vec())
                    .collect();
                if request.is_empty() {
                    return Self::fetch(reader);
                }
                Ok(Some(request))
            }
            None => Self::fetch(reader), // empty line, skip
        }
    }

    fn fetch_bulk_string<R: Read>(reader: &mut BufferedReader<R>) -> Result<Vec<u8>> {
        let line = reader
            .consume_line()?
            .ok_or_else(|| Error::InvalidData("connection closed mid-request".to_string()))?;
        if line.first() != Some(&b'$') {
            return Err(Error::InvalidData("expected bulk string".to_string()));
        }
        let len = parse_int(&line[1..])?;
        if !(0..=512 * 1024 * 1024).contains(&len) {
            return Err(Error::InvalidData(format!("invalid bulk string size {len}")));
        }
        let mut payload = reader
            .consume(len as usize + 2)?
            .ok_or_else(|| Error::InvalidData("connection closed mid-request".to_string()))?;
        if &payload[len as usize..] != b"\r\n" {
            return Err(Error::InvalidData("bulk string missing terminator".to_string()));
        }
        payload.truncate(len as usize);
        Ok(payload)
    }
}

/// A RESP reply parser, used by the Raft talker to read responses from
/// peers. Understands the subset of reply types QuarkDB emits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Status(Vec<u8>),
    Error(Vec<u8>),
    Integer(i64),
    String(Vec<u8>),
    Null,
    Array(Vec<Reply>),
}

impl Reply {
    /// Fetches the next reply, blocking until it arrives.
    pub fn fetch<R: Read>(reader: &mut BufferedReader<R>) -> Result<Reply> {
        let line = reader
            .consume_line()?
            .ok_or_else(|| Error::IO("connection closed".to_string()))?;
        let Some((first, rest)) = line.split_first() else {
            return Err(Error::InvalidData("empty reply line".to_string()));
        };
        match first {
            b'+' => Ok(Reply::Status(rest.to_vec())),
            b'-' => Ok(Reply::Error(rest.to_vec())),
            b':' => Ok(Reply::Integer(parse_int(rest)?)),
            b'$' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(Reply::Null);
                }
                let mut payload = reader
                    .consume(len as usize + 2)?
                    .ok_or_else(|| Error::IO("connection closed".to_string()))?;
                payload.truncate(len as usize);
                Ok(Reply::String(payload))
            }
            b'*' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(Reply::Null);
                }
                let mut elements = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    elements.push(Reply::fetch(reader)?);
                }
                Ok(Reply::Array(elements))
            }
            other => {
                Err(Error::InvalidData(format!("unexpected reply type {}", *other as char)))
            }
        }
    }

    /// The reply as a byte string, for replies where the exact type doesn't
    /// matter.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Status(bytes) | Reply::Error(bytes) | Reply::String(bytes) => Some(bytes),
            _ => None,
        }
    }
}

fn parse_int(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidData(format!("invalid integer: {bytes:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_all(input: &[u8]) -> Result<Vec<RedisRequest>> {
        let mut reader = BufferedReader::new(Cursor::new(input.to_vec()));
        let mut requests = Vec::new();
        while let Some(request) = RedisParser::fetch(&mut reader)? {
            requests.push(request);
        }
        Ok(requests)
    }

    #[test]
    fn parses_array_requests() -> Result<()> {
        let requests = parse_all(b"*3\r\n$3\r\nSET\r\n$4\r\nasdf\r\n$4\r\n1234\r\n")?;
        assert_eq!(
            requests,
            vec![vec![b"SET".to_vec(), b"asdf".to_vec(), b"1234".to_vec()]]
        );
        Ok(())
    }

    #[test]
    fn parses_pipelined_requests() -> Result<()> {
        let requests = parse_all(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*1\r\n$4\r\nPING\r\n")?;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], vec![b"PING".to_vec()]);
        Ok(())
    }

    #[test]
    fn parses_inline_commands() -> Result<()> {
        let requests = parse_all(b"PING\r\nGET  key\r\n")?;
        assert_eq!(requests[0], vec![b"PING".to_vec()]);
        assert_eq!(requests[1], vec![b"GET".to_vec(), b"key".to_vec()]);
        Ok(())
    }

    #[test]
    fn binary_payloads_survive() -> Result<()> {
        let requests = parse_all(b"*2\r\n$3\r\nSET\r\n$4\r\n\x00\xff\r\n\r\n")?;
        assert_eq!(requests[0][1], vec![0x00, 0xff, b'\r', b'\n']);
        Ok(())
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(parse_all(b"*2\r\n$3\r\nGET\r\n:5\r\n").is_err());
        assert!(parse_all(b"*1\r\n$3\r\nGET").is_err());
    }

    #[test]
    fn parses_replies() -> Result<()> {
        let input = b"+OK\r\n-ERR nope\r\n:42\r\n$4\r\ndata\r\n$-1\r\n*2\r\n:1\r\n+two\r\n";
        let mut reader = BufferedReader::new(Cursor::new(input.to_vec()));
        assert_eq!(Reply::fetch(&mut reader)?, Reply::Status(b"OK".to_vec()));
        assert_eq!(Reply::fetch(&mut reader)?, Reply::Error(b"ERR nope".to_vec()));
        assert_eq!(Reply::fetch(&mut reader)?, Reply::Integer(42));
        assert_eq!(Reply::fetch(&mut reader)?, Reply::String(b"data".to_vec()));
        assert_eq!(Reply::fetch(&mut reader)?, Reply::Null);
        assert_eq!(
            Reply::fetch(&mut reader)?,
            Reply::Array(vec![Reply::Integer(1), Reply::Status(b"two".to_vec())])
        );
        Ok(())
    }

    #[test]
    fn large_requests_span_buffers() -> Result<()> {
        let payload = vec![b'x'; 100_000];
        let mut input = format!("*2\r\n$3\r\nSET\r\n${}\r\n", payload.len()).into_bytes();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"\r\n");

        let requests = parse_all(&input)?;
        assert_eq!(requests[0][1], payload);
        Ok(())
    }
}
