use super::dispatcher::RedisDispatcher;
use super::formatter_impl::EncodedResponse;
use super::request::RedisRequest;
use crate::raft::LogIndex;

use log::debug;
use std::collections::VecDeque;
use std::io::Write as _;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Flush the output buffer once it grows past this size, even before the
/// request batch ends.
const OUTPUT_BUFFER: usize = 256 * 1024;

/// A buffered, lock-protected writer for one connection. Writes coalesce in
/// an output buffer; a FlushGuard flushes on scope exit so a batch of
/// pipelined responses goes out in one syscall.
pub struct ConnectionWriter {
    inner: Mutex<WriterState>,
}

struct WriterState {
    sink: Box<dyn std::io::Write + Send>,
    buffer: Vec<u8>,
}

impl ConnectionWriter {
    pub fn new(sink: Box<dyn std::io::Write + Send>) -> Self {
        Self { inner: Mutex::new(WriterState { sink, buffer: Vec::new() }) }
    }

    /// Appends a response to the output buffer, flushing if it grew large.
    pub fn write(&self, response: &EncodedResponse) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.buffer.extend_from_slice(response.as_bytes());
        if inner.buffer.len() >= OUTPUT_BUFFER {
            Self::flush_state(&mut inner);
        }
    }

    /// Flushes the output buffer to the socket. Write errors are ignored;
    /// the reader side of the connection notices the breakage and tears the
    /// connection down.
    pub fn flush(&self) {
        Self::flush_state(&mut self.inner.lock().expect("lock poisoned"));
    }

    fn flush_state(inner: &mut WriterState) {
        if inner.buffer.is_empty() {
            return;
        }
        let buffer = std::mem::take(&mut inner.buffer);
        if let Err(err) = inner.sink.write_all(&buffer) {
            debug!("Write to connection failed: {err}");
        }
    }
}

/// Flushes a connection writer when it goes out of scope.
pub struct FlushGuard<'a> {
    writer: &'a ConnectionWriter,
}

impl<'a> FlushGuard<'a> {
    pub fn new(writer: &'a ConnectionWriter) -> Self {
        Self { writer }
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.writer.flush();
    }
}

/// An entry of the pending queue. The queue usually looks like
/// `write, read, read, write, read`: every write corresponds to a journal
/// entry and waits for its commit; reads queue behind the writes that
/// precede them so responses keep submission order.
enum PendingItem {
    /// An already-formatted response (pre-computed errors, responses
    /// enqueued while earlier items were still pending).
    Ready(EncodedResponse),
    /// A read executed once everything before it has resolved.
    Read(RedisRequest),
    /// A write waiting for its journal entry to commit and apply.
    Write { index: LogIndex, expected_responses: usize },
}

/// The ordered queue of pending requests of one connection.
///
/// The queue is held through a shared handle, since a pending write can
/// outlive its connection: the client may disconnect after the write was
/// appended to the journal. detach_connection() cuts the link; responses
/// resolved after that are silently discarded.
pub struct PendingQueue {
    inner: Mutex<QueueState>,
}

struct QueueState {
    writer: Option<Arc<ConnectionWriter>>,
    items: VecDeque<PendingItem>,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::detached()
    }
}

impl PendingQueue {
    pub fn new(writer: Arc<ConnectionWriter>) -> Self {
        Self { inner: Mutex::new(QueueState { writer: Some(writer), items: VecDeque::new() }) }
    }

    /// A queue with no connection, for tests and internal applies.
    pub fn detached() -> Self {
        Self { inner: Mutex::new(QueueState { writer: None, items: VecDeque::new() }) }
    }

    /// Cuts the connection link; subsequent responses are discarded.
    pub fn detach_connection(&self) {
        self.inner.lock().expect("lock poisoned").writer = None;
    }

    /// True if any request is still waiting in the queue.
    pub fn has_pending(&self) -> bool {
        !self.inner.lock().expect("lock poisoned").items.is_empty()
    }

    /// Flushes the connection writer, if still attached. Needed by writers
    /// outside the connection's own request loop, e.g. monitor broadcasts.
    pub fn flush(&self) {
        if let Some(writer) = &self.inner.lock().expect("lock poisoned").writer {
            writer.flush();
        }
    }

    /// Enqueues a finished response. If nothing is pending it goes straight
    /// out; otherwise it waits its turn behind the pending requests.
    pub fn append_response(&self, response: EncodedResponse) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.items.is_empty() {
            if let Some(writer) = &inner.writer {
                writer.write(&response);
            }
            return;
        }
        inner.items.push_back(PendingItem::Ready(response));
    }

    /// Enqueues a read if anything is pending ahead of it, so it resolves in
    /// submission order. With nothing pending, the read is handed back to
    /// the caller to execute immediately. The check and the enqueue must be
    /// one atomic step, since the commit applier drains the queue
    /// concurrently.
    pub fn queue_read(&self, request: RedisRequest) -> Option<RedisRequest> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.items.is_empty() {
            return Some(request);
        }
        inner.items.push_back(PendingItem::Read(request));
        None
    }

    /// Registers an in-flight write at its journal index.
    pub fn add_pending_write(&self, index: LogIndex, expected_responses: usize) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.items.push_back(PendingItem::Write { index, expected_responses });
    }

    /// Resolves the pending write at the given index with its responses,
    /// then drains everything behind it that is no longer blocked: ready
    /// responses flush, reads execute. Stops at the next pending write.
    pub fn fulfill_write(
        &self,
        index: LogIndex,
        responses: EncodedResponse,
        dispatcher: &RedisDispatcher,
    ) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        match inner.items.front() {
            Some(PendingItem::Write { index: head, .. }) => {
                assert_eq!(*head, index, "pending queue writes resolved out of order");
            }
            // The queue was already flushed with an error, e.g. by a leader
            // step-down racing the commit applier; drop the responses.
            _ => return,
        }
        inner.items.pop_front();
        if let Some(writer) = &inner.writer {
            writer.write(&responses);
        }
        Self::drain(&mut inner, dispatcher);
        if let Some(writer) = &inner.writer {
            writer.flush();
        }
    }

    /// Flushes the unblocked prefix of the queue.
    fn drain(inner: &mut QueueState, dispatcher: &RedisDispatcher) {
        while let Some(item) = inner.items.front() {
            match item {
                PendingItem::Write { .. } => break,
                PendingItem::Ready(_) => {
                    let Some(PendingItem::Ready(response)) = inner.items.pop_front() else {
                        unreachable!()
                    };
                    if let Some(writer) = &inner.writer {
                        writer.write(&response);
                    }
                }
                PendingItem::Read(_) => {
                    let Some(PendingItem::Read(request)) = inner.items.pop_front() else {
                        unreachable!()
                    };
                    let response = dispatcher.dispatch_read(&request);
                    if let Some(writer) = &inner.writer {
                        writer.write(&response);
                    }
                }
            }
        }
    }

    /// Flushes the whole queue with the given response: pre-computed
    /// responses go out as they are, every pending read and every expected
    /// write response is answered with the message. Used when the leader
    /// steps down with requests still in flight.
    pub fn flush_pending(&self, message: &EncodedResponse) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        while let Some(item) = inner.items.pop_front() {
            let response = match item {
                PendingItem::Ready(response) => response,
                PendingItem::Read(_) => message.clone(),
                PendingItem::Write { expected_responses, .. } => EncodedResponse::concat(
                    std::iter::repeat(message.clone()).take(expected_responses),
                ),
            };
            if let Some(writer) = &inner.writer {
                writer.write(&response);
            }
        }
        if let Some(writer) = &inner.writer {
            writer.flush();
        }
    }
}

/// Connection-scoped identity and modes.
pub struct Connection {
    id: u64,
    name: Mutex<String>,
    /// MONITOR latches on; there is deliberately no way back.
    monitor: AtomicBool,
    /// Push types latch on too: a connection is promoted to RESP3 pushes
    /// once and never demoted.
    push_types: AtomicBool,
    /// The connection opted into potentially stale local reads on a
    /// follower.
    stale_reads: AtomicBool,
    /// The peer completed a RAFT_HANDSHAKE on this connection.
    raft_authorized: AtomicBool,
    /// Number of active channel subscriptions.
    subscriptions: AtomicU64,
    pub writer: Arc<ConnectionWriter>,
    pub queue: Arc<PendingQueue>,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_sink(Box::new(stream))
    }

    /// Builds a connection over any byte sink, e.g. for tests.
    pub fn with_sink(sink: Box<dyn std::io::Write + Send>) -> Self {
        let writer = Arc::new(ConnectionWriter::new(sink));
        let queue = Arc::new(PendingQueue::new(writer.clone()));
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            name: Mutex::new(String::new()),
            monitor: AtomicBool::new(false),
            push_types: AtomicBool::new(false),
            stale_reads: AtomicBool::new(false),
            raft_authorized: AtomicBool::new(false),
            subscriptions: AtomicU64::new(0),
            writer,
            queue,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().expect("lock poisoned").clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.lock().expect("lock poisoned") = name;
    }

    pub fn set_monitor(&self) {
        self.monitor.store(true, Ordering::Relaxed);
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor.load(Ordering::Relaxed)
    }

    pub fn activate_push_types(&self) {
        self.push_types.store(true, Ordering::Relaxed);
    }

    pub fn has_push_types(&self) -> bool {
        self.push_types.load(Ordering::Relaxed)
    }

    pub fn activate_stale_reads(&self) {
        self.stale_reads.store(true, Ordering::Relaxed);
    }

    pub fn stale_reads(&self) -> bool {
        self.stale_reads.load(Ordering::Relaxed)
    }

    pub fn authorize_raft(&self) {
        self.raft_authorized.store(true, Ordering::Relaxed);
    }

    pub fn raft_authorized(&self) -> bool {
        self.raft_authorized.load(Ordering::Relaxed)
    }

    /// Adjusts the subscription count, returning the new value.
    pub fn adjust_subscriptions(&self, delta: i64) -> u64 {
        if delta >= 0 {
            self.subscriptions.fetch_add(delta as u64, Ordering::Relaxed) + delta as u64
        } else {
            let mut current = self.subscriptions.load(Ordering::Relaxed);
            loop {
                let next = current.saturating_sub(delta.unsigned_abs());
                match self.subscriptions.compare_exchange_weak(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return next,
                    Err(actual) => current = actual,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::formatter;
    use crate::redis::request::Transaction;
    use crate::statemachine::StateMachine;
    use crate::storage::Memory;

    fn dispatcher() -> RedisDispatcher {
        RedisDispatcher::new(Arc::new(
            StateMachine::open(Box::new(Memory::new()), false).expect("open failed"),
        ))
    }

    /// The per-connection order property: with R1, W, R2 pipelined, R2 must
    /// resolve after W even though the write commits later, and the read
    /// executed behind the write must observe its effects.
    #[test]
    fn pending_queue_preserves_submission_order() {
        let dispatcher = dispatcher();
        let queue = PendingQueue::detached();

        // R1 arrives with nothing pending: it would be answered directly.
        assert!(!queue.has_pending());
        queue.append_response(formatter::pong());

        // W is appended to the journal at index 1.
        queue.add_pending_write(1, 1);
        assert!(queue.has_pending());

        // R2 queues behind it.
        queue.queue_read(vec![b"GET".to_vec(), b"asdf".to_vec()]);

        // The commit applier applies W through the state machine, then
        // resolves the queue. The queued read runs afterwards and sees the
        // write.
        let tx = Transaction::single(vec![b"SET".to_vec(), b"asdf".to_vec(), b"1234".to_vec()]);
        let responses = dispatcher.apply(&tx, 1);
        queue.fulfill_write(1, EncodedResponse::concat(responses), &dispatcher);
        assert!(!queue.has_pending());

        let read = dispatcher.dispatch_read(&vec![b"GET".to_vec(), b"asdf".to_vec()]);
        assert_eq!(read.0, b"$4\r\n1234\r\n");
    }

    #[test]
    #[should_panic(expected = "resolved out of order")]
    fn fulfilling_out_of_order_is_a_bug() {
        let dispatcher = dispatcher();
        let queue = PendingQueue::detached();
        queue.add_pending_write(1, 1);
        queue.add_pending_write(2, 1);
        queue.fulfill_write(2, formatter::ok(), &dispatcher);
    }

    #[test]
    fn flush_pending_answers_by_expected_count() {
        let queue = PendingQueue::detached();
        queue.add_pending_write(5, 3);
        queue.queue_read(vec![b"GET".to_vec(), b"k".to_vec()]);
        queue.flush_pending(&formatter::unavailable());
        assert!(!queue.has_pending());
    }
}
