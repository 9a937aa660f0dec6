use super::connection::PendingQueue;
use super::formatter_impl::formatter;
use super::request::RedisRequest;

use std::sync::{Mutex, Weak};

/// Fans every received command out to connections that issued MONITOR.
/// Registrations are latched: a monitor stays a monitor until it
/// disconnects.
#[derive(Default)]
pub struct CommandMonitor {
    monitors: Mutex<Vec<Weak<PendingQueue>>>,
}

impl CommandMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches a connection on as monitor.
    pub fn register(&self, queue: Weak<PendingQueue>) {
        self.monitors.lock().expect("lock poisoned").push(queue);
    }

    /// True if anyone is listening, to skip formatting on the hot path.
    pub fn active(&self) -> bool {
        !self.monitors.lock().expect("lock poisoned").is_empty()
    }

    /// Broadcasts a command as a status reply to every monitor, pruning the
    /// ones that went away.
    pub fn broadcast(&self, request: &RedisRequest, origin: &str) {
        let mut monitors = self.monitors.lock().expect("lock poisoned");
        if monitors.is_empty() {
            return;
        }

        let mut line = format!("[{origin}]");
        for token in request {
            line.push_str(&format!(" \"{}\"", String::from_utf8_lossy(token)));
        }
        let response = formatter::status(&line);

        monitors.retain(|monitor| match monitor.upgrade() {
            Some(queue) => {
                queue.append_response(response.clone());
                queue.flush();
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn broadcast_prunes_dead_monitors() {
        let monitor = CommandMonitor::new();
        let queue = Arc::new(PendingQueue::detached());
        monitor.register(Arc::downgrade(&queue));
        assert!(monitor.active());

        monitor.broadcast(&vec![b"SET".to_vec(), b"a".to_vec()], "client-1");
        assert!(monitor.active());

        drop(queue);
        monitor.broadcast(&vec![b"GET".to_vec()], "client-1");
        assert!(!monitor.active());
    }
}
