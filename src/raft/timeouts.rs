use super::types::ClusterID;
use crate::error::{Error, Result};

use rand::Rng as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The Raft timing parameters. All nodes of a cluster must agree on them,
/// which the handshake enforces by exchanging their serialized form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// The lower bound of the randomized election timeout.
    pub low: Duration,
    /// The upper bound of the randomized election timeout.
    pub high: Duration,
    /// The heartbeat interval, also used as the per-attempt RPC deadline.
    pub heartbeat: Duration,
}

impl Timeouts {
    pub fn new(low: Duration, high: Duration, heartbeat: Duration) -> Self {
        assert!(low <= high, "election timeout range is inverted");
        Self { low, high, heartbeat }
    }

    /// Production defaults.
    pub fn default_timeouts() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(1500), Duration::from_millis(250))
    }

    /// Aggressive timeouts for tests.
    pub fn aggressive() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_millis(75), Duration::from_millis(10))
    }

    /// Draws a random election timeout in [low, high].
    pub fn random_timeout(&self) -> Duration {
        rand::thread_rng().gen_range(self.low..=self.high)
    }

    /// Serializes as "low:high:heartbeat" in milliseconds, for the
    /// handshake.
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.low.as_millis(), self.high.as_millis(), self.heartbeat.as_millis())
    }

    /// Parses the serialized form.
    pub fn decode(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let [low, high, heartbeat] = parts.as_slice() else {
            return Err(Error::InvalidInput(format!("cannot parse timeouts: {s}")));
        };
        let millis = |v: &str| -> Result<Duration> {
            Ok(Duration::from_millis(
                v.parse().map_err(|_| Error::InvalidInput(format!("cannot parse timeouts: {s}")))?,
            ))
        };
        Ok(Self::new(millis(low)?, millis(high)?, millis(heartbeat)?))
    }
}

/// Everything a node needs to talk to its peers: the cluster identity and
/// the agreed timing parameters, exchanged in the handshake.
#[derive(Clone, Debug)]
pub struct ContactDetails {
    pub cluster_id: ClusterID,
    pub timeouts: Timeouts,
}

impl ContactDetails {
    pub fn new(cluster_id: ClusterID, timeouts: Timeouts) -> Self {
        Self { cluster_id, timeouts }
    }
}

/// Tracks heartbeats received from the cluster leader, and the randomized
/// election timeout the follower loop measures them against.
pub struct HeartbeatTracker {
    timeouts: Timeouts,
    inner: Mutex<TrackerState>,
}

struct TrackerState {
    last_heartbeat: Instant,
    random_timeout: Duration,
}

impl HeartbeatTracker {
    pub fn new(timeouts: Timeouts) -> Self {
        let random_timeout = timeouts.random_timeout();
        Self {
            timeouts,
            inner: Mutex::new(TrackerState { last_heartbeat: Instant::now(), random_timeout }),
        }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Registers a valid heartbeat, resetting the timeout measurement.
    pub fn heartbeat(&self) {
        self.inner.lock().expect("lock poisoned").last_heartbeat = Instant::now();
    }

    /// Draws a fresh randomized election timeout. Refreshed on every
    /// follower loop iteration so that election retries don't synchronize
    /// across nodes.
    pub fn refresh_random_timeout(&self) -> Duration {
        let timeout = self.timeouts.random_timeout();
        self.inner.lock().expect("lock poisoned").random_timeout = timeout;
        timeout
    }

    /// The current randomized election timeout.
    pub fn random_timeout(&self) -> Duration {
        self.inner.lock().expect("lock poisoned").random_timeout
    }

    /// True if no heartbeat has arrived within the current election timeout.
    pub fn timed_out(&self) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.last_heartbeat.elapsed() > inner.random_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip() -> Result<()> {
        let timeouts = Timeouts::default_timeouts();
        assert_eq!(timeouts.encode(), "1000:1500:250");
        assert_eq!(Timeouts::decode(&timeouts.encode())?, timeouts);
        assert!(Timeouts::decode("100:200").is_err());
        assert!(Timeouts::decode("a:b:c").is_err());
        Ok(())
    }

    #[test]
    fn random_timeouts_stay_in_range() {
        let timeouts = Timeouts::default_timeouts();
        for _ in 0..100 {
            let t = timeouts.random_timeout();
            assert!(t >= timeouts.low && t <= timeouts.high);
        }
    }

    #[test]
    fn heartbeats_reset_the_timeout() {
        let tracker = HeartbeatTracker::new(Timeouts::aggressive());
        tracker.heartbeat();
        assert!(!tracker.timed_out());
        std::thread::sleep(Duration::from_millis(100));
        assert!(tracker.timed_out());
        tracker.heartbeat();
        assert!(!tracker.timed_out());
    }
}
