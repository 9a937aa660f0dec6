use std::sync::RwLock;
use std::time::Instant;

/// A millisecond clock value, as persisted in the __clock key.
pub type ClockValue = u64;

/// Tracks the state machine's logical millisecond clock in memory.
///
/// The persisted (static) clock only ever moves forward: it is advanced by
/// writes that carry an external clock value, and an assertion in
/// synchronize() enforces monotonicity. The dynamic clock adds the wall-clock
/// time elapsed since the last synchronization, so it keeps rolling between
/// writes -- but it may step backwards when a synchronization lands below the
/// locally extrapolated value, which is fine for lease bookkeeping.
pub struct Timekeeper {
    inner: RwLock<Anchor>,
}

struct Anchor {
    static_clock: ClockValue,
    anchor: Instant,
}

impl Timekeeper {
    /// Creates a timekeeper with the given initial clock value. Time starts
    /// rolling forward immediately.
    pub fn new(startup: ClockValue) -> Self {
        Self { inner: RwLock::new(Anchor { static_clock: startup, anchor: Instant::now() }) }
    }

    /// Resets the timekeeper completely, disregarding its previous state.
    /// Only used when the state machine is wiped, e.g. by resilvering; use
    /// synchronize() for normal clock updates.
    pub fn reset(&self, startup: ClockValue) {
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.static_clock = startup;
        inner.anchor = Instant::now();
    }

    /// Registers an update of the persisted clock. The persisted clock never
    /// goes back in time; that would indicate serious corruption.
    pub fn synchronize(&self, newval: ClockValue) {
        let mut inner = self.inner.write().expect("lock poisoned");
        assert!(
            inner.static_clock <= newval,
            "static clock went back in time: {} -> {newval}",
            inner.static_clock
        );
        inner.static_clock = newval;
        inner.anchor = Instant::now();
    }

    /// Like synchronize(), but tolerates stale values: the clock only moves
    /// if the observed value is ahead of it. Used when replaying committed
    /// clock updates whose effective value may already be in the past.
    pub fn observe(&self, value: ClockValue) {
        let mut inner = self.inner.write().expect("lock poisoned");
        if inner.static_clock < value {
            inner.static_clock = value;
            inner.anchor = Instant::now();
        }
    }

    /// Returns the current dynamic time in milliseconds.
    pub fn current_time(&self) -> ClockValue {
        let inner = self.inner.read().expect("lock poisoned");
        inner.static_clock + inner.anchor.elapsed().as_millis() as ClockValue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_clock_rolls_forward() {
        let tk = Timekeeper::new(100);
        assert!(tk.current_time() >= 100);

        tk.synchronize(5000);
        let now = tk.current_time();
        assert!(now >= 5000);

        // A synchronization below the extrapolated dynamic value pulls the
        // dynamic clock back; only the static clock is monotonic.
        std::thread::sleep(std::time::Duration::from_millis(5));
        tk.synchronize(5001);
        assert!(tk.current_time() >= 5001);
    }

    #[test]
    #[should_panic(expected = "static clock went back in time")]
    fn static_clock_must_not_regress() {
        let tk = Timekeeper::new(100);
        tk.synchronize(50);
    }
}
