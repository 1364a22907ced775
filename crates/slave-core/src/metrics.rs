//! Process-wide atomic counters (§5): `unlockflow` counts datagram-routed
//! `FlowReturn` acks, `locklogic`/`unlocklogic` count successful
//! `sync.lock`/`sync.unlock` calls. Plain `AtomicU64` statics rather than a
//! shared struct threaded through every call site, matching the "global
//! counters are atomics" framing in the concurrency model.

use std::sync::atomic::{AtomicU64, Ordering};

static UNLOCKFLOW: AtomicU64 = AtomicU64::new(0);
static LOCKLOGIC: AtomicU64 = AtomicU64::new(0);
static UNLOCKLOGIC: AtomicU64 = AtomicU64::new(0);

pub fn incr_unlockflow() {
    UNLOCKFLOW.fetch_add(1, Ordering::Relaxed);
}

pub fn incr_locklogic() {
    LOCKLOGIC.fetch_add(1, Ordering::Relaxed);
}

pub fn incr_unlocklogic() {
    UNLOCKLOGIC.fetch_add(1, Ordering::Relaxed);
}

/// Current `(unlockflow, locklogic, unlocklogic)` values, for the status
/// line the control loop logs alongside the capacity report.
pub fn snapshot() -> (u64, u64, u64) {
    (UNLOCKFLOW.load(Ordering::Relaxed), LOCKLOGIC.load(Ordering::Relaxed), UNLOCKLOGIC.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let (a, b, c) = snapshot();
        incr_unlockflow();
        incr_locklogic();
        incr_unlocklogic();
        let (a2, b2, c2) = snapshot();
        assert_eq!(a2, a + 1);
        assert_eq!(b2, b + 1);
        assert_eq!(c2, c + 1);
    }
}
