//! Bounded cache of interned timeout durations.

use std::collections::HashMap;
use std::time::Duration;

use crate::reactor::{Reactor, Timeout};

/// Maps the handful of durations a loop re-arms constantly to
/// pre-registered descriptors, so repeated arming skips re-registering
/// the duration each time. Bounded: once full, new distinct durations
/// fall back to ad-hoc registration.
pub struct TimeoutCache {
    cached: HashMap<Duration, Timeout>,
    capacity: usize,
}

impl TimeoutCache {
    pub const DEFAULT_CAPACITY: usize = 10;

    pub fn new(capacity: usize) -> TimeoutCache {
        TimeoutCache {
            cached: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Look up (or intern, while below capacity) the descriptor for a
    /// duration. Loop thread only, like all reactor timer state.
    pub fn get(&mut self, reactor: &Reactor, duration: Duration) -> Timeout {
        if let Some(&timeout) = self.cached.get(&duration) {
            return timeout;
        }
        if self.cached.len() < self.capacity {
            let timeout = Timeout::Common(reactor.register_common_timeout(duration));
            self.cached.insert(duration, timeout);
            return timeout;
        }
        Timeout::After(duration)
    }
}
