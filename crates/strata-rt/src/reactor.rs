//! Reactor: readiness and timer multiplexing for one loop thread.
//!
//! Wraps the OS poller and a timer table. All mutation happens on the
//! thread that owns the reactor; the only cross-thread entry point is
//! [`Notifier`], which wakes a reactor blocked inside [`Reactor::react`].

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use polling::{Events, Poller};
use slab::Slab;

/// Callback invoked on the loop thread when a timer fires.
///
/// Receives the reactor and the firing timer's handle so the callback
/// can re-arm itself without capturing its own handle.
pub type TimerCallback = dyn Fn(&Reactor, TimerHandle);

/// Opaque handle to a timer registered with a reactor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle(usize);

/// A pre-registered timeout duration, addressable by index.
///
/// Arming with a `CommonTimeout` skips re-submitting the duration for
/// the handful of values the loop re-uses constantly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommonTimeout(usize);

/// Relative timeout accepted by [`Reactor::arm_timer`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Timeout {
    /// Ad-hoc duration.
    After(Duration),
    /// Duration interned via [`Reactor::register_common_timeout`].
    Common(CommonTimeout),
}

struct TimerEntry {
    callback: Rc<TimerCallback>,
    /// `Some` while armed. The matching `(deadline, key)` pair lives in
    /// `Timers::armed`.
    deadline: Option<Instant>,
}

/// Timer state: `Slab` for handle → entry lookup, `BTreeSet` ordered by
/// `(deadline, key)` for expiry scanning.
struct Timers {
    table: Slab<TimerEntry>,
    armed: BTreeSet<(Instant, usize)>,
}

/// Cross-thread wake handle for a reactor blocked in [`Reactor::react`].
#[derive(Clone)]
pub struct Notifier {
    poller: Arc<Poller>,
}

impl Notifier {
    /// Wake the reactor if it is blocked waiting for events. Wakes are
    /// coalesced by the OS poller; calling this redundantly is cheap.
    pub fn notify(&self) {
        if let Err(err) = self.poller.notify() {
            tracing::warn!(%err, "failed to wake reactor");
        }
    }
}

/// The reactor: owns the OS poller, the timer table, and the interned
/// common timeouts for one loop thread.
pub struct Reactor {
    poller: Arc<Poller>,
    events: RefCell<Events>,
    timers: RefCell<Timers>,
    common: RefCell<Vec<Duration>>,
    stopped: Cell<bool>,
}

impl Reactor {
    /// Allocate a reactor. Fails if the OS poller cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poller: Arc::new(Poller::new()?),
            events: RefCell::new(Events::new()),
            timers: RefCell::new(Timers {
                table: Slab::new(),
                armed: BTreeSet::new(),
            }),
            common: RefCell::new(Vec::new()),
            stopped: Cell::new(false),
        })
    }

    /// Handle for waking this reactor from other threads.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            poller: Arc::clone(&self.poller),
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Register a timer. The callback runs on the loop thread each time
    /// the timer fires; the timer stays registered until freed.
    pub fn register_timer(
        &self,
        callback: impl Fn(&Reactor, TimerHandle) + 'static,
    ) -> TimerHandle {
        let key = self.timers.borrow_mut().table.insert(TimerEntry {
            callback: Rc::new(callback),
            deadline: None,
        });
        TimerHandle(key)
    }

    /// Disarm and remove a timer.
    pub fn free_timer(&self, handle: TimerHandle) {
        let mut timers = self.timers.borrow_mut();
        if timers.table.contains(handle.0) {
            let entry = timers.table.remove(handle.0);
            if let Some(deadline) = entry.deadline {
                timers.armed.remove(&(deadline, handle.0));
            }
        }
    }

    /// Arm a timer to fire once after the given timeout. Re-arming a
    /// pending timer replaces its deadline.
    pub fn arm_timer(&self, handle: TimerHandle, timeout: Timeout) {
        let duration = self.resolve(timeout);
        let deadline = Instant::now() + duration;
        let mut timers = self.timers.borrow_mut();
        if let Some(previous) = timers.table[handle.0].deadline.replace(deadline) {
            timers.armed.remove(&(previous, handle.0));
        }
        timers.armed.insert((deadline, handle.0));
    }

    /// Cancel a pending timer without removing it.
    pub fn disarm_timer(&self, handle: TimerHandle) {
        let mut timers = self.timers.borrow_mut();
        if let Some(deadline) = timers.table[handle.0].deadline.take() {
            timers.armed.remove(&(deadline, handle.0));
        }
    }

    /// Intern a duration for repeated arming. Returns a descriptor that
    /// [`Reactor::arm_timer`] resolves by index.
    pub fn register_common_timeout(&self, duration: Duration) -> CommonTimeout {
        let mut common = self.common.borrow_mut();
        common.push(duration);
        CommonTimeout(common.len() - 1)
    }

    /// Resolve a timeout to its duration.
    pub fn resolve(&self, timeout: Timeout) -> Duration {
        match timeout {
            Timeout::After(duration) => duration,
            Timeout::Common(CommonTimeout(index)) => self.common.borrow()[index],
        }
    }

    // ── Run / stop ──────────────────────────────────────────────────

    /// Request the reactor to stop. The loop driving [`Reactor::react`]
    /// observes this before its next wait.
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// One reactor pass: fire due timers, then block until the next
    /// timer deadline, a [`Notifier::notify`], or the caller's timeout,
    /// whichever comes first. `None` waits indefinitely (still capped by
    /// the next armed deadline).
    pub fn react(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.fire_due_timers();

        // Cap the wait by the earliest armed deadline. A timer armed
        // during this pass (including by a firing callback) lands here,
        // so a zero timeout turns the wait into an immediate return.
        let next_timer = self
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let effective_timeout = match (timeout, next_timer) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        };

        let mut events = self.events.borrow_mut();
        events.clear();
        self.poller.wait(&mut events, effective_timeout)?;
        Ok(())
    }

    /// Fire every timer whose deadline has passed. Timers armed by a
    /// firing callback are excluded from the current batch: they fire no
    /// earlier than the next pass, so a self-re-arming zero timeout
    /// measures one full loop iteration instead of spinning here.
    fn fire_due_timers(&self) {
        let now = Instant::now();
        let due: Vec<(usize, Rc<TimerCallback>)> = {
            let mut timers = self.timers.borrow_mut();
            let mut due = Vec::new();
            loop {
                match timers.armed.first().copied() {
                    Some((deadline, key)) if deadline <= now => {
                        timers.armed.remove(&(deadline, key));
                        timers.table[key].deadline = None;
                        due.push((key, Rc::clone(&timers.table[key].callback)));
                    }
                    _ => break,
                }
            }
            due
        };

        for (key, callback) in due {
            // An earlier callback in this batch may have freed the timer.
            if self.timers.borrow().table.contains(key) {
                callback(self, TimerHandle(key));
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .borrow()
            .armed
            .first()
            .map(|&(deadline, _)| deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn react_until(reactor: &Reactor, done: impl Fn() -> bool) {
        let start = Instant::now();
        while !done() {
            reactor.react(Some(Duration::from_millis(5))).unwrap();
            assert!(
                start.elapsed() < Duration::from_secs(2),
                "reactor test timed out"
            );
        }
    }

    #[test]
    fn timer_fires_after_deadline() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let fired_cb = Rc::clone(&fired);
        let timer = reactor.register_timer(move |_, _| fired_cb.set(true));

        reactor.arm_timer(timer, Timeout::After(Duration::from_millis(10)));
        let start = Instant::now();
        react_until(&reactor, || fired.get());
        assert!(
            start.elapsed() >= Duration::from_millis(10),
            "timer fired too early: {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn disarm_prevents_fire() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let fired_cb = Rc::clone(&fired);
        let timer = reactor.register_timer(move |_, _| fired_cb.set(true));

        reactor.arm_timer(timer, Timeout::After(Duration::from_millis(5)));
        reactor.disarm_timer(timer);
        std::thread::sleep(Duration::from_millis(10));
        reactor.react(Some(Duration::ZERO)).unwrap();
        assert!(!fired.get(), "disarmed timer must not fire");
    }

    #[test]
    fn freed_timer_never_fires() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let fired_cb = Rc::clone(&fired);
        let timer = reactor.register_timer(move |_, _| fired_cb.set(true));

        reactor.arm_timer(timer, Timeout::After(Duration::ZERO));
        reactor.free_timer(timer);
        std::thread::sleep(Duration::from_millis(5));
        reactor.react(Some(Duration::ZERO)).unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn callback_rearm_lands_in_next_pass() {
        let reactor = Reactor::new().unwrap();
        let fires = Rc::new(Cell::new(0u32));
        let fires_cb = Rc::clone(&fires);
        let timer = reactor.register_timer(move |reactor, handle| {
            fires_cb.set(fires_cb.get() + 1);
            if fires_cb.get() == 1 {
                reactor.arm_timer(handle, Timeout::After(Duration::ZERO));
            }
        });

        reactor.arm_timer(timer, Timeout::After(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(1));
        reactor.react(Some(Duration::ZERO)).unwrap();
        assert_eq!(fires.get(), 1, "re-armed timer must wait for the next pass");
        reactor.react(Some(Duration::ZERO)).unwrap();
        assert_eq!(fires.get(), 2);
    }

    #[test]
    fn common_timeout_resolves_to_registered_duration() {
        let reactor = Reactor::new().unwrap();
        let key = reactor.register_common_timeout(Duration::from_secs(1));
        assert_eq!(
            reactor.resolve(Timeout::Common(key)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn notify_wakes_blocking_wait() {
        let reactor = Reactor::new().unwrap();
        let notifier = reactor.notifier();
        let woken = Arc::new(AtomicUsize::new(0));
        let woken_thread = Arc::clone(&woken);

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            woken_thread.store(1, Ordering::SeqCst);
            notifier.notify();
        });

        let start = Instant::now();
        reactor.react(Some(Duration::from_secs(5))).unwrap();
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "notify did not wake the reactor"
        );
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        waker.join().unwrap();
    }

    #[test]
    fn stop_is_sticky() {
        let reactor = Reactor::new().unwrap();
        assert!(!reactor.is_stopped());
        reactor.stop();
        assert!(reactor.is_stopped());
        reactor.stop();
        assert!(reactor.is_stopped());
    }
}
