//! Event loop: one reactor thread's lifecycle.
//!
//! Construction spawns the thread and blocks on a one-shot rendezvous
//! until in-thread initialization reports success or failure; the run
//! phase pumps the injection queue and drives the reactor until the
//! queue's shutdown drain completes; drop joins the thread. A delay
//! probe re-arms itself through the reactor's own timers to measure how
//! late the loop is running its schedule.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::num::NonZeroU64;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::dispose::Disposer;
use crate::reactor::{Reactor, TimerHandle};
use crate::task_queue::{ConfigError, Priority, SubmitError, Task, TaskQueue, NUM_PRIORITIES};
use crate::timeout::TimeoutCache;

thread_local! {
    /// Which loop owns this thread. Set exactly once, when the loop's
    /// run phase begins; the thread exits when the run phase ends.
    static CURRENT_LOOP: Cell<Option<LoopId>> = const { Cell::new(None) };
}

/// Process-wide identity of one [`EventLoop`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LoopId(NonZeroU64);

fn next_loop_id() -> LoopId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    LoopId(NonZeroU64::new(NEXT.fetch_add(1, Ordering::Relaxed)).unwrap())
}

/// Role tag for a loop's thread, recorded next to its name.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoopKind {
    /// Serves the request path.
    Worker,
    /// Background maintenance.
    Utility,
}

/// Construction parameters for [`EventLoop::new`].
#[derive(Clone, Debug)]
pub struct Options {
    /// OS-visible thread name.
    pub name: String,
    pub kind: LoopKind,
    /// Capacity of each priority class in the injection queue.
    pub queue_capacity: usize,
    /// When false every submission is coerced to the highest class and
    /// ordering degenerates to plain FIFO.
    pub priorities_enabled: bool,
    /// Per-iteration drain quota per priority class, highest first.
    pub tasks_per_iteration: [u32; NUM_PRIORITIES],
    /// Steady interval of the scheduling-delay probe.
    pub probe_interval: Duration,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            name: "strata-loop".into(),
            kind: LoopKind::Worker,
            queue_capacity: 1024,
            priorities_enabled: true,
            tasks_per_iteration: [16, 8, 4],
            probe_interval: Duration::from_secs(1),
        }
    }
}

/// Why an event loop failed to construct. Surfaced synchronously by
/// [`EventLoop::new`]; on error the spawned thread has already been
/// joined and nothing stays allocated.
#[derive(Debug, Error)]
pub enum InitError {
    /// The OS poller could not be allocated.
    #[error("failed to allocate reactor: {0}")]
    ResourceExhausted(#[source] io::Error),
    /// The queue/priority configuration was rejected.
    #[error("task queue configuration rejected: {0}")]
    SystemLimit(#[source] ConfigError),
    /// The loop thread could not be spawned, or exited without
    /// reporting.
    #[error("event loop thread failed to start: {0}")]
    Internal(String),
}

/// State reachable from producer threads: the injection queue plus the
/// loop's identity and delay accumulator.
pub(crate) struct Shared {
    name: String,
    kind: LoopKind,
    id: LoopId,
    os_tid: i64,
    queue: TaskQueue,
    delay_us: Arc<AtomicU64>,
    priorities_enabled: bool,
    /// Outstanding [`Handle`]s; must reach zero before the loop drops.
    handles: AtomicUsize,
}

impl Shared {
    pub(crate) fn submit(&self, priority: Priority, task: Task) -> Result<(), SubmitError> {
        let priority = if self.priorities_enabled {
            priority
        } else {
            Priority::HIGHEST
        };
        self.queue.add_with_priority(priority, task)
    }

    pub(crate) fn is_current(&self) -> bool {
        CURRENT_LOOP.with(|current| current.get()) == Some(self.id)
    }

    fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us.load(Ordering::Relaxed))
    }
}

// ── Delay probe ─────────────────────────────────────────────────────

/// Probe phase. The timer toggles between the two every firing.
#[derive(Clone, Copy)]
enum Phase {
    /// Waiting out the steady interval.
    Idle,
    /// A zero timeout is armed; the gap until it fires is the lag.
    Measuring(Instant),
}

struct ProbeState {
    phase: Cell<Phase>,
    interval: Duration,
    timeouts: Rc<RefCell<TimeoutCache>>,
    delay_us: Arc<AtomicU64>,
}

impl ProbeState {
    fn fire(&self, reactor: &Reactor, timer: TimerHandle) {
        let now = Instant::now();
        match self.phase.get() {
            Phase::Idle => {
                let zero = self.timeouts.borrow_mut().get(reactor, Duration::ZERO);
                self.phase.set(Phase::Measuring(now));
                reactor.arm_timer(timer, zero);
            }
            Phase::Measuring(start) => {
                let lag = now.saturating_duration_since(start);
                self.delay_us
                    .fetch_add(lag.as_micros() as u64, Ordering::Relaxed);
                let steady = self.timeouts.borrow_mut().get(reactor, self.interval);
                self.phase.set(Phase::Idle);
                reactor.arm_timer(timer, steady);
            }
        }
    }
}

/// Self-rescheduling timer estimating reactor scheduling delay.
///
/// A zero timeout armed in one pass fires in the next, so the measured
/// gap covers one full loop iteration, pump included, rather than the
/// nominal timer period.
struct DelayProbe {
    timer: TimerHandle,
    state: Rc<ProbeState>,
}

impl DelayProbe {
    fn new(
        reactor: &Reactor,
        timeouts: Rc<RefCell<TimeoutCache>>,
        interval: Duration,
        delay_us: Arc<AtomicU64>,
    ) -> DelayProbe {
        let state = Rc::new(ProbeState {
            phase: Cell::new(Phase::Idle),
            interval,
            timeouts,
            delay_us,
        });
        let callback = Rc::clone(&state);
        let timer = reactor.register_timer(move |reactor, timer| callback.fire(reactor, timer));
        DelayProbe { timer, state }
    }

    /// Start probing from the steady phase.
    fn arm(&self, reactor: &Reactor, timeouts: &RefCell<TimeoutCache>) {
        let steady = timeouts.borrow_mut().get(reactor, self.state.interval);
        self.state.phase.set(Phase::Idle);
        reactor.arm_timer(self.timer, steady);
    }

    fn free(&self, reactor: &Reactor) {
        reactor.free_timer(self.timer);
    }
}

// ── Loop thread ─────────────────────────────────────────────────────

/// Everything confined to the loop thread. Fields release in dependency
/// order: probe timer (freed explicitly at run exit), reactor, then the
/// shared queue reference.
struct LoopState {
    probe: DelayProbe,
    reactor: Reactor,
    timeouts: Rc<RefCell<TimeoutCache>>,
    quotas: [u32; NUM_PRIORITIES],
    shared: Arc<Shared>,
}

impl LoopState {
    fn init(options: &Options) -> Result<LoopState, InitError> {
        if options.tasks_per_iteration.iter().all(|&quota| quota == 0) {
            return Err(InitError::SystemLimit(ConfigError::ZeroQuotas));
        }
        let os_tid = os_thread_id();
        let reactor = Reactor::new().map_err(InitError::ResourceExhausted)?;
        let timeouts = Rc::new(RefCell::new(TimeoutCache::new(TimeoutCache::DEFAULT_CAPACITY)));
        let delay_us = Arc::new(AtomicU64::new(0));
        let probe = DelayProbe::new(
            &reactor,
            Rc::clone(&timeouts),
            options.probe_interval,
            Arc::clone(&delay_us),
        );
        let queue = TaskQueue::new(options.queue_capacity, reactor.notifier())
            .map_err(InitError::SystemLimit)?;
        queue.set_stop_loop_on_shutdown();

        let shared = Arc::new(Shared {
            name: options.name.clone(),
            kind: options.kind,
            id: next_loop_id(),
            os_tid,
            queue,
            delay_us,
            priorities_enabled: options.priorities_enabled,
            handles: AtomicUsize::new(0),
        });
        Ok(LoopState {
            probe,
            reactor,
            timeouts,
            quotas: options.tasks_per_iteration,
            shared,
        })
    }

    fn run(self) {
        CURRENT_LOOP.with(|current| {
            debug_assert!(current.get().is_none(), "thread already owns a loop");
            current.set(Some(self.shared.id));
        });
        self.shared.delay_us.store(0, Ordering::Relaxed);
        self.probe.arm(&self.reactor, &self.timeouts);
        tracing::debug!(name = %self.shared.name, "event loop running");

        loop {
            let executed = self.shared.queue.pump(&self.quotas);
            if self.shared.queue.should_stop_loop() {
                self.reactor.stop();
            }
            if self.reactor.is_stopped() {
                break;
            }
            // Pending work left over by the quotas must not wait for the
            // next wake-up.
            let timeout = if executed > 0 || self.shared.queue.has_pending() {
                Some(Duration::ZERO)
            } else {
                None
            };
            if let Err(err) = self.reactor.react(timeout) {
                tracing::error!(
                    name = %self.shared.name,
                    %err,
                    "reactor wait failed; stopping event loop"
                );
                break;
            }
        }

        self.probe.free(&self.reactor);
        tracing::debug!(name = %self.shared.name, "event loop exiting");
    }
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> i64 {
    unsafe { libc::gettid() as i64 }
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> i64 {
    -1
}

// ── Public surface ──────────────────────────────────────────────────

/// One reactor thread: owns its lifecycle from spawn to join.
///
/// Work reaches the loop only through [`EventLoop::add`],
/// [`EventLoop::add_with_priority`], [`EventLoop::dispose`], or a
/// [`Handle`]; everything submitted executes single-threaded on the
/// loop's own thread. Dropping the loop signals shutdown, drains every
/// accepted task, and joins the thread.
pub struct EventLoop {
    shared: Arc<Shared>,
    disposer: Disposer,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Spawn the loop thread and wait for it to finish initializing.
    ///
    /// Blocks until the new thread reports; on failure the thread is
    /// joined and the error returned, with nothing left allocated.
    pub fn new(options: Options) -> Result<EventLoop, InitError> {
        let (init_tx, init_rx) = mpsc::sync_channel::<Result<Arc<Shared>, InitError>>(1);
        let thread = thread::Builder::new()
            .name(options.name.clone())
            .spawn(move || match LoopState::init(&options) {
                Ok(state) => {
                    let _ = init_tx.send(Ok(Arc::clone(&state.shared)));
                    state.run();
                }
                Err(err) => {
                    tracing::error!(%err, "event loop initialization failed");
                    let _ = init_tx.send(Err(err));
                }
            })
            .map_err(|err| InitError::Internal(format!("spawn failed: {err}")))?;

        match init_rx.recv() {
            Ok(Ok(shared)) => Ok(EventLoop {
                disposer: Disposer::new(Arc::clone(&shared)),
                shared,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(InitError::Internal(
                    "loop thread exited without reporting".into(),
                ))
            }
        }
    }

    /// The loop owning the calling thread, if any.
    pub fn current() -> Option<LoopId> {
        CURRENT_LOOP.with(|current| current.get())
    }

    /// Submit a task at the lowest priority.
    pub fn add(&self, task: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        self.add_with_priority(Priority::LOWEST, task)
    }

    /// Submit a task for execution on the loop thread, waking the
    /// reactor if it is idle. Safe from any thread.
    pub fn add_with_priority(
        &self,
        priority: Priority,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), SubmitError> {
        self.shared.submit(priority, Box::new(task))
    }

    /// Release `payload` on the loop thread. See [`Disposer::dispose`].
    pub fn dispose<T: Send + 'static>(&self, payload: T) -> Result<(), SubmitError> {
        self.disposer.dispose(payload)
    }

    /// The loop's disposer.
    pub fn disposer(&self) -> &Disposer {
        &self.disposer
    }

    /// Signal shutdown: no further submissions are accepted, accepted
    /// tasks drain, then the loop stops. Idempotent.
    pub fn shutdown(&self) {
        self.shared.queue.shutdown();
    }

    /// Accumulated scheduling delay measured by the probe. Non-
    /// decreasing over the loop's lifetime; a best-effort snapshot.
    pub fn delay(&self) -> Duration {
        self.shared.delay()
    }

    /// New producer handle. The loop's drop asserts every handle was
    /// released first.
    pub fn handle(&self) -> Handle {
        self.shared.handles.fetch_add(1, Ordering::SeqCst);
        Handle {
            disposer: Disposer::new(Arc::clone(&self.shared)),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> LoopKind {
        self.shared.kind
    }

    /// Raw OS thread id of the loop thread (-1 where unsupported).
    pub fn os_tid(&self) -> i64 {
        self.shared.os_tid
    }
}

impl Drop for EventLoop {
    /// Blocking: joins the loop thread, guaranteeing it never outlives
    /// this object. Every accepted task has executed by the time this
    /// returns.
    fn drop(&mut self) {
        let outstanding = self.shared.handles.load(Ordering::SeqCst);
        assert_eq!(
            outstanding, 0,
            "event loop `{}` dropped with {} outstanding handles",
            self.shared.name, outstanding
        );
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.queue.shutdown();
        if thread.join().is_err() {
            tracing::error!(name = %self.shared.name, "event loop thread panicked");
        }
    }
}

/// Cloneable producer-side reference to an [`EventLoop`].
///
/// Counted: the loop's drop asserts all handles were dropped, so a
/// handle must never outlive the loop it came from.
pub struct Handle {
    shared: Arc<Shared>,
    disposer: Disposer,
}

impl Handle {
    /// Submit a task at the lowest priority.
    pub fn add(&self, task: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        self.add_with_priority(Priority::LOWEST, task)
    }

    /// Submit a task at the given priority.
    pub fn add_with_priority(
        &self,
        priority: Priority,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), SubmitError> {
        self.shared.submit(priority, Box::new(task))
    }

    /// Release `payload` on the loop thread. See [`Disposer::dispose`].
    pub fn dispose<T: Send + 'static>(&self, payload: T) -> Result<(), SubmitError> {
        self.disposer.dispose(payload)
    }

    /// Accumulated scheduling delay of the target loop.
    pub fn delay(&self) -> Duration {
        self.shared.delay()
    }

    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    /// Whether the calling thread is the target loop's own thread.
    pub fn is_current(&self) -> bool {
        self.shared.is_current()
    }
}

impl Clone for Handle {
    fn clone(&self) -> Handle {
        self.shared.handles.fetch_add(1, Ordering::SeqCst);
        Handle {
            shared: Arc::clone(&self.shared),
            disposer: Disposer::new(Arc::clone(&self.shared)),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.handles.fetch_sub(1, Ordering::SeqCst);
    }
}
