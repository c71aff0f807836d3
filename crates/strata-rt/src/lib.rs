//! strata-rt: per-thread reactor runtime for the strata log server.
//!
//! Each [`EventLoop`] owns one OS thread that multiplexes timers and
//! cross-thread task injection through a single poller. Other threads
//! submit closures at a chosen [`Priority`], hand payload buffers to
//! [`EventLoop::dispose`] for release on the loop thread, and read the
//! loop's scheduling-delay probe. Everything submitted executes
//! single-threaded in loop context; a task that blocks stalls the
//! whole loop, so long-running work belongs elsewhere.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_rt::{EventLoop, Options, Priority};
//!
//! let event_loop = EventLoop::new(Options::default())?;
//! event_loop.add(|| println!("runs on the loop thread"))?;
//! event_loop.add_with_priority(Priority::High, || { /* urgent */ })?;
//!
//! let handle = event_loop.handle();
//! std::thread::spawn(move || {
//!     handle.add(|| { /* injected from another thread */ }).ok();
//!     drop(handle);
//! });
//! // Dropping the loop shuts the queue down, drains it, and joins.
//! ```

mod dispose;
mod event_loop;
mod reactor;
mod task_queue;
mod timeout;

// Re-exports for convenience
pub use dispose::Disposer;
pub use event_loop::{EventLoop, Handle, InitError, LoopId, LoopKind, Options};
pub use reactor::{CommonTimeout, Notifier, Reactor, Timeout, TimerCallback, TimerHandle};
pub use task_queue::{ConfigError, Priority, SubmitError, Task, TaskQueue, NUM_PRIORITIES};
pub use timeout::TimeoutCache;
