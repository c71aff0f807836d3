//! Cross-thread task mailbox with priority classes.
//!
//! Producers on any thread push closures into per-priority bounded
//! queues; the loop thread drains them once per reactor iteration,
//! higher classes first, each class capped by a per-iteration quota so
//! lower classes keep some guaranteed throughput. The queue also owns
//! the loop's shutdown protocol: `Active → Draining → Stopped`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use concurrent_queue::{ConcurrentQueue, PushError};
use thiserror::Error;

use crate::reactor::Notifier;

/// Number of scheduling classes.
pub const NUM_PRIORITIES: usize = 3;

/// A unit of work executed on the loop thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling class for an injected task. Lower discriminant drains
/// first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Mid = 1,
    Low = 2,
}

impl Priority {
    pub const HIGHEST: Priority = Priority::High;
    pub const LOWEST: Priority = Priority::Low;

    fn index(self) -> usize {
        self as usize
    }
}

/// Rejected queue configuration, surfaced by the loop as a system-limit
/// failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue capacity must be nonzero")]
    ZeroCapacity,
    #[error("at least one priority class needs a nonzero per-iteration quota")]
    ZeroQuotas,
}

/// A submission the queue refused. The unexecuted task rides along so
/// the producer can retry, re-route, or drop it.
pub enum SubmitError {
    /// The priority class is at capacity; backpressure.
    Full(Task),
    /// Shutdown was signaled; the queue accepts nothing new.
    ShuttingDown(Task),
}

impl SubmitError {
    /// Recover the rejected task.
    pub fn into_task(self) -> Task {
        match self {
            SubmitError::Full(task) | SubmitError::ShuttingDown(task) => task,
        }
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Full(_) => f.write_str("Full(..)"),
            SubmitError::ShuttingDown(_) => f.write_str("ShuttingDown(..)"),
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Full(_) => f.write_str("task queue is at capacity"),
            SubmitError::ShuttingDown(_) => f.write_str("task queue is shutting down"),
        }
    }
}

impl std::error::Error for SubmitError {}

const ACTIVE: u8 = 0;
const DRAINING: u8 = 1;
const STOPPED: u8 = 2;

/// Multi-producer, single-consumer mailbox feeding one event loop.
///
/// Producers hold this through the loop's shared state; only the loop
/// thread calls [`TaskQueue::pump`].
pub struct TaskQueue {
    buckets: [ConcurrentQueue<Task>; NUM_PRIORITIES],
    state: AtomicU8,
    notifier: Notifier,
    stop_loop_on_shutdown: AtomicBool,
}

impl TaskQueue {
    /// `capacity` bounds each priority class.
    pub fn new(capacity: usize, notifier: Notifier) -> Result<TaskQueue, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(TaskQueue {
            buckets: std::array::from_fn(|_| ConcurrentQueue::bounded(capacity)),
            state: AtomicU8::new(ACTIVE),
            notifier,
            stop_loop_on_shutdown: AtomicBool::new(false),
        })
    }

    /// Once set, the queue stops the owning loop's reactor when its
    /// drain completes after shutdown.
    pub fn set_stop_loop_on_shutdown(&self) {
        self.stop_loop_on_shutdown.store(true, Ordering::Release);
    }

    /// Enqueue a task for the loop thread, waking the reactor. Safe from
    /// any thread.
    pub fn add_with_priority(&self, priority: Priority, task: Task) -> Result<(), SubmitError> {
        if self.state.load(Ordering::Acquire) != ACTIVE {
            return Err(SubmitError::ShuttingDown(task));
        }
        match self.buckets[priority.index()].push(task) {
            Ok(()) => {
                self.notifier.notify();
                Ok(())
            }
            Err(PushError::Full(task)) => Err(SubmitError::Full(task)),
            // Buckets close when draining begins; a push that lost that
            // race is reported, not silently dropped.
            Err(PushError::Closed(task)) => Err(SubmitError::ShuttingDown(task)),
        }
    }

    /// Signal shutdown: reject new submissions, drain what was accepted,
    /// then stop. Idempotent and terminal.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(ACTIVE, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("task queue draining");
            for bucket in &self.buckets {
                bucket.close();
            }
            self.notifier.notify();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    /// `true` once shutdown was signaled and every accepted task has run.
    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    /// `true` if the completed drain should also stop the loop's reactor.
    pub fn should_stop_loop(&self) -> bool {
        self.is_stopped() && self.stop_loop_on_shutdown.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.buckets.iter().any(|bucket| !bucket.is_empty())
    }

    /// Drain one iteration's worth of tasks: strictly higher classes
    /// first, each capped by its quota. Loop thread only.
    pub fn pump(&self, quotas: &[u32; NUM_PRIORITIES]) -> usize {
        let mut executed = 0;
        for (bucket, &quota) in self.buckets.iter().zip(quotas) {
            for _ in 0..quota {
                match bucket.pop() {
                    Ok(task) => {
                        task();
                        executed += 1;
                    }
                    Err(_) => break,
                }
            }
        }
        if self.state.load(Ordering::Acquire) == DRAINING && !self.has_pending() {
            self.state.store(STOPPED, Ordering::Release);
            tracing::debug!("task queue stopped");
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::sync::{Arc, Mutex};

    fn test_queue(capacity: usize) -> (TaskQueue, Reactor) {
        let reactor = Reactor::new().unwrap();
        let queue = TaskQueue::new(capacity, reactor.notifier()).unwrap();
        (queue, reactor)
    }

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, id: &'static str) -> Task {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(id))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let reactor = Reactor::new().unwrap();
        assert_eq!(
            TaskQueue::new(0, reactor.notifier()).err(),
            Some(ConfigError::ZeroCapacity)
        );
    }

    #[test]
    fn single_class_drains_in_fifo_order() {
        let (queue, _reactor) = test_queue(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in ["a", "b", "c"] {
            queue.add_with_priority(Priority::Low, record(&log, id)).unwrap();
        }
        queue.pump(&[4, 4, 4]);
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn quotas_bound_each_class_per_iteration() {
        let (queue, _reactor) = test_queue(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in ["h1", "h2", "h3"] {
            queue.add_with_priority(Priority::High, record(&log, id)).unwrap();
        }
        for id in ["l1", "l2", "l3"] {
            queue.add_with_priority(Priority::Low, record(&log, id)).unwrap();
        }

        queue.pump(&[2, 2, 2]);
        assert_eq!(*log.lock().unwrap(), ["h1", "h2", "l1", "l2"]);
        queue.pump(&[2, 2, 2]);
        assert_eq!(*log.lock().unwrap(), ["h1", "h2", "l1", "l2", "h3", "l3"]);
    }

    #[test]
    fn full_class_rejects_and_returns_the_task() {
        let (queue, _reactor) = test_queue(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.add_with_priority(Priority::High, record(&log, "a")).unwrap();
        queue.add_with_priority(Priority::High, record(&log, "b")).unwrap();

        let rejected = queue
            .add_with_priority(Priority::High, record(&log, "c"))
            .unwrap_err();
        assert!(matches!(rejected, SubmitError::Full(_)));

        // Another class still has room.
        queue.add_with_priority(Priority::Low, record(&log, "d")).unwrap();

        // The producer can run or re-route the returned task itself.
        rejected.into_task()();
        assert_eq!(*log.lock().unwrap(), ["c"]);
    }

    #[test]
    fn shutdown_rejects_new_submissions() {
        let (queue, _reactor) = test_queue(4);
        queue.shutdown();
        let err = queue
            .add_with_priority(Priority::High, Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, SubmitError::ShuttingDown(_)));
    }

    #[test]
    fn shutdown_drains_accepted_tasks_before_stopping() {
        let (queue, _reactor) = test_queue(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in ["a", "b", "c", "d", "e"] {
            queue.add_with_priority(Priority::Mid, record(&log, id)).unwrap();
        }
        queue.shutdown();

        queue.pump(&[2, 2, 2]);
        assert!(!queue.is_stopped(), "still draining");
        queue.pump(&[2, 2, 2]);
        assert!(!queue.is_stopped(), "still draining");
        queue.pump(&[2, 2, 2]);
        assert!(queue.is_stopped());
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (queue, _reactor) = test_queue(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.add_with_priority(Priority::High, record(&log, "a")).unwrap();

        queue.shutdown();
        queue.shutdown();
        queue.shutdown();

        queue.pump(&[4, 4, 4]);
        assert!(queue.is_stopped());
        assert_eq!(*log.lock().unwrap(), ["a"]);

        // Terminal: a later shutdown cannot resurrect the queue.
        queue.shutdown();
        assert!(queue.is_stopped());
    }

    #[test]
    fn stop_loop_flag_requires_completed_drain() {
        let (queue, _reactor) = test_queue(4);
        queue.set_stop_loop_on_shutdown();
        queue.add_with_priority(Priority::Low, Box::new(|| {})).unwrap();
        assert!(!queue.should_stop_loop());

        queue.shutdown();
        assert!(!queue.should_stop_loop(), "drain has not completed yet");
        queue.pump(&[1, 1, 1]);
        assert!(queue.should_stop_loop());
    }
}
