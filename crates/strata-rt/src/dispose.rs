//! Deferred cross-thread disposal.
//!
//! Payload buffers handed to the server's loops must be released on the
//! loop thread that owns their allocation context. The disposer takes
//! ownership from any thread and hops the release over the task queue
//! when the caller is not already on the loop thread.

use std::sync::Arc;

use crate::event_loop::Shared;
use crate::task_queue::{Priority, SubmitError};

/// Releases ride the middle class: behind latency-critical dispatch,
/// ahead of bulk work.
const DISPOSE_PRIORITY: Priority = Priority::Mid;

/// Transfers payload ownership to an event loop for release on its
/// thread.
pub struct Disposer {
    shared: Arc<Shared>,
}

impl Disposer {
    pub(crate) fn new(shared: Arc<Shared>) -> Disposer {
        Disposer { shared }
    }

    /// Release `payload` on the loop thread. Called from the loop
    /// thread itself, the payload drops inline; from any other thread a
    /// release task is injected and the payload drops when the loop
    /// runs it. Exactly once either way.
    ///
    /// After shutdown the hop is refused; the returned [`SubmitError`]
    /// carries the release task (and with it the payload) back to the
    /// caller.
    pub fn dispose<T: Send + 'static>(&self, payload: T) -> Result<(), SubmitError> {
        if self.shared.is_current() {
            drop(payload);
            return Ok(());
        }
        self.shared.submit(DISPOSE_PRIORITY, Box::new(move || drop(payload)))
    }
}
