//! Periodic scheduling for link-layer and path maintenance ticks.
//!
//! A [`Scheduler`] runs a one-shot job after a delay and can cancel it before
//! it fires. Recurring work is expressed by a job that re-submits itself.
//!
//! Two implementations:
//!   - [`TokioScheduler`]: one tokio task per timer; cancel aborts the task.
//!   - [`EventLoopScheduler`]: single-threaded and cooperative; the owning
//!     loop advances a virtual clock and due jobs run inline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Handle for a scheduled job, used to cancel it.
pub type TimerId = u64;

/// A job run once when its timer fires.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Run `job` once after `delay`.
    fn call_later(&self, delay: Duration, job: Job) -> TimerId;

    /// Cancel a job that has not fired yet. Unknown or fired ids are ignored.
    fn cancel(&self, id: TimerId);
}

// ── Tokio ─────────────────────────────────────────────────────────────────────

/// Timers as tokio tasks.
pub struct TokioScheduler {
    handle: Handle,
    timers: Arc<DashMap<TimerId, AbortHandle>>,
    next_id: AtomicU64,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            timers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Scheduler on the runtime of the calling task.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Timers scheduled but not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

impl Scheduler for TokioScheduler {
    fn call_later(&self, delay: Duration, job: Job) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = self.timers.clone();
        // The task waits until its abort handle is registered so a zero delay
        // cannot fire before `cancel` is able to find it.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task = self.handle.spawn(async move {
            let _ = registered_rx.await;
            tokio::time::sleep(delay).await;
            if timers.remove(&id).is_some() {
                job();
            }
        });
        self.timers.insert(id, task.abort_handle());
        let _ = registered_tx.send(());
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some((_, task)) = self.timers.remove(&id) {
            task.abort();
        }
    }
}

// ── Cooperative event loop ────────────────────────────────────────────────────

/// Cooperative scheduler driven by its owner.
///
/// Time is virtual: it moves only when the owner calls [`advance`](Self::advance).
/// Jobs run on the caller's thread, outside the internal lock, so a job may
/// schedule or cancel other jobs (including re-scheduling itself).
#[derive(Default)]
pub struct EventLoopScheduler {
    state: Mutex<LoopState>,
}

#[derive(Default)]
struct LoopState {
    now: Duration,
    next_id: TimerId,
    timers: BTreeMap<TimerId, (Duration, Job)>,
}

impl EventLoopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    pub fn pending(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// Move the clock forward by `by` and run every job that became due,
    /// earliest first. Returns the number of jobs run.
    pub fn advance(&self, by: Duration) -> usize {
        self.state.lock().now += by;
        self.run_due()
    }

    /// Run every job due at the current virtual time.
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = {
                let mut state = self.state.lock();
                let now = state.now;
                let next = state
                    .timers
                    .iter()
                    .filter(|(_, (due, _))| *due <= now)
                    .min_by_key(|(id, (due, _))| (*due, **id))
                    .map(|(id, _)| *id);
                match next.and_then(|id| state.timers.remove(&id)) {
                    Some((_, job)) => job,
                    None => break,
                }
            };
            job();
            ran += 1;
        }
        ran
    }
}

impl Scheduler for EventLoopScheduler {
    fn call_later(&self, delay: Duration, job: Job) -> TimerId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let due = state.now + delay;
        state.timers.insert(id, (due, job));
        id
    }

    fn cancel(&self, id: TimerId) {
        self.state.lock().timers.remove(&id);
    }
}
