//! Threading primitives for the scheduler and the background indexer
//!
//! - `Deadline` - absolute time limit, `Deadline::infinity()` never expires
//! - `Semaphore` - counting barrier bounding concurrent builds/actions
//! - `CancelToken` - cooperative cancellation with a reason, child tokens
//! - `AsyncTaskRunner` - spawns named threads and can wait for all of them
//!
//! All locks are `parking_lot` (no poisoning).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::TaskError;

/// Granularity used when a wait must also watch a cancellation token.
pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Deadline
// ============================================================================

/// A point in time after which blocking operations give up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn infinity() -> Self {
        Self(None)
    }

    /// Already expired: waits only check their condition once.
    pub fn zero() -> Self {
        Self(Some(Instant::now()))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// `None` means wait forever
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) => Self::after(t),
            None => Self::infinity(),
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(t) if Instant::now() >= t)
    }

    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }
}

/// Block on `cv` until `pred` holds or the deadline passes.
///
/// Returns the final value of `pred`.
pub fn wait_until<T>(
    guard: &mut MutexGuard<'_, T>,
    cv: &Condvar,
    deadline: Deadline,
    mut pred: impl FnMut(&mut T) -> bool,
) -> bool {
    loop {
        if pred(&mut **guard) {
            return true;
        }
        match deadline.instant() {
            None => cv.wait(guard),
            Some(t) => {
                if Instant::now() >= t {
                    return pred(&mut **guard);
                }
                cv.wait_until(guard, t);
            }
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Cooperative cancellation flag shared by a task and whoever may cancel it
///
/// A child token observes cancellation of any ancestor. The first reason
/// recorded wins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(CancelState::default()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.state.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// The reason of the nearest cancelled token, if any
    pub fn reason(&self) -> Option<String> {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return self.state.reason.lock().clone();
        }
        self.parent.as_ref().and_then(|p| p.reason())
    }

    /// Yield point: `Err(Cancelled)` once cancelled
    pub fn check(&self) -> std::result::Result<(), TaskError> {
        match self.reason() {
            Some(reason) => Err(TaskError::Cancelled { reason }),
            None if self.is_cancelled() => Err(TaskError::cancelled("cancelled")),
            None => Ok(()),
        }
    }

    /// Sleep in short slices, returning early on cancellation.
    pub fn sleep(&self, duration: Duration) -> std::result::Result<(), TaskError> {
        let end = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            thread::sleep((end - now).min(CANCEL_POLL));
        }
    }
}

// ============================================================================
// Semaphore
// ============================================================================

/// Counting semaphore bounding how many builds and actions run at once
#[derive(Debug)]
pub struct Semaphore {
    capacity: usize,
    free: Mutex<usize>,
    cv: Condvar,
}

/// Held permit; released on drop
#[derive(Debug)]
pub struct SemaphorePermit {
    sem: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        *self.sem.free.lock() += 1;
        self.sem.cv.notify_one();
    }
}

impl Semaphore {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            free: Mutex::new(capacity),
            cv: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.free.lock()
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SemaphorePermit> {
        let mut free = self.free.lock();
        if *free == 0 {
            return None;
        }
        *free -= 1;
        Some(SemaphorePermit {
            sem: Arc::clone(self),
        })
    }

    /// Wait for a permit while watching `cancel` and `deadline`.
    pub fn acquire(
        self: &Arc<Self>,
        cancel: &CancelToken,
        deadline: Deadline,
    ) -> std::result::Result<SemaphorePermit, TaskError> {
        let mut free = self.free.lock();
        loop {
            cancel.check()?;
            if *free > 0 {
                *free -= 1;
                return Ok(SemaphorePermit {
                    sem: Arc::clone(self),
                });
            }
            if deadline.expired() {
                return Err(TaskError::ResourceExhausted {
                    message: format!("all {} workers busy", self.capacity),
                });
            }
            let mut until = Instant::now() + CANCEL_POLL;
            if let Some(t) = deadline.instant() {
                until = until.min(t);
            }
            self.cv.wait_until(&mut free, until);
        }
    }
}

// ============================================================================
// AsyncTaskRunner
// ============================================================================

/// Spawns named threads and tracks how many are still running
#[derive(Debug, Default)]
pub struct AsyncTaskRunner {
    running: Mutex<usize>,
    cv: Condvar,
}

struct RunningGuard(Arc<AsyncTaskRunner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.0.running.lock();
        *running -= 1;
        if *running == 0 {
            self.0.cv.notify_all();
        }
    }
}

impl AsyncTaskRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `task` on a fresh thread named `name`.
    ///
    /// If the OS refuses the thread the task is dropped; tasks that own a
    /// `Callback` still resolve (as cancelled) through its drop.
    pub fn run_async(self: &Arc<Self>, name: impl Into<String>, task: impl FnOnce() + Send + 'static) {
        let name = name.into();
        *self.running.lock() += 1;
        let guard = RunningGuard(Arc::clone(self));
        let spawned = thread::Builder::new().name(thread_name(&name)).spawn(move || {
            let _guard = guard;
            task();
        });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn thread for {}: {}", name, e);
        }
    }

    pub fn running(&self) -> usize {
        *self.running.lock()
    }

    /// Wait until every spawned task has finished
    pub fn wait(&self, deadline: Deadline) -> bool {
        let mut running = self.running.lock();
        wait_until(&mut running, &self.cv, deadline, |n| *n == 0)
    }
}

/// Thread names are truncated by some platforms; keep the distinctive tail.
fn thread_name(name: &str) -> String {
    const MAX: usize = 48;
    if name.len() <= MAX {
        return name.to_string();
    }
    let mut start = name.len() - MAX;
    while !name.is_char_boundary(start) {
        start += 1;
    }
    name[start..].to_string()
}
