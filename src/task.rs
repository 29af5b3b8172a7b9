//! Request plumbing: exactly-once callbacks and the promise handed back to
//! callers.
//!
//! Every scheduled request owns a `Callback<T>`. Calling it consumes it; if
//! it is dropped without being called (queue torn down, thread lost) it fires
//! with `TaskError::Cancelled`, so a requester never waits forever. The value
//! returned by the requester's action travels back through a `TaskHandle`,
//! which can be waited on synchronously or awaited.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::TaskError;
use crate::threading::CancelToken;

/// Result delivered to scheduled actions
pub type TaskResult<T> = std::result::Result<T, TaskError>;

// ============================================================================
// Request policies
// ============================================================================

/// Whether a queued read is cancelled automatically by a newer edit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Invalidation {
    /// Runs to completion regardless of edits (diagnostics, rename)
    #[default]
    NoInvalidation,
    /// Cancelled as soon as an update for a newer version is submitted
    InvalidateOnUpdate,
}

/// Freshness contract for preamble consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleFreshness {
    /// Latest built preamble, possibly older than the current edit. Waits
    /// only if no preamble build has ever completed for the file.
    Stale,
    /// Never waits; the action may see no preamble at all (fallback mode).
    StaleOrAbsent,
}

/// Whether an update should produce diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WantDiagnostics {
    /// Always publish for this version
    Yes,
    /// Never publish for this version
    No,
    /// Publish unless superseded by a later update before the build starts
    #[default]
    Auto,
}

// ============================================================================
// Callback
// ============================================================================

type BoxedAction<T> = Box<dyn FnOnce(TaskResult<T>) + Send + 'static>;

/// Exactly-once continuation of a request
pub struct Callback<T> {
    action: Option<BoxedAction<T>>,
}

impl<T> Callback<T> {
    pub fn new(action: impl FnOnce(TaskResult<T>) + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    pub fn call(mut self, result: TaskResult<T>) {
        if let Some(action) = self.action.take() {
            action(result);
        }
    }
}

impl<T> Drop for Callback<T> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action(Err(TaskError::cancelled("request dropped before completion")));
        }
    }
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("pending", &self.action.is_some())
            .finish()
    }
}

// ============================================================================
// TaskHandle
// ============================================================================

/// Promise for the value produced by a scheduled action
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<TaskResult<R>>,
    cancel: CancelToken,
}

impl<R: Send + 'static> TaskHandle<R> {
    /// Build a callback whose action sees the task result and whose return
    /// value resolves the handle.
    pub fn for_action<T>(
        cancel: CancelToken,
        action: impl FnOnce(TaskResult<T>) -> R + Send + 'static,
    ) -> (Callback<T>, Self) {
        let (tx, rx) = oneshot::channel();
        let callback = Callback::new(move |result| {
            let _ = tx.send(Ok(action(result)));
        });
        (callback, Self { rx, cancel })
    }

    /// Build a callback that only runs `action` on success; failures resolve
    /// the handle directly.
    pub fn for_unit_action(
        cancel: CancelToken,
        action: impl FnOnce() -> R + Send + 'static,
    ) -> (Callback<()>, Self) {
        let (tx, rx) = oneshot::channel();
        let callback = Callback::new(move |result: TaskResult<()>| {
            let _ = tx.send(result.map(|()| action()));
        });
        (callback, Self { rx, cancel })
    }

    /// Handle that is already resolved with an error
    pub fn failed(error: TaskError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            rx,
            cancel: CancelToken::new(),
        }
    }

    /// Request cooperative cancellation of the underlying task
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Block the calling thread until the task resolves.
    ///
    /// Must not be called from inside an async runtime; `.await` the handle
    /// there instead.
    pub fn wait(self) -> TaskResult<R> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(TaskError::cancelled("task abandoned")))
    }

    /// Block for at most `timeout`. On expiry the task is cancelled and
    /// `ResourceExhausted` is returned.
    pub fn wait_timeout(mut self, timeout: Duration) -> TaskResult<R> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.rx.try_recv() {
                Ok(result) => return result,
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(TaskError::cancelled("task abandoned"))
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            if std::time::Instant::now() >= deadline {
                self.cancel.cancel("deadline exceeded");
                return Err(TaskError::ResourceExhausted {
                    message: format!("no result within {:?}", timeout),
                });
            }
            std::thread::sleep(crate::threading::CANCEL_POLL.min(Duration::from_millis(5)));
        }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = TaskResult<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(TaskError::cancelled("task abandoned"))))
    }
}
