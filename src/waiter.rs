//! Single-resolution wake tokens for parked writers.
//!
//! A [`WakeToken`] resolves exactly once, to one of [`WakeReason`]'s
//! variants: credit release, deadline expiry, or stream reset. Deadlines are
//! separate timer tasks referencing the token; whichever event arrives first
//! consumes the callback and cancels the other.

use std::sync::{Arc, Mutex};

use tokio::{task::AbortHandle, time::Instant};

/// Outcome delivered to a parked writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// Credit became available; the stream is writable again.
    Writable,
    /// The waiter's deadline elapsed.
    TimedOut,
    /// The stream was reset or closed.
    Reset,
}

type WakeFn = Box<dyn FnOnce(WakeReason) + Send + 'static>;

struct WakeInner {
    slot: Mutex<Option<WakeFn>>,
    timer: Mutex<Option<AbortHandle>>,
}

/// Handle to a parked writer's wake callback.
#[derive(Clone)]
pub(crate) struct WakeToken {
    inner: Arc<WakeInner>,
}

impl WakeToken {
    /// Wrap `on_wake` in a token. The callback runs at most once.
    pub(crate) fn new(on_wake: WakeFn) -> Self {
        Self {
            inner: Arc::new(WakeInner {
                slot: Mutex::new(Some(on_wake)),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Resolve the token. Returns `false` if it was already resolved.
    pub(crate) fn fire(&self, reason: WakeReason) -> bool {
        let callback = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(callback) = callback else {
            return false;
        };
        if let Some(timer) = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        callback(reason);
        true
    }

    /// Arm a deadline that resolves the token with [`WakeReason::TimedOut`].
    ///
    /// A successful wake from any other source cancels the timer; the token
    /// being single-resolution makes a racing double-fire benign.
    pub(crate) fn arm_deadline(&self, deadline: Instant) {
        let token = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            token.fire(WakeReason::TimedOut);
        });
        *self
            .inner
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle.abort_handle());
    }
}

impl std::fmt::Debug for WakeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeToken").finish_non_exhaustive()
    }
}
