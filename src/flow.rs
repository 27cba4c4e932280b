//! Credit-based flow control for one stream.
//!
//! The sender may keep `cur_buf_size` bytes in flight: writes are admitted
//! while `produced < remote_consumed + cur_buf_size` and rejected as full
//! otherwise. FEEDBACK frames carry the receiver's absolute consumed count,
//! so replayed or reordered feedback is a no-op. When the aggregate
//! unconsumed-bytes threshold of the host transport is enabled, the window
//! adapts: it shrinks to the configured minimum under socket-wide pressure
//! and doubles while the stream stays saturated.
//!
//! Locking discipline: the congestion mutex is never held across a transport
//! write, and wait lists are detached under the lock but woken outside it so
//! callbacks may re-enter `write` or `wait`.

use std::sync::{Mutex, PoisonError};

use log::{info, trace, warn};

use crate::{
    config::{MuxTunables, StreamOptions},
    registry::StreamId,
    transport::UnconsumedCounter,
    waiter::{WakeReason, WakeToken},
};

/// Outcome of asking the controller to admit a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The write may proceed.
    Admitted {
        /// Whether `produced` was advanced; a failed transport write must
        /// reverse exactly the tracked admissions.
        tracked: bool,
    },
    /// No credit left; the caller should park on the wait list.
    Full,
}

#[derive(Debug)]
struct FlowState {
    produced: u64,
    remote_consumed: u64,
    cur_buf_size: u64,
    waiters: Vec<WakeToken>,
}

impl FlowState {
    fn is_full(&self) -> bool {
        self.cur_buf_size > 0 && self.produced >= self.remote_consumed + self.cur_buf_size
    }
}

/// Per-stream congestion state and writer wait list.
#[derive(Debug)]
pub(crate) struct FlowController {
    id: StreamId,
    min_buf_size: u64,
    max_buf_size: u64,
    state: Mutex<FlowState>,
}

impl FlowController {
    /// Build the controller from stream options.
    ///
    /// The initial window is `max_buf_size` (zero disables flow control). A
    /// `min_buf_size` above a positive `max_buf_size` is invalid and reset to
    /// zero. With aggregate pressure enabled and a positive minimum, streams
    /// start at the minimum and grow on demand instead.
    pub(crate) fn new(id: StreamId, options: &StreamOptions, tunables: &MuxTunables) -> Self {
        let max_buf_size = options.max_buf_size as u64;
        let mut min_buf_size = options.min_buf_size as u64;
        if max_buf_size > 0 && min_buf_size > max_buf_size {
            warn!(
                "stream {id}: min_buf_size {min_buf_size} is larger than max_buf_size \
                 {max_buf_size}, resetting it to 0"
            );
            min_buf_size = 0;
        }
        let mut cur_buf_size = max_buf_size;
        if tunables.aggregate_pressure_enabled() && min_buf_size > 0 {
            cur_buf_size = min_buf_size;
        }
        Self {
            id,
            min_buf_size,
            max_buf_size,
            state: Mutex::new(FlowState {
                produced: 0,
                remote_consumed: 0,
                cur_buf_size,
                waiters: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether this side expects FEEDBACK frames from the peer.
    pub(crate) fn need_feedback(&self) -> bool { self.state().cur_buf_size > 0 }

    /// Current send window in bytes (zero means flow control is disabled).
    #[cfg(test)]
    pub(crate) fn cur_buf_size(&self) -> u64 { self.state().cur_buf_size }

    /// Bytes handed to the transport so far.
    #[cfg(test)]
    pub(crate) fn produced(&self) -> u64 { self.state().produced }

    /// Latest acknowledged consumption from the peer.
    #[cfg(test)]
    pub(crate) fn remote_consumed(&self) -> u64 { self.state().remote_consumed }

    /// Try to admit a write of `len` bytes.
    pub(crate) fn admit(&self, len: u64) -> Admission {
        let mut state = self.state();
        if state.cur_buf_size == 0 {
            return Admission::Admitted { tracked: false };
        }
        if state.produced >= state.remote_consumed + state.cur_buf_size {
            trace!(
                "stream {}: full, produced={} remote_consumed={} window={}",
                self.id, state.produced, state.remote_consumed, state.cur_buf_size
            );
            return Admission::Full;
        }
        state.produced += len;
        Admission::Admitted { tracked: true }
    }

    /// Reverse a tracked admission after a failed transport write.
    pub(crate) fn reverse(&self, len: u64) {
        let mut state = self.state();
        state.produced = state.produced.saturating_sub(len);
    }

    /// Apply a FEEDBACK frame carrying the peer's absolute consumed count.
    ///
    /// Stale or replayed values are ignored. When `aggregate` is supplied,
    /// the shared counter is decremented by the newly consumed delta and the
    /// window adapts to socket-wide pressure. Writers parked while the
    /// stream was full are woken (outside the lock) once it no longer is.
    pub(crate) fn set_remote_consumed(
        &self,
        new_value: u64,
        aggregate: Option<(&UnconsumedCounter, u64)>,
    ) {
        let woken = {
            let mut state = self.state();
            if state.cur_buf_size == 0 {
                trace!("stream {}: feedback on a stream without flow control", self.id);
                return;
            }
            if state.remote_consumed >= new_value {
                return;
            }
            let was_full = state.is_full();

            if let Some((counter, threshold)) = aggregate {
                let delta = new_value - state.remote_consumed;
                counter.add(-i64::try_from(delta).unwrap_or(i64::MAX));
                if counter.get() > i64::try_from(threshold).unwrap_or(i64::MAX) {
                    state.cur_buf_size = if self.min_buf_size > 0 {
                        self.min_buf_size
                    } else {
                        state.cur_buf_size / 2
                    };
                    info!(
                        "stream {}: aggregate consumers are crowded, cutting window to {}",
                        self.id, state.cur_buf_size
                    );
                } else if state.produced >= new_value + state.cur_buf_size
                    && (self.max_buf_size == 0 || state.cur_buf_size < self.max_buf_size)
                {
                    state.cur_buf_size =
                        if self.max_buf_size > 0 && state.cur_buf_size * 2 > self.max_buf_size {
                            self.max_buf_size
                        } else {
                            state.cur_buf_size * 2
                        };
                }
            }

            state.remote_consumed = new_value;
            if was_full && !state.is_full() {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };
        for waiter in woken {
            waiter.fire(WakeReason::Writable);
        }
    }

    /// Park `token` until credit is available.
    ///
    /// When the stream is already writable (or flow control is disabled) the
    /// token fires immediately; otherwise it joins the wait list and resolves
    /// on credit release, deadline, or reset.
    pub(crate) fn wait(&self, token: WakeToken) {
        let writable = {
            let mut state = self.state();
            if state.is_full() {
                state.waiters.push(token.clone());
                false
            } else {
                true
            }
        };
        if writable {
            token.fire(WakeReason::Writable);
        }
    }

    /// Detach every parked writer and wake it with `reason`.
    ///
    /// Used on reset and recycle; runs the callbacks outside the lock.
    pub(crate) fn wake_all(&self, reason: WakeReason) {
        let woken = std::mem::take(&mut self.state().waiters);
        for waiter in woken {
            waiter.fire(reason);
        }
    }
}
