//! Interfaces to the host transport carrying frames for many streams.
//!
//! The reliable byte connection underneath the stream layer is a
//! collaborator, not part of this crate. [`HostTransport`] is the narrow
//! seam the core needs: submit frame batches, track which streams ride the
//! connection, and share one aggregate back-pressure counter. The matching
//! [`MessageSink`] capability is what generic RPC code sees when it targets a
//! stream as if it were a byte sink.

use std::{
    io,
    sync::atomic::{AtomicI64, Ordering},
};

use bytes::Bytes;

use crate::{frame::Frame, registry::StreamId};

/// Shared counter of bytes produced but not yet consumed across every stream
/// of one host transport.
///
/// Mutations happen only under the owning stream's congestion lock; reads
/// that drive adaptive window sizing tolerate slight staleness.
#[derive(Debug, Default)]
pub struct UnconsumedCounter(AtomicI64);

impl UnconsumedCounter {
    /// Fresh counter at zero.
    #[must_use]
    pub const fn new() -> Self { Self(AtomicI64::new(0)) }

    /// Adjust by `delta` bytes (positive on admission, negative on feedback).
    pub fn add(&self, delta: i64) { self.0.fetch_add(delta, Ordering::Relaxed); }

    /// Current aggregate unconsumed byte count.
    #[must_use]
    pub fn get(&self) -> i64 { self.0.load(Ordering::Relaxed) }
}

/// Capability set the stream core requires from a host transport.
pub trait HostTransport: Send + Sync + 'static {
    /// Submit a batch of frames in order. Frames of one batch may be packed
    /// into a single transport write. `background` asks the transport to
    /// complete the write off the caller's task.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the connection cannot accept
    /// the batch; the caller reverses any credit it admitted.
    fn send_frames(&self, frames: Vec<Frame>, background: bool) -> io::Result<()>;

    /// Record that `id` now rides this transport.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport refuses new streams (e.g. it is
    /// shutting down).
    fn register_stream(&self, id: StreamId) -> io::Result<()>;

    /// Remove `id` from this transport's stream set.
    fn deregister_stream(&self, id: StreamId);

    /// Aggregate unconsumed-bytes counter shared by all streams here.
    fn unconsumed(&self) -> &UnconsumedCounter;
}

/// Byte-sink capability of the synthetic per-stream transport handle.
///
/// Stream-agnostic code (RPC response assembly in particular) writes to a
/// stream through this narrow surface; the stream reroutes the bytes into
/// its own segmentation path.
pub trait MessageSink {
    /// Forward `payload` into the stream's outbound segmentation path.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`](crate::error::WriteError) when the stream is
    /// unbound, the peer cannot receive, or the transport write fails. Flow
    /// control is not consulted here; admission happens before the sink.
    fn sink_write(&self, payload: Bytes) -> Result<u64, crate::error::WriteError>;

    /// Mark the handle failed, scheduling the stream for recycling.
    fn sink_fail(&self);

    /// Stream id this sink addresses.
    fn address(&self) -> StreamId;
}
