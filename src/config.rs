//! Configuration for streams and the multiplexing layer.
//!
//! [`StreamOptions`] is supplied per stream at create/accept time;
//! [`MuxTunables`] applies to every stream sharing a registry and mirrors the
//! process-wide knobs of the original deployment.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use crate::handler::StreamHandler;

/// Default cap for a single outbound frame segment: 512 MiB.
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 512 * 1024 * 1024;

/// Default number of messages delivered to the handler per batch.
pub const DEFAULT_MESSAGES_IN_BATCH: usize = 128;

/// Default send window when flow control is enabled: 2 MiB.
pub const DEFAULT_MAX_BUF_SIZE: usize = 2 * 1024 * 1024;

/// Per-stream options supplied at creation.
#[derive(Clone)]
pub struct StreamOptions {
    /// Largest send window in bytes. Zero disables flow control entirely:
    /// writes are always admitted and no FEEDBACK frames are exchanged.
    pub max_buf_size: usize,
    /// Smallest send window the adaptive sizing may shrink to. Zero means
    /// unset; shrinking halves the window instead.
    pub min_buf_size: usize,
    /// Idle period after which the handler's `on_idle_timeout` fires.
    /// `None` disables the idle timer.
    pub idle_timeout: Option<Duration>,
    /// Upper bound on messages handed to the handler in one batch.
    pub messages_in_batch: usize,
    /// Inbound message handler. Absence means this side does not receive;
    /// the peer learns this through the handshake `writable` flag.
    pub handler: Option<Arc<dyn StreamHandler>>,
}

impl Default for StreamOptions {
    fn default() -> Self { Self::new() }
}

impl StreamOptions {
    /// Options with the deployment defaults and no handler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_buf_size: DEFAULT_MAX_BUF_SIZE,
            min_buf_size: 0,
            idle_timeout: None,
            messages_in_batch: DEFAULT_MESSAGES_IN_BATCH,
            handler: None,
        }
    }

    /// Install an inbound message handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Effective batch size, defaulting when left at zero.
    #[must_use]
    pub fn batch_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.messages_in_batch)
            .or(NonZeroUsize::new(DEFAULT_MESSAGES_IN_BATCH))
            .unwrap_or(NonZeroUsize::MIN)
    }
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("max_buf_size", &self.max_buf_size)
            .field("min_buf_size", &self.min_buf_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("messages_in_batch", &self.messages_in_batch)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Options applied to a single write.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Submit the transport write without waiting for its completion.
    pub write_in_background: bool,
}

/// Process-wide tunables shared by every stream on a registry.
#[derive(Clone, Copy, Debug)]
pub struct MuxTunables {
    /// Outbound frame size cap; messages above it are segmented.
    pub write_max_segment_size: NonZeroUsize,
    /// Aggregate unconsumed-bytes threshold across all streams of one host
    /// transport. Zero disables aggregate pressure adaptation.
    pub max_streams_unconsumed_bytes: u64,
    /// Upper bound on concurrently registered streams. Zero means unlimited;
    /// at the cap the registry refuses new streams.
    pub max_streams: usize,
}

impl Default for MuxTunables {
    fn default() -> Self {
        Self {
            write_max_segment_size: NonZeroUsize::new(DEFAULT_MAX_SEGMENT_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            max_streams_unconsumed_bytes: 0,
            max_streams: 0,
        }
    }
}

impl MuxTunables {
    /// Whether aggregate pressure adaptation is active.
    #[must_use]
    pub const fn aggregate_pressure_enabled(&self) -> bool {
        self.max_streams_unconsumed_bytes > 0
    }
}
