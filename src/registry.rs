//! Registry of live streams keyed by process-local id.
//!
//! The registry is the transport layer's object table: ids are allocated
//! monotonically, frames are routed to streams by destination id, and a
//! stream disappears from the table when it is recycled. Entries hold the
//! only long-lived strong references besides the consumer task's.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bincode::{Decode, Encode};
use dashmap::DashMap;
use derive_more::{Display, From, Into};
use log::warn;

use crate::{
    config::{MuxTunables, StreamOptions},
    error::{CreateError, DispatchError},
    frame::Frame,
    handler::ResponseParser,
    settings::StreamSettings,
    stream::Stream,
    transport::HostTransport,
};

/// Process-local identifier of a stream.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Display, From, Into,
)]
#[display("{_0}")]
pub struct StreamId(u64);

impl StreamId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(value: u64) -> Self { Self(value) }

    /// Return the inner numeric identifier.
    #[must_use]
    pub const fn get(self) -> u64 { self.0 }
}

/// Table of live streams sharing one set of tunables.
pub struct StreamRegistry {
    tunables: MuxTunables,
    next_id: AtomicU64,
    streams: DashMap<StreamId, Arc<Stream>>,
}

impl StreamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(tunables: MuxTunables) -> Arc<Self> {
        Arc::new(Self {
            tunables,
            next_id: AtomicU64::new(1),
            streams: DashMap::new(),
        })
    }

    /// Tunables shared by every stream in this registry.
    #[must_use]
    pub fn tunables(&self) -> &MuxTunables { &self.tunables }

    /// Allocate a new stream, start its delivery queue, and register it.
    ///
    /// Must be called inside a tokio runtime; the stream's consumer task is
    /// spawned immediately.
    ///
    /// # Errors
    ///
    /// [`CreateError::RegistryFull`] once the configured `max_streams` cap
    /// is reached; no resources are acquired in that case.
    pub fn create(
        self: &Arc<Self>,
        options: StreamOptions,
        remote_settings: Option<StreamSettings>,
        parser: Option<ResponseParser>,
    ) -> Result<StreamId, CreateError> {
        let limit = self.tunables.max_streams;
        if limit > 0 && self.streams.len() >= limit {
            warn!("stream registry is at capacity ({limit} streams)");
            return Err(CreateError::RegistryFull { limit });
        }
        let id = StreamId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let stream = Stream::create(id, self, options, remote_settings, parser);
        self.streams.insert(id, stream);
        Ok(id)
    }

    /// Route a decoded frame to its destination stream.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownStream`] when no stream is registered under
    /// the frame's destination id, [`DispatchError::UnknownFrameType`] when
    /// the stream rejects the frame. Both are reportable and non-fatal to
    /// the transport.
    pub fn dispatch(
        &self,
        frame: Frame,
        host: &Arc<dyn HostTransport>,
    ) -> Result<(), DispatchError> {
        let id = frame.header().stream_id();
        let stream = self
            .get(id)
            .ok_or(DispatchError::UnknownStream(id))?;
        stream.on_received(frame, host)
    }

    /// Look up a live stream.
    pub(crate) fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a stream from the table during recycling.
    pub(crate) fn remove(&self, id: StreamId) { self.streams.remove(&id); }

    /// Whether `id` refers to a live stream.
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool { self.streams.contains_key(&id) }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize { self.streams.len() }

    /// True when no streams are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.streams.is_empty() }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.streams.len())
            .field("tunables", &self.tunables)
            .finish()
    }
}
