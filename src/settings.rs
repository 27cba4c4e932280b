//! Handshake settings exchanged when a stream is established.
//!
//! Each side advertises its local stream id, whether it expects FEEDBACK
//! frames, and whether it installed a handler. The settings ride on the
//! creating RPC; several streams may share one handshake via
//! `extra_stream_ids`.

use bincode::{Decode, Encode};

use crate::registry::StreamId;

/// Settings advertised by one side of a stream handshake.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct StreamSettings {
    stream_id: StreamId,
    need_feedback: bool,
    writable: bool,
    extra_stream_ids: Vec<StreamId>,
}

impl StreamSettings {
    /// Advertise a single stream.
    #[must_use]
    pub const fn new(stream_id: StreamId, need_feedback: bool, writable: bool) -> Self {
        Self {
            stream_id,
            need_feedback,
            writable,
            extra_stream_ids: Vec::new(),
        }
    }

    /// Advertise a leading stream plus extra streams multiplexed over the
    /// same handshake.
    #[must_use]
    pub fn with_extra_streams(mut self, extra: Vec<StreamId>) -> Self {
        self.extra_stream_ids = extra;
        self
    }

    /// Local id of the advertising side.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId { self.stream_id }

    /// True iff the advertising side runs flow control and expects FEEDBACK.
    #[must_use]
    pub const fn need_feedback(&self) -> bool { self.need_feedback }

    /// True iff the advertising side installed a handler and can receive.
    #[must_use]
    pub const fn writable(&self) -> bool { self.writable }

    /// Additional stream ids multiplexed over this handshake.
    #[must_use]
    pub fn extra_stream_ids(&self) -> &[StreamId] { &self.extra_stream_ids }

    /// Copy these settings for one of the extra streams: the advertised id is
    /// replaced and the extra list cleared, so only the leading stream carries
    /// the multiplexing information.
    #[must_use]
    pub fn for_extra_stream(&self, stream_id: StreamId) -> Self {
        Self {
            stream_id,
            need_feedback: self.need_feedback,
            writable: self.writable,
            extra_stream_ids: Vec::new(),
        }
    }
}
