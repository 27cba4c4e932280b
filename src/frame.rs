//! On-wire frame primitives for the stream layer.
//!
//! A [`Frame`] is the unit carried over the host transport: a compact
//! [`FrameHeader`] naming source and destination streams plus an optional
//! opaque payload. The header stays serializer-agnostic; the envelope codec
//! in [`codec`](crate::codec) packs it onto the wire.

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::registry::StreamId;

/// Kind of a stream frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum FrameType {
    /// Carries a payload segment of a logical message.
    Data,
    /// Reports the receiver's absolute consumed byte count.
    Feedback,
    /// Aborts the destination stream.
    Rst,
    /// Closes the destination stream gracefully.
    Close,
    /// Reserved; receivers report a protocol error.
    Unknown,
}

/// Feedback body carried by [`FrameType::Feedback`] frames.
///
/// The count is absolute rather than a delta so replayed or reordered
/// feedback is idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Feedback {
    consumed_size: u64,
}

impl Feedback {
    /// Wrap an absolute consumed byte count.
    #[must_use]
    pub const fn new(consumed_size: u64) -> Self { Self { consumed_size } }

    /// Absolute number of bytes the receiver has delivered to its handler.
    #[must_use]
    pub const fn consumed_size(self) -> u64 { self.consumed_size }
}

/// Metadata header present on every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct FrameHeader {
    stream_id: StreamId,
    source_stream_id: StreamId,
    frame_type: FrameType,
    has_continuation: bool,
    feedback: Option<Feedback>,
}

impl FrameHeader {
    /// Destination stream id (assigned by the peer).
    #[must_use]
    pub const fn stream_id(&self) -> StreamId { self.stream_id }

    /// Originating stream id.
    #[must_use]
    pub const fn source_stream_id(&self) -> StreamId { self.source_stream_id }

    /// Frame kind.
    #[must_use]
    pub const fn frame_type(&self) -> FrameType { self.frame_type }

    /// Whether more segments of the same logical message follow.
    ///
    /// Meaningful only on [`FrameType::Data`] frames.
    #[must_use]
    pub const fn has_continuation(&self) -> bool { self.has_continuation }

    /// Feedback body, present only on [`FrameType::Feedback`] frames.
    #[must_use]
    pub const fn feedback(&self) -> Option<Feedback> { self.feedback }
}

/// A frame ready to be packed onto the host transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Build a DATA frame carrying one segment of a logical message.
    #[must_use]
    pub fn data(dest: StreamId, source: StreamId, payload: Bytes, has_continuation: bool) -> Self {
        Self {
            header: FrameHeader {
                stream_id: dest,
                source_stream_id: source,
                frame_type: FrameType::Data,
                has_continuation,
                feedback: None,
            },
            payload,
        }
    }

    /// Build a FEEDBACK frame reporting `consumed_size` bytes delivered.
    #[must_use]
    pub fn feedback(dest: StreamId, source: StreamId, consumed_size: u64) -> Self {
        Self {
            header: FrameHeader {
                stream_id: dest,
                source_stream_id: source,
                frame_type: FrameType::Feedback,
                has_continuation: false,
                feedback: Some(Feedback::new(consumed_size)),
            },
            payload: Bytes::new(),
        }
    }

    /// Build an RST frame aborting the destination stream.
    #[must_use]
    pub fn rst(dest: StreamId, source: StreamId) -> Self {
        Self::control(dest, source, FrameType::Rst)
    }

    /// Build a CLOSE frame ending the destination stream gracefully.
    #[must_use]
    pub fn close(dest: StreamId, source: StreamId) -> Self {
        Self::control(dest, source, FrameType::Close)
    }

    fn control(dest: StreamId, source: StreamId, frame_type: FrameType) -> Self {
        Self {
            header: FrameHeader {
                stream_id: dest,
                source_stream_id: source,
                frame_type,
                has_continuation: false,
                feedback: None,
            },
            payload: Bytes::new(),
        }
    }

    /// Assemble a frame from decoded parts.
    #[must_use]
    pub const fn from_parts(header: FrameHeader, payload: Bytes) -> Self { Self { header, payload } }

    /// Testing helper producing a frame with the reserved type, as a
    /// misbehaving peer would put on the wire.
    #[doc(hidden)]
    #[must_use]
    pub fn unknown_for_tests(dest: StreamId, source: StreamId) -> Self {
        Self::control(dest, source, FrameType::Unknown)
    }

    /// Frame header.
    #[must_use]
    pub const fn header(&self) -> &FrameHeader { &self.header }

    /// Payload bytes; empty on control frames.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize { self.payload.len() }

    /// Consume the frame, returning its components.
    #[must_use]
    pub fn into_parts(self) -> (FrameHeader, Bytes) { (self.header, self.payload) }
}
