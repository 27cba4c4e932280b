//! Outbound segmentation and inbound reassembly of logical messages.
//!
//! A logical message is a maximal run of DATA frames ending with
//! `has_continuation = false`. [`Segmenter`] cuts oversized payloads into
//! window-friendly segments and concatenates consecutive small payloads into
//! a single transport write while keeping each one a distinct frame.
//! [`ReassemblyBuffer`] is its inbound mirror: at most one continuation run
//! is in flight per stream, and the buffer is empty whenever the previous
//! frame ended a message.

use std::num::NonZeroUsize;

use bytes::{Bytes, BytesMut};

use crate::{frame::Frame, registry::StreamId};

/// Splits write payloads into batches of DATA frames.
///
/// Each returned batch is one transport write; frames inside a batch are
/// packed together on the wire.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Segmenter {
    max_segment_size: NonZeroUsize,
}

impl Segmenter {
    pub(crate) const fn new(max_segment_size: NonZeroUsize) -> Self {
        Self { max_segment_size }
    }

    /// Segment `payloads` into transport write batches addressed to `dest`.
    ///
    /// Byte order is preserved within each payload and across payloads of one
    /// call. Payloads at or under the segment cap become single frames and
    /// coalesce into shared batches; larger payloads are cut into cap-sized
    /// segments, every one but the last marked as a continuation, each
    /// flushed as its own batch.
    pub(crate) fn segment(
        &self,
        dest: StreamId,
        source: StreamId,
        payloads: impl IntoIterator<Item = Bytes>,
    ) -> Vec<Vec<Frame>> {
        let max = self.max_segment_size.get();
        let mut batches = Vec::new();
        let mut pending: Vec<Frame> = Vec::new();
        let mut pending_bytes = 0usize;

        for payload in payloads {
            if payload.len() > max {
                if !pending.is_empty() {
                    batches.push(std::mem::take(&mut pending));
                    pending_bytes = 0;
                }
                let mut rest = payload;
                while !rest.is_empty() {
                    let segment = rest.split_to(rest.len().min(max));
                    let has_continuation = !rest.is_empty();
                    batches.push(vec![Frame::data(dest, source, segment, has_continuation)]);
                }
            } else {
                if pending_bytes + payload.len() > max && !pending.is_empty() {
                    batches.push(std::mem::take(&mut pending));
                    pending_bytes = 0;
                }
                pending_bytes += payload.len();
                pending.push(Frame::data(dest, source, payload, false));
            }
        }

        if !pending.is_empty() {
            batches.push(pending);
        }
        batches
    }
}

/// Accumulates the continuation run currently in flight.
#[derive(Debug, Default)]
pub(crate) struct ReassemblyBuffer {
    pending: Option<BytesMut>,
}

impl ReassemblyBuffer {
    /// Absorb one DATA frame payload.
    ///
    /// Returns the complete message when `has_continuation` is false. A
    /// single-frame message passes through without copying.
    pub(crate) fn push(&mut self, payload: Bytes, has_continuation: bool) -> Option<Bytes> {
        match self.pending.take() {
            None if !has_continuation => Some(payload),
            None => {
                self.pending = Some(BytesMut::from(payload.as_ref()));
                None
            }
            Some(mut buffer) => {
                buffer.extend_from_slice(&payload);
                if has_continuation {
                    self.pending = Some(buffer);
                    None
                } else {
                    Some(buffer.freeze())
                }
            }
        }
    }

    /// Whether a continuation run is currently buffered.
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> bool { self.pending.is_some() }
}
