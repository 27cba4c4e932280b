//! Envelope codec packing stream frames into transport messages.
//!
//! The stream core treats the wire format as a collaborator: anything able to
//! move [`Frame`]s between endpoints will do. This module supplies the
//! default envelope, composing `tokio_util`'s length-delimited framing with a
//! `bincode`-encoded [`FrameHeader`]:
//!
//! ```text
//! [u32 envelope length][u16 header length][header bytes][payload bytes]
//! ```

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::frame::{Frame, FrameHeader};

/// Size of the header-length prefix inside the envelope.
const HEADER_LEN_SIZE: usize = 2;

/// Upper bound for a single envelope (header plus payload segment).
///
/// Segmentation caps payload segments well below this in practice; the codec
/// guard exists so a corrupt length prefix cannot trigger an unbounded
/// allocation.
pub const MAX_ENVELOPE_LENGTH: usize = 520 * 1024 * 1024;

fn bincode_config() -> bincode::config::Configuration { bincode::config::standard() }

fn invalid_data(context: &str, err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{context}: {err}"))
}

/// Codec translating between [`Frame`]s and length-delimited envelopes.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    /// Construct a codec with the default envelope cap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_ENVELOPE_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self { Self::new() }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (header, payload) = item.into_parts();
        let header_bytes = bincode::encode_to_vec(header, bincode_config())
            .map_err(|e| invalid_data("failed to encode frame header", e))?;
        let header_len = u16::try_from(header_bytes.len())
            .map_err(|_| invalid_data("frame header too large", header_bytes.len()))?;

        let mut envelope = BytesMut::with_capacity(HEADER_LEN_SIZE + header_bytes.len() + payload.len());
        envelope.put_u16(header_len);
        envelope.extend_from_slice(&header_bytes);
        envelope.extend_from_slice(&payload);
        self.inner.encode(envelope.freeze(), dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut envelope) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if envelope.len() < HEADER_LEN_SIZE {
            return Err(invalid_data("truncated envelope", envelope.len()));
        }
        let header_len = usize::from(envelope.get_u16());
        if envelope.len() < header_len {
            return Err(invalid_data("truncated frame header", header_len));
        }
        let header_bytes = envelope.split_to(header_len);
        let (header, consumed): (FrameHeader, usize) =
            bincode::decode_from_slice(&header_bytes, bincode_config())
                .map_err(|e| invalid_data("failed to decode frame header", e))?;
        if consumed != header_len {
            return Err(invalid_data("trailing bytes after frame header", header_len - consumed));
        }
        let payload: Bytes = envelope.freeze();
        Ok(Some(Frame::from_parts(header, payload)))
    }
}
