//! Error taxonomy for the stream layer.
//!
//! Each public operation reports failures through its own small enum so
//! callers can match on exactly the outcomes that operation produces. The
//! coarser [`ErrorCode`] mirrors the taxonomy reported to stream handlers,
//! and [`CloseReason`] replaces free-form reason strings with a structured
//! value formatted only at the API boundary.

use thiserror::Error;

use crate::registry::StreamId;

/// Coarse error kind latched when a stream closes and reported to
/// [`StreamHandler::on_failed`](crate::handler::StreamHandler::on_failed).
///
/// `Graceful` corresponds to a zero error code: the stream ended cleanly and
/// only `on_closed` fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorCode {
    /// Clean shutdown; not a failure.
    #[default]
    Graceful,
    /// The peer reset the stream or the local side aborted it.
    ConnectionReset,
    /// A waiter deadline elapsed.
    TimedOut,
    /// The stream id is unknown or the call was malformed.
    InvalidArgument,
    /// The stream is not bound or the peer cannot receive.
    BadHandle,
    /// The initial RPC response could not be parsed.
    Protocol,
    /// The delivery queue rejected a message.
    Internal,
}

impl ErrorCode {
    /// Whether this code represents a failure (non-zero in errno terms).
    #[must_use]
    pub const fn is_failure(self) -> bool { !matches!(self, Self::Graceful) }
}

/// Structured reason attached to a stream closure.
///
/// Variants carry their own context so batch-failure paths can give every
/// stream a distinct, deterministic reason.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CloseReason {
    /// An RST frame arrived from the peer.
    #[error("received RST frame")]
    RemoteReset,
    /// A CLOSE frame arrived from the peer.
    #[error("received CLOSE frame")]
    RemoteClose,
    /// The local side closed the stream via `stream_close`.
    #[error("local close")]
    LocalClose,
    /// The delivery queue refused a reassembled message.
    #[error("failed to enqueue message for delivery")]
    DeliveryRejected,
    /// The first inbound message on a client stream was not a valid RPC
    /// response.
    #[error("failed to parse rpc response message")]
    MalformedResponse,
    /// Stream creation failed partway through a multi-stream request.
    #[error("failed to create stream at index {index}")]
    CreateFailed {
        /// Position of the stream that could not be created.
        index: usize,
    },
    /// Stream acceptance failed partway through a multi-stream handshake.
    #[error("failed to accept stream at index {index}")]
    AcceptFailed {
        /// Position of the stream that could not be accepted.
        index: usize,
    },
    /// A caller-supplied reason with free-form context.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by [`stream_write`](crate::api::stream_write).
#[derive(Debug, Error)]
pub enum WriteError {
    /// The send window has no credit left; wait for writability and retry.
    #[error("stream is full, wait for the peer to consume")]
    Full,
    /// No stream is registered under the given id.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    /// The stream has not completed its handshake yet.
    #[error("stream is not bound to a host transport")]
    NotConnected,
    /// The peer advertised no handler, so it cannot receive data.
    #[error("remote side of stream {local}->{remote} has no handler")]
    PeerNotWritable {
        /// Local id of the writing stream.
        local: StreamId,
        /// Peer-advertised id of the receiving stream.
        remote: StreamId,
    },
    /// The host transport rejected the write.
    #[error("transport write failed: {0}")]
    Transport(#[from] std::io::Error),
}

/// Errors resolving a parked writer.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline elapsed before credit became available.
    #[error("wait timed out before the stream became writable")]
    TimedOut,
    /// The stream was reset or closed while waiting.
    #[error("stream was reset while waiting")]
    Reset,
    /// No stream is registered under the given id.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
}

/// Errors creating or accepting streams.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The controller already carries request streams.
    #[error("request streams were already created on this controller")]
    AlreadyCreated,
    /// The controller already carries response streams.
    #[error("response streams were already accepted on this controller")]
    AlreadyAccepted,
    /// `stream_accept` was called but the request carried no stream settings.
    #[error("no stream attached to this request")]
    NoRemoteStream,
    /// `count` must be at least one.
    #[error("stream count must be at least 1")]
    ZeroStreams,
    /// The single-stream accept was used for a multi-stream handshake.
    #[error("handshake carries multiple streams; use stream_accept")]
    ExpectedSingleStream,
    /// The registry is at its configured stream cap.
    #[error("stream registry is at capacity ({limit} streams)")]
    RegistryFull {
        /// The configured `max_streams` limit.
        limit: usize,
    },
}

/// Errors registering a connect callback.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// `connect` is a one-shot registration and was already called.
    #[error("a connect callback was already registered")]
    AlreadyRegistered,
    /// No stream is registered under the given id.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
}

/// Protocol violations surfaced to the transport's frame dispatcher.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The frame targets a stream id with no registered stream.
    #[error("no stream registered under id {0}")]
    UnknownStream(StreamId),
    /// The frame type is not part of the protocol.
    #[error("unknown frame type on stream {0}")]
    UnknownFrameType(StreamId),
}

/// Failure parsing the initial RPC response on a client stream.
#[derive(Debug, Error)]
#[error("malformed rpc response: {detail}")]
pub struct ResponseParseError {
    detail: String,
}

impl ResponseParseError {
    /// Create a parse error with human-readable context.
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}
