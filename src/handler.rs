//! User-facing callbacks invoked by the delivery pipeline.
//!
//! A [`StreamHandler`] receives batched, in-order messages plus the lifecycle
//! notifications of its stream. All methods run on the stream's single
//! consumer task, so implementations never observe two callbacks of the same
//! stream concurrently.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::{CloseReason, ErrorCode, ResponseParseError},
    registry::StreamId,
};

/// Inbound message and lifecycle callbacks for one stream.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// A batch of fully reassembled messages, in write order.
    async fn on_received_messages(&self, id: StreamId, messages: &[Bytes]);

    /// The stream saw no traffic for its configured idle timeout.
    async fn on_idle_timeout(&self, id: StreamId);

    /// The stream closed abnormally. Fires at most once, before `on_closed`.
    async fn on_failed(&self, id: StreamId, code: ErrorCode, reason: &CloseReason);

    /// The stream closed; always the final callback.
    async fn on_closed(&self, id: StreamId);
}

/// One-shot callback fired when a stream finishes connecting.
///
/// Receives `Ok(())` on success or the latched [`ErrorCode`] when the stream
/// closed before connecting.
pub type ConnectCallback = Box<dyn FnOnce(StreamId, Result<(), ErrorCode>) + Send + 'static>;

/// One-shot callback fired when a parked writer resolves.
pub type WritableCallback =
    Box<dyn FnOnce(StreamId, Result<(), crate::error::WaitError>) + Send + 'static>;

/// One-shot parser for the initial RPC response on a client stream.
///
/// The delivery pipeline hands the first inbound message here instead of the
/// handler; a parse failure closes the stream with a protocol error.
pub type ResponseParser =
    Box<dyn FnOnce(StreamId, Bytes) -> Result<(), ResponseParseError> + Send + 'static>;
