#![doc(html_root_url = "https://docs.rs/streamux/latest")]
//! Public API for the `streamux` library.
//!
//! This crate multiplexes ordered, bidirectional message streams over one
//! host transport: per-stream framing and reassembly of arbitrarily large
//! messages, credit-based flow control with adaptive window sizing, and a
//! cooperative per-stream delivery pipeline that batches in-order messages
//! to a user handler. The underlying byte connection, the RPC machinery that
//! performs the initial handshake, and the wire envelope are collaborators
//! reached through narrow traits.

pub mod api;
pub mod codec;
pub mod config;
mod delivery;
pub mod error;
mod flow;
pub mod frame;
pub mod handler;
pub mod metrics;
pub mod registry;
mod segment;
pub mod settings;
pub mod stream;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;
pub mod transport;
mod waiter;

pub use api::{
    StreamController,
    fail_streams,
    stream_accept,
    stream_accept_one,
    stream_close,
    stream_connect,
    stream_create,
    stream_set_connected,
    stream_wait,
    stream_wait_with,
    stream_write,
};
pub use config::{MuxTunables, StreamOptions, WriteOptions};
pub use error::{
    CloseReason,
    ConnectError,
    CreateError,
    DispatchError,
    ErrorCode,
    ResponseParseError,
    WaitError,
    WriteError,
};
pub use frame::{Feedback, Frame, FrameHeader, FrameType};
pub use handler::{ConnectCallback, ResponseParser, StreamHandler, WritableCallback};
pub use registry::{StreamId, StreamRegistry};
pub use settings::StreamSettings;
pub use stream::Stream;
pub use transport::{HostTransport, MessageSink, UnconsumedCounter};
