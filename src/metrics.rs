//! Metric helpers for the stream layer.
//!
//! Thin wrappers over the [`metrics`](https://docs.rs/metrics) crate. Every
//! function becomes a no-op when the optional `metrics` Cargo feature is
//! disabled, so instrumentation never costs anything by default.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live streams.
pub const STREAMS_ACTIVE: &str = "streamux_streams_active";
/// Name of the counter tracking processed frames by direction.
pub const FRAMES_PROCESSED: &str = "streamux_frames_processed_total";
/// Name of the counter tracking stream failures.
pub const STREAM_FAILURES: &str = "streamux_stream_failures_total";

/// Direction of frame processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Frames received from the host transport.
    Inbound,
    /// Frames submitted to the host transport.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the live-streams gauge.
#[cfg(feature = "metrics")]
pub fn inc_streams() { gauge!(STREAMS_ACTIVE).increment(1.0); }

#[cfg(not(feature = "metrics"))]
pub fn inc_streams() {}

/// Decrement the live-streams gauge.
#[cfg(feature = "metrics")]
pub fn dec_streams() { gauge!(STREAMS_ACTIVE).decrement(1.0); }

#[cfg(not(feature = "metrics"))]
pub fn dec_streams() {}

/// Record `count` processed frames for the given direction.
#[cfg(feature = "metrics")]
pub fn add_frames(direction: Direction, count: usize) {
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(count as u64);
}

#[cfg(not(feature = "metrics"))]
pub fn add_frames(_direction: Direction, _count: usize) {}

/// Record an abnormal stream closure.
#[cfg(feature = "metrics")]
pub fn inc_failures() { counter!(STREAM_FAILURES).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_failures() {}
