#![cfg(any(test, feature = "test-helpers"))]
//! Test-only collaborators: a recording host transport and stream handler.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::{
    error::{CloseReason, ErrorCode},
    frame::{Frame, FrameType},
    handler::StreamHandler,
    registry::StreamId,
    transport::{HostTransport, UnconsumedCounter},
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host transport double recording every submitted batch.
#[derive(Default)]
pub struct MockTransport {
    batches: Mutex<Vec<Vec<Frame>>>,
    backgrounds: Mutex<Vec<bool>>,
    registered: Mutex<Vec<StreamId>>,
    deregistered: Mutex<Vec<StreamId>>,
    unconsumed: UnconsumedCounter,
    fail_writes: AtomicBool,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Coerce to the trait object the dispatch path expects.
    #[must_use]
    pub fn as_host(self: &Arc<Self>) -> Arc<dyn HostTransport> {
        Arc::clone(self) as Arc<dyn HostTransport>
    }

    /// Make subsequent writes fail with `BrokenPipe`.
    pub fn set_fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    /// Every batch submitted so far, in order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<Frame>> { lock(&self.batches).clone() }

    /// Every frame submitted so far, flattened in order.
    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }

    /// Frames of one type, in order.
    #[must_use]
    pub fn frames_of_type(&self, frame_type: FrameType) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|f| f.header().frame_type() == frame_type)
            .collect()
    }

    /// Consumed count of the most recent FEEDBACK frame.
    #[must_use]
    pub fn last_feedback(&self) -> Option<u64> {
        self.frames_of_type(FrameType::Feedback)
            .last()
            .and_then(|f| f.header().feedback())
            .map(crate::frame::Feedback::consumed_size)
    }

    /// Stream ids that bound themselves to this transport.
    #[must_use]
    pub fn registered(&self) -> Vec<StreamId> { lock(&self.registered).clone() }

    /// Stream ids removed during recycling.
    #[must_use]
    pub fn deregistered(&self) -> Vec<StreamId> { lock(&self.deregistered).clone() }

    /// Background flag of each submitted batch, in order.
    #[must_use]
    pub fn backgrounds(&self) -> Vec<bool> { lock(&self.backgrounds).clone() }

    /// Forget all recorded batches.
    pub fn clear(&self) {
        lock(&self.batches).clear();
        lock(&self.backgrounds).clear();
    }
}

impl HostTransport for MockTransport {
    fn send_frames(&self, frames: Vec<Frame>, background: bool) -> std::io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock transport write failure",
            ));
        }
        lock(&self.batches).push(frames);
        lock(&self.backgrounds).push(background);
        Ok(())
    }

    fn register_stream(&self, id: StreamId) -> std::io::Result<()> {
        lock(&self.registered).push(id);
        Ok(())
    }

    fn deregister_stream(&self, id: StreamId) { lock(&self.deregistered).push(id); }

    fn unconsumed(&self) -> &UnconsumedCounter { &self.unconsumed }
}

/// One observable callback on a [`RecordingHandler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerEvent {
    /// A delivered batch of messages.
    Messages(Vec<Bytes>),
    /// The idle timeout fired.
    IdleTimeout,
    /// The stream failed before closing.
    Failed(ErrorCode, CloseReason),
    /// The stream closed.
    Closed,
}

/// Stream handler double recording every callback in order.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
    notify: Notify,
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Snapshot of the callbacks observed so far.
    #[must_use]
    pub fn events(&self) -> Vec<HandlerEvent> { lock(&self.events).clone() }

    /// All delivered payloads, flattened across batches.
    #[must_use]
    pub fn received(&self) -> Vec<Bytes> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HandlerEvent::Messages(batch) => Some(batch),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Park until the recorded events satisfy `predicate`.
    pub async fn wait_until(&self, predicate: impl Fn(&[HandlerEvent]) -> bool) {
        loop {
            let notified = self.notify.notified();
            if predicate(&self.events()) {
                return;
            }
            notified.await;
        }
    }

    /// Park until the stream reports `on_closed`.
    pub async fn wait_closed(&self) {
        self.wait_until(|events| events.contains(&HandlerEvent::Closed))
            .await;
    }

    fn push(&self, event: HandlerEvent) {
        lock(&self.events).push(event);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl StreamHandler for RecordingHandler {
    async fn on_received_messages(&self, _id: StreamId, messages: &[Bytes]) {
        self.push(HandlerEvent::Messages(messages.to_vec()));
    }

    async fn on_idle_timeout(&self, _id: StreamId) { self.push(HandlerEvent::IdleTimeout); }

    async fn on_failed(&self, _id: StreamId, code: ErrorCode, reason: &CloseReason) {
        self.push(HandlerEvent::Failed(code, reason.clone()));
    }

    async fn on_closed(&self, _id: StreamId) { self.push(HandlerEvent::Closed); }
}
