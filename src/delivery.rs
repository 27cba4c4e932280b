//! Per-stream delivery pipeline.
//!
//! Reassembled messages are enqueued on a single-consumer queue and drained
//! by one cooperative task per stream. Each wake drains up to the configured
//! batch size and invokes the handler once per batch, so producer and
//! consumer concurrency stay isolated. The idle timeout is injected into the
//! same queue as a sentinel item, preserving ordering between received bytes
//! and the idle notification without a second lock.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use log::{debug, warn};
use tokio::{
    sync::mpsc,
    task::AbortHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::CloseReason,
    handler::ResponseParser,
    stream::Stream,
};

/// Item carried by the delivery queue.
#[derive(Debug)]
pub(crate) enum DeliveryItem {
    /// A fully reassembled message.
    Message(Bytes),
    /// Idle sentinel posted by the idle timer.
    IdleWake,
}

/// Producer side of a stream's single-consumer queue.
#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    tx: mpsc::UnboundedSender<DeliveryItem>,
    shutdown: CancellationToken,
}

impl DeliveryQueue {
    /// Create the queue, returning the producer half and the consumer's
    /// receiver.
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DeliveryItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                shutdown: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Enqueue a reassembled message.
    ///
    /// # Errors
    ///
    /// Fails once the queue has been stopped; the caller closes the stream.
    pub(crate) fn push_message(&self, message: Bytes) -> Result<(), CloseReason> {
        if self.shutdown.is_cancelled() {
            return Err(CloseReason::DeliveryRejected);
        }
        self.tx
            .send(DeliveryItem::Message(message))
            .map_err(|_| CloseReason::DeliveryRejected)
    }

    /// Stop the queue; the consumer runs its terminal actions and exits.
    /// Pending items are dropped, so a batch never spans the stop.
    pub(crate) fn stop(&self) { self.shutdown.cancel(); }

    pub(crate) fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }
}

/// Absolute idle timer posting [`DeliveryItem::IdleWake`] when it fires.
///
/// The consumer stops it on every wake and rearms it when parking again;
/// `set_connected` starts it on the server side.
#[derive(Debug)]
pub(crate) struct IdleTimer {
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<DeliveryItem>,
    armed: Mutex<Option<AbortHandle>>,
}

impl IdleTimer {
    pub(crate) fn new(timeout: Option<Duration>, queue: &DeliveryQueue) -> Self {
        Self {
            timeout,
            tx: queue.tx.clone(),
            armed: Mutex::new(None),
        }
    }

    /// Arm the timer, replacing any outstanding one.
    pub(crate) fn start(&self) {
        let Some(timeout) = self.timeout else { return };
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(DeliveryItem::IdleWake);
        });
        let previous = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancel the outstanding timer, if any.
    pub(crate) fn stop(&self) {
        if self.timeout.is_none() {
            return;
        }
        if let Some(armed) = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            armed.abort();
        }
    }
}

/// The single consumer task of one stream's delivery queue.
pub(crate) struct Consumer {
    stream: Arc<Stream>,
    rx: mpsc::UnboundedReceiver<DeliveryItem>,
    parser: Option<ResponseParser>,
    local_consumed: u64,
}

impl Consumer {
    pub(crate) fn new(
        stream: Arc<Stream>,
        rx: mpsc::UnboundedReceiver<DeliveryItem>,
        parser: Option<ResponseParser>,
    ) -> Self {
        Self {
            stream,
            rx,
            parser,
            local_consumed: 0,
        }
    }

    /// Drive the queue until it is stopped, then run the terminal actions
    /// exactly once.
    pub(crate) async fn run(mut self) {
        let shutdown = self.stream.shutdown_token();
        let batch_size = self.stream.batch_size().get();

        loop {
            let first = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.stream.idle_timer().stop();

            let mut messages = Vec::with_capacity(batch_size.min(64));
            let mut saw_idle_wake = false;
            self.accept(first, &mut messages, &mut saw_idle_wake);
            while messages.len() < batch_size {
                match self.rx.try_recv() {
                    Ok(item) => self.accept(item, &mut messages, &mut saw_idle_wake),
                    Err(_) => break,
                }
            }

            self.dispatch(messages, saw_idle_wake).await;
            self.stream.idle_timer().start();
        }

        self.finish().await;
    }

    fn accept(&mut self, item: DeliveryItem, messages: &mut Vec<Bytes>, saw_idle_wake: &mut bool) {
        match item {
            DeliveryItem::IdleWake => *saw_idle_wake = true,
            DeliveryItem::Message(message) => {
                if let Some(parser) = self.parser.take() {
                    let id = self.stream.id();
                    debug!("stream {id}: handing first message to the rpc response parser");
                    if let Err(err) = parser(id, message) {
                        warn!("stream {id}: {err}");
                        self.stream.close(
                            crate::error::ErrorCode::Protocol,
                            CloseReason::MalformedResponse,
                        );
                    }
                } else {
                    messages.push(message);
                }
            }
        }
    }

    async fn dispatch(&mut self, messages: Vec<Bytes>, saw_idle_wake: bool) {
        let id = self.stream.id();
        let total: u64 = messages.iter().map(|m| m.len() as u64).sum();

        if let Some(handler) = self.stream.handler() {
            // The idle notification fires only when the stream is truly
            // idle; a sentinel mixed into a batch with payload bytes is
            // discarded.
            if saw_idle_wake && total == 0 {
                handler.on_idle_timeout(id).await;
            }
            if !messages.is_empty() {
                handler.on_received_messages(id, &messages).await;
            }
        }

        if total > 0 {
            self.local_consumed += total;
            if self.stream.peer_needs_feedback() {
                self.stream.send_feedback(self.local_consumed);
            }
        }
    }

    /// Terminal actions: release the host transport, report the latched
    /// failure, then the closure, then drop the stream reference.
    async fn finish(self) {
        let id = self.stream.id();
        self.stream.idle_timer().stop();
        self.stream.release_host();
        if let Some(handler) = self.stream.handler() {
            let (code, reason) = self.stream.latched_error();
            if code.is_failure() {
                handler.on_failed(id, code, &reason).await;
            }
            handler.on_closed(id).await;
        }
        debug!("stream {id}: delivery queue drained and stopped");
    }
}
