//! The stream object: per-stream state and the write/wait/close surface.
//!
//! A stream moves through `Pending -> Connected -> Closed` (or straight to
//! `Closed`); back-transitions are forbidden. Two locks guard its state: the
//! connect mutex covers the phase, latched error, and pending connect
//! callback; the congestion mutex (inside [`FlowController`]) covers the
//! credit counters and wait list. The two are never held together, and
//! neither is held across a transport write.

use std::sync::{
    Arc, Mutex, OnceLock, PoisonError, Weak,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{MuxTunables, StreamOptions, WriteOptions},
    delivery::{Consumer, DeliveryQueue, IdleTimer},
    error::{CloseReason, ConnectError, DispatchError, ErrorCode, WaitError, WriteError},
    flow::{Admission, FlowController},
    frame::{Frame, FrameType},
    handler::{ConnectCallback, ResponseParser, StreamHandler, WritableCallback},
    metrics,
    registry::{StreamId, StreamRegistry},
    segment::{ReassemblyBuffer, Segmenter},
    settings::StreamSettings,
    transport::{HostTransport, MessageSink},
    waiter::{WakeReason, WakeToken},
};

/// Connection phase of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Pending,
    Connected,
    Closed,
}

struct ConnectState {
    phase: Phase,
    ever_connected: bool,
    code: ErrorCode,
    reason: Option<CloseReason>,
    on_connect: Option<ConnectCallback>,
    connect_registered: bool,
}

/// An ordered, bidirectional message channel multiplexed on one host
/// transport.
pub struct Stream {
    id: StreamId,
    registry: Weak<StreamRegistry>,
    options: StreamOptions,
    tunables: MuxTunables,
    connect: Mutex<ConnectState>,
    flow: FlowController,
    segmenter: Segmenter,
    remote: OnceLock<StreamSettings>,
    reassembly: Mutex<ReassemblyBuffer>,
    queue: DeliveryQueue,
    idle: IdleTimer,
    host: Mutex<Option<Arc<dyn HostTransport>>>,
    host_bound: AtomicBool,
    recycled: AtomicBool,
}

impl Stream {
    /// Allocate a stream, start its delivery queue, and return it.
    ///
    /// `remote_settings` are merged immediately on the accepting side;
    /// `parser` marks a client stream whose first inbound message is the RPC
    /// response. Must run inside a tokio runtime: the consumer task is
    /// spawned here.
    pub(crate) fn create(
        id: StreamId,
        registry: &Arc<StreamRegistry>,
        options: StreamOptions,
        remote_settings: Option<StreamSettings>,
        parser: Option<ResponseParser>,
    ) -> Arc<Self> {
        let tunables = *registry.tunables();
        let (queue, rx) = DeliveryQueue::new();
        let idle = IdleTimer::new(options.idle_timeout, &queue);
        let flow = FlowController::new(id, &options, &tunables);
        let remote = OnceLock::new();
        if let Some(settings) = remote_settings {
            let _ = remote.set(settings);
        }

        let stream = Arc::new(Self {
            id,
            registry: Arc::downgrade(registry),
            segmenter: Segmenter::new(tunables.write_max_segment_size),
            options,
            tunables,
            connect: Mutex::new(ConnectState {
                phase: Phase::Pending,
                ever_connected: false,
                code: ErrorCode::Graceful,
                reason: None,
                on_connect: None,
                connect_registered: false,
            }),
            flow,
            remote,
            reassembly: Mutex::new(ReassemblyBuffer::default()),
            queue,
            idle,
            host: Mutex::new(None),
            host_bound: AtomicBool::new(false),
            recycled: AtomicBool::new(false),
        });

        tokio::spawn(Consumer::new(Arc::clone(&stream), rx, parser).run());
        metrics::inc_streams();
        stream
    }

    /// Process-local identifier of this stream.
    #[must_use]
    pub fn id(&self) -> StreamId { self.id }

    /// Local handshake settings to advertise on the creating RPC.
    #[must_use]
    pub fn fill_settings(&self) -> StreamSettings {
        StreamSettings::new(
            self.id,
            self.flow.need_feedback(),
            self.options.handler.is_some(),
        )
    }

    fn connect_state(&self) -> std::sync::MutexGuard<'_, ConnectState> {
        self.connect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host(&self) -> Option<Arc<dyn HostTransport>> {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register the one-shot connect callback.
    ///
    /// Dispatched on a fresh task once the stream reaches `Connected`
    /// (success) or `Closed` (failure). If the stream already settled, the
    /// callback fires immediately, still on a fresh task.
    pub fn connect(&self, on_connect: ConnectCallback) -> Result<(), ConnectError> {
        let id = self.id;
        let mut state = self.connect_state();
        if state.connect_registered {
            warn!("stream {id}: connect is supposed to be called once");
            return Err(ConnectError::AlreadyRegistered);
        }
        state.connect_registered = true;
        match state.phase {
            Phase::Pending => {
                state.on_connect = Some(on_connect);
            }
            Phase::Connected => {
                drop(state);
                tokio::spawn(async move { on_connect(id, Ok(())) });
            }
            Phase::Closed => {
                drop(state);
                tokio::spawn(async move { on_connect(id, Err(ErrorCode::ConnectionReset)) });
            }
        }
        Ok(())
    }

    /// Transition to `Connected` after the handshake RPC completes.
    ///
    /// Remote settings are merged exactly once: the accepting side merged
    /// them at creation and passes `None` here, the client side receives
    /// them from the RPC response. The accepting side also starts the idle
    /// timer now; client streams arm it after the first consumed batch.
    pub fn set_connected(&self, remote_settings: Option<StreamSettings>) {
        let id = self.id;
        let fired = {
            let mut state = self.connect_state();
            if state.phase == Phase::Closed {
                return;
            }
            if state.phase == Phase::Connected {
                warn!("stream {id}: duplicate set_connected call ignored");
                return;
            }
            let server_side = remote_settings.is_none();
            match remote_settings {
                Some(settings) => {
                    if self.remote.set(settings).is_err() {
                        warn!("stream {id}: remote settings were already merged");
                    }
                }
                None => {
                    debug_assert!(
                        self.remote.get().is_some(),
                        "accepting side must merge remote settings at creation"
                    );
                }
            }
            state.phase = Phase::Connected;
            state.ever_connected = true;
            state.code = ErrorCode::Graceful;
            if server_side {
                self.idle.start();
            }
            state.on_connect.take()
        };
        if let Some(remote) = self.remote.get() {
            trace!(
                "stream {id} is connected to remote stream {}",
                remote.stream_id()
            );
        }
        if let Some(on_connect) = fired {
            tokio::spawn(async move { on_connect(id, Ok(())) });
        }
    }

    /// Admit `payload` through flow control and hand it to frame I/O.
    ///
    /// # Errors
    ///
    /// [`WriteError::Full`] means the send window is exhausted; park on
    /// [`wait_writable`](Self::wait_writable) and retry. A failed transport
    /// write reverses the admission before surfacing the error.
    pub fn write(&self, payload: Bytes, options: &WriteOptions) -> Result<u64, WriteError> {
        let len = payload.len() as u64;
        let tracked = match self.flow.admit(len) {
            Admission::Full => return Err(WriteError::Full),
            Admission::Admitted { tracked } => tracked,
        };
        match self.send_data(payload, options.write_in_background) {
            Ok(written) => {
                if tracked
                    && self.tunables.aggregate_pressure_enabled()
                    && let Some(host) = self.host()
                {
                    host.unconsumed().add(i64::try_from(len).unwrap_or(i64::MAX));
                }
                Ok(written)
            }
            Err(err) => {
                warn!("stream {}: transport write failed: {err}", self.id);
                if tracked {
                    self.flow.reverse(len);
                }
                Err(err)
            }
        }
    }

    /// Segment `payload` into DATA frames and submit them to the host.
    fn send_data(&self, payload: Bytes, background: bool) -> Result<u64, WriteError> {
        let Some(host) = self.host() else {
            return Err(WriteError::NotConnected);
        };
        let Some(remote) = self.remote.get() else {
            return Err(WriteError::NotConnected);
        };
        if !remote.writable() {
            warn!(
                "the remote side of stream {}->{} doesn't have a handler",
                self.id,
                remote.stream_id()
            );
            return Err(WriteError::PeerNotWritable {
                local: self.id,
                remote: remote.stream_id(),
            });
        }
        let written = payload.len() as u64;
        for batch in self
            .segmenter
            .segment(remote.stream_id(), self.id, [payload])
        {
            metrics::add_frames(metrics::Direction::Outbound, batch.len());
            host.send_frames(batch, background)?;
        }
        Ok(written)
    }

    /// Park until credit is available, the deadline elapses, or the stream
    /// fails; the callback runs on a fresh task and fires exactly once.
    ///
    /// Waiting is permitted even when the peer is not writable: only `write`
    /// reports `PeerNotWritable`, so such a waiter resolves through deadline
    /// or reset rather than through credit.
    pub fn wait_with(&self, deadline: Option<Instant>, on_writable: WritableCallback) {
        let id = self.id;
        let token = WakeToken::new(Box::new(move |reason| {
            let outcome = match reason {
                WakeReason::Writable => Ok(()),
                WakeReason::TimedOut => Err(WaitError::TimedOut),
                WakeReason::Reset => Err(WaitError::Reset),
            };
            tokio::spawn(async move { on_writable(id, outcome) });
        }));
        if let Some(deadline) = deadline {
            token.arm_deadline(deadline);
        }
        self.park(token);
    }

    /// Awaitable form of [`wait_with`](Self::wait_with); resolves in place.
    pub async fn wait_writable(&self, deadline: Option<Instant>) -> Result<(), WaitError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let token = WakeToken::new(Box::new(move |reason| {
            let _ = tx.send(reason);
        }));
        if let Some(deadline) = deadline {
            token.arm_deadline(deadline);
        }
        self.park(token);
        match rx.await {
            Ok(WakeReason::Writable) => Ok(()),
            Ok(WakeReason::TimedOut) => Err(WaitError::TimedOut),
            Ok(WakeReason::Reset) | Err(_) => Err(WaitError::Reset),
        }
    }

    /// Park a token, resolving it with a reset when the stream is already
    /// recycled so late waiters never hang.
    fn park(&self, token: WakeToken) {
        if self.recycled.load(Ordering::Acquire) {
            token.fire(WakeReason::Reset);
            return;
        }
        self.flow.wait(token);
    }

    /// Classify one inbound frame.
    ///
    /// The first frame binds the stream to `host`; the binding is one-shot
    /// and idempotent under concurrent arrivals.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownFrameType`] reports a protocol violation to
    /// the caller, which is free to log and continue.
    pub fn on_received(
        &self,
        frame: Frame,
        host: &Arc<dyn HostTransport>,
    ) -> Result<(), DispatchError> {
        self.bind_host(host);
        metrics::add_frames(metrics::Direction::Inbound, 1);
        let (header, payload) = frame.into_parts();
        match header.frame_type() {
            FrameType::Data => {
                let complete = self
                    .reassembly
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(payload, header.has_continuation());
                if let Some(message) = complete
                    && let Err(reason) = self.queue.push_message(message)
                {
                    self.close(ErrorCode::Internal, reason);
                }
            }
            FrameType::Feedback => {
                let consumed = header
                    .feedback()
                    .map_or(0, crate::frame::Feedback::consumed_size);
                if self.tunables.aggregate_pressure_enabled() {
                    self.flow.set_remote_consumed(
                        consumed,
                        Some((
                            host.unconsumed(),
                            self.tunables.max_streams_unconsumed_bytes,
                        )),
                    );
                } else {
                    self.flow.set_remote_consumed(consumed, None);
                }
            }
            FrameType::Rst => {
                trace!("stream {} received rst frame", self.id);
                self.close(ErrorCode::ConnectionReset, CloseReason::RemoteReset);
            }
            FrameType::Close => {
                trace!("stream {} received close frame", self.id);
                self.close(ErrorCode::Graceful, CloseReason::RemoteClose);
            }
            FrameType::Unknown => {
                return Err(DispatchError::UnknownFrameType(self.id));
            }
        }
        Ok(())
    }

    fn bind_host(&self, host: &Arc<dyn HostTransport>) {
        if self.host_bound.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = host.register_stream(self.id) {
            warn!("stream {}: failed to join host transport: {err}", self.id);
            return;
        }
        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(host));
    }

    /// Close the stream, latching the first `(code, reason)` pair.
    ///
    /// Idempotent. Parked writers wake with a reset; a pending connect
    /// callback on a never-connected stream fires with `ConnectionReset`;
    /// the delivery queue is stopped so the handler observes exactly one
    /// `on_failed`/`on_closed` sequence.
    pub fn close(&self, code: ErrorCode, reason: CloseReason) {
        let id = self.id;
        let pending_connect = {
            let mut state = self.connect_state();
            if state.phase == Phase::Closed {
                None
            } else {
                debug!("stream {id}: closing ({reason})");
                if code.is_failure() {
                    metrics::inc_failures();
                }
                state.phase = Phase::Closed;
                state.code = code;
                state.reason = Some(reason);
                if state.ever_connected {
                    None
                } else {
                    state.on_connect.take()
                }
            }
        };
        if let Some(on_connect) = pending_connect {
            tokio::spawn(async move { on_connect(id, Err(ErrorCode::ConnectionReset)) });
        }
        self.recycle();
    }

    /// Tear the stream down exactly once.
    fn recycle(&self) {
        if self.recycled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flow.wake_all(WakeReason::Reset);

        let ever_connected = self.connect_state().ever_connected;
        if let Some(host) = self.host() {
            if ever_connected && let Some(remote) = self.remote.get() {
                trace!("stream {}: sending close frame", self.id);
                if let Err(err) =
                    host.send_frames(vec![Frame::close(remote.stream_id(), self.id)], false)
                {
                    debug!("stream {}: failed to send close frame: {err}", self.id);
                }
            }
            host.deregister_stream(self.id);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.queue.stop();
        metrics::dec_streams();
    }

    // Support surface for the delivery consumer.

    pub(crate) fn shutdown_token(&self) -> CancellationToken { self.queue.shutdown_token() }

    pub(crate) fn batch_size(&self) -> std::num::NonZeroUsize { self.options.batch_size() }

    pub(crate) fn handler(&self) -> Option<Arc<dyn StreamHandler>> {
        self.options.handler.clone()
    }

    pub(crate) fn idle_timer(&self) -> &IdleTimer { &self.idle }

    /// Whether the peer asked for FEEDBACK frames during the handshake.
    pub(crate) fn peer_needs_feedback(&self) -> bool {
        self.remote.get().is_some_and(StreamSettings::need_feedback)
    }

    /// Report the absolute delivered byte count back to the peer.
    pub(crate) fn send_feedback(&self, local_consumed: u64) {
        let (Some(host), Some(remote)) = (self.host(), self.remote.get()) else {
            return;
        };
        let frame = Frame::feedback(remote.stream_id(), self.id, local_consumed);
        metrics::add_frames(metrics::Direction::Outbound, 1);
        if let Err(err) = host.send_frames(vec![frame], false) {
            debug!("stream {}: failed to send feedback: {err}", self.id);
        }
    }

    /// Latched failure state, read by the consumer's terminal actions.
    pub(crate) fn latched_error(&self) -> (ErrorCode, CloseReason) {
        let state = self.connect_state();
        (
            state.code,
            state.reason.clone().unwrap_or(CloseReason::LocalClose),
        )
    }

    /// Drop the host transport reference during the terminal actions.
    pub(crate) fn release_host(&self) {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub(crate) fn is_connected(&self) -> bool {
        self.connect_state().phase == Phase::Connected
    }

    /// Peer-advertised stream id, visible to tests only.
    #[cfg(any(test, feature = "test-helpers"))]
    pub(crate) fn remote_stream_id(&self) -> Option<StreamId> {
        self.remote.get().map(StreamSettings::stream_id)
    }

    /// Current send window, visible to tests only.
    #[cfg(test)]
    pub(crate) fn window(&self) -> u64 { self.flow.cur_buf_size() }
}

impl MessageSink for Stream {
    /// Forward RPC-assembled bytes straight into the segmentation path.
    ///
    /// Flow control is deliberately not consulted: admission happens in
    /// [`Stream::write`] before the sink, and the RPC response rides outside
    /// the data window.
    fn sink_write(&self, payload: Bytes) -> Result<u64, WriteError> {
        self.send_data(payload, false)
    }

    fn sink_fail(&self) {
        self.close(
            ErrorCode::ConnectionReset,
            CloseReason::Other("transport handle failed".to_owned()),
        );
    }

    fn address(&self) -> StreamId { self.id }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("remote", &self.remote.get().map(StreamSettings::stream_id))
            .field("recycled", &self.recycled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
