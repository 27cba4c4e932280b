//! Public surface of the stream layer.
//!
//! [`StreamController`] is the thin stand-in for the RPC dispatch machinery:
//! it tracks which streams ride the outgoing request and the incoming
//! response, and carries the peer's handshake settings. The free functions
//! mirror the id-addressed operations the transport exposes to applications.

use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use tokio::time::Instant;

use crate::{
    config::{StreamOptions, WriteOptions},
    error::{CloseReason, ConnectError, CreateError, ErrorCode, WaitError, WriteError},
    handler::{ConnectCallback, ResponseParser, WritableCallback},
    registry::{StreamId, StreamRegistry},
    settings::StreamSettings,
};

/// Stream bookkeeping attached to one RPC exchange.
#[derive(Debug)]
pub struct StreamController {
    registry: Arc<StreamRegistry>,
    request_streams: Vec<StreamId>,
    response_streams: Vec<StreamId>,
    remote_stream_settings: Option<StreamSettings>,
}

impl StreamController {
    /// Controller for an RPC carried by `registry`'s transport.
    #[must_use]
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self {
            registry,
            request_streams: Vec::new(),
            response_streams: Vec::new(),
            remote_stream_settings: None,
        }
    }

    /// Registry this controller allocates streams from.
    #[must_use]
    pub fn registry(&self) -> &Arc<StreamRegistry> { &self.registry }

    /// Streams created on the outgoing request.
    #[must_use]
    pub fn request_streams(&self) -> &[StreamId] { &self.request_streams }

    /// Streams accepted from the incoming request.
    #[must_use]
    pub fn response_streams(&self) -> &[StreamId] { &self.response_streams }

    /// Attach the peer's handshake settings, as decoded from the request.
    pub fn set_remote_stream_settings(&mut self, settings: StreamSettings) {
        self.remote_stream_settings = Some(settings);
    }

    /// Peer handshake settings, if the request carried a stream.
    #[must_use]
    pub fn remote_stream_settings(&self) -> Option<&StreamSettings> {
        self.remote_stream_settings.as_ref()
    }
}

/// Register `count` streams on the outgoing RPC.
///
/// The first stream carries the RPC response as its first inbound message
/// and hands it to `parser`; the rest deliver straight to their handlers.
///
/// # Errors
///
/// [`CreateError::AlreadyCreated`] when the controller already carries
/// request streams, [`CreateError::ZeroStreams`] for an empty request,
/// [`CreateError::RegistryFull`] when the registry refuses a stream; in
/// that case the streams created so far are failed with the refusing index
/// as their reason and the controller is left untouched.
pub fn stream_create(
    ctrl: &mut StreamController,
    options: &StreamOptions,
    count: usize,
    parser: ResponseParser,
) -> Result<Vec<StreamId>, CreateError> {
    if !ctrl.request_streams.is_empty() {
        warn!("request streams can only be created once per rpc");
        return Err(CreateError::AlreadyCreated);
    }
    if count == 0 {
        return Err(CreateError::ZeroStreams);
    }
    let mut parser = Some(parser);
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        // Only the first stream parses the RPC response.
        match ctrl.registry.create(options.clone(), None, parser.take()) {
            Ok(id) => ids.push(id),
            Err(err) => {
                let index = ids.len();
                warn!("failed to create stream at index {index}");
                fail_streams(&ctrl.registry, &ids, ErrorCode::Graceful, |_| {
                    CloseReason::CreateFailed { index }
                });
                return Err(err);
            }
        }
    }
    ctrl.request_streams.clone_from(&ids);
    Ok(ids)
}

/// Accept the streams attached to an incoming RPC request.
///
/// The leading stream takes the peer's settings as-is; when those settings
/// carry `extra_stream_ids`, one additional stream is accepted per id with
/// the advertised id substituted and the extra list cleared.
///
/// # Errors
///
/// [`CreateError::AlreadyAccepted`] on a second call,
/// [`CreateError::NoRemoteStream`] when the request carried no stream,
/// [`CreateError::RegistryFull`] when the registry refuses a stream; the
/// streams accepted so far are then failed with the refusing index as
/// their reason and the controller is left untouched.
pub fn stream_accept(
    ctrl: &mut StreamController,
    options: &StreamOptions,
) -> Result<Vec<StreamId>, CreateError> {
    if !ctrl.response_streams.is_empty() {
        warn!("response streams can only be accepted once per rpc");
        return Err(CreateError::AlreadyAccepted);
    }
    let Some(remote) = ctrl.remote_stream_settings.clone() else {
        warn!("no stream along with this request");
        return Err(CreateError::NoRemoteStream);
    };

    let mut ids = Vec::with_capacity(1 + remote.extra_stream_ids().len());
    let settings = std::iter::once(remote.clone())
        .chain(remote.extra_stream_ids().iter().map(|&id| remote.for_extra_stream(id)));
    for stream_settings in settings {
        match ctrl.registry.create(options.clone(), Some(stream_settings), None) {
            Ok(id) => ids.push(id),
            Err(err) => {
                let index = ids.len();
                warn!("failed to accept stream at index {index}");
                fail_streams(&ctrl.registry, &ids, ErrorCode::Graceful, |_| {
                    CloseReason::AcceptFailed { index }
                });
                return Err(err);
            }
        }
    }
    ctrl.response_streams.clone_from(&ids);
    Ok(ids)
}

/// Accept exactly one stream from the incoming RPC request.
///
/// # Errors
///
/// In addition to [`stream_accept`]'s errors,
/// [`CreateError::ExpectedSingleStream`] when the handshake multiplexes
/// several streams; the accepted streams are failed with a per-index reason
/// and the controller is unwound.
pub fn stream_accept_one(
    ctrl: &mut StreamController,
    options: &StreamOptions,
) -> Result<StreamId, CreateError> {
    let ids = stream_accept(ctrl, options)?;
    if let [id] = ids[..] {
        return Ok(id);
    }
    warn!("misusing single-stream accept for a multi-stream handshake");
    fail_streams(&ctrl.registry, &ids, ErrorCode::InvalidArgument, |index| {
        CloseReason::AcceptFailed { index }
    });
    ctrl.response_streams.clear();
    Err(CreateError::ExpectedSingleStream)
}

/// Write `payload` on stream `id`.
///
/// # Errors
///
/// [`WriteError::UnknownStream`] for an unregistered id; otherwise the
/// stream's own admission and transport errors. [`WriteError::Full`] is the
/// back-pressure signal: park with [`stream_wait`] and retry.
pub fn stream_write(
    registry: &StreamRegistry,
    id: StreamId,
    payload: Bytes,
    options: &WriteOptions,
) -> Result<u64, WriteError> {
    let stream = registry.get(id).ok_or(WriteError::UnknownStream(id))?;
    stream.write(payload, options)
}

/// Park until stream `id` is writable, its deadline elapses, or it fails.
///
/// # Errors
///
/// [`WaitError::UnknownStream`] for an unregistered id,
/// [`WaitError::TimedOut`] past the deadline, [`WaitError::Reset`] when the
/// stream closes while waiting.
pub async fn stream_wait(
    registry: &StreamRegistry,
    id: StreamId,
    deadline: Option<Instant>,
) -> Result<(), WaitError> {
    let stream = registry.get(id).ok_or(WaitError::UnknownStream(id))?;
    stream.wait_writable(deadline).await
}

/// Callback-driven form of [`stream_wait`].
///
/// The callback runs on a fresh task exactly once, even for an unknown id.
pub fn stream_wait_with(
    registry: &StreamRegistry,
    id: StreamId,
    deadline: Option<Instant>,
    on_writable: WritableCallback,
) {
    match registry.get(id) {
        Some(stream) => stream.wait_with(deadline, on_writable),
        None => {
            tokio::spawn(async move { on_writable(id, Err(WaitError::UnknownStream(id))) });
        }
    }
}

/// Register the one-shot connect callback for stream `id`.
///
/// # Errors
///
/// [`ConnectError::UnknownStream`] for an unregistered id,
/// [`ConnectError::AlreadyRegistered`] on a second registration.
pub fn stream_connect(
    registry: &StreamRegistry,
    id: StreamId,
    on_connect: ConnectCallback,
) -> Result<(), ConnectError> {
    let stream = registry.get(id).ok_or(ConnectError::UnknownStream(id))?;
    stream.connect(on_connect)
}

/// Mark stream `id` connected once the handshake RPC has completed.
///
/// Client streams pass the settings decoded from the RPC response; accepting
/// streams merged them at creation and pass `None`. Unknown ids are ignored,
/// matching the recycled-stream tolerance of the transport layer.
pub fn stream_set_connected(
    registry: &StreamRegistry,
    id: StreamId,
    remote_settings: Option<StreamSettings>,
) {
    if let Some(stream) = registry.get(id) {
        stream.set_connected(remote_settings);
    }
}

/// Close stream `id` gracefully. Idempotent; unknown ids are ignored.
pub fn stream_close(registry: &StreamRegistry, id: StreamId) {
    if let Some(stream) = registry.get(id) {
        stream.close(ErrorCode::Graceful, CloseReason::LocalClose);
    }
}

/// Fail a batch of streams, giving each id its own deterministic reason.
///
/// Recycled or unknown ids are skipped without error.
pub fn fail_streams(
    registry: &StreamRegistry,
    ids: &[StreamId],
    code: ErrorCode,
    reason_for: impl Fn(usize) -> CloseReason,
) {
    for (index, id) in ids.iter().enumerate() {
        if let Some(stream) = registry.get(*id) {
            stream.close(code, reason_for(index));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, PoisonError};

    use super::*;
    use crate::{
        config::MuxTunables,
        error::WaitError,
        test_support::{HandlerEvent, RecordingHandler},
    };

    fn noop_parser() -> ResponseParser { Box::new(|_, _| Ok(())) }

    fn controller() -> StreamController {
        StreamController::new(StreamRegistry::new(MuxTunables::default()))
    }

    #[tokio::test]
    async fn create_registers_the_requested_number_of_streams() {
        let mut ctrl = controller();
        let ids = stream_create(&mut ctrl, &StreamOptions::new(), 3, noop_parser())
            .expect("create");
        assert_eq!(ids.len(), 3);
        assert_eq!(ctrl.request_streams(), &ids[..]);
        assert_eq!(ctrl.registry().len(), 3);
    }

    #[tokio::test]
    async fn create_twice_on_one_controller_is_rejected() {
        let mut ctrl = controller();
        stream_create(&mut ctrl, &StreamOptions::new(), 1, noop_parser()).expect("create");
        assert!(matches!(
            stream_create(&mut ctrl, &StreamOptions::new(), 1, noop_parser()),
            Err(CreateError::AlreadyCreated)
        ));
    }

    #[tokio::test]
    async fn create_requires_at_least_one_stream() {
        let mut ctrl = controller();
        assert!(matches!(
            stream_create(&mut ctrl, &StreamOptions::new(), 0, noop_parser()),
            Err(CreateError::ZeroStreams)
        ));
    }

    #[tokio::test]
    async fn create_unwinds_when_the_registry_is_full() {
        let registry = StreamRegistry::new(MuxTunables {
            max_streams: 2,
            ..MuxTunables::default()
        });
        let mut ctrl = StreamController::new(Arc::clone(&registry));
        let handler = RecordingHandler::new();
        let options = StreamOptions::new()
            .with_handler(Arc::clone(&handler) as Arc<dyn crate::handler::StreamHandler>);

        let err = stream_create(&mut ctrl, &options, 3, noop_parser())
            .expect_err("third stream must be refused");
        assert!(matches!(err, CreateError::RegistryFull { limit: 2 }));

        // The two streams created before the refusal are failed and
        // released; the controller is left untouched.
        assert!(ctrl.request_streams().is_empty());
        assert!(ctrl.registry().is_empty());
        handler
            .wait_until(|events| {
                events
                    .iter()
                    .filter(|e| matches!(e, HandlerEvent::Closed))
                    .count()
                    == 2
            })
            .await;
        // The unwind is graceful: no on_failed fires.
        assert!(
            handler
                .events()
                .iter()
                .all(|e| !matches!(e, HandlerEvent::Failed(..)))
        );
    }

    #[tokio::test]
    async fn accept_unwinds_when_the_registry_is_full() {
        let registry = StreamRegistry::new(MuxTunables {
            max_streams: 1,
            ..MuxTunables::default()
        });
        let mut ctrl = StreamController::new(Arc::clone(&registry));
        ctrl.set_remote_stream_settings(
            StreamSettings::new(StreamId::new(5), true, true)
                .with_extra_streams(vec![StreamId::new(7)]),
        );

        assert!(matches!(
            stream_accept(&mut ctrl, &StreamOptions::new()),
            Err(CreateError::RegistryFull { limit: 1 })
        ));
        assert!(ctrl.response_streams().is_empty());
        assert!(ctrl.registry().is_empty());
    }

    #[tokio::test]
    async fn accept_fails_without_an_attached_stream() {
        let mut ctrl = controller();
        assert!(matches!(
            stream_accept(&mut ctrl, &StreamOptions::new()),
            Err(CreateError::NoRemoteStream)
        ));
    }

    #[tokio::test]
    async fn accept_mirrors_extra_stream_ids() {
        let mut ctrl = controller();
        ctrl.set_remote_stream_settings(
            StreamSettings::new(StreamId::new(5), true, true)
                .with_extra_streams(vec![StreamId::new(7), StreamId::new(8)]),
        );

        let ids = stream_accept(&mut ctrl, &StreamOptions::new()).expect("accept");
        assert_eq!(ids.len(), 3);
        assert_eq!(ctrl.response_streams(), &ids[..]);

        let remotes: Vec<Option<StreamId>> = ids
            .iter()
            .map(|id| {
                ctrl.registry()
                    .get(*id)
                    .expect("live stream")
                    .remote_stream_id()
            })
            .collect();
        assert_eq!(
            remotes,
            vec![
                Some(StreamId::new(5)),
                Some(StreamId::new(7)),
                Some(StreamId::new(8)),
            ]
        );

        assert!(matches!(
            stream_accept(&mut ctrl, &StreamOptions::new()),
            Err(CreateError::AlreadyAccepted)
        ));
    }

    #[tokio::test]
    async fn accept_one_accepts_a_single_stream() {
        let mut ctrl = controller();
        ctrl.set_remote_stream_settings(StreamSettings::new(StreamId::new(5), true, true));
        let id = stream_accept_one(&mut ctrl, &StreamOptions::new()).expect("accept");
        assert!(ctrl.registry().contains(id));
    }

    #[tokio::test]
    async fn accept_one_unwinds_a_multi_stream_handshake() {
        let mut ctrl = controller();
        ctrl.set_remote_stream_settings(
            StreamSettings::new(StreamId::new(5), true, true)
                .with_extra_streams(vec![StreamId::new(7)]),
        );

        assert!(matches!(
            stream_accept_one(&mut ctrl, &StreamOptions::new()),
            Err(CreateError::ExpectedSingleStream)
        ));
        assert!(ctrl.response_streams().is_empty());
        assert!(ctrl.registry().is_empty());
    }

    #[tokio::test]
    async fn id_addressed_operations_reject_unknown_streams() {
        let registry = StreamRegistry::new(MuxTunables::default());
        let missing = StreamId::new(42);

        assert!(matches!(
            stream_write(
                &registry,
                missing,
                Bytes::from_static(b"x"),
                &WriteOptions::default()
            ),
            Err(WriteError::UnknownStream(_))
        ));
        assert_eq!(
            stream_wait(&registry, missing, None).await,
            Err(WaitError::UnknownStream(missing))
        );

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&outcomes);
        stream_wait_with(
            &registry,
            missing,
            None,
            Box::new(move |_, outcome| {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(outcome);
            }),
        );
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *outcomes.lock().unwrap_or_else(PoisonError::into_inner),
            vec![Err(WaitError::UnknownStream(missing))]
        );

        // Close and batch failure tolerate unknown ids.
        stream_close(&registry, missing);
        fail_streams(&registry, &[missing], ErrorCode::InvalidArgument, |_| {
            CloseReason::LocalClose
        });
    }
}
