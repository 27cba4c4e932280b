use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use rstest::rstest;
use tokio::time::{self, Duration};

use super::*;
use crate::{
    api,
    error::WaitError,
    registry::StreamRegistry,
    test_support::{HandlerEvent, MockTransport, RecordingHandler},
};

const PEER: StreamId = StreamId::new(901);

fn options(max: usize, min: usize) -> StreamOptions {
    StreamOptions {
        max_buf_size: max,
        min_buf_size: min,
        ..StreamOptions::new()
    }
}

fn peer_settings(writable: bool) -> StreamSettings { StreamSettings::new(PEER, true, writable) }

/// Create a client-side stream bound to `host` and connected to [`PEER`].
fn writer_stream(
    registry: &Arc<StreamRegistry>,
    host: &Arc<MockTransport>,
    options: StreamOptions,
) -> StreamId {
    let id = registry.create(options, None, None).expect("create stream");
    // The first inbound frame performs the one-shot host binding; a stale
    // feedback value is a no-op for flow control.
    registry
        .dispatch(Frame::feedback(id, PEER, 0), &host.as_host())
        .expect("bind dispatch");
    api::stream_set_connected(registry, id, Some(peer_settings(true)));
    host.clear();
    id
}

/// Create an accept-side stream with `handler`, already carrying the peer's
/// settings.
fn receiver_stream(
    registry: &Arc<StreamRegistry>,
    handler: &Arc<RecordingHandler>,
    options: StreamOptions,
    peer_need_feedback: bool,
) -> StreamId {
    registry
        .create(
            options.with_handler(Arc::clone(handler) as Arc<dyn crate::handler::StreamHandler>),
            Some(StreamSettings::new(PEER, peer_need_feedback, true)),
            None,
        )
        .expect("create stream")
}

fn data_frame(dest: StreamId, payload: &'static [u8], has_continuation: bool) -> Frame {
    Frame::data(dest, PEER, Bytes::from_static(payload), has_continuation)
}

/// Yield to the consumer tasks until `condition` holds.
async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition was never reached");
}

#[tokio::test]
async fn write_segments_and_the_peer_reassembles() {
    let tunables = MuxTunables {
        write_max_segment_size: NonZeroUsize::new(4).expect("non-zero"),
        ..MuxTunables::default()
    };
    let registry = StreamRegistry::new(tunables);
    let host = MockTransport::new();
    let writer = writer_stream(&registry, &host, options(0, 0));

    let written = api::stream_write(
        &registry,
        writer,
        Bytes::from_static(b"abcdefghij"),
        &WriteOptions::default(),
    )
    .expect("write");
    assert_eq!(written, 10);

    let sent = host.frames_of_type(FrameType::Data);
    let observed: Vec<(&[u8], bool)> = sent
        .iter()
        .map(|f| (f.payload().as_ref(), f.header().has_continuation()))
        .collect();
    assert_eq!(
        observed,
        vec![
            (b"abcd".as_slice(), true),
            (b"efgh".as_slice(), true),
            (b"ij".as_slice(), false),
        ]
    );
    assert!(sent.iter().all(|f| f.header().stream_id() == PEER
        && f.header().source_stream_id() == writer));

    // Replay the frames into a receiving stream; the handler observes the
    // single logical payload.
    let handler = RecordingHandler::new();
    let receiver = receiver_stream(&registry, &handler, options(0, 0), false);
    for frame in sent {
        let (header, payload) = frame.into_parts();
        registry
            .dispatch(
                Frame::data(receiver, PEER, payload, header.has_continuation()),
                &host.as_host(),
            )
            .expect("dispatch");
    }
    handler
        .wait_until(|events| {
            events
                .iter()
                .any(|e| matches!(e, HandlerEvent::Messages(_)))
        })
        .await;
    assert_eq!(handler.received(), vec![Bytes::from_static(b"abcdefghij")]);
}

#[tokio::test]
async fn ordered_delivery_across_messages() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let receiver = receiver_stream(&registry, &handler, options(0, 0), false);

    for payload in [b"first".as_slice(), b"second".as_slice(), b"third".as_slice()] {
        registry
            .dispatch(
                Frame::data(receiver, PEER, Bytes::copy_from_slice(payload), false),
                &host.as_host(),
            )
            .expect("dispatch");
    }
    handler.wait_until(|_| handler.received().len() == 3).await;
    assert_eq!(
        handler.received(),
        vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second"),
            Bytes::from_static(b"third"),
        ]
    );
}

#[tokio::test]
async fn admission_blocks_at_the_window_and_feedback_wakes_the_waiter() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let writer = writer_stream(&registry, &host, options(10, 10));
    let opts = WriteOptions::default();

    assert_eq!(
        api::stream_write(&registry, writer, Bytes::from_static(b"abcdef"), &opts).expect("write"),
        6
    );
    assert_eq!(
        api::stream_write(&registry, writer, Bytes::from_static(b"ghij"), &opts).expect("write"),
        4
    );
    assert!(matches!(
        api::stream_write(&registry, writer, Bytes::from_static(b"k"), &opts),
        Err(WriteError::Full)
    ));

    let waiter = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { api::stream_wait(&registry, writer, None).await })
    };
    tokio::task::yield_now().await;

    registry
        .dispatch(Frame::feedback(writer, PEER, 6), &host.as_host())
        .expect("feedback");
    waiter
        .await
        .expect("join")
        .expect("waiter resolves writable");

    // 4 bytes remain in flight against a window of 10.
    assert_eq!(
        api::stream_write(&registry, writer, Bytes::from_static(b"k"), &opts).expect("write"),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn waiter_deadline_times_out_while_the_stream_stays_full() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let writer = writer_stream(&registry, &host, options(4, 4));
    api::stream_write(
        &registry,
        writer,
        Bytes::from_static(b"full"),
        &WriteOptions::default(),
    )
    .expect("write");

    let deadline = time::Instant::now() + Duration::from_millis(20);
    let outcome = api::stream_wait(&registry, writer, Some(deadline)).await;
    assert_eq!(outcome, Err(WaitError::TimedOut));
}

#[tokio::test]
async fn transport_failure_reverses_the_admission() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let writer = writer_stream(&registry, &host, options(10, 0));
    let opts = WriteOptions::default();

    host.set_fail_writes(true);
    assert!(matches!(
        api::stream_write(&registry, writer, Bytes::from_static(b"abcdef"), &opts),
        Err(WriteError::Transport(_))
    ));

    // The failed write gave its credit back: the full window is available.
    host.set_fail_writes(false);
    assert_eq!(
        api::stream_write(&registry, writer, Bytes::from_static(b"0123456789"), &opts)
            .expect("write"),
        10
    );
}

#[tokio::test]
async fn write_before_binding_reports_not_connected() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let id = registry
        .create(options(0, 0), None, None)
        .expect("create stream");
    assert!(matches!(
        api::stream_write(
            &registry,
            id,
            Bytes::from_static(b"x"),
            &WriteOptions::default()
        ),
        Err(WriteError::NotConnected)
    ));
}

#[tokio::test]
async fn unwritable_peer_rejects_writes_but_not_waits() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let id = registry
        .create(options(10, 0), None, None)
        .expect("create stream");
    registry
        .dispatch(Frame::feedback(id, PEER, 0), &host.as_host())
        .expect("bind");
    api::stream_set_connected(&registry, id, Some(peer_settings(false)));

    assert!(matches!(
        api::stream_write(
            &registry,
            id,
            Bytes::from_static(b"x"),
            &WriteOptions::default()
        ),
        Err(WriteError::PeerNotWritable { .. })
    ));

    // Waiting is still permitted: credit exists, so the waiter resolves.
    api::stream_wait(&registry, id, None)
        .await
        .expect("wait succeeds despite unwritable peer");
}

#[tokio::test]
async fn background_writes_are_forwarded_to_the_transport() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let writer = writer_stream(&registry, &host, options(0, 0));

    api::stream_write(
        &registry,
        writer,
        Bytes::from_static(b"bg"),
        &WriteOptions {
            write_in_background: true,
        },
    )
    .expect("write");
    assert_eq!(host.backgrounds(), vec![true]);
}

#[tokio::test]
async fn rst_wakes_the_waiter_and_fails_the_handler_once() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let id = registry
        .create(
            options(4, 0)
                .with_handler(Arc::clone(&handler) as Arc<dyn crate::handler::StreamHandler>),
            Some(peer_settings(true)),
            None,
        )
        .expect("create stream");
    registry
        .dispatch(Frame::feedback(id, PEER, 0), &host.as_host())
        .expect("bind");
    api::stream_set_connected(&registry, id, None);
    api::stream_write(
        &registry,
        id,
        Bytes::from_static(b"full"),
        &WriteOptions::default(),
    )
    .expect("write");

    let waiter = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { api::stream_wait(&registry, id, None).await })
    };
    tokio::task::yield_now().await;

    registry
        .dispatch(Frame::rst(id, PEER), &host.as_host())
        .expect("rst");

    assert_eq!(waiter.await.expect("join"), Err(WaitError::Reset));
    handler.wait_closed().await;
    assert_eq!(
        handler.events(),
        vec![
            HandlerEvent::Failed(ErrorCode::ConnectionReset, CloseReason::RemoteReset),
            HandlerEvent::Closed,
        ]
    );
    assert!(!registry.contains(id));
}

#[tokio::test]
async fn close_frame_closes_gracefully() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let id = receiver_stream(&registry, &handler, options(0, 0), false);

    registry
        .dispatch(Frame::close(id, PEER), &host.as_host())
        .expect("close frame");
    handler.wait_closed().await;
    assert_eq!(handler.events(), vec![HandlerEvent::Closed]);
}

#[tokio::test]
async fn close_is_idempotent_and_the_first_code_wins() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let id = receiver_stream(&registry, &handler, options(0, 0), false);
    registry
        .dispatch(data_frame(id, b"seed", false), &host.as_host())
        .expect("bind");

    let stream = registry.get(id).expect("live stream");
    stream.close(ErrorCode::ConnectionReset, CloseReason::RemoteReset);
    stream.close(ErrorCode::Graceful, CloseReason::LocalClose);
    api::stream_close(&registry, id);

    handler.wait_closed().await;
    let closures = handler
        .events()
        .iter()
        .filter(|e| matches!(e, HandlerEvent::Closed))
        .count();
    assert_eq!(closures, 1);
    assert!(handler.events().contains(&HandlerEvent::Failed(
        ErrorCode::ConnectionReset,
        CloseReason::RemoteReset
    )));
}

#[tokio::test]
async fn local_close_after_connect_sends_a_close_frame() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let writer = writer_stream(&registry, &host, options(0, 0));

    api::stream_close(&registry, writer);
    let close_frames = host.frames_of_type(FrameType::Close);
    assert_eq!(close_frames.len(), 1);
    assert_eq!(close_frames[0].header().stream_id(), PEER);
    assert_eq!(close_frames[0].header().source_stream_id(), writer);
    assert_eq!(host.registered(), vec![writer]);
    assert_eq!(host.deregistered(), vec![writer]);
}

#[tokio::test]
async fn never_connected_stream_closes_without_a_close_frame() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let id = registry
        .create(options(0, 0), None, None)
        .expect("create stream");
    registry
        .dispatch(Frame::feedback(id, PEER, 0), &host.as_host())
        .expect("bind");
    host.clear();

    api::stream_close(&registry, id);
    assert!(host.frames_of_type(FrameType::Close).is_empty());
    assert!(!registry.contains(id));
}

#[tokio::test]
async fn delivery_emits_absolute_feedback() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let id = receiver_stream(&registry, &handler, options(0, 0), true);

    registry
        .dispatch(data_frame(id, b"abcd", false), &host.as_host())
        .expect("dispatch");
    handler.wait_until(|_| handler.received().len() == 1).await;
    handler
        .wait_until(|_| host.last_feedback() == Some(4))
        .await;

    registry
        .dispatch(data_frame(id, b"ef", false), &host.as_host())
        .expect("dispatch");
    handler.wait_until(|_| handler.received().len() == 2).await;
    handler
        .wait_until(|_| host.last_feedback() == Some(6))
        .await;
}

#[tokio::test]
async fn peer_without_feedback_gets_none() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let id = receiver_stream(&registry, &handler, options(0, 0), false);

    registry
        .dispatch(data_frame(id, b"abcd", false), &host.as_host())
        .expect("dispatch");
    handler.wait_until(|_| handler.received().len() == 1).await;
    assert!(host.frames_of_type(FrameType::Feedback).is_empty());
}

#[tokio::test]
async fn handler_less_stream_still_reports_consumption() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let id = registry
        .create(
            options(0, 0),
            Some(StreamSettings::new(PEER, true, true)),
            None,
        )
        .expect("create stream");

    registry
        .dispatch(data_frame(id, b"dropped", false), &host.as_host())
        .expect("dispatch");
    // The consumer has no handler to call, yet the peer's window must move.
    wait_for(|| host.last_feedback().is_some()).await;
    assert_eq!(host.last_feedback(), Some(7));
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_fires_without_traffic() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let handler = RecordingHandler::new();
    let id = registry
        .create(
            StreamOptions {
                idle_timeout: Some(Duration::from_millis(50)),
                ..options(0, 0)
            }
            .with_handler(Arc::clone(&handler) as Arc<dyn crate::handler::StreamHandler>),
            Some(peer_settings(true)),
            None,
        )
        .expect("create stream");
    // The accepting side starts the idle timer when it connects.
    api::stream_set_connected(&registry, id, None);

    handler
        .wait_until(|events| events.contains(&HandlerEvent::IdleTimeout))
        .await;
    assert!(
        handler
            .events()
            .iter()
            .all(|e| !matches!(e, HandlerEvent::Messages(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn traffic_rearms_the_idle_timer() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let id = registry
        .create(
            StreamOptions {
                idle_timeout: Some(Duration::from_millis(50)),
                ..options(0, 0)
            }
            .with_handler(Arc::clone(&handler) as Arc<dyn crate::handler::StreamHandler>),
            Some(peer_settings(true)),
            None,
        )
        .expect("create stream");
    api::stream_set_connected(&registry, id, None);

    registry
        .dispatch(data_frame(id, b"ping", false), &host.as_host())
        .expect("dispatch");
    handler.wait_until(|_| handler.received().len() == 1).await;

    // The consumer rearmed the timer after the batch; idleness follows.
    handler
        .wait_until(|events| events.contains(&HandlerEvent::IdleTimeout))
        .await;
    let events = handler.events();
    let message_index = events
        .iter()
        .position(|e| matches!(e, HandlerEvent::Messages(_)))
        .expect("messages delivered");
    let idle_index = events
        .iter()
        .position(|e| *e == HandlerEvent::IdleTimeout)
        .expect("idle fired");
    assert!(message_index < idle_index);
}

#[tokio::test]
async fn handshake_connects_before_any_delivery() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let mut ctrl = api::StreamController::new(Arc::clone(&registry));

    let connect_log: Arc<Mutex<Vec<Result<(), ErrorCode>>>> = Arc::new(Mutex::new(Vec::new()));

    let parser_registry = Arc::clone(&registry);
    let ids = api::stream_create(
        &mut ctrl,
        &options(0, 0).with_handler(Arc::clone(&handler) as Arc<dyn crate::handler::StreamHandler>),
        1,
        Box::new(move |id, payload| {
            assert_eq!(payload.as_ref(), b"rpc-response");
            api::stream_set_connected(&parser_registry, id, Some(peer_settings(true)));
            Ok(())
        }),
    )
    .expect("create");
    let id = ids[0];

    let log = Arc::clone(&connect_log);
    api::stream_connect(
        &registry,
        id,
        Box::new(move |_, outcome| {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(outcome);
        }),
    )
    .expect("connect registration");

    // The first inbound message is the RPC response; it reaches the parser,
    // not the handler.
    registry
        .dispatch(data_frame(id, b"rpc-response", false), &host.as_host())
        .expect("dispatch response");
    wait_for(|| registry.get(id).is_some_and(|stream| stream.is_connected())).await;
    wait_for(|| {
        !connect_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    })
    .await;
    assert_eq!(
        *connect_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner),
        vec![Ok(())]
    );
    assert!(handler.received().is_empty());

    // Subsequent messages follow the normal path.
    registry
        .dispatch(data_frame(id, b"payload", false), &host.as_host())
        .expect("dispatch payload");
    handler.wait_until(|_| handler.received().len() == 1).await;
    assert_eq!(handler.received(), vec![Bytes::from_static(b"payload")]);
    assert_eq!(
        connect_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len(),
        1
    );
}

#[tokio::test]
async fn malformed_response_closes_with_a_protocol_error() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let mut ctrl = api::StreamController::new(Arc::clone(&registry));

    let ids = api::stream_create(
        &mut ctrl,
        &options(0, 0).with_handler(Arc::clone(&handler) as Arc<dyn crate::handler::StreamHandler>),
        1,
        Box::new(|_, _| Err(crate::error::ResponseParseError::new("bad magic"))),
    )
    .expect("create");

    registry
        .dispatch(data_frame(ids[0], b"garbage", false), &host.as_host())
        .expect("dispatch");
    handler.wait_closed().await;
    assert_eq!(
        handler.events(),
        vec![
            HandlerEvent::Failed(ErrorCode::Protocol, CloseReason::MalformedResponse),
            HandlerEvent::Closed,
        ]
    );
    assert!(!registry.contains(ids[0]));
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let id = registry
        .create(options(0, 0), None, None)
        .expect("create stream");
    api::stream_connect(&registry, id, Box::new(|_, _| {})).expect("first registration");
    assert_eq!(
        api::stream_connect(&registry, id, Box::new(|_, _| {})),
        Err(ConnectError::AlreadyRegistered)
    );
}

#[tokio::test]
async fn aggregate_pressure_shrinks_a_grown_window() {
    let tunables = MuxTunables {
        max_streams_unconsumed_bytes: 30,
        ..MuxTunables::default()
    };
    let registry = StreamRegistry::new(tunables);
    let host = MockTransport::new();
    let opts = WriteOptions::default();
    let first = writer_stream(&registry, &host, options(100, 10));
    let second = writer_stream(&registry, &host, options(100, 10));

    // With aggregate pressure enabled both windows start at the minimum.
    let first_stream = registry.get(first).expect("live");
    assert_eq!(first_stream.window(), 10);

    api::stream_write(&registry, first, Bytes::from_static(&[0; 20]), &opts).expect("write");
    api::stream_write(&registry, second, Bytes::from_static(&[0; 20]), &opts).expect("write");
    assert_eq!(host.as_host().unconsumed().get(), 40);

    // Feedback that keeps the stream saturated below the threshold grows it.
    registry
        .dispatch(Frame::feedback(first, PEER, 10), &host.as_host())
        .expect("feedback");
    assert_eq!(first_stream.window(), 20);

    api::stream_write(&registry, first, Bytes::from_static(&[0; 20]), &opts).expect("write");

    // The next feedback sees the socket over its threshold and cuts the
    // window back to the minimum.
    registry
        .dispatch(Frame::feedback(first, PEER, 15), &host.as_host())
        .expect("feedback");
    assert_eq!(first_stream.window(), 10);
    assert_eq!(registry.get(second).expect("live").window(), 10);
}

#[tokio::test]
async fn unknown_frame_type_is_reported_not_fatal() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let handler = RecordingHandler::new();
    let id = receiver_stream(&registry, &handler, options(0, 0), false);

    assert_eq!(
        registry.dispatch(Frame::unknown_for_tests(id, PEER), &host.as_host()),
        Err(DispatchError::UnknownFrameType(id))
    );

    // The stream survives and keeps delivering.
    registry
        .dispatch(data_frame(id, b"still-alive", false), &host.as_host())
        .expect("dispatch");
    handler.wait_until(|_| handler.received().len() == 1).await;
}

#[tokio::test]
async fn fail_streams_gives_each_stream_its_own_reason() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let handlers: Vec<Arc<RecordingHandler>> =
        (0..3).map(|_| RecordingHandler::new()).collect();
    let ids: Vec<StreamId> = handlers
        .iter()
        .map(|handler| receiver_stream(&registry, handler, options(0, 0), false))
        .collect();

    api::fail_streams(&registry, &ids, ErrorCode::InvalidArgument, |index| {
        CloseReason::AcceptFailed { index }
    });

    for (index, handler) in handlers.iter().enumerate() {
        handler.wait_closed().await;
        assert_eq!(
            handler.events(),
            vec![
                HandlerEvent::Failed(
                    ErrorCode::InvalidArgument,
                    CloseReason::AcceptFailed { index }
                ),
                HandlerEvent::Closed,
            ]
        );
    }
}

#[rstest]
#[case(10, true)]
#[case(0, false)]
#[tokio::test]
async fn fill_settings_advertises_feedback_and_writability(
    #[case] max_buf: usize,
    #[case] need_feedback: bool,
) {
    let registry = StreamRegistry::new(MuxTunables::default());
    let handler = RecordingHandler::new();
    let with_handler = registry
        .create(
            options(max_buf, 0)
                .with_handler(Arc::clone(&handler) as Arc<dyn crate::handler::StreamHandler>),
            None,
            None,
        )
        .expect("create stream");
    let without_handler = registry
        .create(options(max_buf, 0), None, None)
        .expect("create stream");

    let advertised = registry.get(with_handler).expect("live").fill_settings();
    assert_eq!(advertised.stream_id(), with_handler);
    assert_eq!(advertised.need_feedback(), need_feedback);
    assert!(advertised.writable());

    let advertised = registry.get(without_handler).expect("live").fill_settings();
    assert!(!advertised.writable());
}

#[tokio::test]
async fn sink_write_bypasses_flow_control() {
    let registry = StreamRegistry::new(MuxTunables::default());
    let host = MockTransport::new();
    let writer = writer_stream(&registry, &host, options(4, 0));
    let opts = WriteOptions::default();

    api::stream_write(&registry, writer, Bytes::from_static(b"full"), &opts).expect("write");
    assert!(matches!(
        api::stream_write(&registry, writer, Bytes::from_static(b"x"), &opts),
        Err(WriteError::Full)
    ));

    // The synthetic handle's sink path carries RPC bytes outside the window.
    let stream = registry.get(writer).expect("live");
    assert_eq!(stream.sink_write(Bytes::from_static(b"rpc")).expect("sink"), 3);
    assert!(matches!(
        api::stream_write(&registry, writer, Bytes::from_static(b"x"), &opts),
        Err(WriteError::Full)
    ));
}
