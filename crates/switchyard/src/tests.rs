use crate::{
    CALL_ID, CallContext, CallIo, CallOptions, CallService, ChannelError, Code, Connection,
    Dispatcher, Frame, FrameReceiver, FrameSender, Metadata, Next, Pattern, Registry, Status,
    VIOLATION_KEY,
    interceptor::{
        Chain, from_fn,
        auth::{Authenticator, Principal, Role, RoleGuard, StaticTokens},
        logging::Logging,
        recovery::Recovery,
    },
};
use core::time::Duration;
use futures::{StreamExt, future::join_all};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::oneshot;

const ECHO: &str = "/demo.Echo/Say";
const COUNT_UP: &str = "/demo.Counter/CountUp";
const COUNT: &str = "/demo.Counter/Count";
const ECHO_STREAM: &str = "/demo.Echo/Chat";
const HOLD: &str = "/demo.Hold/Open";
const WHOAMI: &str = "/demo.Identity/WhoAmI";
const HEALTH: &str = "/switchyard.Health/Check";

const ADMIN_TOKEN: &str = "admin-token";
const VIEWER_TOKEN: &str = "viewer-token";

async fn echo(_ctx: CallContext, frame: Frame) -> Result<Frame, Status> {
    Ok(frame)
}

async fn count_up(_ctx: CallContext, request: Frame, mut out: FrameSender) -> Result<(), Status> {
    let n: usize = request
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Status::invalid_argument("Expected a number"))?;
    for i in 0..n {
        out.send(Frame::text(i.to_string()))?;
    }
    // Returning without close_send closes the direction implicitly.
    Ok(())
}

async fn count(_ctx: CallContext, mut inbound: FrameReceiver) -> Result<Frame, Status> {
    let mut seen = 0_u64;
    while inbound.receive().await?.is_some() {
        seen += 1;
    }
    Ok(Frame::text(seen.to_string()))
}

async fn echo_stream(
    _ctx: CallContext,
    mut inbound: FrameReceiver,
    mut outbound: FrameSender,
) -> Result<(), Status> {
    while let Some(frame) = inbound.receive().await? {
        let text = frame.as_str().unwrap_or_default();
        outbound.send(Frame::text(format!("echo: {text}")))?;
    }
    outbound.close_send();
    Ok(())
}

async fn hold(
    _ctx: CallContext,
    mut inbound: FrameReceiver,
    _outbound: FrameSender,
) -> Result<(), Status> {
    while inbound.receive().await?.is_some() {}
    Ok(())
}

async fn whoami(ctx: CallContext, _frame: Frame) -> Result<Frame, Status> {
    let role = ctx
        .principal()
        .map(|p| p.role().to_string())
        .unwrap_or_default();
    Ok(Frame::text(role))
}

async fn explode(_ctx: CallContext, _frame: Frame) -> Result<Frame, Status> {
    panic!("handler exploded")
}

fn demo_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .unary(ECHO, echo)
        .unwrap()
        .server_streaming(COUNT_UP, count_up)
        .unwrap()
        .client_streaming(COUNT, count)
        .unwrap()
        .bidi_streaming(ECHO_STREAM, echo_stream)
        .unwrap()
        .bidi_streaming(HOLD, hold)
        .unwrap()
        .unary(WHOAMI, whoami)
        .unwrap()
        .unary(HEALTH, echo)
        .unwrap();
    registry
}

fn authenticator() -> Authenticator {
    let tokens: StaticTokens = [
        (ADMIN_TOKEN, Principal::new("ada", Role::new("admin"))),
        (VIEWER_TOKEN, Principal::new("vic", Role::new("viewer"))),
    ]
    .into_iter()
    .collect();
    Authenticator::new(tokens).with_bypass([HEALTH])
}

fn plain_connection() -> Connection {
    Dispatcher::builder()
        .registry(demo_registry())
        .interceptor(Recovery)
        .interceptor(Logging)
        .build()
        .unwrap()
        .connect()
}

fn secured_connection() -> Connection {
    Dispatcher::builder()
        .registry(demo_registry())
        .interceptor(Recovery)
        .interceptor(Logging)
        .interceptor(authenticator())
        .interceptor(RoleGuard::new().allow(ECHO, ["admin"]))
        .build()
        .unwrap()
        .connect()
}

fn bearer(token: &str) -> CallOptions {
    CallOptions::new().with_metadata("authorization", format!("Bearer {token}"))
}

/// A raw unary service that sends `responses` frames, ignoring send errors,
/// and then returns `result`.
struct Scripted {
    responses: usize,
    result: Result<(), Status>,
}

#[tonic::async_trait]
impl CallService for Scripted {
    async fn call(&self, _ctx: CallContext, io: CallIo) -> Result<(), Status> {
        let CallIo {
            mut inbound,
            mut outbound,
        } = io;
        inbound.receive_one().await?;
        for i in 0..self.responses {
            let _ = outbound.send(Frame::text(i.to_string()));
        }
        self.result.clone()
    }
}

fn scripted_connection(responses: usize, result: Result<(), Status>) -> Connection {
    let mut registry = Registry::new();
    registry
        .register(ECHO, Pattern::Unary, Scripted { responses, result })
        .unwrap();
    Dispatcher::builder()
        .registry(registry)
        .build()
        .unwrap()
        .connect()
}

#[tokio::test]
async fn unary_yields_one_message_or_one_error() {
    let conn = plain_connection();
    let reply = conn
        .unary(ECHO, Frame::text("ping"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.as_str(), Some("ping"));

    // A handler that responds and then fails: the caller only sees the error.
    let conn = scripted_connection(1, Err(Status::not_found("gone")));
    let err = conn
        .unary(ECHO, Frame::text("ping"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // Succeeding without a response is a framing error, not an empty reply.
    let conn = scripted_connection(0, Ok(()));
    let err = conn
        .unary(ECHO, Frame::text("ping"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ProtocolViolation);
}

#[tokio::test]
async fn unary_rejects_second_request() {
    let conn = plain_connection();
    let mut call = conn.open(ECHO, Pattern::Unary, CallOptions::new());
    call.send(Frame::text("one")).unwrap();
    let err = call.send(Frame::text("two")).unwrap_err();
    assert_eq!(err.code(), Code::ProtocolViolation);
    assert_eq!(call.close_and_receive().await.unwrap().as_str(), Some("one"));
}

#[tokio::test]
async fn recorded_error_beats_implicit_close() {
    // Second response on a single-shot direction, ignored by the handler.
    let conn = scripted_connection(3, Ok(()));
    let err = conn
        .unary(ECHO, Frame::text("ping"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ProtocolViolation);
    // The third frame arrived after the error was recorded.
    assert!(err.metadata().contains_key(VIOLATION_KEY));
}

async fn run_server_stream(conn: &Connection, n: usize) -> Vec<String> {
    let call = conn
        .server_streaming(COUNT_UP, Frame::text(n.to_string()), CallOptions::new())
        .unwrap();
    call.into_stream()
        .map(|frame| frame.unwrap().as_str().unwrap().to_string())
        .collect()
        .await
}

#[tokio::test]
async fn server_stream_delivers_n_frames_in_order() {
    let conn = plain_connection();
    for n in [0, 1, 250] {
        let expected: Vec<String> = (0..n).map(|i| i.to_string()).collect();
        assert_eq!(run_server_stream(&conn, n).await, expected);
    }
}

#[tokio::test]
async fn server_stream_failure_ends_the_stream() {
    let conn = plain_connection();
    let mut call = conn
        .server_streaming(COUNT_UP, Frame::text("many"), CallOptions::new())
        .unwrap();
    let err = call.receive().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

async fn run_client_stream(conn: &Connection, n: usize) -> Result<String, Status> {
    let mut call = conn.client_streaming(COUNT, CallOptions::new());
    for i in 0..n {
        call.send(Frame::text(i.to_string()))?;
    }
    let reply = call.close_and_receive().await?;
    Ok(reply.as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn client_stream_response_reflects_every_request() -> Result<(), Status> {
    let conn = plain_connection();
    assert_eq!(run_client_stream(&conn, 4).await?, "4");
    assert_eq!(run_client_stream(&conn, 0).await?, "0");
    Ok(())
}

#[tokio::test]
async fn bidi_echo_answers_each_message_after_it_arrives() -> Result<(), Status> {
    let conn = plain_connection();
    let mut call = conn.bidi_streaming(ECHO_STREAM, CallOptions::new());

    // Nothing is sent before the first request.
    assert!(
        tokio::time::timeout(Duration::from_millis(20), call.receive())
            .await
            .is_err()
    );

    for word in ["Hi!", "Bye!"] {
        call.send(Frame::text(word))?;
        let reply = call.receive().await?.expect("one echo per message");
        assert_eq!(reply.as_str(), Some(format!("echo: {word}").as_str()));
    }
    call.close_send();
    assert!(call.receive().await?.is_none());
    call.finish().await
}

#[tokio::test]
async fn auth_interceptor_resolves_role_or_rejects() {
    let conn = secured_connection();

    let err = conn
        .unary(WHOAMI, Frame::text(""), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let err = conn
        .unary(WHOAMI, Frame::text(""), bearer("invalid-token"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let options = CallOptions::new().with_metadata("authorization", format!("Basic {ADMIN_TOKEN}"));
    let err = conn
        .unary(WHOAMI, Frame::text(""), options)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    for (token, role) in [(ADMIN_TOKEN, "admin"), (VIEWER_TOKEN, "viewer")] {
        let reply = conn
            .unary(WHOAMI, Frame::text(""), bearer(token))
            .await
            .unwrap();
        assert_eq!(reply.as_str(), Some(role));
    }
}

#[tokio::test]
async fn bypassed_method_needs_no_metadata() {
    let conn = secured_connection();
    assert!(conn.metadata().is_empty());
    let reply = conn
        .unary(HEALTH, Frame::text("ok"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.as_str(), Some("ok"));
}

#[tokio::test]
async fn role_guard_denies_insufficient_role() {
    let conn = secured_connection();
    let err = conn
        .unary(ECHO, Frame::text("x"), bearer(VIEWER_TOKEN))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert!(
        conn.unary(ECHO, Frame::text("x"), bearer(ADMIN_TOKEN))
            .await
            .is_ok()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_creates_never_lose_updates() {
    const N: usize = 500;
    let store: Arc<RwLock<BTreeMap<u64, String>>> = Arc::default();

    let mut registry = Registry::new();
    let handler_store = Arc::clone(&store);
    registry
        .unary("/demo.Store/Create", move |_ctx, frame: Frame| {
            let store = Arc::clone(&handler_store);
            async move {
                let name = frame.as_str().unwrap_or_default().to_string();
                let id = {
                    let mut entries = store.write();
                    let id = entries.len() as u64 + 1;
                    entries.insert(id, name);
                    id
                };
                Ok::<_, Status>(Frame::text(id.to_string()))
            }
        })
        .unwrap();
    let conn = Dispatcher::builder()
        .registry(registry)
        .build()
        .unwrap()
        .connect();

    let calls = (0..N).map(|i| {
        let conn = conn.clone();
        async move {
            conn.unary(
                "/demo.Store/Create",
                Frame::text(format!("item-{i}")),
                CallOptions::new(),
            )
            .await
        }
    });
    let ids: HashSet<String> = join_all(calls)
        .await
        .into_iter()
        .map(|reply| reply.unwrap().as_str().unwrap().to_string())
        .collect();

    assert_eq!(ids.len(), N);
    let entries = store.read();
    assert_eq!(entries.len(), N);
    let names: HashSet<&String> = entries.values().collect();
    assert_eq!(names.len(), N);
}

type ParkReport = (Result<Option<Frame>, ChannelError>, Result<(), ChannelError>);

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn cancellation_unblocks_only_the_cancelled_call() {
    let (report_tx, report_rx) = oneshot::channel::<ParkReport>();
    let report_tx = Arc::new(Mutex::new(Some(report_tx)));

    let mut registry = demo_registry();
    registry
        .bidi_streaming("/demo.Park/Open", move |_ctx, mut inbound, mut outbound| {
            let report = report_tx.lock().take();
            async move {
                let report = report.ok_or_else(|| Status::internal("Parked twice"))?;
                // Outlives the handler, which is dropped on cancellation.
                tokio::spawn(async move {
                    if let Ok(Some(frame)) = inbound.receive().await {
                        let _ = outbound.send(frame);
                    }
                    let pending = inbound.receive().await;
                    let late = outbound.send(Frame::text("late"));
                    let _ = report.send((pending, late));
                });
                futures::future::pending::<()>().await;
                Ok::<_, Status>(())
            }
        })
        .unwrap();
    let conn = Dispatcher::builder()
        .registry(registry)
        .build()
        .unwrap()
        .connect();

    let mut other = conn.bidi_streaming(ECHO_STREAM, CallOptions::new());
    let mut parked = conn.bidi_streaming("/demo.Park/Open", CallOptions::new());
    parked.send(Frame::text("ping")).unwrap();
    assert_eq!(parked.receive().await.unwrap().unwrap().as_str(), Some("ping"));

    let token = parked.cancellation_token();
    let waiter = tokio::spawn(async move {
        let received = parked.receive().await;
        (received, parked)
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    let (received, mut parked) = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("caller receive unblocked")
        .unwrap();
    assert_eq!(received.unwrap_err().code(), Code::Cancelled);
    assert_eq!(
        parked.send(Frame::text("again")).unwrap_err().code(),
        Code::Cancelled
    );

    let (pending, late) = tokio::time::timeout(Duration::from_secs(1), report_rx)
        .await
        .expect("handler receive unblocked")
        .unwrap();
    assert_eq!(pending, Err(ChannelError::Cancelled));
    assert_eq!(late, Err(ChannelError::Cancelled));

    // The neighbour call is untouched.
    other.send(Frame::text("still here")).unwrap();
    let reply = other.receive().await.unwrap().unwrap();
    assert_eq!(reply.as_str(), Some("echo: still here"));
    other.close_send();
    assert!(other.receive().await.unwrap().is_none());
    assert!(
        conn.unary(ECHO, Frame::text("ok"), CallOptions::new())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn deadline_ends_the_call() {
    let conn = plain_connection();
    let mut call = conn.bidi_streaming(HOLD, CallOptions::new().with_timeout(Duration::from_millis(30)));
    let err = call.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(
        call.send(Frame::text("late")).unwrap_err().code(),
        Code::DeadlineExceeded
    );
}

#[tokio::test]
async fn unary_receive_withholds_a_response_the_call_then_failed() {
    let conn = scripted_connection(1, Err(Status::not_found("gone")));
    let mut call = conn.open(ECHO, Pattern::Unary, CallOptions::new());
    call.send(Frame::text("ping")).unwrap();
    call.close_send();
    assert_eq!(call.receive().await.unwrap_err().code(), Code::NotFound);
    assert_eq!(call.receive().await.unwrap_err().code(), Code::NotFound);

    let conn = scripted_connection(1, Ok(()));
    let mut call = conn.open(ECHO, Pattern::Unary, CallOptions::new());
    call.send(Frame::text("ping")).unwrap();
    call.close_send();
    assert_eq!(call.receive().await.unwrap().unwrap().as_str(), Some("0"));
    assert!(call.receive().await.unwrap().is_none());
}

/// A server-stream handler whose sender lives on in a detached task that
/// never looks at the call's cancellation.
fn leaky_connection() -> Connection {
    let mut registry = Registry::new();
    registry
        .server_streaming(
            "/demo.Leak/Watch",
            |_ctx: CallContext, _request: Frame, mut out: FrameSender| async move {
                out.send(Frame::text("first"))?;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(out);
                });
                futures::future::pending::<()>().await;
                Ok::<_, Status>(())
            },
        )
        .unwrap();
    Dispatcher::builder()
        .registry(registry)
        .build()
        .unwrap()
        .connect()
}

#[tokio::test]
async fn caller_receive_ends_on_cancel_despite_a_leaked_sender() {
    let conn = leaky_connection();
    let mut call = conn
        .server_streaming("/demo.Leak/Watch", Frame::text(""), CallOptions::new())
        .unwrap();
    assert_eq!(call.receive().await.unwrap().unwrap().as_str(), Some("first"));

    let token = call.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let err = tokio::time::timeout(Duration::from_millis(500), call.receive())
        .await
        .expect("caller receive unblocked")
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
}

#[tokio::test]
async fn caller_receive_ends_at_the_deadline_despite_a_leaked_sender() {
    let conn = leaky_connection();
    let mut call = conn
        .server_streaming(
            "/demo.Leak/Watch",
            Frame::text(""),
            CallOptions::new().with_timeout(Duration::from_millis(30)),
        )
        .unwrap();
    assert_eq!(call.receive().await.unwrap().unwrap().as_str(), Some("first"));
    let err = tokio::time::timeout(Duration::from_millis(500), call.receive())
        .await
        .expect("caller receive unblocked")
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn caller_receive_ends_at_the_deadline_while_the_handler_waits() {
    let conn = plain_connection();
    let mut call = conn.bidi_streaming(HOLD, CallOptions::new().with_timeout(Duration::from_millis(30)));
    let err = tokio::time::timeout(Duration::from_millis(500), call.receive())
        .await
        .expect("caller receive unblocked")
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn dropping_the_handle_cancels_the_call() {
    let dispatcher = Dispatcher::builder()
        .registry(demo_registry())
        .build()
        .unwrap();
    let call = dispatcher.connect().bidi_streaming(HOLD, CallOptions::new());
    assert_eq!(dispatcher.inflight(), 1);
    drop(call);
    tokio::time::timeout(Duration::from_secs(1), async {
        while dispatcher.inflight() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("dropped call settled");
}

fn tracer(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> impl crate::Interceptor {
    let log = Arc::clone(log);
    from_fn(name, move |ctx: CallContext, io: CallIo, next: Next| {
        let log = Arc::clone(&log);
        async move {
            log.lock().push(format!("{name}>"));
            let outcome = next.proceed(ctx, io).await;
            log.lock().push(format!("<{name}"));
            outcome
        }
    })
}

#[tokio::test]
async fn interceptors_run_in_declaration_order() {
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let handler_log = Arc::clone(&log);

    let mut registry = Registry::new();
    registry
        .unary(ECHO, move |_ctx, frame: Frame| {
            handler_log.lock().push("handler".to_string());
            async move { Ok::<_, Status>(frame) }
        })
        .unwrap();
    let chain = Chain::new()
        .with(tracer(&log, "outer"))
        .with(tracer(&log, "inner"));
    assert_eq!(chain.names().collect::<Vec<_>>(), ["outer", "inner"]);

    let conn = Dispatcher::builder()
        .registry(registry)
        .chain(chain)
        .build()
        .unwrap()
        .connect();
    conn.unary(ECHO, Frame::text("x"), CallOptions::new())
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        ["outer>", "inner>", "handler", "<inner", "<outer"]
    );
}

#[tokio::test]
async fn interceptor_can_short_circuit() {
    let reached = Arc::new(AtomicBool::new(false));
    let handler_reached = Arc::clone(&reached);

    let mut registry = Registry::new();
    registry
        .unary(ECHO, move |_ctx, frame: Frame| {
            handler_reached.store(true, Ordering::SeqCst);
            async move { Ok::<_, Status>(frame) }
        })
        .unwrap();
    let gate = from_fn("gate", |_ctx, _io, _next| async {
        Err::<(), _>(Status::permission_denied("Closed for maintenance"))
    });

    let conn = Dispatcher::builder()
        .registry(registry)
        .interceptor(gate)
        .build()
        .unwrap()
        .connect();
    let err = conn
        .unary(ECHO, Frame::text("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert!(!reached.load(Ordering::SeqCst));
}

#[derive(Debug, PartialEq, Eq)]
struct Tenant(&'static str);

#[tokio::test]
async fn injected_values_reach_the_handler() {
    let mut registry = Registry::new();
    registry
        .unary(ECHO, |ctx: CallContext, _frame| async move {
            let tenant = ctx
                .extensions()
                .get::<Tenant>()
                .ok_or_else(|| Status::internal("No tenant"))?;
            Ok::<_, Status>(Frame::text(tenant.0))
        })
        .unwrap();
    let inject = from_fn("tenant", |mut ctx: CallContext, io, next: Next| async move {
        ctx.extensions_mut()
            .insert(Tenant("acme"))
            .map_err(|_| Status::internal("Tenant already set"))?;
        next.proceed(ctx, io).await
    });

    let conn = Dispatcher::builder()
        .registry(registry)
        .interceptor(inject)
        .build()
        .unwrap()
        .connect();
    let reply = conn
        .unary(ECHO, Frame::text(""), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.as_str(), Some("acme"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn panics_become_internal_and_spare_other_calls() {
    for chain in [Chain::new().with(Recovery), Chain::new()] {
        let mut registry = demo_registry();
        registry.unary("/demo.Boom/Explode", explode).unwrap();
        let conn = Dispatcher::builder()
            .registry(registry)
            .chain(chain)
            .build()
            .unwrap()
            .connect();

        let mut neighbour = conn.bidi_streaming(ECHO_STREAM, CallOptions::new());
        let err = conn
            .unary("/demo.Boom/Explode", Frame::text(""), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        neighbour.send(Frame::text("alive")).unwrap();
        let reply = neighbour.receive().await.unwrap().unwrap();
        assert_eq!(reply.as_str(), Some("echo: alive"));
        neighbour.close_send();
        neighbour.finish().await.unwrap();
    }
}

#[tokio::test]
async fn logging_tags_calls_with_their_id() {
    let conn = plain_connection();
    let mut call = conn.open(ECHO, Pattern::Unary, CallOptions::new());
    call.send(Frame::text("x")).unwrap();
    call.close_and_receive().await.unwrap();
    assert_eq!(call.headers().get(CALL_ID), Some(call.id().to_string().as_str()));
}

#[tokio::test]
async fn refused_calls_report_dispatch_errors() {
    let conn = plain_connection();

    let err = conn
        .unary("/demo.Missing/Call", Frame::text(""), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    // The request itself arrived after the terminal status.
    assert!(err.metadata().contains_key(VIOLATION_KEY));

    let mut call = conn.open(ECHO, Pattern::BidiStream, CallOptions::new());
    let err = call.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::ProtocolViolation);
}

#[tokio::test]
async fn connection_metadata_reaches_handlers() {
    let mut registry = Registry::new();
    registry
        .unary(ECHO, |ctx: CallContext, _frame| async move {
            let peer = ctx.peer().unwrap_or("unknown").to_string();
            let trace = ctx.metadata().get("x-trace").unwrap_or("none").to_string();
            Ok::<_, Status>(Frame::text(format!("{peer}/{trace}")))
        })
        .unwrap();
    let conn = Dispatcher::builder()
        .registry(registry)
        .build()
        .unwrap()
        .connect()
        .with_metadata("X-Forwarded-For", "10.0.0.7");

    let reply = conn
        .unary(ECHO, Frame::text(""), CallOptions::new().with_metadata("x-trace", "t1"))
        .await
        .unwrap();
    assert_eq!(reply.as_str(), Some("10.0.0.7/t1"));

    let mut expected = Metadata::new();
    expected.insert("x-forwarded-for", "10.0.0.7");
    assert_eq!(conn.metadata(), &expected);
}
