//! WebSocket connection driver: handles one client from upgrade through
//! disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::{ConnectionId, JoinRequest, RelayError, ServerEnvelope};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::directory::{Admission, DepartReason};
use crate::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{
    RELAY_HEARTBEAT_TIMEOUTS_TOTAL, RELAY_JOIN_REJECTIONS_TOTAL, RELAY_JOINS_TOTAL,
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
};
use crate::router::{MessageRouter, RouteOutcome};
use crate::server::AppState;
use crate::session::{Lifecycle, Outbound, Session, SessionState};

/// How long a departed connection's writer gets to send its close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// A decoded inbound WebSocket message.
enum Frame {
    Text(String),
    NotUtf8,
    Control,
    Close,
}

fn decode(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => String::from_utf8(data.to_vec()).map_or(Frame::NotUtf8, Frame::Text),
        Message::Ping(_) | Message::Pong(_) => Frame::Control,
        Message::Close(_) => Frame::Close,
    }
}

/// How the writer task ended.
#[derive(Debug, PartialEq, Eq)]
enum WriterExit {
    Closed,
    Failed,
}

/// Run a WebSocket connection.
///
/// 1. Waits for the join request under the join deadline
/// 2. Admits the connection through the room directory, or sends one
///    `error` envelope and closes
/// 3. Routes inbound frames while a writer task drains the outbound queue
///    and the heartbeat probes liveness
/// 4. Departs exactly once, whichever way the session ends
#[instrument(
    skip_all,
    fields(conn_id = %id, peer = %peer, room = tracing::field::Empty, username = tracing::field::Empty)
)]
pub async fn run_connection(mut socket: WebSocket, id: ConnectionId, peer: SocketAddr, state: AppState) {
    let started = std::time::Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    debug!("connection upgraded");

    let lifecycle = Arc::new(Lifecycle::new());
    let join_timeout = state.config.join_timeout;

    let first = time::timeout(join_timeout, next_join_frame(&mut socket)).await;
    match first {
        Err(_) => {
            let _ = lifecycle.advance(SessionState::Closed);
            let err = RelayError::HandshakeTimeout(join_timeout);
            warn!(error = %err, "closing connection");
            close_socket(&mut socket, state.config.write_timeout).await;
        }
        Ok(None) => {
            let _ = lifecycle.advance(SessionState::Closed);
            debug!("connection closed before joining");
        }
        Ok(Some(raw)) => {
            let _ = lifecycle.advance(SessionState::Joining);
            admit(socket, raw, id, peer, lifecycle, &state).await;
        }
    }

    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// Read frames until the first text (or UTF-8 binary) frame.
async fn next_join_frame(socket: &mut WebSocket) -> Option<Result<String, RelayError>> {
    while let Some(Ok(msg)) = socket.recv().await {
        match decode(msg) {
            Frame::Text(text) => return Some(Ok(text)),
            Frame::NotUtf8 => {
                return Some(Err(RelayError::InvalidJoin("binary frame is not UTF-8".into())));
            }
            Frame::Control => {}
            Frame::Close => return None,
        }
    }
    None
}

async fn admit(
    mut socket: WebSocket,
    raw: Result<String, RelayError>,
    id: ConnectionId,
    peer: SocketAddr,
    lifecycle: Arc<Lifecycle>,
    state: &AppState,
) {
    let request = match raw.and_then(|raw| JoinRequest::parse(&raw)) {
        Ok(request) => request,
        Err(err) => {
            reject(&mut socket, &lifecycle, &err, state.config.write_timeout).await;
            return;
        }
    };

    let span = tracing::Span::current();
    let _ = span.record("room", request.room.as_str());
    let _ = span.record("username", request.username.as_str());

    let allow_create = request.create || state.config.implicit_create;
    let (tx, rx) = mpsc::channel(state.config.outbound_capacity());
    let admission = Admission {
        id,
        peer: Some(peer),
        outbound: tx,
        lifecycle: Arc::clone(&lifecycle),
    };

    let outcome = match state
        .directory
        .join_or_create(admission, &request.room, &request.username, allow_create)
    {
        Ok(outcome) => outcome,
        Err(err) => {
            reject(&mut socket, &lifecycle, &err, state.config.write_timeout).await;
            return;
        }
    };

    counter!(RELAY_JOINS_TOTAL).increment(1);
    info!(
        created = outcome.created_room,
        members = outcome.members.len(),
        "joined room"
    );

    run_session(socket, outcome.session, rx, state).await;
}

/// Send the rejection envelope, then close.
async fn reject(socket: &mut WebSocket, lifecycle: &Lifecycle, err: &RelayError, write_timeout: Duration) {
    counter!(RELAY_JOIN_REJECTIONS_TOTAL, "reason" => err.kind()).increment(1);
    if err.is_join_error() {
        info!(reason = err.kind(), error = %err, "join rejected");
    } else {
        warn!(reason = err.kind(), error = %err, "join failed");
    }

    if let Some(text) = err.client_message() {
        match ServerEnvelope::Error(text.to_owned()).to_json() {
            Ok(json) => {
                let _ = time::timeout(write_timeout, socket.send(Message::Text(json.into()))).await;
            }
            Err(e) => warn!(error = %e, "failed to serialize error envelope"),
        }
    }
    close_socket(socket, write_timeout).await;
    let _ = lifecycle.advance(SessionState::Closed);
}

async fn close_socket(socket: &mut WebSocket, write_timeout: Duration) {
    let frame = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(""),
    }));
    let _ = time::timeout(write_timeout, socket.send(frame)).await;
}

async fn run_session(
    socket: WebSocket,
    session: Arc<Session>,
    outbound: mpsc::Receiver<Outbound>,
    state: &AppState,
) {
    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        session.closed_token(),
        state.config.write_timeout,
    ));
    let mut writer_done = false;

    let heartbeat = run_heartbeat(
        Arc::clone(&session),
        state.config.heartbeat_interval,
        state.config.heartbeat_timeout,
        session.closed_token(),
    );
    let shutdown = state.shutdown.token();

    let reason = tokio::select! {
        reason = read_loop(stream, &session, &state.router) => reason,
        result = heartbeat => match result {
            HeartbeatResult::TimedOut => {
                counter!(RELAY_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                let err = RelayError::LivenessTimeout(state.config.heartbeat_timeout);
                warn!(error = %err, "heartbeat timed out");
                DepartReason::LivenessTimeout
            }
            HeartbeatResult::Cancelled => DepartReason::Evicted,
        },
        exit = &mut writer => {
            writer_done = true;
            match exit {
                Ok(WriterExit::Closed) => DepartReason::Evicted,
                Ok(WriterExit::Failed) | Err(_) => DepartReason::WriteFailed,
            }
        },
        () = shutdown.cancelled() => DepartReason::Shutdown,
    };

    let departed = state.directory.depart(&session, reason);
    info!(
        reason = reason.as_str(),
        departed,
        age_secs = session.age().as_secs(),
        dropped_frames = session.drop_count(),
        "connection closed"
    );

    if !writer_done && time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    session: &Arc<Session>,
    router: &MessageRouter,
) -> DepartReason {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "read failed");
                return DepartReason::TransportClosed;
            }
        };
        match decode(msg) {
            Frame::Text(text) => {
                if router.route(session, &text) == RouteOutcome::Leave {
                    return DepartReason::Leave;
                }
            }
            Frame::NotUtf8 => {
                session.touch();
                warn!("skipping non-UTF-8 binary frame");
            }
            Frame::Control => session.touch(),
            Frame::Close => return DepartReason::TransportClosed,
        }
    }
    DepartReason::TransportClosed
}

/// Drain the outbound queue into the socket until the session closes.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    write_timeout: Duration,
) -> WriterExit {
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => {
                let frame = Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static(""),
                }));
                let _ = time::timeout(write_timeout, sink.send(frame)).await;
                return WriterExit::Closed;
            }
            next = outbound.recv() => {
                let Some(item) = next else {
                    return WriterExit::Closed;
                };
                let msg = match item {
                    Outbound::Text(text) => Message::Text(text.to_string().into()),
                    Outbound::Ping => Message::Ping(Vec::new().into()),
                };
                match time::timeout(write_timeout, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(error = %err, "socket write failed");
                        return WriterExit::Failed;
                    }
                    Err(_) => {
                        warn!(timeout = ?write_timeout, "socket write timed out");
                        return WriterExit::Failed;
                    }
                }
            }
        }
    }
}
