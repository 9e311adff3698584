use std::collections::VecDeque;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{sink::SinkExt, stream::SplitSink, StreamExt};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{
    scope::MemoryScope,
    storage::types::{analytics::Analytics, session::SessionRecord},
};
use engine::{ThinkChunk, TurnRequest};

use crate::{
    messages::{ClientFrame, ScopePayload, ServerFrame},
    state::WsState,
};

/// A turn currently executing for this session.
struct TurnHandle {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Per-connection state. Owned by the receive loop; at most one turn is in
/// flight at any time.
struct SessionCtx {
    scope: Option<MemoryScope>,
    pending_division: Option<String>,
    queued: VecDeque<(String, Option<String>)>,
    turn: Option<TurnHandle>,
    turn_count: u64,
    connected_at: Instant,
}

/// Drive one WebSocket connection: a bounded send channel plus a send task,
/// a receive loop that owns the session state, and per-turn tasks feeding
/// the channel. Disconnect cancels everything via the connection token.
pub async fn handle_socket(socket: WebSocket, session_id: String, state: WsState) {
    info!(%session_id, "websocket connected");

    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerFrame>(state.transport.send_buffer);
    let connection_cancel = CancellationToken::new();

    let send_task = tokio::spawn(send_loop(ws_sender, rx));

    let _ = tx.send(ServerFrame::Connected).await;

    let mut ctx = SessionCtx {
        scope: None,
        pending_division: None,
        queued: VecDeque::new(),
        turn: None,
        turn_count: 0,
        connected_at: Instant::now(),
    };

    loop {
        tokio::select! {
            () = connection_cancel.cancelled() => break,

            // Reap a finished turn: analytics out, deferred division in,
            // queued message (if any) started.
            () = async {
                match ctx.turn.as_mut() {
                    Some(turn) => { let _ = (&mut turn.handle).await; }
                    None => std::future::pending().await,
                }
            }, if ctx.turn.is_some() => {
                finish_turn(&mut ctx, &tx).await;
                if let Some((content, division)) = ctx.queued.pop_front() {
                    start_queued_or_reject(&mut ctx, &state, &tx, &connection_cancel, &session_id, content, division).await;
                }
            }

            incoming = ws_receiver.next() => {
                let frame = match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                debug!(%session_id, error = %err, "malformed frame");
                                let _ = tx
                                    .send(ServerFrame::Error {
                                        code: "bad_request".into(),
                                        message: "malformed frame".into(),
                                    })
                                    .await;
                                continue;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(%session_id, error = %err, "websocket receive error");
                        break;
                    }
                };

                if !handle_frame(&mut ctx, &state, &tx, &connection_cancel, &session_id, frame).await {
                    break;
                }
            }
        }
    }

    // Disconnect: the active turn's context fires and every in-flight
    // upstream call unwinds.
    connection_cancel.cancel();
    drop(tx);
    let _ = send_task.await;
    info!(%session_id, "websocket closed");
}

/// Dispatch one client frame. Returns false when the connection must close.
async fn handle_frame(
    ctx: &mut SessionCtx,
    state: &WsState,
    tx: &mpsc::Sender<ServerFrame>,
    connection_cancel: &CancellationToken,
    session_id: &str,
    frame: ClientFrame,
) -> bool {
    // A turn that already ran to completion but has not been reaped by the
    // select arm yet counts as finished here.
    if ctx
        .turn
        .as_ref()
        .is_some_and(|turn| turn.handle.is_finished())
    {
        finish_turn(ctx, tx).await;
    }
    let turn_active = ctx.turn.is_some();

    match frame {
        ClientFrame::Ping => {
            let _ = tx.send(ServerFrame::Pong).await;
            true
        }

        ClientFrame::Verify { credential } => {
            if turn_active {
                let _ = tx
                    .send(ServerFrame::Error {
                        code: "bad_request".into(),
                        message: "cannot change scope while a turn is in flight".into(),
                    })
                    .await;
                return true;
            }
            match state.resolver.resolve(&credential).await {
                Ok(scope) => {
                    if !scope.is_empty() {
                        if let Err(err) = SessionRecord::ensure(session_id, &scope, &state.db).await
                        {
                            warn!(error = %err, "session record upsert failed");
                        }
                        if let Err(err) = Analytics::record_session(&state.db).await {
                            debug!(error = %err, "analytics session count failed");
                        }
                    }
                    let _ = tx
                        .send(ServerFrame::Verified {
                            scope: ScopePayload::from(&scope),
                        })
                        .await;
                    ctx.scope = Some(scope);
                    true
                }
                Err(err) => {
                    warn!(error = %err, "credential resolution failed");
                    let _ = tx
                        .send(ServerFrame::Error {
                            code: "unauthorized".into(),
                            message: "credential could not be resolved".into(),
                        })
                        .await;
                    true
                }
            }
        }

        ClientFrame::SetDivision { division } => {
            if ctx.scope.is_none() {
                let _ = tx
                    .send(ServerFrame::Error {
                        code: "unauthorized".into(),
                        message: "verify before changing division".into(),
                    })
                    .await;
                return true;
            }
            if turn_active {
                // Applied atomically between turns.
                ctx.pending_division = Some(division);
                return true;
            }
            apply_division(ctx, tx, division).await;
            true
        }

        ClientFrame::Message { content, division } => {
            let Some(scope) = ctx.scope.clone().filter(|scope| !scope.is_empty()) else {
                // Fail-secure: no retrieval, no ingest, and the connection
                // does not stay open without scope.
                let _ = tx
                    .send(ServerFrame::Error {
                        code: "unauthorized".into(),
                        message: "verify_required".into(),
                    })
                    .await;
                return false;
            };

            if turn_active {
                if state.transport.queue_turns {
                    ctx.queued.push_back((content, division));
                } else {
                    let _ = tx
                        .send(ServerFrame::Error {
                            code: "turn_in_flight".into(),
                            message: "a turn is already in flight for this session".into(),
                        })
                        .await;
                }
                return true;
            }

            start_turn(ctx, state, tx, connection_cancel, session_id, scope, content, division);
            true
        }
    }
}

/// Turn bookkeeping once the task has ended.
async fn finish_turn(ctx: &mut SessionCtx, tx: &mpsc::Sender<ServerFrame>) {
    if ctx.turn.take().is_none() {
        return;
    }
    ctx.turn_count += 1;

    if let Some(division) = ctx.pending_division.take() {
        apply_division(ctx, tx, division).await;
    }

    let _ = tx
        .send(ServerFrame::SessionAnalytics {
            session_duration_ms: ctx.connected_at.elapsed().as_millis() as u64,
            turn_count: ctx.turn_count,
        })
        .await;
}

async fn apply_division(ctx: &mut SessionCtx, tx: &mpsc::Sender<ServerFrame>, division: String) {
    if let Some(scope) = ctx.scope.as_mut() {
        scope.departments = vec![division];
        let _ = tx
            .send(ServerFrame::Verified {
                scope: ScopePayload::from(&*scope),
            })
            .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_queued_or_reject(
    ctx: &mut SessionCtx,
    state: &WsState,
    tx: &mpsc::Sender<ServerFrame>,
    connection_cancel: &CancellationToken,
    session_id: &str,
    content: String,
    division: Option<String>,
) {
    let Some(scope) = ctx.scope.clone().filter(|scope| !scope.is_empty()) else {
        ctx.queued.clear();
        return;
    };
    start_turn(ctx, state, tx, connection_cancel, session_id, scope, content, division);
}

/// Spawn the turn task. The turn's cancellation token is a child of the
/// connection token, so disconnect propagates without extra wiring.
#[allow(clippy::too_many_arguments)]
fn start_turn(
    ctx: &mut SessionCtx,
    state: &WsState,
    tx: &mpsc::Sender<ServerFrame>,
    connection_cancel: &CancellationToken,
    session_id: &str,
    mut scope: MemoryScope,
    content: String,
    division: Option<String>,
) {
    if let Some(division) = division {
        scope.departments = vec![division];
    }

    let cancel = connection_cancel.child_token();
    let handle = tokio::spawn(run_turn(
        state.clone(),
        tx.clone(),
        connection_cancel.clone(),
        session_id.to_string(),
        scope,
        content,
        cancel.clone(),
    ));
    ctx.turn = Some(TurnHandle { cancel, handle });
}

/// Pump one think stream into the send channel, enforcing the turn deadline
/// and the slow-consumer policy.
async fn run_turn(
    state: WsState,
    tx: mpsc::Sender<ServerFrame>,
    connection_cancel: CancellationToken,
    session_id: String,
    scope: MemoryScope,
    content: String,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + state.transport.turn_deadline;

    let twin = match state.registry.twin_for(scope.tenant_id.as_deref()).await {
        Ok(twin) => twin,
        Err(err) => {
            warn!(error = %err, "twin resolution failed");
            let _ = tx
                .send(ServerFrame::Error {
                    code: "internal".into(),
                    message: "engine unavailable".into(),
                })
                .await;
            let _ = send_done(&tx).await;
            return;
        }
    };

    let request = TurnRequest {
        session_id,
        input: content,
        scope,
        cancel: cancel.clone(),
    };
    let mut chunks = match twin.think(request).await {
        Ok(chunks) => chunks,
        Err(err) => {
            let _ = tx
                .send(ServerFrame::Error {
                    code: err.wire_code().into(),
                    message: err.to_string(),
                })
                .await;
            let _ = send_done(&tx).await;
            return;
        }
    };

    let mut deadline_hit = false;
    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                let frame = match chunk {
                    None => break,
                    Some(ThinkChunk::Content(content)) => ServerFrame::StreamChunk {
                        content,
                        done: false,
                    },
                    Some(ThinkChunk::Meta(meta)) => ServerFrame::CognitiveState {
                        phase: meta.phase,
                        tools_used: meta.tools_used,
                    },
                    Some(ThinkChunk::Error { code, message }) => ServerFrame::Error {
                        code: code.into(),
                        message,
                    },
                };

                match tx.send_timeout(frame, state.transport.send_timeout).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        // Slow consumer: drop the whole connection.
                        warn!("send buffer saturated, closing connection");
                        cancel.cancel();
                        connection_cancel.cancel();
                        return;
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        cancel.cancel();
                        return;
                    }
                }
            }

            () = tokio::time::sleep_until(deadline), if !deadline_hit => {
                deadline_hit = true;
                cancel.cancel();
                let _ = tx
                    .send(ServerFrame::Error {
                        code: "deadline".into(),
                        message: "turn deadline exceeded".into(),
                    })
                    .await;
                // Keep draining: the engine unwinds and ingests the partial
                // exchange before closing its channel.
            }
        }
    }

    let _ = send_done(&tx).await;
}

/// The stream always terminates with an empty `done` chunk while the
/// connection lives.
async fn send_done(tx: &mpsc::Sender<ServerFrame>) -> Result<(), ()> {
    tx.send(ServerFrame::StreamChunk {
        content: String::new(),
        done: true,
    })
    .await
    .map_err(|_| ())
}

/// Serialize frames onto the socket until the channel closes.
async fn send_loop(
    mut sender: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "frame serialization failed");
                continue;
            }
        };
        if sender.send(WsMessage::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = sender.close().await;
}
