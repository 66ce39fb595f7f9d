use crate::{
    decoder::OwnedPayload,
    encoder::SessionEvent,
    frame::SessionId,
    queue::{LaneResults, LaneSubmitter, QueueError},
    server::SharedState,
    session::{Registration, SessionHandle},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use serde_json::json;
use std::{fmt::Display, time::Duration};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Room for base64 expansion and the data-URI prefix of text frames.
const MESSAGE_OVERHEAD: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to read from socket: {0}")]
    Receive(axum::Error),
    #[error("failed to write to socket: {0}")]
    Send(String),
    #[error("send loop ended abnormally: {0}")]
    SendLoop(#[from] tokio::task::JoinError),
}

pub async fn stream_with_id(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<SharedState>,
) -> Response {
    accept(ws, SessionId::new(client_id), state)
}

pub async fn stream_with_generated_id(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> Response {
    accept(ws, SessionId::generate(), state)
}

/// Registers the session before upgrading so duplicate ids are refused with a
/// plain HTTP response.
fn accept(ws: WebSocketUpgrade, id: SessionId, state: SharedState) -> Response {
    let registration = match state.sessions.register(id.clone()) {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!(session_id = %id, "refusing connection: {}", e);
            let body = json!({ "error": "conflict", "message": e.to_string() });
            return (StatusCode::CONFLICT, Json(body)).into_response();
        }
    };

    let max_message_size = state
        .decoder
        .max_payload_bytes()
        .saturating_mul(4)
        .div_ceil(3)
        .saturating_add(MESSAGE_OVERHEAD);

    let sessions = state.sessions.clone();
    let failed = registration.handle.clone();

    ws.max_message_size(max_message_size)
        .on_failed_upgrade(move |e| {
            tracing::warn!(session_id = %failed.id(), "websocket upgrade failed: {}", e);
            sessions.finish_close(&failed);
        })
        .on_upgrade(move |socket| run_session(socket, registration, state))
}

#[instrument(skip_all, fields(session_id = %registration.handle.id()))]
async fn run_session(socket: WebSocket, registration: Registration, state: SharedState) {
    let Registration {
        handle,
        outbound,
        closing,
    } = registration;

    let (ws_tx, mut ws_rx) = socket.split();
    let mut send_loop: JoinHandle<Result<(), TransportError>> =
        tokio::spawn(send_loop(ws_tx, outbound, closing.clone()));

    let (submitter, results) = state.queue.open_lane(handle.id().clone()).split();
    tokio::spawn(forward_results(results, state.clone(), handle.clone()));

    if let Err(e) = state.sessions.open(&handle) {
        tracing::warn!("session could not be opened: {}", e);
    }

    let mut send_finished = false;
    loop {
        tokio::select! {
            _ = closing.cancelled() => {
                tracing::debug!("session closing, no longer reading");
                break;
            }
            outcome = &mut send_loop => {
                send_finished = true;
                log_send_outcome(outcome);
                break;
            }
            message = ws_rx.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    submit_frame(&state, &handle, &submitter, OwnedPayload::Binary(data)).await;
                }
                Some(Ok(Message::Text(text))) => {
                    let payload = OwnedPayload::Text(text.as_str().to_owned());
                    submit_frame(&state, &handle, &submitter, payload).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("peer closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("{}", TransportError::Receive(e));
                    break;
                }
            }
        }
    }

    state.sessions.begin_close(&handle);
    // In-flight frames still complete; their results are dropped by the session manager.
    drop(submitter);

    if !send_finished {
        let grace = Duration::from_millis(state.session_config.close_grace_ms);
        match tokio::time::timeout(grace, &mut send_loop).await {
            Ok(outcome) => log_send_outcome(outcome),
            Err(_) => {
                tracing::warn!(?grace, "outbound queue not drained in time, abandoning it");
                send_loop.abort();
            }
        }
    }

    state.sessions.finish_close(&handle);
}

async fn submit_frame(
    state: &SharedState,
    handle: &SessionHandle,
    submitter: &LaneSubmitter,
    payload: OwnedPayload,
) {
    let id = handle.id();

    let frame = match state.decoder.decode_blocking(id.clone(), payload).await {
        Ok(frame) => frame,
        Err(e) => {
            state.metrics.record_rejection("decode");
            tracing::info!(session_id = %id, "frame rejected: {}", e);
            report_error(state, handle, "decode", e.to_string());
            return;
        }
    };

    let archived = state.archive.as_ref().map(|archive| (archive, frame.clone()));

    match submitter.submit(frame).await {
        Ok(ticket) => {
            state.metrics.record_submission("ocr_ws");
            if let Some((archive, frame)) = archived {
                archive.spawn_save(&frame);
            }
            tracing::debug!(
                session_id = %id,
                frame_id = %ticket.frame_id,
                sequence = ticket.sequence,
                "frame accepted"
            );
        }
        Err(e) => {
            let kind = match e {
                QueueError::Backpressure { .. } => "backpressure",
                _ => "queue",
            };
            state.metrics.record_rejection(kind);
            tracing::info!(session_id = %id, "frame rejected: {}", e);
            report_error(state, handle, kind, e.to_string());
        }
    }
}

fn report_error(state: &SharedState, handle: &SessionHandle, kind: &str, message: String) {
    match (SessionEvent::Error { kind, message }).to_json() {
        Ok(json) => {
            // Already logged by the session manager when dropped.
            let _ = state.sessions.notify(handle, json);
        }
        Err(e) => tracing::warn!("failed to serialize error event: {}", e),
    }
}

/// Encodes results in submission order and queues them on the connection
/// that submitted the frames.
async fn forward_results(mut results: LaneResults, state: SharedState, handle: SessionHandle) {
    let id = handle.id();

    while let Some(result) = results.next().await {
        let frame_id = result.id;
        let sequence = result.sequence;

        let encoder = state.encoder.clone();
        let message = match tokio::task::spawn_blocking(move || encoder.encode_stream(&result)).await
        {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::error!(session_id = %id, %frame_id, "failed to encode result: {}", e);
                report_error(&state, &handle, "encode", e.to_string());
                continue;
            }
            Err(e) => {
                tracing::error!(session_id = %id, %frame_id, "encoder task failed: {}", e);
                continue;
            }
        };

        if let Err(e) = state.sessions.send(&handle, message).await {
            tracing::debug!(session_id = %id, %frame_id, sequence, "result discarded: {}", e);
        }
    }

    tracing::debug!(session_id = %id, "result stream finished");
}

/// Writes the outbound queue to the socket. Once `closing` fires, whatever is
/// already queued is flushed and a close frame ends the connection.
async fn send_loop<S>(
    mut ws_tx: S,
    mut outbound: mpsc::Receiver<String>,
    closing: CancellationToken,
) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let send_err = |e: S::Error| TransportError::Send(e.to_string());

    loop {
        tokio::select! {
            biased;
            item = outbound.recv() => match item {
                Some(text) => ws_tx.send(Message::Text(text.into())).await.map_err(send_err)?,
                None => break,
            },
            _ = closing.cancelled() => {
                while let Ok(text) = outbound.try_recv() {
                    ws_tx.send(Message::Text(text.into())).await.map_err(send_err)?;
                }
                break;
            }
        }
    }

    // The peer may already have closed its side.
    let _ = ws_tx.send(Message::Close(None)).await;
    Ok(())
}

fn log_send_outcome(outcome: Result<Result<(), TransportError>, tokio::task::JoinError>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("{}", e),
        Err(e) => tracing::warn!("{}", TransportError::from(e)),
    }
}
