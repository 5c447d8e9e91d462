//! Stream server (C8): a local Unix-domain-socket (named-pipe on Windows)
//! server that pushes live terminal frames to UI clients and accepts
//! input/resize/focus commands. Listener lifecycle grounded in the
//! teacher's `ipc::server::spawn_ipc_server` (`interprocess` + per-connection
//! task); framing is line-delimited JSON, same as the teacher.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::router::Router;
use crate::runtime::Runtime;
use crate::{AppError, Result};
use protocol::{join_window_id, split_window_id, ClientMessage, PatchOp, ServerMessage, StyledLineDto, StyledPatchOp};

const INTERNAL_TICK: Duration = Duration::from_millis(33);
const EMIT_FLOOR: Duration = Duration::from_millis(50);
/// Patches are only sent when the changed-line fraction stays at or below
/// this threshold; otherwise a full frame is cheaper to parse and render.
const PATCH_MAX_RATIO: f64 = 0.55;

/// Spawn the stream server task, listening on `socket_name` until `cancel`
/// fires.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn(
    runtime: Arc<dyn Runtime>,
    router: Arc<Router>,
    socket_name: String,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener_name = socket_name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid stream socket name '{socket_name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create stream listener: {err}")))?;

    info!(name = %socket_name, "stream server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("stream_server", name = %socket_name);
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("stream server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let runtime = Arc::clone(&runtime);
                                let router = Arc::clone(&router);
                                let cancel = cancel.clone();
                                tokio::spawn(handle_connection(stream, runtime, router, cancel));
                            }
                            Err(err) => warn!(%err, "stream accept failed"),
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

struct Subscription {
    cols: u16,
    rows: u16,
    seq: u64,
    last_plain: Vec<String>,
    last_styled: Option<Vec<StyledLineDto>>,
    last_emit: Option<Instant>,
}

async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    runtime: Arc<dyn Runtime>,
    router: Arc<Router>,
    cancel: CancellationToken,
) {
    let span = info_span!("stream_conn");
    async move {
        let (reader, writer) = tokio::io::split(stream);
        let mut buf_reader = BufReader::new(reader);
        let writer = Arc::new(Mutex::new(writer));
        let subscriptions: Arc<Mutex<HashMap<String, Subscription>>> = Arc::new(Mutex::new(HashMap::new()));

        let tick_writer = Arc::clone(&writer);
        let tick_subscriptions = Arc::clone(&subscriptions);
        let tick_runtime = Arc::clone(&runtime);
        let tick_cancel = cancel.clone();
        let tick_task = tokio::spawn(async move {
            tick_loop(tick_runtime, tick_subscriptions, tick_writer, tick_cancel).await;
        });

        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                () = cancel.cancelled() => break,
                result = buf_reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            handle_client_message(trimmed, &runtime, &router, &subscriptions, &writer).await;
                        }
                        Err(err) => {
                            warn!(%err, "stream read error");
                            break;
                        }
                    }
                }
            }
        }

        tick_task.abort();
        info!("stream connection closed");
    }
    .instrument(span)
    .await;
}

async fn handle_client_message(
    line: &str,
    runtime: &Arc<dyn Runtime>,
    router: &Arc<Router>,
    subscriptions: &Arc<Mutex<HashMap<String, Subscription>>>,
    writer: &Arc<Mutex<tokio::io::WriteHalf<interprocess::local_socket::tokio::Stream>>>,
) {
    let message = match serde_json::from_str::<ClientMessage>(line) {
        Ok(message) => message,
        Err(err) => {
            send(writer, &ServerMessage::Error { message: format!("invalid json: {err}") }).await;
            return;
        }
    };

    match message {
        ClientMessage::Hello => {
            send(writer, &ServerMessage::Hello).await;
        }
        ClientMessage::Subscribe { window_id, cols, rows } => {
            let Some((session, window)) = split_window_id(&window_id) else {
                send(writer, &ServerMessage::Error { message: format!("malformed windowId: {window_id}") }).await;
                return;
            };
            if let Err(err) = runtime.resize_window(session, window, cols, rows).await {
                send(writer, &ServerMessage::Error { message: err.to_string() }).await;
                return;
            }
            subscriptions.lock().await.insert(
                window_id,
                Subscription {
                    cols,
                    rows,
                    seq: 0,
                    last_plain: Vec::new(),
                    last_styled: None,
                    last_emit: None,
                },
            );
        }
        ClientMessage::Focus { window_id } => {
            router.notify_focus(&window_id);
            send(writer, &ServerMessage::Focus { window_id }).await;
        }
        ClientMessage::Input { window_id, bytes_base64 } => {
            let Some((session, window)) = split_window_id(&window_id) else {
                send(writer, &ServerMessage::Error { message: format!("malformed windowId: {window_id}") }).await;
                return;
            };
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(bytes_base64) else {
                send(writer, &ServerMessage::Error { message: "invalid base64 input".to_string() }).await;
                return;
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if let Err(err) = runtime.type_keys_to_window(session, window, &text, None).await {
                send(writer, &ServerMessage::Error { message: err.to_string() }).await;
            }
        }
        ClientMessage::Resize { window_id, cols, rows } => {
            let Some((session, window)) = split_window_id(&window_id) else {
                send(writer, &ServerMessage::Error { message: format!("malformed windowId: {window_id}") }).await;
                return;
            };
            if let Err(err) = runtime.resize_window(session, window, cols, rows).await {
                send(writer, &ServerMessage::Error { message: err.to_string() }).await;
                return;
            }
            if let Some(subscription) = subscriptions.lock().await.get_mut(&window_id) {
                subscription.cols = cols;
                subscription.rows = rows;
            }
        }
    }
}

async fn tick_loop(
    runtime: Arc<dyn Runtime>,
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
    writer: Arc<Mutex<tokio::io::WriteHalf<interprocess::local_socket::tokio::Stream>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(INTERNAL_TICK) => {}
        }

        let window_ids: Vec<String> = subscriptions.lock().await.keys().cloned().collect();
        for window_id in window_ids {
            emit_window_update(&runtime, &subscriptions, &writer, &window_id).await;
        }
    }
}

async fn emit_window_update(
    runtime: &Arc<dyn Runtime>,
    subscriptions: &Arc<Mutex<HashMap<String, Subscription>>>,
    writer: &Arc<Mutex<tokio::io::WriteHalf<interprocess::local_socket::tokio::Stream>>>,
    window_id: &str,
) {
    let Some((session, window)) = split_window_id(window_id) else {
        return;
    };

    match runtime.window_exists(session, window).await {
        Ok(true) => {}
        Ok(false) => {
            subscriptions.lock().await.remove(window_id);
            send(writer, &ServerMessage::WindowExit { window_id: window_id.to_string(), code: None, signal: None }).await;
            return;
        }
        Err(err) => {
            warn!(%err, %window_id, "window_exists check failed");
            return;
        }
    }

    let (cols, rows) = {
        let Some(subscription) = subscriptions.lock().await.get(window_id).map(|s| (s.cols, s.rows)) else {
            return;
        };
        subscription
    };

    let styled = runtime.get_window_frame(session, window, Some(cols), Some(rows)).await.ok().flatten();

    let mut guard = subscriptions.lock().await;
    let Some(subscription) = guard.get_mut(window_id) else {
        return;
    };

    let now = Instant::now();
    if let Some(last_emit) = subscription.last_emit {
        if now.duration_since(last_emit) < EMIT_FLOOR {
            return;
        }
    }

    if let Some(frame) = styled {
        let new_lines: Vec<StyledLineDto> = (&frame).into();
        if subscription.last_styled.as_ref() == Some(&new_lines) {
            return;
        }

        let message = match &subscription.last_styled {
            Some(previous) if previous.len() == new_lines.len() => {
                diff_styled(previous, &new_lines).map_or_else(
                    || full_styled_message(window_id, subscription.seq + 1, &new_lines, frame.cursor_row, frame.cursor_col),
                    |ops| ServerMessage::PatchStyled {
                        window_id: window_id.to_string(),
                        seq: subscription.seq + 1,
                        line_count: new_lines.len(),
                        ops,
                    },
                )
            }
            _ => full_styled_message(window_id, subscription.seq + 1, &new_lines, frame.cursor_row, frame.cursor_col),
        };

        subscription.seq += 1;
        subscription.last_styled = Some(new_lines);
        subscription.last_emit = Some(now);
        drop(guard);
        send(writer, &message).await;
    } else {
        let plain = runtime.get_window_buffer(session, window).await.unwrap_or_default();
        let new_lines: Vec<String> = plain.lines().map(ToString::to_string).collect();
        if subscription.last_plain == new_lines {
            return;
        }

        let message = if subscription.last_plain.len() == new_lines.len() {
            diff_plain(&subscription.last_plain, &new_lines).map_or_else(
                || ServerMessage::Frame { window_id: window_id.to_string(), seq: subscription.seq + 1, lines: new_lines.clone() },
                |ops| ServerMessage::Patch { window_id: window_id.to_string(), seq: subscription.seq + 1, line_count: new_lines.len(), ops },
            )
        } else {
            ServerMessage::Frame { window_id: window_id.to_string(), seq: subscription.seq + 1, lines: new_lines.clone() }
        };

        subscription.seq += 1;
        subscription.last_plain = new_lines;
        subscription.last_emit = Some(now);
        drop(guard);
        send(writer, &message).await;
    }
}

fn full_styled_message(window_id: &str, seq: u64, lines: &[StyledLineDto], cursor_row: usize, cursor_col: usize) -> ServerMessage {
    ServerMessage::FrameStyled {
        window_id: window_id.to_string(),
        seq,
        lines: lines.to_vec(),
        cursor_row,
        cursor_col,
    }
}

fn diff_plain(previous: &[String], current: &[String]) -> Option<Vec<PatchOp>> {
    let ops: Vec<PatchOp> = previous
        .iter()
        .zip(current.iter())
        .enumerate()
        .filter(|(_, (old, new))| old != new)
        .map(|(index, (_, new))| PatchOp { index, line: new.clone() })
        .collect();
    within_patch_budget(ops.len(), current.len()).then_some(ops)
}

fn diff_styled(previous: &[StyledLineDto], current: &[StyledLineDto]) -> Option<Vec<StyledPatchOp>> {
    let ops: Vec<StyledPatchOp> = previous
        .iter()
        .zip(current.iter())
        .enumerate()
        .filter(|(_, (old, new))| old != new)
        .map(|(index, (_, new))| StyledPatchOp { index, line: new.clone() })
        .collect();
    within_patch_budget(ops.len(), current.len()).then_some(ops)
}

fn within_patch_budget(changed: usize, total: usize) -> bool {
    total > 0 && (changed as f64) / (total as f64) <= PATCH_MAX_RATIO
}

async fn send(writer: &Arc<Mutex<tokio::io::WriteHalf<interprocess::local_socket::tokio::Stream>>>, message: &ServerMessage) {
    let Ok(mut json) = serde_json::to_string(message) else {
        warn!("failed to serialize stream message");
        return;
    };
    json.push('\n');
    let mut guard = writer.lock().await;
    if let Err(err) = guard.write_all(json.as_bytes()).await {
        warn!(%err, "failed to write stream message");
    }
}

/// Resolve the default stream-socket path under the user's home directory.
#[must_use]
pub fn default_socket_name() -> String {
    "discode-runtime.sock".to_string()
}
