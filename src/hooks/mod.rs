//! Hook HTTP server (C5): loopback-only axum server receiving agent-side
//! hook events and CLI-facing control requests. Bind/serve/shutdown shape
//! grounded in the teacher's `mcp::sse::serve_sse`.

pub mod payload;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::messaging::OutboundFile;
use crate::project_service::resolve_instance;
use crate::router::Router as MessageRouter;
use crate::runtime::WindowSnapshot;
use crate::state::StateStore;
use crate::{AppError, Result};
use payload::{EventKind, HookEvent};

/// Shared state handed to every hook route.
#[derive(Clone)]
pub struct HookState {
    /// State store, for project/instance/channel resolution.
    pub state: Arc<StateStore>,
    /// Router, used to re-register channel mappings and enqueue file sends.
    pub router: Arc<MessageRouter>,
}

/// Start the hook HTTP server, bound to `127.0.0.1:port`, returning once
/// `cancel` fires (graceful shutdown, no in-flight request is aborted).
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound.
pub async fn serve(state: HookState, port: u16, cancel: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let app = Router::new()
        .route("/reload", post(reload))
        .route("/opencode-event", post(opencode_event))
        .route("/send-files", post(send_files))
        .route("/windows", post(windows))
        .route("/ensure-window", post(ensure_window))
        .route("/focus", post(focus))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind hook server on {bind}: {err}")))?;

    info!(%bind, "hook server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("hook server error: {err}")))?;
    info!("hook server shut down");
    Ok(())
}

async fn reload(State(state): State<HookState>) -> StatusCode {
    match state.state.reload().await {
        Ok(()) => {
            if let Err(err) = state.router.reregister_channel_map().await {
                warn!(%err, "failed to re-register channel map after reload");
            }
            StatusCode::OK
        }
        Err(err) => {
            warn!(%err, "reload failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn opencode_event(State(state): State<HookState>, Json(body): Json<Value>) -> StatusCode {
    let Some(event) = HookEvent::parse(&body) else {
        return StatusCode::BAD_REQUEST;
    };

    let Some(project) = state.state.get_project(&event.project_name).await else {
        return StatusCode::BAD_REQUEST;
    };

    let Some(instance) = resolve_instance(&project, event.instance_id.as_deref(), &event.agent_type) else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(channel_id) = instance.channel_id.clone() else {
        return StatusCode::BAD_REQUEST;
    };

    match event.kind {
        EventKind::SessionIdle => {
            if let Err(err) = state
                .router
                .handle_session_idle(&event.project_name, &instance.instance_id, &channel_id, event.effective_text())
                .await
            {
                warn!(%err, "session.idle handling failed");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
        EventKind::SessionError => {
            if let Err(err) = state
                .router
                .handle_session_error(&event.project_name, &instance.instance_id, &channel_id)
                .await
            {
                warn!(%err, "session.error handling failed");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
        EventKind::SessionStart | EventKind::SessionEnd | EventKind::Other => {
            state
                .router
                .reset_pending(&event.project_name, &instance.instance_id)
                .await;
        }
    }

    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct SendFilesRequest {
    #[serde(rename = "projectName")]
    project_name: String,
    #[serde(rename = "agentType")]
    agent_type: Option<String>,
    #[serde(rename = "instanceId")]
    instance_id: Option<String>,
    files: Vec<String>,
}

async fn send_files(State(state): State<HookState>, Json(body): Json<SendFilesRequest>) -> StatusCode {
    let Some(project) = state.state.get_project(&body.project_name).await else {
        return StatusCode::BAD_REQUEST;
    };
    let agent_hint = body.agent_type.as_deref().unwrap_or_default();
    let Some(instance) = resolve_instance(&project, body.instance_id.as_deref(), agent_hint) else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(channel_id) = instance.channel_id.clone() else {
        return StatusCode::BAD_REQUEST;
    };

    let files: Vec<OutboundFile> = body
        .files
        .into_iter()
        .map(|path| {
            let path = std::path::PathBuf::from(path);
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            OutboundFile { path, file_name }
        })
        .collect();

    match state.router.send_files(&channel_id, &files).await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(%err, "send-files failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize)]
struct WindowsResponse {
    windows: Vec<WindowSnapshotDto>,
}

#[derive(Debug, Serialize)]
struct WindowSnapshotDto {
    session: String,
    window: String,
    alive: bool,
}

impl From<WindowSnapshot> for WindowSnapshotDto {
    fn from(snapshot: WindowSnapshot) -> Self {
        Self {
            session: snapshot.session,
            window: snapshot.window,
            alive: snapshot.alive,
        }
    }
}

async fn windows(State(state): State<HookState>) -> Result<Json<WindowsResponse>, StatusCode> {
    let windows = state
        .router
        .list_windows()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(WindowsResponse {
        windows: windows.into_iter().map(WindowSnapshotDto::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct EnsureWindowRequest {
    #[serde(rename = "projectName")]
    project_name: String,
    #[serde(rename = "instanceId")]
    instance_id: String,
}

async fn ensure_window(State(state): State<HookState>, Json(body): Json<EnsureWindowRequest>) -> StatusCode {
    match state
        .router
        .ensure_window(&body.project_name, &body.instance_id)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(%err, "ensure-window failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Deserialize)]
struct FocusRequest {
    #[serde(rename = "windowId")]
    window_id: String,
}

async fn focus(State(state): State<HookState>, Json(body): Json<FocusRequest>) -> StatusCode {
    state.router.notify_focus(&body.window_id);
    StatusCode::OK
}
