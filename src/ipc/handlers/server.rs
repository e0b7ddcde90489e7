use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{CommandRequest, IPCServer, SinceQuery};
use crate::events::ProcessRole;
use crate::supervisor::error::SupervisorError;

const DEFAULT_CONSOLE_COUNT: usize = 200;

/// GET /api/status - 서버/터널 상태와 플레이어 수
pub async fn get_status(State(state): State<IPCServer>) -> impl IntoResponse {
    let status = state.supervisor.status().await;
    Json(json!({
        "success": true,
        "status": status,
        "restart_phase": state.orchestrator.phase(),
    }))
}

/// POST /api/server/start - 서버 시작
pub async fn start_server_handler(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    let process = state.supervisor.start_server().await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "pid": process.pid,
            "generation": process.generation(),
        })),
    ))
}

/// POST /api/server/stop - 서버 중지 (진행 중인 자동 재시작도 취소)
pub async fn stop_server_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    if let Ok(cycle) = state.orchestrator.cancel() {
        tracing::info!("Operator stop cancelled restart cycle {}", cycle);
    }
    state.supervisor.stop_server().await;
    Json(json!({ "success": true }))
}

/// POST /api/server/command - 서버 콘솔에 명령 전송
pub async fn send_command_handler(
    State(state): State<IPCServer>,
    Json(payload): Json<CommandRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let command = payload.command.trim();
    if command.is_empty() {
        return Err(SupervisorError::BadRequest("Missing 'command' field".to_string()));
    }
    match payload.generation {
        Some(generation) => state.supervisor.send_command_to(generation, command).await?,
        None => state.supervisor.send_command(command).await?,
    }
    Ok(Json(json!({ "success": true })))
}

/// POST /api/start-all - 서버 시작 후 준비되면 터널 시작
pub async fn start_all_handler(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.start_all().await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/tunnel/start
pub async fn start_tunnel_handler(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    let process = state.supervisor.start_tunnel().await?;
    Ok(Json(json!({
        "success": true,
        "pid": process.pid,
        "generation": process.generation(),
    })))
}

/// POST /api/tunnel/stop
pub async fn stop_tunnel_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    state.supervisor.stop_tunnel().await;
    Json(json!({ "success": true }))
}

/// GET /api/console/:role?since=0&count=100 - 콘솔 출력 조회
pub async fn get_console_handler(
    Path(role): Path<String>,
    State(state): State<IPCServer>,
    Query(params): Query<SinceQuery>,
) -> Result<impl IntoResponse, SupervisorError> {
    let role = match role.as_str() {
        "server" => ProcessRole::Server,
        "tunnel" => ProcessRole::Tunnel,
        other => return Err(SupervisorError::BadRequest(format!("Unknown process '{}'", other))),
    };
    let slot = state.supervisor.slot(role);
    let lines = match params.since {
        Some(since) => slot.console_since(since).await,
        None => slot.console_recent(params.count.unwrap_or(DEFAULT_CONSOLE_COUNT)).await,
    };
    Ok(Json(json!({
        "success": true,
        "role": role,
        "lines": lines,
    })))
}
