use axum::{extract::State, response::IntoResponse, Json};
use serde_json::{json, Value};

use super::super::{IPCServer, ScheduleRequest};
use crate::scheduler::orchestrator::RestartTrigger;
use crate::scheduler::{DailyTime, ScheduleError, ScheduleMode};
use crate::supervisor::error::SupervisorError;

/// GET /api/schedule - 현재 스케줄과 다음 재시작까지 남은 시간
pub async fn get_schedule(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(schedule_body(&state)?))
}

/// PUT /api/schedule - 스케줄 설정/해제
pub async fn put_schedule(
    State(state): State<IPCServer>,
    Json(payload): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let mode = if payload.enabled {
        Some(parse_mode(&payload)?)
    } else {
        None
    };

    state.schedule.set_schedule(payload.enabled, mode, state.clock.now())?;
    state.orchestrator.reset_warnings();
    Ok(Json(schedule_body(&state)?))
}

/// POST /api/restart - 수동 재시작
pub async fn trigger_restart(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    let handle = state.orchestrator.trigger(RestartTrigger::Manual)?;
    Ok(Json(json!({
        "success": true,
        "cycle": handle.cycle,
    })))
}

/// POST /api/restart/cancel - 진행 중인 재시작 취소
pub async fn cancel_restart(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    let cycle = state.orchestrator.cancel()?;
    Ok(Json(json!({
        "success": true,
        "cycle": cycle,
    })))
}

fn parse_mode(payload: &ScheduleRequest) -> Result<ScheduleMode, SupervisorError> {
    match payload.mode.as_deref() {
        Some("interval") => {
            let interval_hours = payload.interval_hours.ok_or_else(|| {
                SupervisorError::BadRequest("'interval_hours' is required for interval mode".to_string())
            })?;
            let mode = ScheduleMode::Interval { interval_hours };
            mode.validate()?;
            Ok(mode)
        }
        Some("daily") | Some("time") => {
            let raw = payload.restart_time.as_deref().ok_or_else(|| {
                SupervisorError::BadRequest("'restart_time' is required for daily mode".to_string())
            })?;
            Ok(ScheduleMode::DailyTime {
                restart_time: DailyTime::parse(raw)?,
            })
        }
        Some(other) => Err(SupervisorError::BadRequest(format!("Unknown schedule mode '{}'", other))),
        None => Err(ScheduleError::MissingMode.into()),
    }
}

fn schedule_body(state: &IPCServer) -> Result<Value, SupervisorError> {
    let schedule = state.schedule.state();
    let status = state.schedule.status(state.clock.now())?;
    Ok(json!({
        "success": true,
        "enabled": schedule.is_some(),
        "schedule": schedule,
        "status": status,
        "restart_phase": state.orchestrator.phase(),
        "active_cycle": state.orchestrator.active_cycle(),
        "warnings_sent": state.orchestrator.sent_warnings(),
    }))
}
