//! Supervisor error types — 에러 종류를 구분하여 IPC 핸들러에서
//! 적절한 HTTP 상태 코드를 반환할 수 있게 합니다.

use axum::http::StatusCode;

use crate::events::ProcessRole;
use crate::scheduler::orchestrator::RestartError;
use crate::scheduler::ScheduleError;

/// Errors local to one supervised process instance.
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("Executable not found: {0}")]
    ExecutableMissing(String),

    #[error("Working directory not found: {0}")]
    WorkDirMissing(String),

    #[error("Failed to launch '{program}': {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command rejected: {0} is not running")]
    CommandRejected(ProcessRole),

    #[error("{0} is already running")]
    AlreadyRunning(ProcessRole),
}

impl ProcessError {
    /// Launch failures are the only process errors surfaced to the operator.
    pub fn is_launch_error(&self) -> bool {
        matches!(
            self,
            Self::ExecutableMissing(_) | Self::WorkDirMissing(_) | Self::LaunchFailed { .. }
        )
    }
}

/// Errors returned through the IPC command surface.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Process(e) if e.is_launch_error() => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Process(_) => StatusCode::CONFLICT,
            Self::Restart(RestartError::AlreadyInProgress) => StatusCode::CONFLICT,
            Self::Restart(RestartError::NotInProgress) => StatusCode::CONFLICT,
            Self::Restart(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Schedule(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Process(ProcessError::ExecutableMissing(_)) => "EXECUTABLE_MISSING",
            Self::Process(ProcessError::WorkDirMissing(_)) => "WORKDIR_MISSING",
            Self::Process(ProcessError::LaunchFailed { .. }) => "LAUNCH_FAILED",
            Self::Process(ProcessError::CommandRejected(_)) => "COMMAND_REJECTED",
            Self::Process(ProcessError::AlreadyRunning(_)) => "ALREADY_RUNNING",
            Self::Restart(RestartError::AlreadyInProgress) => "RESTART_IN_PROGRESS",
            Self::Restart(RestartError::NotInProgress) => "NO_RESTART_IN_PROGRESS",
            Self::Restart(RestartError::VerificationFailed(_)) => "RESTART_VERIFICATION_FAILED",
            Self::Restart(RestartError::Cancelled) => "RESTART_CANCELLED",
            Self::Restart(RestartError::Launch(_)) => "LAUNCH_FAILED",
            Self::Schedule(_) => "INVALID_SCHEDULE",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
