//! IPC 라우터 직접 호출 테스트 (Axum tower::ServiceExt)

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bridge_core::events::EventBus;
use bridge_core::ipc::IPCServer;
use bridge_core::scheduler::orchestrator::{RestartOrchestrator, RestartTimings};
use bridge_core::scheduler::store::ScheduleStore;
use bridge_core::scheduler::{ManualClock, ScheduleService, ScheduleWindows};
use bridge_core::supervisor::process::{GracefulStop, LaunchSpec};
use bridge_core::supervisor::Supervisor;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn test_app(tmp: &TempDir) -> Router {
    let launch = LaunchSpec {
        program: "no-such-server-binary-for-bridge-tests".into(),
        args: vec![],
        working_dir: tmp.path().to_path_buf(),
        env: vec![],
        accepts_input: true,
        graceful: GracefulStop::Command("stop".into()),
        graceful_timeout: Duration::from_millis(100),
        kill_timeout: Duration::from_millis(100),
    };
    let clock = Arc::new(ManualClock::new(
        NaiveDate::from_ymd_opt(2024, 5, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap(),
    ));
    let supervisor = Arc::new(Supervisor::new(launch.clone(), launch, None, EventBus::new()));
    let schedule = Arc::new(ScheduleService::load(
        ScheduleStore::new(tmp.path()),
        ScheduleWindows::default(),
    ));
    let orchestrator = Arc::new(RestartOrchestrator::new(
        supervisor.clone(),
        schedule.clone(),
        clock.clone(),
        RestartTimings::default(),
    ));
    IPCServer::new(supervisor, schedule, orchestrator, clock, "127.0.0.1:0").router()
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_status_of_idle_daemon() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, json) = call(&app, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"]["server"]["state"], "not_started");
    assert_eq!(json["status"]["tunnel"]["state"], "not_started");
    assert_eq!(json["status"]["players"], 0);
    assert_eq!(json["restart_phase"], "idle");
}

#[tokio::test]
async fn test_schedule_roundtrip_through_api() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, json) = call(&app, "GET", "/api/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], false);
    assert!(json["status"].is_null());

    let (status, json) = call(
        &app,
        "PUT",
        "/api/schedule",
        Some(json!({"enabled": true, "mode": "interval", "interval_hours": 6})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], true);
    assert_eq!(json["schedule"]["type"], "interval");
    assert_eq!(json["schedule"]["interval_hours"], 6);
    assert_eq!(json["status"]["is_due"], false);
    assert_eq!(json["status"]["remaining_seconds"], 21600.0);

    let (status, json) = call(
        &app,
        "PUT",
        "/api/schedule",
        Some(json!({"enabled": true, "mode": "daily", "restart_time": "03:00"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["schedule"]["type"], "time");
    assert_eq!(json["schedule"]["restart_time"], "03:00");
    // 12:00 → 다음날 03:00
    assert_eq!(json["status"]["remaining_seconds"], 15.0 * 3600.0);

    let metadata: Value =
        serde_json::from_str(&std::fs::read_to_string(tmp.path().join("metadata.json")).unwrap()).unwrap();
    assert_eq!(metadata["scheduler"]["restart_time"], "03:00");

    let (status, json) = call(&app, "PUT", "/api/schedule", Some(json!({"enabled": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], false);
    let metadata: Value =
        serde_json::from_str(&std::fs::read_to_string(tmp.path().join("metadata.json")).unwrap()).unwrap();
    assert!(metadata.get("scheduler").is_none());
}

#[tokio::test]
async fn test_invalid_schedules_rejected() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, json) = call(
        &app,
        "PUT",
        "/api/schedule",
        Some(json!({"enabled": true, "mode": "interval", "interval_hours": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(json["error_code"], "INVALID_SCHEDULE");

    let (status, json) = call(
        &app,
        "PUT",
        "/api/schedule",
        Some(json!({"enabled": true, "mode": "interval", "interval_hours": u32::MAX})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "INVALID_SCHEDULE");

    // 거부된 값 이후에도 조회는 정상
    let (status, json) = call(&app, "GET", "/api/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], false);

    let (status, json) = call(
        &app,
        "PUT",
        "/api/schedule",
        Some(json!({"enabled": true, "mode": "daily", "restart_time": "25:99"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "INVALID_SCHEDULE");

    let (status, json) = call(
        &app,
        "PUT",
        "/api/schedule",
        Some(json!({"enabled": true, "mode": "weekly"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "BAD_REQUEST");

    let (status, json) = call(&app, "PUT", "/api/schedule", Some(json!({"enabled": true}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "INVALID_SCHEDULE");
}

#[tokio::test]
async fn test_process_errors_map_to_status_codes() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, json) = call(&app, "POST", "/api/server/command", Some(json!({"command": "list"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error_code"], "COMMAND_REJECTED");

    let (status, json) = call(&app, "POST", "/api/server/command", Some(json!({"command": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "BAD_REQUEST");

    let (status, json) = call(&app, "POST", "/api/server/start", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error_code"], "EXECUTABLE_MISSING");

    let (status, json) = call(&app, "POST", "/api/restart/cancel", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error_code"], "NO_RESTART_IN_PROGRESS");

    // 실행 중이 아니어도 stop은 성공 (멱등)
    let (status, json) = call(&app, "POST", "/api/server/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn test_events_and_console_polling() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, json) = call(&app, "GET", "/api/events", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["events"].as_array().unwrap().is_empty());

    let (status, json) = call(&app, "GET", "/api/console/server?count=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["role"], "server");
    assert!(json["lines"].as_array().unwrap().is_empty());

    let (status, _) = call(&app, "GET", "/api/console/database", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
