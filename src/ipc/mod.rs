pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::scheduler::orchestrator::RestartOrchestrator;
use crate::scheduler::{Clock, ScheduleService};
use crate::supervisor::Supervisor;

use handlers::{events, schedule, server};

/// IPC 요청/응답 타입
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    /// Target a specific server instance; stale generations are rejected
    #[serde(default)]
    pub generation: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub enabled: bool,
    /// `"interval"` or `"daily"`; required when enabling
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub interval_hours: Option<u32>,
    /// `"HH:MM"`
    #[serde(default)]
    pub restart_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinceQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub schedule: Arc<ScheduleService>,
    pub orchestrator: Arc<RestartOrchestrator>,
    pub clock: Arc<dyn Clock>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        schedule: Arc<ScheduleService>,
        orchestrator: Arc<RestartOrchestrator>,
        clock: Arc<dyn Clock>,
        listen_addr: &str,
    ) -> Self {
        Self {
            supervisor,
            schedule,
            orchestrator,
            clock,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(server::get_status))
            .route("/api/server/start", post(server::start_server_handler))
            .route("/api/server/stop", post(server::stop_server_handler))
            .route("/api/server/command", post(server::send_command_handler))
            .route("/api/start-all", post(server::start_all_handler))
            .route("/api/tunnel/start", post(server::start_tunnel_handler))
            .route("/api/tunnel/stop", post(server::stop_tunnel_handler))
            .route("/api/console/:role", get(server::get_console_handler))
            .route("/api/schedule", get(schedule::get_schedule).put(schedule::put_schedule))
            .route("/api/restart", post(schedule::trigger_restart))
            .route("/api/restart/cancel", post(schedule::cancel_restart))
            .route("/api/events", get(events::get_events))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        // TCP 리스너
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}
