use std::sync::Arc;

use bridge_core::config::GlobalConfig;
use bridge_core::events::EventBus;
use bridge_core::ipc;
use bridge_core::scheduler::orchestrator::RestartOrchestrator;
use bridge_core::scheduler::poller::Poller;
use bridge_core::scheduler::store::ScheduleStore;
use bridge_core::scheduler::{Clock, ScheduleService, SystemClock};
use bridge_core::supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Bridge daemon starting");

    let cfg = GlobalConfig::load()?;
    tracing::info!(
        "Managing instance '{}' in {}",
        cfg.instance,
        cfg.instance_dir().display()
    );

    let bus = EventBus::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let supervisor = Arc::new(Supervisor::from_config(&cfg, bus));
    let schedule = Arc::new(ScheduleService::load(
        ScheduleStore::new(&cfg.instance_dir()),
        cfg.schedule_windows(),
    ));
    let orchestrator = Arc::new(RestartOrchestrator::new(
        supervisor.clone(),
        schedule.clone(),
        clock.clone(),
        cfg.restart_timings(),
    ));

    let shutdown = CancellationToken::new();

    // 스케줄 폴링 태스크
    let poller = Poller::new(
        supervisor.clone(),
        schedule.clone(),
        orchestrator.clone(),
        clock.clone(),
        cfg.poll_interval(),
    );
    let poller_task = tokio::spawn(poller.run(shutdown.clone()));

    // Graceful shutdown: Ctrl+C 시 재시작 취소 후 프로세스 정리
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, cleaning up...");
        signal_token.cancel();
    });

    let ipc_server = ipc::IPCServer::new(
        supervisor.clone(),
        schedule,
        orchestrator.clone(),
        clock,
        &cfg.ipc_listen,
    );
    if let Err(e) = ipc_server.start(shutdown.clone()).await {
        tracing::error!("IPC server error: {}", e);
        shutdown.cancel();
    }

    let _ = orchestrator.cancel();
    let _ = poller_task.await;
    supervisor.shutdown().await;

    tracing::info!("Bridge daemon shut down");
    Ok(())
}
