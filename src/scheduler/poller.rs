use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::orchestrator::{RestartOrchestrator, RestartTrigger};
use super::warnings::WarningKey;
use super::{Clock, ScheduleService};
use crate::supervisor::Supervisor;

/// What one poll decided.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub skipped: Option<SkipReason>,
    pub warned: Option<WarningKey>,
    /// Cycle id of a restart started by this tick
    pub triggered: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ServerOffline,
    RestartInProgress,
    NoSchedule,
}

impl TickReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

/// Periodic schedule check: sends due warnings and triggers due restarts.
///
/// Only acts while the server is running; an offline server is neither
/// warned nor restarted.
pub struct Poller {
    supervisor: Arc<Supervisor>,
    schedule: Arc<ScheduleService>,
    orchestrator: Arc<RestartOrchestrator>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        supervisor: Arc<Supervisor>,
        schedule: Arc<ScheduleService>,
        orchestrator: Arc<RestartOrchestrator>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            schedule,
            orchestrator,
            clock,
            interval,
        }
    }

    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        if !self.supervisor.is_server_running().await {
            return Ok(TickReport::skipped(SkipReason::ServerOffline));
        }
        if self.orchestrator.is_active() {
            return Ok(TickReport::skipped(SkipReason::RestartInProgress));
        }

        let now = self.clock.now();
        let Some(status) = self.schedule.status(now)? else {
            return Ok(TickReport::skipped(SkipReason::NoSchedule));
        };

        let warned = self.orchestrator.send_warning_if_due(status.remaining_seconds).await;

        let triggered = if status.is_due {
            tracing::info!("[Scheduler] Restart is due, starting restart sequence");
            let handle = self.orchestrator.trigger(RestartTrigger::Scheduled)?;
            Some(handle.cycle)
        } else {
            None
        };

        Ok(TickReport {
            skipped: None,
            warned,
            triggered,
        })
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("[Scheduler] Polling every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut error_count: u32 = 0;
        let max_consecutive_errors = 10;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("[Scheduler] Poller stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(report) => {
                    if error_count > 0 {
                        tracing::info!("[Scheduler] Poller recovered after {} errors", error_count);
                    }
                    error_count = 0;
                    tracing::trace!("[Scheduler] Tick: {:?}", report);
                }
                Err(e) => {
                    error_count += 1;
                    // 처음 3번과 이후 10번마다 로깅하여 반복 로그 방지
                    if error_count <= 3 || error_count % 10 == 0 {
                        tracing::error!("[Scheduler] Poll error (count: {}): {}", error_count, e);
                    }
                    if error_count >= max_consecutive_errors {
                        error_count = 0;
                    }
                }
            }
        }
    }
}
