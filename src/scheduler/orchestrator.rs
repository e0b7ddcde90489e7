//! Restart orchestrator - runs one restart cycle end to end.
//!
//! ## Sequence
//! 1. **Warning**: in-game countdown `5..2`, then "NOW!"
//! 2. **Stopping**: graceful stop, waited on with a ceiling
//! 3. **Cooldown**: fixed pause so ports and files are released
//! 4. **Starting**: launch a fresh server instance
//! 5. **Verifying**: wait for the new instance to be running (early exit on ready)
//!
//! Only one cycle runs at a time. Operator actions cancel the cycle through a
//! `CancellationToken`; cancellation is honoured between steps, never in the
//! middle of a stop.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::warnings::{warning_due, WarningKey, WarningLedger};
use super::{Clock, ScheduleService};
use crate::events::{Event, EventBus, RestartEvent, RestartPhase};
use crate::supervisor::error::ProcessError;
use crate::supervisor::Supervisor;

const COUNTDOWN_FROM: u32 = 5;
const COUNTDOWN_TO: u32 = 2;

#[derive(thiserror::Error, Debug)]
pub enum RestartError {
    #[error("A restart is already in progress")]
    AlreadyInProgress,

    #[error("No restart is in progress")]
    NotInProgress,

    #[error("Restart verification failed: {0}")]
    VerificationFailed(String),

    #[error("Restart was cancelled")]
    Cancelled,

    #[error("Restart could not launch the server: {0}")]
    Launch(#[from] ProcessError),
}

/// Delays between restart steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartTimings {
    pub countdown_step: Duration,
    pub stop_ceiling: Duration,
    pub stop_poll: Duration,
    pub cooldown: Duration,
    pub start_wait: Duration,
}

impl Default for RestartTimings {
    fn default() -> Self {
        Self {
            countdown_step: Duration::from_secs(1),
            stop_ceiling: Duration::from_secs(30),
            stop_poll: Duration::from_secs(1),
            cooldown: Duration::from_secs(5),
            start_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartOutcome {
    pub cycle: String,
    pub trigger: RestartTrigger,
    pub ready: bool,
}

/// Handle to a spawned restart cycle.
pub struct RestartHandle {
    pub cycle: String,
    pub join: JoinHandle<Result<RestartOutcome, RestartError>>,
}

struct ActiveCycle {
    id: String,
    token: CancellationToken,
}

pub struct RestartOrchestrator {
    supervisor: Arc<Supervisor>,
    schedule: Arc<ScheduleService>,
    clock: Arc<dyn Clock>,
    timings: RestartTimings,
    bus: EventBus,
    phase: Mutex<RestartPhase>,
    active: Mutex<Option<ActiveCycle>>,
    ledger: Mutex<WarningLedger>,
}

impl RestartOrchestrator {
    pub fn new(
        supervisor: Arc<Supervisor>,
        schedule: Arc<ScheduleService>,
        clock: Arc<dyn Clock>,
        timings: RestartTimings,
    ) -> Self {
        let bus = supervisor.bus().clone();
        Self {
            supervisor,
            schedule,
            clock,
            timings,
            bus,
            phase: Mutex::new(RestartPhase::Idle),
            active: Mutex::new(None),
            ledger: Mutex::new(WarningLedger::new()),
        }
    }

    pub fn phase(&self) -> RestartPhase {
        *lock(&self.phase)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    pub fn active_cycle(&self) -> Option<String> {
        lock(&self.active).as_ref().map(|c| c.id.clone())
    }

    pub fn sent_warnings(&self) -> Vec<WarningKey> {
        lock(&self.ledger).sent_keys()
    }

    /// New schedule, new cycle: earlier warnings no longer apply.
    pub fn reset_warnings(&self) {
        lock(&self.ledger).clear();
    }

    /// Broadcast the warning for `remaining`, if one is due and not yet sent.
    pub async fn send_warning_if_due(&self, remaining: Option<f64>) -> Option<WarningKey> {
        let grace = self.schedule.windows().warning_grace_secs;
        let key = {
            let mut ledger = lock(&self.ledger);
            let key = warning_due(remaining, &ledger, grace)?;
            ledger.mark(key);
            key
        };

        tracing::info!("[Scheduler] Sending {} restart warning", key.as_str());
        if let Err(e) = self.supervisor.send_command(&key.command()).await {
            tracing::warn!("[Scheduler] Failed to send {} warning: {}", key.as_str(), e);
        }
        self.bus.emit(Event::Restart(RestartEvent::WarningSent {
            key: key.as_str().to_string(),
            message: key.message().to_string(),
        }));
        Some(key)
    }

    /// Spawn a restart cycle. Fails if one is already running.
    pub fn trigger(self: &Arc<Self>, trigger: RestartTrigger) -> Result<RestartHandle, RestartError> {
        let token = CancellationToken::new();
        let cycle = {
            let mut active = lock(&self.active);
            if active.is_some() {
                return Err(RestartError::AlreadyInProgress);
            }
            let id = uuid::Uuid::new_v4().to_string();
            *active = Some(ActiveCycle {
                id: id.clone(),
                token: token.clone(),
            });
            id
        };

        tracing::info!("[Restart] Cycle {} started ({:?})", cycle, trigger);
        let this = self.clone();
        let cycle_id = cycle.clone();
        let join = tokio::spawn(async move {
            let result = this.run_cycle(&cycle_id, trigger, &token).await;
            this.finish(&cycle_id, &result);
            result
        });

        Ok(RestartHandle { cycle, join })
    }

    /// Cancel the in-flight cycle. The cycle stops at its next step boundary.
    pub fn cancel(&self) -> Result<String, RestartError> {
        let active = lock(&self.active);
        let cycle = active.as_ref().ok_or(RestartError::NotInProgress)?;
        tracing::info!("[Restart] Cancelling cycle {}", cycle.id);
        cycle.token.cancel();
        Ok(cycle.id.clone())
    }

    async fn run_cycle(
        &self,
        cycle: &str,
        trigger: RestartTrigger,
        token: &CancellationToken,
    ) -> Result<RestartOutcome, RestartError> {
        // ── 1. countdown ─────────────────────────────────────
        self.set_phase(RestartPhase::Warning);
        for n in (COUNTDOWN_TO..=COUNTDOWN_FROM).rev() {
            self.countdown(&format!("Restarting in {}...", n)).await;
            self.pause(self.timings.countdown_step, token).await?;
        }
        self.countdown("Restarting NOW!").await;
        self.pause(self.timings.countdown_step, token).await?;

        // ── 2. stop ──────────────────────────────────────────
        self.set_phase(RestartPhase::Stopping);
        self.stop_with_ceiling().await;

        // ── 3. cooldown ──────────────────────────────────────
        self.set_phase(RestartPhase::Cooldown);
        self.pause(self.timings.cooldown, token).await?;

        // ── 4. start ─────────────────────────────────────────
        self.set_phase(RestartPhase::Starting);
        match self.supervisor.start_server().await {
            Ok(_) => {}
            Err(ProcessError::AlreadyRunning(_)) => {
                tracing::info!("[Restart] Server was started by someone else, verifying it");
            }
            Err(e) => return Err(RestartError::Launch(e)),
        }

        // ── 5. verify ────────────────────────────────────────
        self.set_phase(RestartPhase::Verifying);
        let ready = self.wait_until_ready(token).await?;
        let running = match self.supervisor.server().await {
            Some(p) => p.is_running(),
            None => false,
        };
        if !running {
            return Err(RestartError::VerificationFailed(
                "server is not running after restart".to_string(),
            ));
        }
        if !ready {
            tracing::warn!("[Restart] Server is running but not ready yet after {:?}", self.timings.start_wait);
        }

        Ok(RestartOutcome {
            cycle: cycle.to_string(),
            trigger,
            ready,
        })
    }

    /// Record the result, release the single-flight slot and reset the phase.
    fn finish(&self, cycle: &str, result: &Result<RestartOutcome, RestartError>) {
        match result {
            Ok(outcome) => {
                if self.schedule.is_enabled() {
                    if let Err(e) = self.schedule.mark_run(self.clock.now()) {
                        tracing::error!("[Scheduler] Failed to persist last run: {}", e);
                    }
                }
                lock(&self.ledger).clear();
                tracing::info!("[Restart] Cycle {} completed (ready: {})", cycle, outcome.ready);
                self.bus.emit(Event::Restart(RestartEvent::Completed {
                    cycle: cycle.to_string(),
                }));
            }
            Err(RestartError::Cancelled) => {
                tracing::info!("[Restart] Cycle {} cancelled", cycle);
                self.bus.emit(Event::Restart(RestartEvent::Cancelled {
                    cycle: cycle.to_string(),
                }));
            }
            Err(e) => {
                tracing::error!("[Restart] Cycle {} FAILED: {}", cycle, e);
                self.set_phase(RestartPhase::Failed);
                self.bus.emit(Event::Restart(RestartEvent::VerificationFailed {
                    cycle: cycle.to_string(),
                    reason: e.to_string(),
                }));
            }
        }

        *lock(&self.active) = None;
        self.set_phase(RestartPhase::Idle);
    }

    async fn countdown(&self, message: &str) {
        if let Err(e) = self.supervisor.send_command(&format!("say {}", message)).await {
            tracing::debug!("[Restart] Countdown '{}' not delivered: {}", message, e);
        }
        self.bus
            .emit(Event::Restart(RestartEvent::Countdown(message.to_string())));
    }

    /// Request a stop and wait for exit, polling so progress is visible.
    /// Gives up waiting (not stopping) after `stop_ceiling`.
    async fn stop_with_ceiling(&self) {
        let stop = self.supervisor.stop_server();
        tokio::pin!(stop);

        let deadline = tokio::time::Instant::now() + self.timings.stop_ceiling;
        let mut waited = Duration::ZERO;
        loop {
            tokio::select! {
                _ = &mut stop => {
                    tracing::info!("[Restart] Server stopped");
                    return;
                }
                _ = tokio::time::sleep(self.timings.stop_poll) => {
                    waited += self.timings.stop_poll;
                    if tokio::time::Instant::now() >= deadline {
                        tracing::warn!(
                            "[Restart] Server did not stop within {:?}, continuing",
                            self.timings.stop_ceiling
                        );
                        break;
                    }
                    tracing::debug!("[Restart] Waiting for server to stop ({:?})", waited);
                }
            }
        }

        // Keep the stop running so its kill escalation still happens.
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move { supervisor.stop_server().await });
    }

    async fn wait_until_ready(&self, token: &CancellationToken) -> Result<bool, RestartError> {
        let deadline = tokio::time::Instant::now() + self.timings.start_wait;
        loop {
            if let Some(p) = self.supervisor.server().await {
                if p.is_ready() {
                    return Ok(true);
                }
                if p.has_exited() {
                    return Ok(false);
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let step = self.timings.stop_poll.min(deadline - now);
            self.pause(step, token).await?;
        }
    }

    async fn pause(&self, duration: Duration, token: &CancellationToken) -> Result<(), RestartError> {
        tokio::select! {
            _ = token.cancelled() => Err(RestartError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn set_phase(&self, phase: RestartPhase) {
        let changed = {
            let mut current = lock(&self.phase);
            let changed = *current != phase;
            *current = phase;
            changed
        };
        if changed {
            tracing::debug!("[Restart] Phase -> {:?}", phase);
            self.bus.emit(Event::Restart(RestartEvent::Phase(phase)));
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::store::ScheduleStore;
    use crate::scheduler::{ManualClock, ScheduleWindows};
    use crate::supervisor::process::{GracefulStop, LaunchSpec};
    use chrono::NaiveDate;

    fn fixture(dir: &std::path::Path) -> Arc<RestartOrchestrator> {
        let launch = LaunchSpec {
            program: "no-such-server-binary-for-bridge-tests".into(),
            args: vec![],
            working_dir: dir.to_path_buf(),
            env: vec![],
            accepts_input: true,
            graceful: GracefulStop::Command("stop".into()),
            graceful_timeout: Duration::from_millis(100),
            kill_timeout: Duration::from_millis(100),
        };
        let supervisor = Arc::new(Supervisor::new(launch.clone(), launch, None, EventBus::new()));
        let schedule = Arc::new(ScheduleService::load(
            ScheduleStore::new(dir),
            ScheduleWindows::default(),
        ));
        let clock = ManualClock::new(
            NaiveDate::from_ymd_opt(2024, 5, 10)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        let timings = RestartTimings {
            countdown_step: Duration::from_millis(5),
            stop_ceiling: Duration::from_millis(200),
            stop_poll: Duration::from_millis(10),
            cooldown: Duration::from_millis(5),
            start_wait: Duration::from_millis(50),
        };
        Arc::new(RestartOrchestrator::new(supervisor, schedule, Arc::new(clock), timings))
    }

    #[tokio::test]
    async fn second_trigger_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = fixture(dir.path());
        let handle = orch.trigger(RestartTrigger::Manual).unwrap();
        assert!(matches!(
            orch.trigger(RestartTrigger::Manual),
            Err(RestartError::AlreadyInProgress)
        ));
        let _ = handle.join.await;
        assert!(!orch.is_active());
    }

    #[tokio::test]
    async fn cancel_without_cycle_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let orch = fixture(dir.path());
        assert!(matches!(orch.cancel(), Err(RestartError::NotInProgress)));
    }

    #[tokio::test]
    async fn cancel_during_countdown_skips_stop() {
        let dir = tempfile::tempdir().unwrap();
        let orch = fixture(dir.path());
        let bus = orch.bus.clone();
        let handle = orch.trigger(RestartTrigger::Manual).unwrap();
        orch.cancel().unwrap();
        let result = handle.join.await.unwrap();
        assert!(matches!(result, Err(RestartError::Cancelled)));
        assert_eq!(orch.phase(), RestartPhase::Idle);

        let phases: Vec<RestartPhase> = bus
            .events_since(None)
            .into_iter()
            .filter_map(|r| match r.event {
                Event::Restart(RestartEvent::Phase(p)) => Some(p),
                _ => None,
            })
            .collect();
        assert!(!phases.contains(&RestartPhase::Stopping));
    }

    #[tokio::test]
    async fn launch_failure_reports_and_keeps_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let orch = fixture(dir.path());
        lock(&orch.ledger).mark(WarningKey::OneMinute);

        let handle = orch.trigger(RestartTrigger::Scheduled).unwrap();
        let result = handle.join.await.unwrap();
        assert!(matches!(result, Err(RestartError::Launch(_))));
        assert_eq!(orch.sent_warnings(), vec![WarningKey::OneMinute]);

        let failed = orch
            .bus
            .events_since(None)
            .into_iter()
            .any(|r| matches!(r.event, Event::Restart(RestartEvent::VerificationFailed { .. })));
        assert!(failed);
        assert_eq!(orch.phase(), RestartPhase::Idle);
    }

    #[tokio::test]
    async fn warnings_are_sent_once() {
        let dir = tempfile::tempdir().unwrap();
        let orch = fixture(dir.path());
        assert_eq!(orch.send_warning_if_due(Some(3610.0)).await, Some(WarningKey::OneHour));
        assert_eq!(orch.send_warning_if_due(Some(3605.0)).await, None);
        assert_eq!(orch.send_warning_if_due(Some(1000.0)).await, None);
        orch.reset_warnings();
        assert!(orch.sent_warnings().is_empty());
    }
}
