//! Restart scheduling.
//!
//! ## Layers
//! - [`RestartScheduler`]: pure queries over [`ScheduleState`] and an injected
//!   `now` ("is a restart due", "how long until the next one").
//! - [`ScheduleService`]: the scheduler plus its durable store; what the
//!   poller, the orchestrator and the IPC layer share.
//! - [`orchestrator`]: executes the restart sequence.
//! - [`poller`]: the periodic timer that ties the two together.
//!
//! All times are local wall-clock `NaiveDateTime`s, matching how operators
//! think about "restart at 03:00".

pub mod orchestrator;
pub mod poller;
pub mod store;
pub mod warnings;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use store::ScheduleStore;

// ─── Clock ───────────────────────────────────────────────────

/// Source of "now" for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *lock(&self.now)
    }
}

// ─── Schedule Types ──────────────────────────────────────────

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("interval must be between 1 and {max} hours (got {0})", max = MAX_INTERVAL_HOURS)]
    InvalidInterval(u32),

    #[error("restart time must be HH:MM (got '{0}')")]
    InvalidTime(String),

    #[error("a restart mode is required when enabling the schedule")]
    MissingMode,
}

/// One year.
pub const MAX_INTERVAL_HOURS: u32 = 24 * 365;

/// Time of day for `DailyTime` mode, stored as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DailyTime(NaiveTime);

impl DailyTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map(Self)
            .map_err(|_| ScheduleError::InvalidTime(s.to_string()))
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }
}

impl TryFrom<String> for DailyTime {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DailyTime> for String {
    fn from(value: DailyTime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

/// Active restart mode. "Disabled" is the absence of a [`ScheduleState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleMode {
    Interval { interval_hours: u32 },
    #[serde(rename = "time")]
    DailyTime { restart_time: DailyTime },
}

impl ScheduleMode {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Interval { interval_hours } if !(1..=MAX_INTERVAL_HOURS).contains(interval_hours) => {
                Err(ScheduleError::InvalidInterval(*interval_hours))
            }
            _ => Ok(()),
        }
    }
}

/// Persisted schedule for one managed instance.
///
/// `last_run` is the anchor of the next due time in `Interval` mode, and only
/// a same-day duplicate guard in `DailyTime` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    #[serde(flatten)]
    pub mode: ScheduleMode,
    #[serde(default)]
    pub last_run: Option<NaiveDateTime>,
}

/// Tolerances around poll granularity. Defaults: 120 s trigger window,
/// 300 s same-day suppression, 30 s warning grace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleWindows {
    pub daily_trigger_secs: i64,
    pub daily_suppress_secs: i64,
    pub warning_grace_secs: f64,
}

impl Default for ScheduleWindows {
    fn default() -> Self {
        Self {
            daily_trigger_secs: 120,
            daily_suppress_secs: 300,
            warning_grace_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduleStatus {
    pub is_due: bool,
    pub remaining_seconds: Option<f64>,
}

// ─── Scheduler ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RestartScheduler {
    state: Option<ScheduleState>,
    windows: ScheduleWindows,
}

impl RestartScheduler {
    pub fn new(state: Option<ScheduleState>, windows: ScheduleWindows) -> Self {
        Self { state, windows }
    }

    pub fn state(&self) -> Option<&ScheduleState> {
        self.state.as_ref()
    }

    pub fn windows(&self) -> ScheduleWindows {
        self.windows
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// Enable, change or disable the schedule.
    ///
    /// Interval mode anchors `last_run` at `now`; daily mode starts with no
    /// `last_run` so only the time-of-day window gates the first trigger.
    pub fn set_schedule(
        &mut self,
        enabled: bool,
        mode: Option<ScheduleMode>,
        now: NaiveDateTime,
    ) -> Result<(), ScheduleError> {
        if !enabled {
            self.state = None;
            return Ok(());
        }
        let mode = mode.ok_or(ScheduleError::MissingMode)?;
        mode.validate()?;

        let last_run = match mode {
            ScheduleMode::Interval { .. } => Some(now),
            ScheduleMode::DailyTime { .. } => None,
        };
        self.state = Some(ScheduleState { mode, last_run });
        Ok(())
    }

    /// Interval schedules written without an anchor get one at `now`.
    /// Returns true when the state changed and should be persisted.
    pub fn ensure_anchor(&mut self, now: NaiveDateTime) -> bool {
        match &mut self.state {
            Some(ScheduleState {
                mode: ScheduleMode::Interval { .. },
                last_run: last_run @ None,
            }) => {
                *last_run = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        match state.mode {
            ScheduleMode::Interval { interval_hours } => {
                match state.last_run.and_then(|last_run| next_interval(last_run, interval_hours)) {
                    Some(next) => now >= next,
                    None => false,
                }
            }
            ScheduleMode::DailyTime { restart_time } => {
                self.in_trigger_window(restart_time, now) && !self.ran_recently(state, now)
            }
        }
    }

    /// Seconds until the next due instant (negative or zero once due).
    pub fn remaining_seconds(&self, now: NaiveDateTime) -> Option<f64> {
        let state = self.state.as_ref()?;
        match state.mode {
            ScheduleMode::Interval { interval_hours } => {
                let next = next_interval(state.last_run?, interval_hours)?;
                Some(seconds_between(now, next))
            }
            ScheduleMode::DailyTime { restart_time } => {
                let target = now.date().and_time(restart_time.time());
                if now < target {
                    Some(seconds_between(now, target))
                } else if self.in_trigger_window(restart_time, now) && !self.ran_recently(state, now) {
                    Some(0.0)
                } else {
                    Some(seconds_between(now, target + ChronoDuration::days(1)))
                }
            }
        }
    }

    pub fn status(&self, now: NaiveDateTime) -> Option<ScheduleStatus> {
        self.state.as_ref()?;
        Some(ScheduleStatus {
            is_due: self.is_due(now),
            remaining_seconds: self.remaining_seconds(now),
        })
    }

    /// Record a completed restart. No-op while disabled.
    pub fn mark_run(&mut self, now: NaiveDateTime) {
        if let Some(state) = &mut self.state {
            state.last_run = Some(now);
        }
    }

    fn in_trigger_window(&self, restart_time: DailyTime, now: NaiveDateTime) -> bool {
        let target = now.date().and_time(restart_time.time());
        now >= target && now < target + ChronoDuration::seconds(self.windows.daily_trigger_secs)
    }

    fn ran_recently(&self, state: &ScheduleState, now: NaiveDateTime) -> bool {
        match state.last_run {
            Some(last) => {
                last.date() == now.date()
                    && now >= last
                    && now - last < ChronoDuration::seconds(self.windows.daily_suppress_secs)
            }
            None => false,
        }
    }
}

/// `None` when the sum leaves chrono's range (hand-edited metadata).
fn next_interval(last_run: NaiveDateTime, interval_hours: u32) -> Option<NaiveDateTime> {
    last_run.checked_add_signed(ChronoDuration::hours(i64::from(interval_hours)))
}

fn seconds_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

// ─── Service ─────────────────────────────────────────────────

/// Scheduler state shared between the poller, the orchestrator and IPC.
/// Every mutation is written through to the store.
pub struct ScheduleService {
    scheduler: Mutex<RestartScheduler>,
    store: ScheduleStore,
}

impl ScheduleService {
    /// Load persisted state; a missing or unreadable file means "disabled".
    pub fn load(store: ScheduleStore, windows: ScheduleWindows) -> Self {
        let state = match store.load() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("[Scheduler] Failed to load schedule: {}", e);
                None
            }
        };
        if let Some(state) = &state {
            tracing::info!("[Scheduler] Loaded schedule {:?}", state.mode);
        }
        Self {
            scheduler: Mutex::new(RestartScheduler::new(state, windows)),
            store,
        }
    }

    pub fn state(&self) -> Option<ScheduleState> {
        lock(&self.scheduler).state().cloned()
    }

    pub fn windows(&self) -> ScheduleWindows {
        lock(&self.scheduler).windows()
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.scheduler).is_enabled()
    }

    pub fn set_schedule(
        &self,
        enabled: bool,
        mode: Option<ScheduleMode>,
        now: NaiveDateTime,
    ) -> anyhow::Result<Option<ScheduleState>> {
        let mut scheduler = lock(&self.scheduler);
        let mut next = scheduler.clone();
        next.set_schedule(enabled, mode, now)?;
        self.store.save(next.state())?;
        *scheduler = next;
        match scheduler.state() {
            Some(state) => tracing::info!("[Scheduler] Schedule enabled: {:?}", state.mode),
            None => tracing::info!("[Scheduler] Schedule disabled"),
        }
        Ok(scheduler.state().cloned())
    }

    /// Current status; `None` while disabled.
    pub fn status(&self, now: NaiveDateTime) -> anyhow::Result<Option<ScheduleStatus>> {
        let mut scheduler = lock(&self.scheduler);
        let mut next = scheduler.clone();
        if next.ensure_anchor(now) {
            tracing::info!("[Scheduler] Interval schedule had no anchor, starting from now");
            self.store.save(next.state())?;
            *scheduler = next;
        }
        Ok(scheduler.status(now))
    }

    pub fn mark_run(&self, now: NaiveDateTime) -> anyhow::Result<()> {
        let mut scheduler = lock(&self.scheduler);
        let mut next = scheduler.clone();
        next.mark_run(now);
        self.store.save(next.state())?;
        *scheduler = next;
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
