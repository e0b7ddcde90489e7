//! Event bus — typed publish/subscribe for lifecycle transitions.
//!
//! Every component announces what happened through [`EventBus::emit`]:
//! - the reader task of a supervised process (server / tunnel events)
//! - the restart orchestrator (warnings, countdown, phases, outcome)
//!
//! Delivery is synchronous and best-effort. A subscriber that panics is
//! logged and skipped; the remaining subscribers still get the event.
//! Emitted events are also kept in a bounded history (for `GET /api/events`)
//! and pushed to a broadcast channel for async listeners.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_HISTORY: usize = 1_000;

// ─── Event Types ─────────────────────────────────────────────

/// Which managed process an event (or a slot) belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Server,
    Tunnel,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Tunnel => "tunnel",
        }
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Starting,
    Ready,
    Stopped,
    PlayerCountChanged(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TunnelEvent {
    Starting,
    ClaimUrlDetected(String),
    AddressAssigned(String),
    Offline,
    Error(String),
}

/// Steps of the automated restart sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartPhase {
    Idle,
    Warning,
    Stopping,
    Cooldown,
    Starting,
    Verifying,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RestartEvent {
    /// Lead-time warning broadcast to players (`1h`, `30m`, `15m`, `1m`)
    WarningSent { key: String, message: String },
    /// One message of the final countdown
    Countdown(String),
    Phase(RestartPhase),
    Completed { cycle: String },
    VerificationFailed { cycle: String, reason: String },
    Cancelled { cycle: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", content = "event", rename_all = "lowercase")]
pub enum Event {
    Server(ServerEvent),
    Tunnel(TunnelEvent),
    Restart(RestartEvent),
}

/// Payload-free discriminant used for subscribe-by-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStarting,
    ServerReady,
    ServerStopped,
    PlayerCountChanged,
    TunnelStarting,
    ClaimUrlDetected,
    AddressAssigned,
    TunnelOffline,
    TunnelError,
    RestartWarning,
    RestartCountdown,
    RestartPhase,
    RestartCompleted,
    RestartFailed,
    RestartCancelled,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Server(e) => match e {
                ServerEvent::Starting => EventKind::ServerStarting,
                ServerEvent::Ready => EventKind::ServerReady,
                ServerEvent::Stopped => EventKind::ServerStopped,
                ServerEvent::PlayerCountChanged(_) => EventKind::PlayerCountChanged,
            },
            Event::Tunnel(e) => match e {
                TunnelEvent::Starting => EventKind::TunnelStarting,
                TunnelEvent::ClaimUrlDetected(_) => EventKind::ClaimUrlDetected,
                TunnelEvent::AddressAssigned(_) => EventKind::AddressAssigned,
                TunnelEvent::Offline => EventKind::TunnelOffline,
                TunnelEvent::Error(_) => EventKind::TunnelError,
            },
            Event::Restart(e) => match e {
                RestartEvent::WarningSent { .. } => EventKind::RestartWarning,
                RestartEvent::Countdown(_) => EventKind::RestartCountdown,
                RestartEvent::Phase(_) => EventKind::RestartPhase,
                RestartEvent::Completed { .. } => EventKind::RestartCompleted,
                RestartEvent::VerificationFailed { .. } => EventKind::RestartFailed,
                RestartEvent::Cancelled { .. } => EventKind::RestartCancelled,
            },
        }
    }

    /// Whether this is the "process is gone" signal for its role.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Server(ServerEvent::Stopped) | Event::Tunnel(TunnelEvent::Offline)
        )
    }
}

// ─── History ─────────────────────────────────────────────────

/// An emitted event with a sequential ID for polling (`GET /api/events?since=<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub event: Event,
}

struct History {
    entries: VecDeque<RecordedEvent>,
    next_id: u64,
    max_size: usize,
}

impl History {
    fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(DEFAULT_HISTORY)),
            next_id: 0,
            max_size: max_size.max(1),
        }
    }

    fn push(&mut self, event: Event) {
        let entry = RecordedEvent {
            id: self.next_id,
            timestamp: current_timestamp(),
            event,
        };
        self.next_id += 1;
        if self.entries.len() >= self.max_size {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn since(&self, since_id: Option<u64>) -> Vec<RecordedEvent> {
        self.entries
            .iter()
            .filter(|e| since_id.map_or(true, |since| e.id > since))
            .cloned()
            .collect()
    }
}

// ─── Bus ─────────────────────────────────────────────────────

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    /// `None` subscribes to every kind
    kind: Option<EventKind>,
    callback: Callback,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    history: Mutex<History>,
    next_sub: AtomicU64,
    broadcast: broadcast::Sender<Event>,
}

/// Cloneable handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(max_size: usize) -> Self {
        let (tx, _) = broadcast::channel(512);
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                history: Mutex::new(History::new(max_size)),
                next_sub: AtomicU64::new(1),
                broadcast: tx,
            }),
        }
    }

    /// Register `callback` for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_subscriber(Some(kind), Arc::new(callback))
    }

    /// Register `callback` for every event.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_subscriber(None, Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.inner.subscribers);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Async receiver for events emitted after this call.
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.inner.broadcast.subscribe()
    }

    /// Record `event`, then deliver it to every matching subscriber in
    /// registration order.
    ///
    /// Events emitted by a subscriber are recorded after the event that
    /// triggered them.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        tracing::debug!("Event emitted: {:?}", event);

        {
            let mut history = lock(&self.inner.history);
            history.push(event.clone());
            let _ = self.inner.broadcast.send(event.clone());
        }

        // 콜백 실행 중에는 락을 잡지 않는다 (콜백이 subscribe를 호출할 수 있음)
        let targets: Vec<(SubscriptionId, Callback)> = lock(&self.inner.subscribers)
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| (s.id, s.callback.clone()))
            .collect();

        for (id, callback) in targets {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if result.is_err() {
                tracing::error!("Event subscriber {:?} panicked while handling {:?}", id, kind);
            }
        }
    }

    /// Recorded events with `id > since_id` (all retained events if `None`).
    pub fn events_since(&self, since_id: Option<u64>) -> Vec<RecordedEvent> {
        lock(&self.inner.history).since(since_id)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    fn add_subscriber(&self, kind: Option<EventKind>, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_sub.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.subscribers).push(Subscriber { id, kind, callback });
        id
    }
}

/// Poisoning only happens if a panic escaped while the lock was held, which
/// `emit` never allows; recover the guard instead of propagating.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
