pub mod classifier;
pub mod console;
pub mod error;
pub mod process;
pub mod state_machine;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::config::GlobalConfig;
use crate::events::{Event, EventBus, ProcessRole, ServerEvent, SubscriptionId, TunnelEvent};
use classifier::{OutputClassifier, ServerClassifier, TunnelClassifier};
use console::{ConsoleBuffer, LogLine};
use error::ProcessError;
use process::{LaunchSpec, SupervisedProcess};
use state_machine::ProcessState;

/// Holds the live instance for one role.
///
/// At most one instance exists per role. A new one may only be started once
/// the previous one has reached `Exited`; each start gets a fresh generation.
pub struct ProcessSlot {
    role: ProcessRole,
    spec: LaunchSpec,
    current: RwLock<Option<Arc<SupervisedProcess>>>,
    generation: AtomicU64,
    console: Arc<AsyncMutex<ConsoleBuffer>>,
    start_lock: AsyncMutex<()>,
}

impl ProcessSlot {
    pub fn new(role: ProcessRole, spec: LaunchSpec, console: ConsoleBuffer) -> Self {
        Self {
            role,
            spec,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            console: Arc::new(AsyncMutex::new(console)),
            start_lock: AsyncMutex::new(()),
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub async fn current(&self) -> Option<Arc<SupervisedProcess>> {
        self.current.read().await.clone()
    }

    pub async fn state(&self) -> ProcessState {
        match self.current().await {
            Some(p) => p.state(),
            None => ProcessState::NotStarted,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == ProcessState::Running
    }

    /// Launch a new instance with a fresh classifier.
    ///
    /// Fails with `AlreadyRunning` while an instance is running; an instance
    /// that is still stopping is waited out first.
    pub async fn start<C: OutputClassifier>(
        &self,
        classifier: C,
        bus: &EventBus,
    ) -> Result<Arc<SupervisedProcess>, ProcessError> {
        let _guard = self.start_lock.lock().await;

        if let Some(previous) = self.current().await {
            match previous.state() {
                ProcessState::Running => return Err(ProcessError::AlreadyRunning(self.role)),
                ProcessState::Stopping => {
                    tracing::info!("[{}] Waiting for previous instance to exit", self.role);
                    previous.wait_exited().await;
                }
                ProcessState::NotStarted | ProcessState::Exited => {}
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let process = SupervisedProcess::start(
            &self.spec,
            classifier,
            generation,
            bus.clone(),
            self.console.clone(),
        )
        .await?;

        *self.current.write().await = Some(process.clone());
        Ok(process)
    }

    /// Stop the live instance, if any. Returns once it has exited.
    pub async fn stop(&self) {
        match self.current().await {
            Some(process) => process.stop().await,
            None => tracing::debug!("[{}] Stop requested but nothing was started", self.role),
        }
    }

    pub async fn send_line(&self, text: &str) -> Result<(), ProcessError> {
        match self.current().await {
            Some(process) => process.send_line(text).await,
            None => Err(ProcessError::CommandRejected(self.role)),
        }
    }

    /// Like `send_line`, but only if `generation` is still the live instance.
    pub async fn send_line_to(&self, generation: u64, text: &str) -> Result<(), ProcessError> {
        match self.current().await {
            Some(process) if process.generation() == generation => process.send_line(text).await,
            Some(process) => {
                tracing::warn!(
                    "[{}] Dropping command for stale generation {} (live: {})",
                    self.role,
                    generation,
                    process.generation()
                );
                Err(ProcessError::CommandRejected(self.role))
            }
            None => Err(ProcessError::CommandRejected(self.role)),
        }
    }

    pub async fn console_since(&self, since_id: u64) -> Vec<LogLine> {
        self.console.lock().await.get_since(since_id)
    }

    pub async fn console_recent(&self, count: usize) -> Vec<LogLine> {
        self.console.lock().await.get_recent(count)
    }

    pub async fn status(&self) -> ProcessStatus {
        match self.current().await {
            Some(p) => ProcessStatus {
                role: self.role,
                state: p.state(),
                pid: (!p.has_exited()).then_some(p.pid),
                generation: p.generation(),
                ready: p.is_ready(),
                uptime_secs: p.is_running().then(|| p.uptime().as_secs()),
            },
            None => ProcessStatus {
                role: self.role,
                state: ProcessState::NotStarted,
                pid: None,
                generation: 0,
                ready: false,
                uptime_secs: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub role: ProcessRole,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub ready: bool,
    pub uptime_secs: Option<u64>,
}

/// Values derived from the event stream rather than from process handles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveInfo {
    pub players: u32,
    pub tunnel_address: Option<String>,
    pub claim_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub server: ProcessStatus,
    pub tunnel: ProcessStatus,
    #[serde(flatten)]
    pub live: LiveInfo,
}

/// Owns the game server and tunnel agent slots.
pub struct Supervisor {
    bus: EventBus,
    server: ProcessSlot,
    tunnel: ProcessSlot,
    live: Arc<Mutex<LiveInfo>>,
    live_subscription: SubscriptionId,
}

impl Supervisor {
    pub fn new(server: LaunchSpec, tunnel: LaunchSpec, log_pattern: Option<&str>, bus: EventBus) -> Self {
        let mut server_console = ConsoleBuffer::default();
        server_console.set_level_pattern(log_pattern);

        let live = Arc::new(Mutex::new(LiveInfo::default()));
        let live_subscription = {
            let live = live.clone();
            bus.subscribe_all(move |event| track_live_info(&live, event))
        };

        Self {
            bus,
            server: ProcessSlot::new(ProcessRole::Server, server, server_console),
            tunnel: ProcessSlot::new(ProcessRole::Tunnel, tunnel, ConsoleBuffer::default()),
            live,
            live_subscription,
        }
    }

    pub fn from_config(config: &GlobalConfig, bus: EventBus) -> Self {
        Self::new(
            config.server_launch_spec(),
            config.tunnel_launch_spec(),
            config.server.log_pattern.as_deref(),
            bus,
        )
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn slot(&self, role: ProcessRole) -> &ProcessSlot {
        match role {
            ProcessRole::Server => &self.server,
            ProcessRole::Tunnel => &self.tunnel,
        }
    }

    /// Live server instance, re-read on every call.
    pub async fn server(&self) -> Option<Arc<SupervisedProcess>> {
        self.server.current().await
    }

    pub async fn is_server_running(&self) -> bool {
        self.server.is_running().await
    }

    pub async fn start_server(&self) -> Result<Arc<SupervisedProcess>, ProcessError> {
        tracing::info!("Starting game server");
        self.server.start(ServerClassifier::new(), &self.bus).await
    }

    pub async fn stop_server(&self) {
        tracing::info!("Stopping game server");
        self.server.stop().await;
    }

    pub async fn send_command(&self, command: &str) -> Result<(), ProcessError> {
        tracing::debug!("Sending command to server: {}", command);
        self.server.send_line(command).await
    }

    /// Send to a specific server generation; rejected once it was replaced.
    pub async fn send_command_to(&self, generation: u64, command: &str) -> Result<(), ProcessError> {
        tracing::debug!("Sending command to server generation {}: {}", generation, command);
        self.server.send_line_to(generation, command).await
    }

    /// The tunnel's working directory holds only agent state and is created
    /// on demand. Launch failures are also announced as `TunnelEvent::Error`.
    pub async fn start_tunnel(&self) -> Result<Arc<SupervisedProcess>, ProcessError> {
        tracing::info!("[Tunnel] Starting tunnel agent");
        let result = match self.prepare_tunnel_dir() {
            Ok(()) => self.tunnel.start(TunnelClassifier::new(), &self.bus).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.is_launch_error() {
                tracing::error!("[Tunnel] Failed to start: {}", e);
                self.bus.emit(Event::Tunnel(TunnelEvent::Error(e.to_string())));
            }
        }
        result
    }

    fn prepare_tunnel_dir(&self) -> Result<(), ProcessError> {
        let dir = &self.tunnel.spec.working_dir;
        if dir.is_dir() {
            return Ok(());
        }
        tracing::info!("[Tunnel] Creating working directory {}", dir.display());
        std::fs::create_dir_all(dir).map_err(|source| ProcessError::LaunchFailed {
            program: self.tunnel.spec.program.clone(),
            source,
        })
    }

    pub async fn stop_tunnel(&self) {
        tracing::info!("[Tunnel] Stopping tunnel agent");
        self.tunnel.stop().await;
    }

    /// Start the server, then the tunnel once the server reports ready.
    ///
    /// If the server is already running and ready the tunnel starts at once.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), ProcessError> {
        let armed = self.arm_tunnel_on_ready();
        match self.start_server().await {
            Ok(_) => Ok(()),
            Err(ProcessError::AlreadyRunning(_)) => {
                let ready = self.server().await.map(|p| p.is_ready()).unwrap_or(false);
                if ready {
                    self.bus.unsubscribe(armed);
                    self.start_tunnel_if_idle().await;
                }
                Ok(())
            }
            Err(e) => {
                self.bus.unsubscribe(armed);
                Err(e)
            }
        }
    }

    /// Stop both processes concurrently.
    pub async fn shutdown(&self) {
        tokio::join!(self.stop_server(), self.stop_tunnel());
    }

    pub async fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            server: self.server.status().await,
            tunnel: self.tunnel.status().await,
            live: lock(&self.live).clone(),
        }
    }

    pub fn player_count(&self) -> u32 {
        lock(&self.live).players
    }

    async fn start_tunnel_if_idle(&self) {
        match self.start_tunnel().await {
            Ok(_) => {}
            Err(ProcessError::AlreadyRunning(_)) => {
                tracing::debug!("[Tunnel] Already running, nothing to do");
            }
            Err(e) => tracing::warn!("[Tunnel] Auto-start failed: {}", e),
        }
    }

    /// One-shot subscription: the next server `Ready` starts the tunnel, the
    /// next server `Stopped` disarms it.
    fn arm_tunnel_on_ready(self: &Arc<Self>) -> SubscriptionId {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        let own_id: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());
        let fired = Arc::new(AtomicBool::new(false));
        let bus = self.bus.clone();

        let id = {
            let own_id = own_id.clone();
            self.bus.subscribe_all(move |event| {
                let start = match event {
                    Event::Server(ServerEvent::Ready) => true,
                    Event::Server(ServerEvent::Stopped) => false,
                    _ => return,
                };
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(id) = own_id.get() {
                    bus.unsubscribe(*id);
                }
                if !start {
                    tracing::info!("[Tunnel] Server stopped before ready, tunnel auto-start cancelled");
                    return;
                }
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };
                tracing::info!("[Tunnel] Server ready, starting tunnel");
                tokio::spawn(async move {
                    supervisor.start_tunnel_if_idle().await;
                });
            })
        };
        let _ = own_id.set(id);
        id
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.live_subscription);
    }
}

fn track_live_info(live: &Mutex<LiveInfo>, event: &Event) {
    let mut info = lock(live);
    match event {
        Event::Server(ServerEvent::PlayerCountChanged(n)) => info.players = *n,
        Event::Server(ServerEvent::Stopped) | Event::Server(ServerEvent::Starting) => info.players = 0,
        Event::Tunnel(TunnelEvent::AddressAssigned(addr)) => info.tunnel_address = Some(addr.clone()),
        Event::Tunnel(TunnelEvent::ClaimUrlDetected(url)) => info.claim_url = Some(url.clone()),
        Event::Tunnel(TunnelEvent::Offline) => {
            info.tunnel_address = None;
            info.claim_url = None;
        }
        _ => {}
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
