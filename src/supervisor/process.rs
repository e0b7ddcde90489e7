//! Supervised Process - one external process instance with stdio capture
//!
//! Owns exactly one child process and provides:
//! - Launch with executable / working directory validation
//! - Line-based stdin command injection via `send_line()`
//! - Graceful-then-forced termination via `stop()`
//! - A background reader that strips, classifies and publishes output
//! - A single authoritative exit signal via `wait_exited()`
//!
//! Instances are single-use. After `Exited` a fresh instance must be started.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};

use super::classifier::OutputClassifier;
use super::console::{ConsoleBuffer, LogLevel};
use super::error::ProcessError;
use super::state_machine::{ProcessState, StateMachine};
use crate::events::{Event, EventBus, ProcessRole, ServerEvent, TunnelEvent};

/// After the child has exited, how long the reader keeps draining buffered
/// output before declaring the process gone.
const EXIT_DRAIN: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 4096;

/// How to ask a process to shut down before force-killing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulStop {
    /// Write this line to stdin (e.g. `stop` for a Minecraft server)
    Command(String),
    /// SIGTERM on Unix; Windows has no equivalent and kills directly
    Terminate,
}

/// Everything needed to launch one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Pipe stdin so commands can be sent; otherwise stdin is null
    pub accepts_input: bool,
    pub graceful: GracefulStop,
    pub graceful_timeout: Duration,
    pub kill_timeout: Duration,
}

#[derive(Debug)]
pub struct SupervisedProcess {
    role: ProcessRole,
    generation: u64,
    pub pid: u32,
    started_at: Instant,
    stdin_tx: Option<mpsc::Sender<String>>,
    state: Arc<Mutex<StateMachine>>,
    ready: Arc<AtomicBool>,
    /// Set by the waiter once the OS has reaped the child; the pid may be reused after this
    reaped: Arc<AtomicBool>,
    exited_rx: watch::Receiver<bool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    graceful: GracefulStop,
    graceful_timeout: Duration,
    kill_timeout: Duration,
}

impl SupervisedProcess {
    /// Launch a new instance.
    ///
    /// Returns as soon as the OS has spawned the child. Readiness is announced
    /// later by the classifier (e.g. `ServerEvent::Ready`), never by this call.
    pub async fn start<C: OutputClassifier>(
        spec: &LaunchSpec,
        mut classifier: C,
        generation: u64,
        bus: EventBus,
        console: Arc<AsyncMutex<ConsoleBuffer>>,
    ) -> Result<Arc<Self>, ProcessError> {
        let role = classifier.role();
        let program = resolve_program(&spec.program, &spec.working_dir)?;

        let mut cmd = TokioCommand::new(&program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        if spec.accepts_input {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::ExecutableMissing(spec.program.clone())
            } else {
                ProcessError::LaunchFailed {
                    program: spec.program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id().unwrap_or_default();
        let state = Arc::new(Mutex::new(StateMachine::new()));
        if let Err(e) = lock(&state).transition(ProcessState::Running) {
            tracing::error!("[{}] {}", role, e);
        }

        let ready = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_status_tx, exit_status_rx) = oneshot::channel::<String>();
        let (line_tx, line_rx) = mpsc::channel::<String>(1024);

        // ── output pumps (stdout + stderr merged into one line stream) ──
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        // ── stdin writer ─────────────────────────────────────
        let stdin_tx = child.stdin.take().map(|mut stdin_handle| {
            let (tx, mut rx) = mpsc::channel::<String>(256);
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let data = format!("{}\n", line);
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
            tx
        });

        // ── process waiter ───────────────────────────────────
        let reaped = Arc::new(AtomicBool::new(false));
        let waiter_reaped = reaped.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill PID {}: {}", pid, e);
                    }
                    child.wait().await
                }
            };
            waiter_reaped.store(true, Ordering::SeqCst);
            let msg = match status {
                Ok(status) => format!("Process exited with {}", status),
                Err(e) => format!("Failed to wait for process: {}", e),
            };
            let _ = exit_status_tx.send(msg);
        });

        // ── announce start, then hand the classifier to the reader ──
        console
            .lock()
            .await
            .push_system(format!("Process started with PID {}", pid), LogLevel::Info);
        tracing::info!("[{}] Process started with PID {} (generation {})", role, pid, generation);
        bus.emit(classifier.on_start());

        tokio::spawn(read_output(ReaderContext {
            role,
            classifier,
            bus,
            console,
            state: state.clone(),
            ready: ready.clone(),
            line_rx,
            exit_status_rx,
            exited_tx,
        }));

        Ok(Arc::new(Self {
            role,
            generation,
            pid,
            started_at: Instant::now(),
            stdin_tx,
            state,
            ready,
            reaped,
            exited_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
            graceful: spec.graceful.clone(),
            graceful_timeout: spec.graceful_timeout,
            kill_timeout: spec.kill_timeout,
        }))
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Identifies this instance among all instances ever started for its role.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.state).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Whether the classifier has reported readiness for this instance.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Write `text` followed by a newline to the process's stdin.
    pub async fn send_line(&self, text: &str) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::CommandRejected(self.role));
        }
        let tx = self
            .stdin_tx
            .as_ref()
            .ok_or(ProcessError::CommandRejected(self.role))?;
        tx.send(text.to_string())
            .await
            .map_err(|_| ProcessError::CommandRejected(self.role))
    }

    /// Stop the process: graceful request, then force-kill after
    /// `graceful_timeout`, then wait for OS-level exit.
    ///
    /// Idempotent. A caller arriving while another stop is in flight applies
    /// the same deadlines, so an abandoned first caller never leaves the
    /// process hanging.
    pub async fn stop(&self) {
        let first_caller = {
            let mut sm = lock(&self.state);
            match sm.state {
                ProcessState::Running => {
                    let _ = sm.transition(ProcessState::Stopping);
                    true
                }
                ProcessState::Stopping => false,
                ProcessState::NotStarted | ProcessState::Exited => return,
            }
        };

        let requested = if first_caller {
            tracing::info!("[{}] Stopping process (PID {})", self.role, self.pid);
            self.request_graceful_stop().await
        } else {
            true
        };

        let graceful_exit = requested
            && tokio::time::timeout(self.graceful_timeout, self.wait_exited())
                .await
                .is_ok();

        if !graceful_exit {
            if requested {
                tracing::warn!(
                    "[{}] Graceful stop timed out after {:?}, force killing PID {}",
                    self.role,
                    self.graceful_timeout,
                    self.pid
                );
            }
            self.force_kill();
            if tokio::time::timeout(self.kill_timeout, self.wait_exited())
                .await
                .is_err()
            {
                tracing::error!(
                    "[{}] PID {} still not reaped {:?} after kill, waiting",
                    self.role,
                    self.pid,
                    self.kill_timeout
                );
            }
        }

        self.wait_exited().await;
    }

    /// Resolves once the reader has published the terminal event.
    pub async fn wait_exited(&self) {
        let mut rx = self.exited_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }

    /// Returns false when no graceful request could be delivered.
    async fn request_graceful_stop(&self) -> bool {
        match &self.graceful {
            GracefulStop::Command(command) => {
                let Some(tx) = self.stdin_tx.as_ref() else {
                    return false;
                };
                match tx.send(command.clone()).await {
                    Ok(()) => true,
                    Err(_) => {
                        tracing::warn!("[{}] stdin closed, cannot send '{}'", self.role, command);
                        false
                    }
                }
            }
            GracefulStop::Terminate => match self.terminate_target() {
                Some(pid) => send_terminate(pid),
                None => {
                    tracing::debug!("[{}] PID {} already reaped, not signalling", self.role, self.pid);
                    false
                }
            },
        }
    }

    /// Pid that may still be signalled; `None` once the child was reaped.
    fn terminate_target(&self) -> Option<u32> {
        (!self.reaped.load(Ordering::SeqCst)).then_some(self.pid)
    }

    fn force_kill(&self) {
        if let Some(tx) = lock(&self.kill_tx).take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to send SIGTERM to PID {}: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}

/// Bare names are left to the OS `PATH` lookup; anything with a path
/// separator must point at an existing file (relative to the working dir).
fn resolve_program(program: &str, working_dir: &Path) -> Result<PathBuf, ProcessError> {
    if !working_dir.is_dir() {
        return Err(ProcessError::WorkDirMissing(working_dir.display().to_string()));
    }

    let path = Path::new(program);
    if path.components().count() <= 1 && !path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    };
    if resolved.is_file() {
        Ok(resolved)
    } else {
        Err(ProcessError::ExecutableMissing(program.to_string()))
    }
}

/// Split a raw byte stream on `\n` / `\r` and forward cleaned lines.
async fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Output read error: {}", e);
                break;
            }
        };
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = crate::utils::clean_line(&pending) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
    }

    if let Some(line) = crate::utils::clean_line(&pending) {
        let _ = tx.send(line).await;
    }
}

struct ReaderContext<C> {
    role: ProcessRole,
    classifier: C,
    bus: EventBus,
    console: Arc<AsyncMutex<ConsoleBuffer>>,
    state: Arc<Mutex<StateMachine>>,
    ready: Arc<AtomicBool>,
    line_rx: mpsc::Receiver<String>,
    exit_status_rx: oneshot::Receiver<String>,
    exited_tx: watch::Sender<bool>,
}

async fn read_output<C: OutputClassifier>(mut ctx: ReaderContext<C>) {
    let mut exit_msg: Option<String> = None;

    loop {
        tokio::select! {
            biased;
            line = ctx.line_rx.recv() => match line {
                Some(line) => handle_line(&mut ctx, line).await,
                None => break,
            },
            msg = &mut ctx.exit_status_rx => {
                exit_msg = Some(msg.unwrap_or_else(|_| "Process waiter vanished".to_string()));
                break;
            }
        }
    }

    let exit_msg = match exit_msg {
        Some(msg) => {
            // 자식이 먼저 종료된 경우: 남은 출력을 잠시 더 읽는다
            let deadline = tokio::time::Instant::now() + EXIT_DRAIN;
            while let Ok(Some(line)) = tokio::time::timeout_at(deadline, ctx.line_rx.recv()).await {
                handle_line(&mut ctx, line).await;
            }
            msg
        }
        None => (&mut ctx.exit_status_rx)
            .await
            .unwrap_or_else(|_| "Process waiter vanished".to_string()),
    };

    if let Err(e) = lock(&ctx.state).transition(ProcessState::Exited) {
        tracing::error!("[{}] {}", ctx.role, e);
    }
    ctx.ready.store(false, Ordering::SeqCst);

    tracing::info!("[{}] {}", ctx.role, exit_msg);
    ctx.console.lock().await.push_system(exit_msg, LogLevel::Info);

    let terminal = ctx.classifier.on_exit();
    ctx.bus.emit(terminal);
    let _ = ctx.exited_tx.send(true);
}

async fn handle_line<C: OutputClassifier>(ctx: &mut ReaderContext<C>, line: String) {
    let events = ctx.classifier.classify(&line);
    ctx.console.lock().await.push_output(line);

    for event in events {
        if matches!(
            event,
            Event::Server(ServerEvent::Ready) | Event::Tunnel(TunnelEvent::AddressAssigned(_))
        ) {
            ctx.ready.store(true, Ordering::SeqCst);
        }
        ctx.bus.emit(event);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
