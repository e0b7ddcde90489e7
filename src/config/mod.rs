//! Daemon configuration (`config/global.toml`).
//!
//! Every field has a default so a missing or partial file still yields a
//! usable configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::scheduler::orchestrator::RestartTimings;
use crate::scheduler::ScheduleWindows;
use crate::supervisor::process::{GracefulStop, LaunchSpec};

pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub ipc_listen: String,
    /// Key of the managed instance; schedule state is stored per instance
    pub instance: String,
    pub servers_dir: PathBuf,
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
    pub scheduler: SchedulerConfig,
    pub restart: RestartConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Relative paths resolve against `servers_dir/<instance>`
    pub working_dir: Option<PathBuf>,
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stop_command: String,
    pub graceful_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    /// Regex with a `level` capture group for console colouring
    pub log_pattern: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TunnelConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub graceful_timeout_secs: u64,
    pub kill_timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub daily_trigger_window_secs: i64,
    pub daily_suppress_window_secs: i64,
    pub warning_grace_secs: f64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RestartConfig {
    pub countdown_step_secs: u64,
    pub stop_ceiling_secs: u64,
    pub stop_poll_secs: u64,
    pub cooldown_secs: u64,
    pub start_wait_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ipc_listen: "127.0.0.1:57480".to_string(),
            instance: "default".to_string(),
            servers_dir: PathBuf::from("servers"),
            server: ServerConfig::default(),
            tunnel: TunnelConfig::default(),
            scheduler: SchedulerConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            executable: "java".to_string(),
            args: ["-Xmx2G", "-jar", "server.jar", "nogui"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env: BTreeMap::new(),
            stop_command: "stop".to_string(),
            graceful_timeout_secs: 10,
            kill_timeout_secs: 10,
            log_pattern: Some(r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]".to_string()),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let binary = if cfg!(target_os = "windows") { "bin/playit.exe" } else { "bin/playit" };
        Self {
            executable: binary.to_string(),
            args: vec!["--stdout".to_string()],
            working_dir: PathBuf::from("config"),
            env: BTreeMap::from([("RUST_LOG".to_string(), "info".to_string())]),
            graceful_timeout_secs: 5,
            kill_timeout_secs: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            daily_trigger_window_secs: 120,
            daily_suppress_window_secs: 300,
            warning_grace_secs: 30.0,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            countdown_step_secs: 1,
            stop_ceiling_secs: 30,
            stop_poll_secs: 1,
            cooldown_secs: 5,
            start_wait_secs: 10,
        }
    }
}

impl GlobalConfig {
    /// Load from `BRIDGE_CONFIG` or `config/global.toml`, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("BRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        if let Ok(dir) = std::env::var("BRIDGE_SERVERS_DIR") {
            cfg.servers_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
        };
        match toml::from_str::<Self>(&content) {
            Ok(cfg) => Ok(cfg),
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.servers_dir.join(&self.instance)
    }

    pub fn server_launch_spec(&self) -> LaunchSpec {
        let instance_dir = self.instance_dir();
        let working_dir = match &self.server.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => instance_dir.join(dir),
            None => instance_dir,
        };
        LaunchSpec {
            program: self.server.executable.clone(),
            args: self.server.args.clone(),
            working_dir,
            env: env_pairs(&self.server.env),
            accepts_input: true,
            graceful: GracefulStop::Command(self.server.stop_command.clone()),
            graceful_timeout: Duration::from_secs(self.server.graceful_timeout_secs),
            kill_timeout: Duration::from_secs(self.server.kill_timeout_secs),
        }
    }

    pub fn tunnel_launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            program: absolutize(&self.tunnel.executable),
            args: self.tunnel.args.clone(),
            working_dir: self.tunnel.working_dir.clone(),
            env: env_pairs(&self.tunnel.env),
            accepts_input: false,
            graceful: GracefulStop::Terminate,
            graceful_timeout: Duration::from_secs(self.tunnel.graceful_timeout_secs),
            kill_timeout: Duration::from_secs(self.tunnel.kill_timeout_secs),
        }
    }

    pub fn schedule_windows(&self) -> ScheduleWindows {
        ScheduleWindows {
            daily_trigger_secs: self.scheduler.daily_trigger_window_secs,
            daily_suppress_secs: self.scheduler.daily_suppress_window_secs,
            warning_grace_secs: self.scheduler.warning_grace_secs,
        }
    }

    pub fn restart_timings(&self) -> RestartTimings {
        RestartTimings {
            countdown_step: Duration::from_secs(self.restart.countdown_step_secs),
            stop_ceiling: Duration::from_secs(self.restart.stop_ceiling_secs),
            stop_poll: Duration::from_secs(self.restart.stop_poll_secs.max(1)),
            cooldown: Duration::from_secs(self.restart.cooldown_secs),
            start_wait: Duration::from_secs(self.restart.start_wait_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs.max(1))
    }
}

/// The tunnel binary lives next to the daemon (`bin/`), not inside the
/// tunnel's working directory.
fn absolutize(program: &str) -> String {
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() <= 1 {
        return program.to_string();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path).display().to_string())
        .unwrap_or_else(|_| program.to_string())
}

fn env_pairs(env: &BTreeMap<String, String>) -> Vec<(String, String)> {
    env.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.scheduler.poll_interval_secs, 30);
        assert_eq!(cfg.scheduler.daily_trigger_window_secs, 120);
        assert_eq!(cfg.scheduler.daily_suppress_window_secs, 300);
        assert_eq!(cfg.restart.cooldown_secs, 5);
        assert_eq!(cfg.restart.stop_ceiling_secs, 30);
        assert_eq!(cfg.server.stop_command, "stop");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: GlobalConfig = toml::from_str(
            r#"
            instance = "survival"

            [server]
            executable = "/usr/bin/java"

            [scheduler]
            poll_interval_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.instance, "survival");
        assert_eq!(cfg.server.executable, "/usr/bin/java");
        assert_eq!(cfg.server.stop_command, "stop");
        assert_eq!(cfg.scheduler.poll_interval_secs, 10);
        assert_eq!(cfg.scheduler.daily_trigger_window_secs, 120);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = GlobalConfig::load_from(Path::new("/nonexistent/global.toml")).unwrap();
        assert_eq!(cfg.ipc_listen, "127.0.0.1:57480");
    }

    #[test]
    fn server_working_dir_defaults_to_instance_dir() {
        let cfg = GlobalConfig {
            servers_dir: PathBuf::from("/srv/mc"),
            instance: "main".into(),
            ..Default::default()
        };
        let spec = cfg.server_launch_spec();
        assert_eq!(spec.working_dir, PathBuf::from("/srv/mc/main"));
        assert_eq!(spec.graceful, GracefulStop::Command("stop".into()));
        assert!(spec.accepts_input);
    }

    #[test]
    fn tunnel_spec_uses_terminate() {
        let spec = GlobalConfig::default().tunnel_launch_spec();
        assert!(Path::new(&spec.program).is_absolute());
        assert_eq!(spec.graceful, GracefulStop::Terminate);
        assert!(!spec.accepts_input);
        assert_eq!(spec.args, vec!["--stdout".to_string()]);
    }
}
