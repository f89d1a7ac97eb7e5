use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::entities::{host::Host, logger::LogConfig};

/// Core config. Loaded from TOML file(s) with env overrides,
/// see `core_config()` in the core binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
  /// Port the api server binds. default: 9120
  #[serde(default = "default_core_port")]
  pub port: u16,

  /// IP the api server binds. default: 0.0.0.0
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,

  #[serde(default)]
  pub logging: LogConfig,

  /// Log the full config (sanitized) on startup.
  #[serde(default)]
  pub pretty_startup_config: bool,

  /// The fleet. `[hosts.<id>]` tables in the config file.
  #[serde(default)]
  pub hosts: IndexMap<String, Host>,

  #[serde(default)]
  pub ssh: SshConfig,

  #[serde(default)]
  pub timeouts: TimeoutConfig,

  /// Append-only JSON lines audit log of remote command
  /// executions. Raw command text is never written to it.
  #[serde(default = "default_audit_log")]
  pub audit_log: PathBuf,
}

fn default_core_port() -> u16 {
  9120
}

fn default_bind_ip() -> String {
  String::from("0.0.0.0")
}

fn default_audit_log() -> PathBuf {
  PathBuf::from("stackhaul-audit.jsonl")
}

impl Default for CoreConfig {
  fn default() -> Self {
    CoreConfig {
      port: default_core_port(),
      bind_ip: default_bind_ip(),
      logging: Default::default(),
      pretty_startup_config: false,
      hosts: Default::default(),
      ssh: Default::default(),
      timeouts: Default::default(),
      audit_log: default_audit_log(),
    }
  }
}

/// Session pool and rate limiting knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
  /// Live sessions per host cap. default: 5
  #[serde(default = "default_max_concurrent_per_host")]
  pub max_concurrent_per_host: usize,
  /// Idle sessions are reaped after this. default: 300
  #[serde(default = "default_max_idle_secs")]
  pub max_idle_secs: u64,
  /// Sessions are recycled after this. default: 3600
  #[serde(default = "default_max_lifetime_secs")]
  pub max_lifetime_secs: u64,
  /// Per host request admission cap. default: 60
  #[serde(default = "default_requests_per_minute")]
  pub requests_per_minute: u32,
  /// Per host request admission cap. default: 600
  #[serde(default = "default_requests_per_hour")]
  pub requests_per_hour: u32,
  /// How long `acquire` waits on a saturated pool before
  /// failing rate limited. default: 30
  #[serde(default = "default_acquire_wait_secs")]
  pub acquire_wait_secs: u64,
  /// Directory holding the per-host control sockets.
  #[serde(default = "default_control_dir")]
  pub control_dir: PathBuf,
}

fn default_max_concurrent_per_host() -> usize {
  5
}

fn default_max_idle_secs() -> u64 {
  300
}

fn default_max_lifetime_secs() -> u64 {
  3600
}

fn default_requests_per_minute() -> u32 {
  60
}

fn default_requests_per_hour() -> u32 {
  600
}

fn default_acquire_wait_secs() -> u64 {
  30
}

fn default_control_dir() -> PathBuf {
  PathBuf::from("/tmp/stackhaul-ssh")
}

impl Default for SshConfig {
  fn default() -> Self {
    SshConfig {
      max_concurrent_per_host: default_max_concurrent_per_host(),
      max_idle_secs: default_max_idle_secs(),
      max_lifetime_secs: default_max_lifetime_secs(),
      requests_per_minute: default_requests_per_minute(),
      requests_per_hour: default_requests_per_hour(),
      acquire_wait_secs: default_acquire_wait_secs(),
      control_dir: default_control_dir(),
    }
  }
}

/// Per remote-call time budgets, seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
  /// Short queries (find, stat, df). default: 30
  #[serde(default = "default_short_secs")]
  pub short_secs: u64,
  /// Docker cli calls. default: 60
  #[serde(default = "default_docker_secs")]
  pub docker_secs: u64,
  /// General subprocess budget. default: 120
  #[serde(default = "default_subprocess_secs")]
  pub subprocess_secs: u64,
  /// Tar pack / unpack. default: 300
  #[serde(default = "default_archive_secs")]
  pub archive_secs: u64,
  /// Rsync data copy. default: 600
  #[serde(default = "default_rsync_secs")]
  pub rsync_secs: u64,
  /// Backup capture / restore. default: 300
  #[serde(default = "default_backup_secs")]
  pub backup_secs: u64,
}

fn default_short_secs() -> u64 {
  30
}

fn default_docker_secs() -> u64 {
  60
}

fn default_subprocess_secs() -> u64 {
  120
}

fn default_archive_secs() -> u64 {
  300
}

fn default_rsync_secs() -> u64 {
  600
}

fn default_backup_secs() -> u64 {
  300
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    TimeoutConfig {
      short_secs: default_short_secs(),
      docker_secs: default_docker_secs(),
      subprocess_secs: default_subprocess_secs(),
      archive_secs: default_archive_secs(),
      rsync_secs: default_rsync_secs(),
      backup_secs: default_backup_secs(),
    }
  }
}

impl CoreConfig {
  /// Strip nothing today, but keep the seam the startup dump
  /// goes through so secrets added later stay out of logs.
  pub fn sanitized(&self) -> CoreConfig {
    self.clone()
  }
}
