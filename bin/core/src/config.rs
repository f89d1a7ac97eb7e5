use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;
use colored::Colorize;
use config::ConfigLoader;
use stackhaul_client::entities::{
  config::core::CoreConfig,
  logger::{LogConfig, LogLevel, StdioLogMode},
};

#[derive(Parser)]
#[command(name = "core", version)]
pub struct CliArgs {
  /// Paths to config files / directories. Later paths override
  /// earlier ones.
  #[arg(long, short)]
  pub config_path: Option<Vec<PathBuf>>,

  /// Wildcard patterns matching config file names in config
  /// directories.
  #[arg(long)]
  pub config_keyword: Option<Vec<String>>,

  /// Merge nested config objects across files.
  #[arg(long)]
  pub merge_nested_config: Option<bool>,

  /// Extend arrays across config files.
  #[arg(long)]
  pub extend_config_arrays: Option<bool>,

  /// Override the log level.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

#[derive(serde::Deserialize)]
pub struct Env {
  #[serde(default = "default_config_paths")]
  pub stackhaul_config_paths: Vec<PathBuf>,
  #[serde(default)]
  pub stackhaul_config_keywords: Vec<String>,
  #[serde(default)]
  pub stackhaul_merge_nested_config: bool,
  #[serde(default)]
  pub stackhaul_extend_config_arrays: bool,
  pub stackhaul_port: Option<u16>,
  pub stackhaul_bind_ip: Option<String>,
  pub stackhaul_audit_log: Option<PathBuf>,
  pub stackhaul_logging_level: Option<LogLevel>,
  pub stackhaul_logging_stdio: Option<StdioLogMode>,
  pub stackhaul_logging_pretty: Option<bool>,
  pub stackhaul_pretty_startup_config: Option<bool>,
}

fn default_config_paths() -> Vec<PathBuf> {
  vec![
    PathBuf::from("/etc/stackhaul/core.toml"),
    PathBuf::from("core.toml"),
  ]
}

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse core environment");
    let args = CliArgs::parse();
    let config_paths =
      args.config_path.unwrap_or(env.stackhaul_config_paths);

    let config = if config_paths.is_empty() {
      println!(
        "{}: No config paths found, using default config",
        "INFO".green(),
      );
      CoreConfig::default()
    } else {
      (ConfigLoader {
        paths: &config_paths
          .iter()
          .map(PathBuf::as_path)
          .collect::<Vec<_>>(),
        match_wildcards: &args
          .config_keyword
          .unwrap_or(env.stackhaul_config_keywords)
          .iter()
          .map(String::as_str)
          .collect::<Vec<_>>(),
        merge_nested: args
          .merge_nested_config
          .unwrap_or(env.stackhaul_merge_nested_config),
        extend_array: args
          .extend_config_arrays
          .unwrap_or(env.stackhaul_extend_config_arrays),
        debug_print: args
          .log_level
          .map(|level| {
            level == tracing::Level::DEBUG
              || level == tracing::Level::TRACE
          })
          .unwrap_or_default(),
      })
      .load()
      .expect("failed at parsing config from paths")
    };

    CoreConfig {
      port: env.stackhaul_port.unwrap_or(config.port),
      bind_ip: env.stackhaul_bind_ip.unwrap_or(config.bind_ip),
      logging: LogConfig {
        level: args
          .log_level
          .map(LogLevel::from)
          .or(env.stackhaul_logging_level)
          .unwrap_or(config.logging.level),
        stdio: env
          .stackhaul_logging_stdio
          .unwrap_or(config.logging.stdio),
        pretty: env
          .stackhaul_logging_pretty
          .unwrap_or(config.logging.pretty),
      },
      pretty_startup_config: env
        .stackhaul_pretty_startup_config
        .unwrap_or(config.pretty_startup_config),
      audit_log: env
        .stackhaul_audit_log
        .unwrap_or(config.audit_log),
      hosts: config.hosts,
      ssh: config.ssh,
      timeouts: config.timeouts,
    }
  })
}
