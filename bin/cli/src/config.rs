use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;
use config::ConfigLoader;
use stackhaul_client::entities::config::cli::{
  CliArgs, CliConfig,
};

pub fn cli_args() -> &'static CliArgs {
  static CLI_ARGS: OnceLock<CliArgs> = OnceLock::new();
  CLI_ARGS.get_or_init(CliArgs::parse)
}

#[derive(serde::Deserialize)]
pub struct Env {
  #[serde(default = "default_config_paths")]
  pub stackhaul_cli_config_paths: Vec<PathBuf>,
  pub stackhaul_cli_address: Option<String>,
}

fn default_config_paths() -> Vec<PathBuf> {
  vec![
    PathBuf::from("/etc/stackhaul/cli.toml"),
    PathBuf::from("cli.toml"),
  ]
}

pub fn cli_config() -> &'static CliConfig {
  static CLI_CONFIG: OnceLock<CliConfig> = OnceLock::new();
  CLI_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse cli environment");
    let args = cli_args();
    let config_paths = args
      .config_path
      .clone()
      .unwrap_or(env.stackhaul_cli_config_paths);

    let config = if config_paths.is_empty() {
      CliConfig::default()
    } else {
      (ConfigLoader {
        paths: &config_paths
          .iter()
          .map(PathBuf::as_path)
          .collect::<Vec<_>>(),
        match_wildcards: &[],
        merge_nested: true,
        extend_array: false,
        debug_print: false,
      })
      .load()
      .expect("failed at parsing config from paths")
    };

    CliConfig {
      address: args
        .address
        .clone()
        .or(env.stackhaul_cli_address)
        .unwrap_or(config.address),
      cli_logging: config.cli_logging,
    }
  })
}
