use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::entities::logger::LogConfig;

/// Cli config. Loaded the same way as the core config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
  /// Address of the core api. default: http://127.0.0.1:9120
  #[serde(default = "default_core_address")]
  pub address: String,

  #[serde(default)]
  pub cli_logging: LogConfig,
}

fn default_core_address() -> String {
  String::from("http://127.0.0.1:9120")
}

impl Default for CliConfig {
  fn default() -> Self {
    CliConfig {
      address: default_core_address(),
      cli_logging: Default::default(),
    }
  }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "stackhaul", about = "Move compose stacks between hosts")]
pub struct CliArgs {
  /// Path to a config file. Can pass multiple.
  #[arg(long, short)]
  pub config_path: Option<Vec<PathBuf>>,

  /// Override the core address.
  #[arg(long)]
  pub address: Option<String>,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
  /// Print the resolved cli config.
  Config {},
  /// List the hosts in the fleet.
  Hosts {},
  /// List compose stacks on a host.
  Stacks {
    /// Host id.
    host: String,
  },
  /// Print a stack's compose file.
  Compose {
    /// Host id.
    host: String,
    /// Stack name.
    stack: String,
  },
  /// Deploy a stack on a host (compose up -d).
  Deploy {
    /// Host id.
    host: String,
    /// Stack name.
    stack: String,
    /// Pull images before up.
    #[arg(long)]
    pull: bool,
  },
  /// Run a compose lifecycle action against a stack.
  Manage {
    /// Host id.
    host: String,
    /// Stack name.
    stack: String,
    /// up | down | restart | start | stop | pause | unpause
    action: String,
  },
  /// Migrate a stack from one host to another.
  Migrate {
    /// Source host id.
    source: String,
    /// Target host id.
    target: String,
    /// Stack name.
    stack: String,
    /// Walk the pipeline without mutating remote state.
    #[arg(long)]
    dry_run: bool,
    /// Require the source stack to already be stopped.
    #[arg(long)]
    skip_stop_source: bool,
    /// Remove the source compose file after success.
    #[arg(long)]
    remove_source: bool,
    /// Pass -F to zfs recv (destroys diverging target data).
    #[arg(long)]
    force_receive: bool,
    /// Recursive zfs send.
    #[arg(long)]
    recursive: bool,
    /// Copy through a tar archive instead of direct rsync.
    #[arg(long)]
    archive: bool,
  },
  /// Show a migration context by id.
  Migration {
    /// Migration id.
    id: String,
  },
  /// Cancel a running migration.
  Cancel {
    /// Migration id.
    id: String,
  },
}
