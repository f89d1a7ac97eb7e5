use derive_variants::EnumVariants;
use resolver_api::Resolve;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::entities::{
  migration::{MigrateFlags, MigrationResult},
  update::Log,
};

#[derive(
  Debug, Clone, Serialize, Deserialize, EnumVariants,
)]
#[variant_derive(Debug)]
#[serde(tag = "type", content = "params")]
pub enum ExecuteRequest {
  MigrateStack(MigrateStack),
  CancelMigration(CancelMigration),
  DeployStack(DeployStack),
  ManageStack(ManageStack),
  CleanupBackup(CleanupBackup),
}

//

/// Relocate a stack (compose file, named volumes, bind mount
/// data) from one host to another, with verification and
/// rollback on failure.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(MigrationResult)]
#[error(serror::Error)]
pub struct MigrateStack {
  /// Source host id.
  pub source: String,
  /// Target host id.
  pub target: String,
  /// Stack name.
  pub stack: String,
  #[serde(default)]
  pub flags: MigrateFlags,
}

//

/// Cancel a running migration. The outstanding remote command
/// is terminated; if data was already copied, rollback runs to
/// completion first. Cancelling during rollback is refused.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(CancelMigrationResponse)]
#[error(serror::Error)]
pub struct CancelMigration {
  pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelMigrationResponse {
  /// False when the migration was already terminal or is in
  /// rollback.
  pub cancelled: bool,
}

//

/// `docker compose up -d` a stack on a host.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Log)]
#[error(serror::Error)]
pub struct DeployStack {
  /// Host id.
  pub host: String,
  /// Stack name.
  pub stack: String,
  /// Pull images before up.
  #[serde(default)]
  pub pull: bool,
}

//

/// Compose lifecycle actions, constrained to the compose
/// subcommand allow-list.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StackAction {
  Up,
  Down,
  Restart,
  Start,
  Stop,
  Pause,
  Unpause,
}

#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Log)]
#[error(serror::Error)]
pub struct ManageStack {
  /// Host id.
  pub host: String,
  /// Stack name.
  pub stack: String,
  pub action: StackAction,
}

//

/// Delete a backup artifact (tar archive or zfs snapshot) on a
/// host. Goes through the safety gate; blocked paths are
/// recorded on the deletion manifest and never executed.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Log)]
#[error(serror::Error)]
pub struct CleanupBackup {
  /// Host id.
  pub host: String,
  /// Tar path or `dataset@snapshot`.
  pub backup: String,
}
