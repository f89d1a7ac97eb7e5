use derive_variants::EnumVariants;
use resolver_api::Resolve;
use serde::{Deserialize, Serialize};

use crate::entities::{
  NoData,
  backup::DeletionRecord,
  host::Host,
  migration::{MigrationContext, MigrationState},
  stack::StackListItem,
  update::Log,
};

#[derive(
  Debug, Clone, Serialize, Deserialize, EnumVariants,
)]
#[variant_derive(Debug)]
#[serde(tag = "type", content = "params")]
pub enum ReadRequest {
  GetVersion(GetVersion),
  GetHealth(GetHealth),
  ListHosts(ListHosts),
  ListStacks(ListStacks),
  GetCompose(GetCompose),
  GetStackLog(GetStackLog),
  GetMigration(GetMigration),
  ListMigrations(ListMigrations),
  GetDeletionManifest(GetDeletionManifest),
}

//

#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(GetVersionResponse)]
#[error(serror::Error)]
pub struct GetVersion {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetVersionResponse {
  pub version: String,
}

//

#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(NoData)]
#[error(serror::Error)]
pub struct GetHealth {}

//

/// List all hosts in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Vec<Host>)]
#[error(serror::Error)]
pub struct ListHosts {}

//

/// List compose stacks on a host: `docker compose ls` projects
/// merged with compose directories found under `appdata_path`.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Vec<StackListItem>)]
#[error(serror::Error)]
pub struct ListStacks {
  /// Host id.
  pub host: String,
}

//

/// Read a stack's compose file contents off the host.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(GetComposeResponse)]
#[error(serror::Error)]
pub struct GetCompose {
  /// Host id.
  pub host: String,
  /// Stack name.
  pub stack: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetComposeResponse {
  /// Absolute path of the detected compose file.
  pub path: String,
  pub contents: String,
}

//

/// Tail a stack's compose logs.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Log)]
#[error(serror::Error)]
pub struct GetStackLog {
  /// Host id.
  pub host: String,
  /// Stack name.
  pub stack: String,
  /// Pass `--tail` for only recent log contents.
  #[serde(default = "default_tail")]
  pub tail: u64,
}

fn default_tail() -> u64 {
  50
}

//

/// Full migration context by id.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(MigrationContext)]
#[error(serror::Error)]
pub struct GetMigration {
  pub id: String,
}

//

#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Vec<MigrationListItem>)]
#[error(serror::Error)]
pub struct ListMigrations {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationListItem {
  pub id: String,
  pub stack: String,
  pub source: String,
  pub target: String,
  pub state: MigrationState,
  pub start_ts: i64,
}

//

/// The in-memory deletion manifest: every destructive remote
/// command attempted this process, with its validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize, Resolve)]
#[response(Vec<DeletionRecord>)]
#[error(serror::Error)]
pub struct GetDeletionManifest {}
